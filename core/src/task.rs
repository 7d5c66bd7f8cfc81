/// Task, dependency and context-slice data models.
use crate::errors::{TaskError, TaskResult};
use crate::ids;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounds enforced on task fields.
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MIN_PRIORITY_SCORE: i32 = 0;
pub const MAX_PRIORITY_SCORE: i32 = 100;
pub const DEFAULT_PRIORITY_SCORE: i32 = 50;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
    Archived,
}

impl TaskStatus {
    /// True for statuses that end a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Archived
        )
    }

    /// All statuses, in display order.
    pub fn all() -> [TaskStatus; 5] {
        [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Cancelled,
            TaskStatus::Archived,
        ]
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in-progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "archived" => Ok(TaskStatus::Archived),
            _ => Err(TaskError::Validation(format!("invalid status: {s:?}"))),
        }
    }
}

/// A task as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    /// None only for the synthetic project root.
    pub parent_id: Option<String>,

    pub title: String,

    pub description: Option<String>,

    pub status: TaskStatus,

    /// 0-100, higher is more important.
    pub priority_score: i32,

    /// Free-text source the task was generated from.
    pub prd: Option<String>,

    /// Opaque digest of the context the task was created under.
    pub context_digest: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_project_root(&self) -> bool {
        ids::is_project_root(&self.id)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    /// None targets the project root.
    pub parent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub priority_score: Option<i32>,
    pub prd: Option<String>,
    pub context_digest: Option<String>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        TaskDraft {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority_score(mut self, score: i32) -> Self {
        self.priority_score = Some(score);
        self
    }

    pub fn with_prd(mut self, prd: impl Into<String>) -> Self {
        self.prd = Some(prd.into());
        self
    }

    /// Check the draft's field bounds.
    pub fn validate(&self) -> TaskResult<()> {
        validate_title(&self.title)?;
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let Some(score) = self.priority_score {
            validate_priority_score(score)?;
        }
        if let Some(parent) = &self.parent_id {
            ids::validate_parent_id(parent)?;
        }
        Ok(())
    }

    /// Materialise the draft into a task with the given id and parent.
    pub fn into_task(self, id: String, parent_id: String, now: DateTime<Utc>) -> Task {
        Task {
            id,
            parent_id: Some(parent_id),
            title: self.title,
            description: self.description,
            status: self.status,
            priority_score: self.priority_score.unwrap_or(DEFAULT_PRIORITY_SCORE),
            prd: self.prd,
            context_digest: self.context_digest,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Closed set of fields a partial update may touch. Unknown keys are
/// rejected at the boundary rather than silently dropped.
///
/// An explicit empty string clears the nullable text fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        TaskUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority_score.is_none()
            && self.prd.is_none()
            && self.context_digest.is_none()
            && self.parent_id.is_none()
    }

    /// Parse a dynamic update payload, rejecting unknown keys.
    pub fn from_value(value: serde_json::Value) -> TaskResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| TaskError::Validation(format!("invalid update payload: {e}")))
    }

    /// Check the update's field bounds.
    pub fn validate(&self) -> TaskResult<()> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(description) = &self.description {
            if !description.is_empty() {
                validate_description(description)?;
            }
        }
        if let Some(score) = self.priority_score {
            validate_priority_score(score)?;
        }
        if let Some(parent) = &self.parent_id {
            ids::validate_parent_id(parent)?;
        }
        Ok(())
    }

    /// Field-level merge: later values win per field.
    pub fn merge(&mut self, later: &TaskUpdate) {
        if later.title.is_some() {
            self.title = later.title.clone();
        }
        if later.description.is_some() {
            self.description = later.description.clone();
        }
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.priority_score.is_some() {
            self.priority_score = later.priority_score;
        }
        if later.prd.is_some() {
            self.prd = later.prd.clone();
        }
        if later.context_digest.is_some() {
            self.context_digest = later.context_digest.clone();
        }
        if later.parent_id.is_some() {
            self.parent_id = later.parent_id.clone();
        }
    }

    /// Apply the update to a task in place, stamping `updated_at`.
    pub fn apply_to(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = if description.is_empty() {
                None
            } else {
                Some(description.clone())
            };
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(score) = self.priority_score {
            task.priority_score = score;
        }
        if let Some(prd) = &self.prd {
            task.prd = if prd.is_empty() { None } else { Some(prd.clone()) };
        }
        if let Some(digest) = &self.context_digest {
            task.context_digest = if digest.is_empty() {
                None
            } else {
                Some(digest.clone())
            };
        }
        if let Some(parent) = &self.parent_id {
            task.parent_id = Some(parent.clone());
        }
        task.updated_at = now;
    }
}

/// A dependency edge: the dependent is blocked until the dependency is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
    pub id: Uuid,
    pub dependent_task_id: String,
    pub dependency_task_id: String,
    pub created_at: DateTime<Utc>,
}

/// A titled note attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSlice {
    pub id: Uuid,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub context_type: String,
    pub created_at: DateTime<Utc>,
}

/// Input for attaching a context slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSliceDraft {
    pub task_id: String,
    pub title: String,
    pub description: String,
    /// Defaults to "general".
    pub context_type: Option<String>,
}

impl ContextSliceDraft {
    pub fn validate(&self) -> TaskResult<()> {
        ids::validate_id(&self.task_id)?;
        if self.title.is_empty() {
            return Err(TaskError::Validation(
                "context slice title must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Conjunctive filters for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    /// Empty or None means any status.
    pub statuses: Option<Vec<TaskStatus>>,
    pub parent_id: Option<String>,
    pub include_project_root: bool,
}

/// Per-status task counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub cancelled: usize,
    pub archived: usize,
}

pub fn validate_title(title: &str) -> TaskResult<()> {
    let len = title.chars().count();
    if len == 0 || len > MAX_TITLE_LEN {
        return Err(TaskError::Validation(format!(
            "title must be 1-{MAX_TITLE_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> TaskResult<()> {
    let len = description.chars().count();
    if len > MAX_DESCRIPTION_LEN {
        return Err(TaskError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

pub fn validate_priority_score(score: i32) -> TaskResult<()> {
    if !(MIN_PRIORITY_SCORE..=MAX_PRIORITY_SCORE).contains(&score) {
        return Err(TaskError::Validation(format!(
            "priority score must be {MIN_PRIORITY_SCORE}-{MAX_PRIORITY_SCORE}, got {score}"
        )));
    }
    Ok(())
}
