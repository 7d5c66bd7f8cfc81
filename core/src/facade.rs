/// The embedder-facing facade.
///
/// An `Astrotask` bundles one store with snapshot loading and the
/// scheduler, and implements the handlers behind the tool surface in
/// `rpc`. Reads are safe to run concurrently; writes funnel through the
/// store's serialised write path.
use crate::config::EngineConfig;
use crate::errors::{TaskError, TaskResult};
use crate::graph::DependencyGraph;
use crate::ids::{self, PROJECT_ROOT_ID};
use crate::rpc::{
    AddDependencyArgs, AddTaskContextArgs, AddTasksArgs, DeleteTaskArgs, GetNextTaskArgs,
    GetTaskArgs, ListTasksArgs, UpdateStatusArgs,
};
use crate::scheduler::{self, CompletionOptions, TaskFilter};
use crate::store::TaskStore;
use crate::task::{
    ContextSlice, ContextSliceDraft, Task, TaskDependency, TaskDraft, TaskListFilter,
    TaskStatistics, TaskStatus,
};
use crate::tracking_graph::TrackingGraph;
use crate::tracking_tree::TrackingTree;
use crate::tree::TaskTree;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything `updateStatus` did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusOutcome {
    pub task: Task,
    /// Tasks marked done (target first; more with cascade).
    pub completed: Vec<String>,
    /// Task auto-started by the completion workflow, if any.
    pub started: Option<String>,
    /// Dependents whose last remaining blocker was completed.
    pub unblocked: Vec<String>,
}

pub struct Astrotask {
    store: TaskStore,
    config: EngineConfig,
}

impl Astrotask {
    pub async fn open(config: EngineConfig) -> TaskResult<Self> {
        let store = TaskStore::open(&config).await?;
        Ok(Astrotask { store, config })
    }

    /// Open using environment configuration (`DATABASE_URI` and friends).
    pub async fn from_env() -> TaskResult<Self> {
        Self::open(EngineConfig::from_env()?).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Immutable tree snapshot rooted at the project root.
    pub async fn load_tree(&self) -> TaskResult<TaskTree> {
        self.store.build_task_tree(PROJECT_ROOT_ID).await
    }

    /// Immutable dependency graph snapshot.
    pub async fn load_graph(&self) -> TaskResult<DependencyGraph> {
        self.store.build_dependency_graph().await
    }

    pub async fn task_statistics(&self) -> TaskResult<TaskStatistics> {
        self.store.task_statistics().await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    // ------------------------------------------------------------------
    // Tool handlers
    // ------------------------------------------------------------------

    pub async fn get_next_task(&self, args: &GetNextTaskArgs) -> TaskResult<Option<TaskTree>> {
        let tree = self.load_tree().await?;
        let graph = self.load_graph().await?;
        let filter = TaskFilter {
            status: args.status,
            min_priority_score: args.priority_score,
            parent_id: args.parent_task_id.clone(),
            include_blocked: false,
        };
        Ok(scheduler::next_task(&tree, &graph, &filter).cloned())
    }

    pub async fn get_task(&self, args: &GetTaskArgs) -> TaskResult<Option<Task>> {
        self.store.get_task(&args.task_id).await
    }

    /// Batch create. `parentIndex` entries must reference an earlier
    /// element; `dependsOn` may reference any element. The whole batch
    /// lands atomically through one reconciliation plan per overlay.
    pub async fn add_tasks(&self, args: &AddTasksArgs) -> TaskResult<Vec<Task>> {
        if args.tasks.is_empty() {
            return Ok(Vec::new());
        }

        let tree = self.load_tree().await?;
        let graph = self.load_graph().await?;
        let mut tracking = TrackingTree::from_task_tree(&tree);
        let mut tracking_graph = TrackingGraph::from_graph(graph);

        let mut staged: Vec<String> = Vec::with_capacity(args.tasks.len());
        for (index, entry) in args.tasks.iter().enumerate() {
            let parent = match (&entry.parent_task_id, entry.parent_index) {
                (Some(_), Some(_)) => {
                    return Err(TaskError::Validation(format!(
                        "task {index}: parentTaskId and parentIndex are mutually exclusive"
                    )))
                }
                (Some(id), None) => id.clone(),
                (None, Some(parent_index)) => {
                    if parent_index >= index {
                        return Err(TaskError::Validation(format!(
                            "task {index}: parentIndex {parent_index} must reference an earlier entry"
                        )));
                    }
                    staged[parent_index].clone()
                }
                (None, None) => PROJECT_ROOT_ID.to_string(),
            };

            let mut draft = TaskDraft::new(entry.title.clone());
            draft.description = entry.description.clone();
            draft.status = entry.status.unwrap_or_default();
            draft.priority_score = entry.priority_score;
            staged.push(tracking.add_child(&parent, draft)?);
        }

        for (index, entry) in args.tasks.iter().enumerate() {
            let Some(depends_on) = &entry.depends_on else {
                continue;
            };
            for &dep_index in depends_on {
                if dep_index >= args.tasks.len() {
                    return Err(TaskError::Validation(format!(
                        "task {index}: dependsOn index {dep_index} is out of range"
                    )));
                }
                tracking_graph.add_dependency(&staged[index], &staged[dep_index])?;
            }
        }

        let flush = tracking.flush(&self.store).await?;
        tracking_graph.apply_id_mappings(&flush.id_mappings);
        tracking_graph.flush(&self.store).await?;

        let mut created = Vec::with_capacity(staged.len());
        for temp in &staged {
            let id = flush
                .id_mappings
                .get(temp)
                .cloned()
                .ok_or_else(|| TaskError::Reconciliation {
                    index: 0,
                    message: format!("no id mapping for {temp}"),
                })?;
            let task = self.store.get_task(&id).await?.ok_or_else(|| {
                TaskError::Storage(format!("created task {id} missing after flush"))
            })?;
            created.push(task);
        }
        debug!(count = created.len(), "batch create complete");
        Ok(created)
    }

    pub async fn list_tasks(&self, args: &ListTasksArgs) -> TaskResult<Vec<Task>> {
        self.store
            .list_tasks(&TaskListFilter {
                statuses: args.statuses.clone(),
                parent_id: args.parent_id.clone(),
                include_project_root: args.include_project_root.unwrap_or(false),
            })
            .await
    }

    pub async fn add_task_context(&self, args: &AddTaskContextArgs) -> TaskResult<ContextSlice> {
        self.store
            .add_context_slice(&ContextSliceDraft {
                task_id: args.task_id.clone(),
                title: args.title.clone(),
                description: args.description.clone(),
                context_type: args.context_type.clone(),
            })
            .await
    }

    pub async fn add_dependency(&self, args: &AddDependencyArgs) -> TaskResult<TaskDependency> {
        self.store
            .add_task_dependency(&args.dependent_task_id, &args.dependency_task_id)
            .await
    }

    /// Set a task's status. Marking done routes through the scheduler's
    /// completion workflow (cascade, auto-start, unblocked report); other
    /// statuses update the store directly.
    pub async fn update_status(&self, args: &UpdateStatusArgs) -> TaskResult<UpdateStatusOutcome> {
        let cascade = args.cascade.unwrap_or(false);
        if args.status != TaskStatus::Done {
            let task = self
                .store
                .update_task_status(&args.task_id, args.status)
                .await?
                .ok_or_else(|| TaskError::NotFound(format!("task {}", args.task_id)))?;
            return Ok(UpdateStatusOutcome {
                task,
                completed: Vec::new(),
                started: None,
                unblocked: Vec::new(),
            });
        }

        let tree = self.load_tree().await?;
        let graph = self.load_graph().await?;
        if tree.find_by_id(&args.task_id).is_none() {
            return Err(TaskError::NotFound(format!("task {}", args.task_id)));
        }
        let mut tracking = TrackingTree::from_task_tree(&tree);
        let outcome = scheduler::complete_task(
            &mut tracking,
            &graph,
            &args.task_id,
            &CompletionOptions {
                cascade,
                auto_start: true,
            },
        )?;
        tracking.flush(&self.store).await?;

        let task = self
            .store
            .get_task(&args.task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(format!("task {}", args.task_id)))?;
        Ok(UpdateStatusOutcome {
            task,
            completed: outcome.completed,
            started: outcome.started,
            unblocked: outcome.unblocked,
        })
    }

    /// Delete a task. Without cascade the store refuses while children or
    /// dependents exist. With cascade the whole subtree goes: incident
    /// dependency edges are removed first (graph plan), then the subtree
    /// rows bottom-up (tree plan).
    pub async fn delete_task(&self, args: &DeleteTaskArgs) -> TaskResult<bool> {
        if !args.cascade.unwrap_or(false) {
            return self.store.delete_task(&args.task_id).await;
        }
        if ids::is_project_root(&args.task_id) {
            return Err(TaskError::Conflict(
                "the project root cannot be deleted".to_string(),
            ));
        }

        let tree = self.load_tree().await?;
        let Some(node) = tree.find_by_id(&args.task_id) else {
            return Ok(false);
        };
        let mut member_ids: Vec<String> = vec![args.task_id.clone()];
        member_ids.extend(node.all_descendants().iter().map(|t| t.id.clone()));

        let graph = self.load_graph().await?;
        let mut tracking_graph = TrackingGraph::from_graph(graph);
        for id in &member_ids {
            let dependencies: Vec<String> = tracking_graph.graph().dependencies_of(id).to_vec();
            for dependency in dependencies {
                tracking_graph.remove_dependency(id, &dependency);
            }
            let dependents: Vec<String> = tracking_graph.graph().dependents_of(id).to_vec();
            for dependent in dependents {
                tracking_graph.remove_dependency(&dependent, id);
            }
        }
        tracking_graph.flush(&self.store).await?;

        let parent_id = tree
            .parent_of(&args.task_id)
            .map(|parent| parent.id().to_string())
            .ok_or_else(|| {
                TaskError::Conflict(format!("task {} has no parent", args.task_id))
            })?;
        let mut tracking = TrackingTree::from_task_tree(&tree);
        tracking.remove_child(&parent_id, &args.task_id)?;
        tracking.flush(&self.store).await?;
        debug!(task = %args.task_id, removed = member_ids.len(), "subtree deleted");
        Ok(true)
    }
}
