/// Typed tool surface for the external RPC collaborator.
///
/// Argument shapes mirror the protocol verbatim (camelCase field names,
/// unknown keys rejected). The transport and tool-registration plumbing
/// live outside this crate; `dispatch` maps a tool name plus raw JSON
/// arguments onto the facade.
use crate::errors::{TaskError, TaskResult};
use crate::facade::Astrotask;
use crate::task::TaskStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The tools the core provides handlers for.
pub const TOOL_NAMES: [&str; 8] = [
    "getNextTask",
    "getTask",
    "addTasks",
    "listTasks",
    "addTaskContext",
    "addDependency",
    "updateStatus",
    "deleteTask",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetNextTaskArgs {
    pub status: Option<TaskStatus>,
    /// Lower bound on priority score.
    pub priority_score: Option<i32>,
    pub parent_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetTaskArgs {
    pub task_id: String,
}

/// One entry in a batch create. `parent_index` and `depends_on` index
/// into the same array, so a connected sub-graph can be created in one
/// call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskEntryArgs {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority_score: Option<i32>,
    pub parent_task_id: Option<String>,
    pub parent_index: Option<usize>,
    pub depends_on: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddTasksArgs {
    pub tasks: Vec<TaskEntryArgs>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTasksArgs {
    /// Empty or absent means any status.
    pub statuses: Option<Vec<TaskStatus>>,
    pub parent_id: Option<String>,
    pub include_project_root: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddTaskContextArgs {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub context_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddDependencyArgs {
    pub dependent_task_id: String,
    pub dependency_task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateStatusArgs {
    pub task_id: String,
    pub status: TaskStatus,
    pub cascade: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteTaskArgs {
    pub task_id: String,
    pub cascade: Option<bool>,
}

/// Route one tool call to its handler. Unknown tools and malformed
/// arguments are validation errors.
pub async fn dispatch(engine: &Astrotask, tool: &str, args: Value) -> TaskResult<Value> {
    let args = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args
    };
    match tool {
        "getNextTask" => to_value(engine.get_next_task(&parse_args(args)?).await?),
        "getTask" => to_value(engine.get_task(&parse_args(args)?).await?),
        "addTasks" => to_value(engine.add_tasks(&parse_args(args)?).await?),
        "listTasks" => to_value(engine.list_tasks(&parse_args(args)?).await?),
        "addTaskContext" => to_value(engine.add_task_context(&parse_args(args)?).await?),
        "addDependency" => to_value(engine.add_dependency(&parse_args(args)?).await?),
        "updateStatus" => to_value(engine.update_status(&parse_args(args)?).await?),
        "deleteTask" => to_value(engine.delete_task(&parse_args(args)?).await?),
        other => Err(TaskError::Validation(format!("unknown tool: {other:?}"))),
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> TaskResult<T> {
    serde_json::from_value(args)
        .map_err(|e| TaskError::Validation(format!("invalid arguments: {e}")))
}

fn to_value<T: Serialize>(value: T) -> TaskResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| TaskError::Storage(format!("failed to serialise response: {e}")))
}
