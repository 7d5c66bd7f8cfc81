// Astrotask: local-first task management for humans and AI agents.
// Core engine library embedded by the CLI, TUI and RPC server.

pub mod config;
pub mod errors;
pub mod facade;
pub mod generator;
pub mod graph;
pub mod ids;
pub mod lock;
pub mod reconcile;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tracking_graph;
pub mod tracking_tree;
pub mod tree;

// Re-export commonly used types
pub use errors::{TaskError, TaskResult};

pub use task::{
    ContextSlice, ContextSliceDraft, Task, TaskDependency, TaskDraft, TaskListFilter,
    TaskStatistics, TaskStatus, TaskUpdate,
};

pub use ids::{PROJECT_ROOT_ID, TEMP_ID_PREFIX};

pub use config::{init_tracing, DatabaseUrl, EngineConfig};

pub use lock::{LockHolder, ProcessLock};

pub use store::{TaskStore, TreeReconcileOutcome};

pub use tree::TaskTree;

pub use graph::{CycleReport, DependencyGraph, GraphMetrics, TaskDependencyView};

pub use reconcile::{
    GraphOperation, GraphReconciliationPlan, ReconciliationPlan, TreeOperation,
};

pub use tracking_tree::{TrackingTree, TreeDraft, TreeFlush};

pub use tracking_graph::TrackingGraph;

pub use scheduler::{
    available_tasks, complete_task, next_task, start_work, CompletionOptions, CompletionOutcome,
    TaskFilter,
};

pub use generator::{
    persist_generated, GeneratedPlan, GenerationContext, GenerationInput, PersistedGeneration,
    TaskGenerator,
};

pub use facade::{Astrotask, UpdateStatusOutcome};

pub use rpc::{
    dispatch, AddDependencyArgs, AddTaskContextArgs, AddTasksArgs, DeleteTaskArgs,
    GetNextTaskArgs, GetTaskArgs, ListTasksArgs, TaskEntryArgs, UpdateStatusArgs, TOOL_NAMES,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
