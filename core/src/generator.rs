/// Abstract task-producing collaborator.
///
/// Concrete generators (the LLM-backed PRD-from-text generator lives
/// outside this crate) assemble a tracking tree of new tasks and a
/// tracking graph of dependencies between them, referring to
/// not-yet-persisted tasks by their temporary ids. The core's contract is
/// `persist_generated`: flush the tree, apply the minted id mappings to
/// the graph, flush the graph.
use crate::errors::TaskResult;
use crate::graph::DependencyGraph;
use crate::store::TaskStore;
use crate::task::Task;
use crate::tracking_graph::TrackingGraph;
use crate::tracking_tree::TrackingTree;
use crate::tree::TaskTree;
use async_trait::async_trait;
use std::collections::HashMap;

/// Where generated tasks should attach, and what already exists.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub parent_task_id: Option<String>,
    pub existing_tasks: Vec<Task>,
}

/// Input handed to a generator.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    /// Free-form source content (a PRD, a ticket, a prompt).
    pub content: String,
    pub context: Option<GenerationContext>,
    pub metadata: Option<serde_json::Value>,
}

impl GenerationInput {
    pub fn new(content: impl Into<String>) -> Self {
        GenerationInput {
            content: content.into(),
            context: None,
            metadata: None,
        }
    }
}

/// A generator's output: buffered tasks and buffered dependencies, still
/// carrying temporary ids.
#[derive(Debug)]
pub struct GeneratedPlan {
    pub tree: TrackingTree,
    pub graph: TrackingGraph,
}

/// A task-producing collaborator. Content validation is the generator's
/// responsibility; the store validates the resulting operations against
/// its own invariants at flush time.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    /// Name of this generator, for diagnostics.
    fn name(&self) -> &str;

    async fn generate(&self, input: GenerationInput) -> TaskResult<GeneratedPlan>;
}

/// Result of persisting a generated plan.
#[derive(Debug, Clone)]
pub struct PersistedGeneration {
    pub tree: TaskTree,
    pub graph: DependencyGraph,
    pub id_mappings: HashMap<String, String>,
}

/// Persist a generated plan: tree first (minting canonical ids), then the
/// graph with the mapping applied. Generator errors surface verbatim.
pub async fn persist_generated(
    store: &TaskStore,
    plan: GeneratedPlan,
) -> TaskResult<PersistedGeneration> {
    let GeneratedPlan {
        mut tree,
        mut graph,
    } = plan;
    let flush = tree.flush(store).await?;
    graph.apply_id_mappings(&flush.id_mappings);
    let graph = graph.flush(store).await?;
    Ok(PersistedGeneration {
        tree: flush.tree,
        graph,
        id_mappings: flush.id_mappings,
    })
}
