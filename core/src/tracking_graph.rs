/// Mutable tracking overlay over a dependency graph.
///
/// Mutations apply to the wrapped graph in place and append a timestamped
/// pending operation. Consolidation reduces the buffer to the net effect
/// per edge against the base snapshot, so an add followed by a remove of
/// the same pair flushes as nothing at all.
use crate::errors::{TaskError, TaskResult};
use crate::graph::DependencyGraph;
use crate::ids;
use crate::reconcile::{
    consolidate_graph_operations, GraphOperation, GraphReconciliationPlan,
};
use crate::store::TaskStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Label recorded on graph reconciliation plans.
pub const DEPENDENCY_GRAPH_ID: &str = "dependencies";

#[derive(Debug, Clone)]
pub struct TrackingGraph {
    graph: DependencyGraph,
    base_edges: HashSet<(String, String)>,
    pending: Vec<GraphOperation>,
    base_version: u64,
}

impl TrackingGraph {
    pub fn new() -> Self {
        Self::from_graph(DependencyGraph::new())
    }

    /// Seed the overlay from a store snapshot.
    pub fn from_graph(graph: DependencyGraph) -> Self {
        let base_edges = graph.edges().into_iter().collect();
        TrackingGraph {
            graph,
            base_edges,
            pending: Vec::new(),
            base_version: 0,
        }
    }

    /// Read access to the buffered graph state.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_operations(&self) -> &[GraphOperation] {
        &self.pending
    }

    /// Add a dependency edge in place and record the operation. Rejects
    /// self-edges and edges that would close a cycle in the buffered state;
    /// the store re-checks exactly at flush time.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> TaskResult<()> {
        if dependent == dependency {
            return Err(TaskError::Conflict(format!(
                "task {dependent} cannot depend on itself"
            )));
        }
        if self.graph.would_create_cycle(dependent, dependency) {
            let cycle = self
                .graph
                .cycle_path(dependent, dependency)
                .unwrap_or_else(|| vec![dependent.to_string(), dependency.to_string()]);
            return Err(TaskError::Conflict(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }
        if self.graph.has_edge(dependent, dependency) {
            return Ok(());
        }
        self.graph.add_edge(dependent, dependency);
        self.pending.push(GraphOperation::DependencyAdd {
            dependent_id: dependent.to_string(),
            dependency_id: dependency.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Remove a dependency edge in place and record the operation. Returns
    /// false when the edge was not present.
    pub fn remove_dependency(&mut self, dependent: &str, dependency: &str) -> bool {
        if !self.graph.remove_edge(dependent, dependency) {
            return false;
        }
        self.pending.push(GraphOperation::DependencyRemove {
            dependent_id: dependent.to_string(),
            dependency_id: dependency.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Rewrite temporary ids to their persisted counterparts, in both the
    /// buffered operations and the graph itself. Called with the mapping a
    /// tracking-tree flush returned, before this overlay's own flush.
    pub fn apply_id_mappings(&mut self, mappings: &HashMap<String, String>) {
        if mappings.is_empty() {
            return;
        }
        let remap = |id: &mut String| {
            if let Some(real) = mappings.get(id.as_str()) {
                *id = real.clone();
            }
        };
        for op in &mut self.pending {
            match op {
                GraphOperation::DependencyAdd {
                    dependent_id,
                    dependency_id,
                    ..
                }
                | GraphOperation::DependencyRemove {
                    dependent_id,
                    dependency_id,
                    ..
                } => {
                    remap(dependent_id);
                    remap(dependency_id);
                }
            }
        }
        for (temp, real) in mappings {
            self.graph.rename_task(temp, real);
        }
        self.base_edges = self
            .base_edges
            .iter()
            .map(|(a, b)| {
                (
                    mappings.get(a).cloned().unwrap_or_else(|| a.clone()),
                    mappings.get(b).cloned().unwrap_or_else(|| b.clone()),
                )
            })
            .collect();
    }

    /// Read-only consolidated plan for the current buffer.
    pub fn create_reconciliation_plan(&self) -> GraphReconciliationPlan {
        GraphReconciliationPlan {
            graph_id: DEPENDENCY_GRAPH_ID.to_string(),
            base_version: self.base_version,
            operations: consolidate_graph_operations(&self.pending, &self.base_edges),
        }
    }

    /// Flush the buffer to the store. Pending operations must not
    /// reference unmapped temporary ids; apply the tree flush's id
    /// mappings first.
    pub async fn flush(&mut self, store: &TaskStore) -> TaskResult<DependencyGraph> {
        let plan = self.create_reconciliation_plan();
        for (index, op) in plan.operations.iter().enumerate() {
            let (dependent, dependency) = op.endpoints();
            if ids::is_temp_id(dependent) || ids::is_temp_id(dependency) {
                return Err(TaskError::Reconciliation {
                    index,
                    message: format!(
                        "unmapped temporary id in dependency {dependent} -> {dependency}"
                    ),
                });
            }
        }
        let had_ops = !plan.is_empty();
        let graph = store
            .apply_reconciliation_plan(&plan)
            .await
            .map_err(|e| e.into_reconciliation(0))?;

        debug!(
            operations = plan.operations.len(),
            "tracking graph flushed"
        );

        self.base_edges = graph.edges().into_iter().collect();
        self.graph = graph.clone();
        self.pending.clear();
        if had_ops {
            self.base_version = plan.base_version + 1;
        }
        Ok(graph)
    }
}

impl Default for TrackingGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn seeded() -> TrackingGraph {
        let graph = DependencyGraph::from_parts(
            [("BBBB".to_string(), "AAAA".to_string())],
            [
                ("AAAA".to_string(), TaskStatus::Pending),
                ("BBBB".to_string(), TaskStatus::Pending),
            ],
        );
        TrackingGraph::from_graph(graph)
    }

    #[test]
    fn test_add_and_remove_record_operations() {
        let mut overlay = seeded();
        overlay.add_dependency("CCCC", "AAAA").unwrap();
        assert!(overlay.graph().has_edge("CCCC", "AAAA"));
        assert!(overlay.has_pending_changes());

        assert!(overlay.remove_dependency("CCCC", "AAAA"));
        assert!(!overlay.graph().has_edge("CCCC", "AAAA"));

        // Net effect matches the base: the plan is empty.
        let plan = overlay.create_reconciliation_plan();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_rejects_self_and_cycle_edges() {
        let mut overlay = seeded();
        assert!(matches!(
            overlay.add_dependency("AAAA", "AAAA"),
            Err(TaskError::Conflict(_))
        ));
        // BBBB -> AAAA exists; AAAA -> BBBB would close the cycle.
        assert!(matches!(
            overlay.add_dependency("AAAA", "BBBB"),
            Err(TaskError::Conflict(_))
        ));
        assert!(!overlay.has_pending_changes());
    }

    #[test]
    fn test_duplicate_add_is_a_noop() {
        let mut overlay = seeded();
        overlay.add_dependency("BBBB", "AAAA").unwrap();
        assert!(!overlay.has_pending_changes());
    }

    #[test]
    fn test_remove_missing_edge_returns_false() {
        let mut overlay = seeded();
        assert!(!overlay.remove_dependency("AAAA", "BBBB"));
        assert!(!overlay.has_pending_changes());
    }

    #[test]
    fn test_apply_id_mappings_rewrites_everything() {
        let mut overlay = TrackingGraph::new();
        overlay.add_dependency("temp-2", "temp-1").unwrap();

        let mappings: HashMap<String, String> = [
            ("temp-1".to_string(), "AAAA".to_string()),
            ("temp-2".to_string(), "BBBB".to_string()),
        ]
        .into_iter()
        .collect();
        overlay.apply_id_mappings(&mappings);

        assert!(overlay.graph().has_edge("BBBB", "AAAA"));
        let plan = overlay.create_reconciliation_plan();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].endpoints(), ("BBBB", "AAAA"));
    }

    #[tokio::test]
    async fn test_flush_rejects_unmapped_temp_ids() {
        use crate::config::{DatabaseUrl, EngineConfig};
        use crate::store::TaskStore;

        let store = TaskStore::open(&EngineConfig::new(DatabaseUrl::Memory(
            "tracking-graph-temp".to_string(),
        )))
        .await
        .unwrap();

        let mut overlay = TrackingGraph::new();
        overlay.add_dependency("temp-2", "temp-1").unwrap();
        let err = overlay.flush(&store).await.expect_err("unmapped temp ids");
        assert!(matches!(err, TaskError::Reconciliation { .. }));
        // The buffer survives the failed flush.
        assert!(overlay.has_pending_changes());
        store.close().await;
    }
}
