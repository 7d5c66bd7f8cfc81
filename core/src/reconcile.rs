/// Pending operations and reconciliation plans.
///
/// Tracking overlays buffer timestamped operations and hand them to the
/// store as a plan to be applied atomically. Consolidation compresses the
/// buffer without changing its meaning: task updates merge field-wise with
/// last-writer-wins, structural tree operations are never consolidated, and
/// graph operations reduce to the net effect per edge.
use crate::task::{Task, TaskUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A buffered mutation of a tracking tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TreeOperation {
    /// Insert `child` under `parent_id`. The child (and the parent) may
    /// carry overlay-temporary ids; the store mints canonical ids and
    /// reports the mapping.
    ChildAdd {
        parent_id: String,
        child: Task,
        timestamp: DateTime<Utc>,
    },

    /// Delete the edge and the child row. The overlay records removals
    /// bottom-up so the store never sees a child-bearing delete.
    ChildRemove {
        parent_id: String,
        child_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Partial field update of an existing task.
    TaskUpdate {
        task_id: String,
        updates: TaskUpdate,
        timestamp: DateTime<Utc>,
    },
}

impl TreeOperation {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TreeOperation::ChildAdd { timestamp, .. }
            | TreeOperation::ChildRemove { timestamp, .. }
            | TreeOperation::TaskUpdate { timestamp, .. } => *timestamp,
        }
    }
}

/// The bundle a tracking tree hands to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationPlan {
    /// Root the resulting tree is reported from. May be temporary.
    pub root_id: String,
    pub base_version: u64,
    pub operations: Vec<TreeOperation>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A buffered mutation of a tracking graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOperation {
    DependencyAdd {
        dependent_id: String,
        dependency_id: String,
        timestamp: DateTime<Utc>,
    },
    DependencyRemove {
        dependent_id: String,
        dependency_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl GraphOperation {
    pub fn endpoints(&self) -> (&str, &str) {
        match self {
            GraphOperation::DependencyAdd {
                dependent_id,
                dependency_id,
                ..
            }
            | GraphOperation::DependencyRemove {
                dependent_id,
                dependency_id,
                ..
            } => (dependent_id, dependency_id),
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, GraphOperation::DependencyAdd { .. })
    }
}

/// The bundle a tracking graph hands to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphReconciliationPlan {
    pub graph_id: String,
    pub base_version: u64,
    pub operations: Vec<GraphOperation>,
}

impl GraphReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Consolidate tree operations: per task, keep one merged `TaskUpdate` at
/// the position of the last write; structural operations pass through
/// untouched in their original order.
pub fn consolidate_tree_operations(operations: &[TreeOperation]) -> Vec<TreeOperation> {
    // Last update index and merged payload per task id.
    let mut merged: HashMap<String, (usize, TaskUpdate, DateTime<Utc>)> = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        if let TreeOperation::TaskUpdate {
            task_id,
            updates,
            timestamp,
        } = op
        {
            match merged.get_mut(task_id) {
                Some((last_index, acc, last_ts)) => {
                    acc.merge(updates);
                    *last_index = index;
                    *last_ts = *timestamp;
                }
                None => {
                    merged.insert(task_id.clone(), (index, updates.clone(), *timestamp));
                }
            }
        }
    }

    let mut out = Vec::with_capacity(operations.len());
    for (index, op) in operations.iter().enumerate() {
        match op {
            TreeOperation::TaskUpdate { task_id, .. } => {
                let (last_index, updates, timestamp) = &merged[task_id];
                if *last_index == index {
                    out.push(TreeOperation::TaskUpdate {
                        task_id: task_id.clone(),
                        updates: updates.clone(),
                        timestamp: *timestamp,
                    });
                }
            }
            other => out.push(other.clone()),
        }
    }
    out
}

/// Consolidate graph operations against the overlay's base edge set: per
/// `(dependent, dependency)` pair only the latest operation survives, and a
/// pair whose net effect matches the base emits nothing at all.
pub fn consolidate_graph_operations(
    operations: &[GraphOperation],
    base_edges: &HashSet<(String, String)>,
) -> Vec<GraphOperation> {
    // Last operation index per pair; the last op determines final presence.
    let mut last_for_pair: HashMap<(String, String), usize> = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        let (dependent, dependency) = op.endpoints();
        last_for_pair.insert((dependent.to_string(), dependency.to_string()), index);
    }

    let mut out = Vec::new();
    for (index, op) in operations.iter().enumerate() {
        let (dependent, dependency) = op.endpoints();
        let pair = (dependent.to_string(), dependency.to_string());
        if last_for_pair[&pair] != index {
            continue;
        }
        let final_presence = op.is_add();
        let base_presence = base_edges.contains(&pair);
        if final_presence != base_presence {
            out.push(op.clone());
        }
    }
    out
}
