/// Mutable tracking overlay over a task tree.
///
/// Nodes live in an arena with parent back-pointers so mutations on deeply
/// nested nodes can record themselves on the single pending-operation
/// buffer. New children get `temp-<n>` ids; flushing hands the buffer to
/// the store as a reconciliation plan and rebuilds the overlay from the
/// persisted result, reporting the temp-to-real id mapping.
use crate::errors::{TaskError, TaskResult};
use crate::ids::TempIdAllocator;
use crate::reconcile::{consolidate_tree_operations, ReconciliationPlan, TreeOperation};
use crate::store::TaskStore;
use crate::task::{Task, TaskDraft, TaskUpdate};
use crate::tree::TaskTree;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct TrackingNode {
    task: Task,
    parent: Option<usize>,
    children: Vec<usize>,
    removed: bool,
}

/// A nested draft used to stage whole subtrees in one call.
#[derive(Debug, Clone, Default)]
pub struct TreeDraft {
    pub task: TaskDraft,
    pub children: Vec<TreeDraft>,
}

impl TreeDraft {
    pub fn new(task: TaskDraft) -> Self {
        TreeDraft {
            task,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: TreeDraft) -> Self {
        self.children.push(child);
        self
    }
}

/// Result of flushing a tracking tree.
#[derive(Debug, Clone)]
pub struct TreeFlush {
    /// The persisted tree, rooted where the plan indicated.
    pub tree: TaskTree,
    /// Temporary-to-canonical id mapping for every task minted by the
    /// flush.
    pub id_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TrackingTree {
    nodes: Vec<TrackingNode>,
    index: HashMap<String, usize>,
    root: usize,
    pending: Vec<TreeOperation>,
    base_version: u64,
    temp_ids: TempIdAllocator,
}

impl TrackingTree {
    /// Seed the overlay from a store snapshot.
    pub fn from_task_tree(tree: &TaskTree) -> Self {
        let mut overlay = TrackingTree {
            nodes: Vec::new(),
            index: HashMap::new(),
            root: 0,
            pending: Vec::new(),
            base_version: 0,
            temp_ids: TempIdAllocator::new(),
        };
        overlay.root = overlay.seed(tree, None);
        overlay
    }

    /// Single-task overlay (a leaf root).
    pub fn from_task(task: Task) -> Self {
        Self::from_task_tree(&TaskTree::leaf(task))
    }

    /// Overlay rooted at a placeholder for an already-persisted task id.
    /// Used to stage children under an existing task without loading its
    /// subtree.
    pub fn empty(root_id: &str) -> Self {
        let now = Utc::now();
        let placeholder = Task {
            id: root_id.to_string(),
            parent_id: None,
            title: root_id.to_string(),
            description: None,
            status: Default::default(),
            priority_score: crate::task::DEFAULT_PRIORITY_SCORE,
            prd: None,
            context_digest: None,
            created_at: now,
            updated_at: now,
        };
        Self::from_task(placeholder)
    }

    fn seed(&mut self, tree: &TaskTree, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(TrackingNode {
            task: tree.task().clone(),
            parent,
            children: Vec::new(),
            removed: false,
        });
        self.index.insert(tree.id().to_string(), idx);
        for child in tree.children() {
            let child_idx = self.seed(child, Some(idx));
            self.nodes[idx].children.push(child_idx);
        }
        idx
    }

    pub fn root_id(&self) -> &str {
        &self.nodes[self.root].task.id
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_operations(&self) -> &[TreeOperation] {
        &self.pending
    }

    fn live_index(&self, id: &str) -> Option<usize> {
        self.index
            .get(id)
            .copied()
            .filter(|&idx| !self.nodes[idx].removed)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live_index(id).is_some()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.live_index(id).map(|idx| &self.nodes[idx].task)
    }

    pub fn parent_id_of(&self, id: &str) -> Option<&str> {
        let idx = self.live_index(id)?;
        let parent = self.nodes[idx].parent?;
        Some(self.nodes[parent].task.id.as_str())
    }

    /// Stage a new child under `parent_id` and return its temporary id.
    pub fn add_child(&mut self, parent_id: &str, draft: TaskDraft) -> TaskResult<String> {
        crate::task::validate_title(&draft.title)?;
        if let Some(description) = &draft.description {
            crate::task::validate_description(description)?;
        }
        if let Some(score) = draft.priority_score {
            crate::task::validate_priority_score(score)?;
        }

        let parent_idx = self
            .live_index(parent_id)
            .ok_or_else(|| TaskError::NotFound(format!("parent task {parent_id}")))?;
        let parent_real_id = self.nodes[parent_idx].task.id.clone();

        let now = Utc::now();
        let temp_id = self.temp_ids.allocate();
        let task = draft.into_task(temp_id.clone(), parent_real_id.clone(), now);

        let idx = self.nodes.len();
        self.nodes.push(TrackingNode {
            task: task.clone(),
            parent: Some(parent_idx),
            children: Vec::new(),
            removed: false,
        });
        self.index.insert(temp_id.clone(), idx);
        self.nodes[parent_idx].children.push(idx);

        self.pending.push(TreeOperation::ChildAdd {
            parent_id: parent_real_id,
            child: task,
            timestamp: now,
        });
        Ok(temp_id)
    }

    /// Stage a whole subtree, parents before children. Returns the
    /// temporary id of the subtree root.
    pub fn add_subtree(&mut self, parent_id: &str, draft: &TreeDraft) -> TaskResult<String> {
        let root_temp = self.add_child(parent_id, draft.task.clone())?;
        for child in &draft.children {
            self.add_subtree(&root_temp, child)?;
        }
        Ok(root_temp)
    }

    /// Stage removal of `child_id` (and its whole subtree, bottom-up) from
    /// under `parent_id`.
    pub fn remove_child(&mut self, parent_id: &str, child_id: &str) -> TaskResult<()> {
        let parent_idx = self
            .live_index(parent_id)
            .ok_or_else(|| TaskError::NotFound(format!("parent task {parent_id}")))?;
        let child_idx = self
            .live_index(child_id)
            .ok_or_else(|| TaskError::NotFound(format!("task {child_id}")))?;
        if self.nodes[child_idx].parent != Some(parent_idx) {
            return Err(TaskError::Conflict(format!(
                "{child_id} is not a child of {parent_id}"
            )));
        }

        // Collect the subtree post-order so removals apply leaves-first.
        let mut order = Vec::new();
        self.post_order(child_idx, &mut order);

        let now = Utc::now();
        for idx in order {
            let parent_task_id = self.nodes[idx]
                .parent
                .map(|p| self.nodes[p].task.id.clone())
                .unwrap_or_else(|| self.root_id().to_string());
            self.nodes[idx].removed = true;
            let removed_id = self.nodes[idx].task.id.clone();
            self.pending.push(TreeOperation::ChildRemove {
                parent_id: parent_task_id,
                child_id: removed_id,
                timestamp: now,
            });
        }
        let keep: Vec<usize> = self.nodes[parent_idx]
            .children
            .iter()
            .copied()
            .filter(|&c| c != child_idx)
            .collect();
        self.nodes[parent_idx].children = keep;
        Ok(())
    }

    fn post_order(&self, idx: usize, out: &mut Vec<usize>) {
        for &child in &self.nodes[idx].children {
            if !self.nodes[child].removed {
                self.post_order(child, out);
            }
        }
        out.push(idx);
    }

    /// Apply a partial update to a node in place and record it.
    pub fn apply_update(&mut self, id: &str, update: TaskUpdate) -> TaskResult<()> {
        update.validate()?;
        if update.parent_id.is_some() {
            return Err(TaskError::Validation(
                "reparenting is not supported through a tracking tree".to_string(),
            ));
        }
        if update.is_empty() {
            return Ok(());
        }
        let idx = self
            .live_index(id)
            .ok_or_else(|| TaskError::NotFound(format!("task {id}")))?;

        let now = Utc::now();
        update.apply_to(&mut self.nodes[idx].task, now);
        self.pending.push(TreeOperation::TaskUpdate {
            task_id: id.to_string(),
            updates: update,
            timestamp: now,
        });
        Ok(())
    }

    /// Pure snapshot of the overlay's current (buffered) state.
    pub fn snapshot(&self) -> TaskTree {
        self.snapshot_from(self.root)
    }

    fn snapshot_from(&self, idx: usize) -> TaskTree {
        let children = self.nodes[idx]
            .children
            .iter()
            .filter(|&&child| !self.nodes[child].removed)
            .map(|&child| self.snapshot_from(child))
            .collect();
        TaskTree::new(self.nodes[idx].task.clone(), children)
    }

    /// Read-only consolidated plan for the current buffer.
    pub fn create_reconciliation_plan(&self) -> ReconciliationPlan {
        ReconciliationPlan {
            root_id: self.root_id().to_string(),
            base_version: self.base_version,
            operations: consolidate_tree_operations(&self.pending),
        }
    }

    /// Flush the buffer to the store. On success the buffer is cleared,
    /// the base version advances, and the overlay re-seeds itself from the
    /// persisted tree. On failure the buffer is preserved for retry and
    /// the error is reported as a reconciliation failure.
    pub async fn flush(&mut self, store: &TaskStore) -> TaskResult<TreeFlush> {
        let plan = self.create_reconciliation_plan();
        let had_ops = !plan.is_empty();
        let outcome = store
            .execute_reconciliation_operations(&plan)
            .await
            .map_err(|e| e.into_reconciliation(0))?;

        debug!(
            root = %plan.root_id,
            operations = plan.operations.len(),
            minted = outcome.id_mappings.len(),
            "tracking tree flushed"
        );

        *self = TrackingTree::from_task_tree(&outcome.tree);
        if had_ops {
            self.base_version = plan.base_version + 1;
        } else {
            self.base_version = plan.base_version;
        }

        Ok(TreeFlush {
            tree: outcome.tree,
            id_mappings: outcome.id_mappings,
        })
    }
}
