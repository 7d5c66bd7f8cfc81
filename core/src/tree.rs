/// Immutable hierarchical task tree.
///
/// A `TaskTree` is a pure value: a task plus an ordered list of child
/// trees. Queries are addressed by task id from the owning root. Child
/// ordering is deterministic: completed (terminal-status) tasks last, then
/// priority score descending, then creation time ascending, id as the final
/// tiebreak.
use crate::graph::DependencyGraph;
use crate::ids;
use crate::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTree {
    task: Task,
    children: Vec<TaskTree>,
}

/// Deterministic sibling ordering.
pub(crate) fn child_order(a: &Task, b: &Task) -> Ordering {
    a.status
        .is_terminal()
        .cmp(&b.status.is_terminal())
        .then_with(|| b.priority_score.cmp(&a.priority_score))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

impl TaskTree {
    /// Build a node from a task and children; children are re-sorted.
    pub fn new(task: Task, mut children: Vec<TaskTree>) -> Self {
        children.sort_by(|a, b| child_order(&a.task, &b.task));
        TaskTree { task, children }
    }

    /// Leaf node.
    pub fn leaf(task: Task) -> Self {
        TaskTree {
            task,
            children: Vec::new(),
        }
    }

    /// Assemble a tree from a flat task list, rooted at `root_id`. Tasks
    /// not reachable from the root are ignored. Returns None when the root
    /// is absent.
    pub fn from_tasks<I>(tasks: I, root_id: &str) -> Option<TaskTree>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut by_parent: HashMap<String, Vec<Task>> = HashMap::new();
        let mut root_task = None;
        for task in tasks {
            if task.id == root_id {
                root_task = Some(task);
            } else if let Some(parent) = &task.parent_id {
                by_parent.entry(parent.clone()).or_default().push(task);
            }
        }

        fn build(task: Task, by_parent: &mut HashMap<String, Vec<Task>>) -> TaskTree {
            let children = by_parent
                .remove(&task.id)
                .unwrap_or_default()
                .into_iter()
                .map(|child| build(child, by_parent))
                .collect();
            TaskTree::new(task, children)
        }

        root_task.map(|task| build(task, &mut by_parent))
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn children(&self) -> &[TaskTree] {
        &self.children
    }

    /// Copy-on-write: same task, new (re-sorted) children.
    pub fn with_children(&self, children: Vec<TaskTree>) -> TaskTree {
        TaskTree::new(self.task.clone(), children)
    }

    /// Total node count including this one.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(TaskTree::len).sum::<usize>()
    }

    /// Pre-order depth-first walk; the visitor sees each node with its
    /// depth relative to this root.
    pub fn walk_depth_first<'a>(&'a self, visitor: &mut dyn FnMut(&'a TaskTree, usize)) {
        self.walk_inner(0, visitor);
    }

    fn walk_inner<'a>(&'a self, depth: usize, visitor: &mut dyn FnMut(&'a TaskTree, usize)) {
        visitor(self, depth);
        for child in &self.children {
            child.walk_inner(depth + 1, visitor);
        }
    }

    /// First node (pre-order) whose task matches the predicate.
    pub fn find(&self, predicate: &mut dyn FnMut(&Task) -> bool) -> Option<&TaskTree> {
        if predicate(&self.task) {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find(predicate))
    }

    pub fn find_by_id(&self, id: &str) -> Option<&TaskTree> {
        self.find(&mut |task| task.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find_by_id(id).is_some()
    }

    /// Parent node of `id` within this tree, None for the root itself.
    pub fn parent_of(&self, id: &str) -> Option<&TaskTree> {
        if self.task.id == id {
            return None;
        }
        if self.children.iter().any(|child| child.task.id == id) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.parent_of(id))
    }

    /// Root-to-node path of tasks, inclusive of both ends.
    pub fn path_to(&self, id: &str) -> Option<Vec<&Task>> {
        if self.task.id == id {
            return Some(vec![&self.task]);
        }
        for child in &self.children {
            if let Some(mut path) = child.path_to(id) {
                path.insert(0, &self.task);
                return Some(path);
            }
        }
        None
    }

    /// All strict descendants of this node, pre-order.
    pub fn all_descendants(&self) -> Vec<&Task> {
        let mut out = Vec::new();
        for child in &self.children {
            child.walk_inner(0, &mut |node, _| out.push(&node.task));
        }
        out
    }

    /// All strict descendants of the node `id`.
    pub fn descendants_of(&self, id: &str) -> Option<Vec<&Task>> {
        self.find_by_id(id).map(TaskTree::all_descendants)
    }

    /// Effective status of node `id` after ancestor inheritance: done if
    /// any ancestor (or the node itself) is done, else archived if any
    /// ancestor is archived, else cancelled if any ancestor is cancelled,
    /// else the node's own status.
    pub fn effective_status(&self, id: &str) -> Option<TaskStatus> {
        let path = self.path_to(id)?;
        let (node, ancestors) = path.split_last()?;
        Some(effective_from(
            node.status,
            ancestors.iter().map(|task| task.status),
        ))
    }

    /// True when a strict ancestor of `id` has the given status.
    pub fn has_ancestor_with_status(&self, id: &str, status: TaskStatus) -> bool {
        self.ancestor_with_status(id, status).is_some()
    }

    /// Nearest strict ancestor of `id` with the given status.
    pub fn ancestor_with_status(&self, id: &str, status: TaskStatus) -> Option<&Task> {
        let path = self.path_to(id)?;
        let (_, ancestors) = path.split_last()?;
        ancestors
            .iter()
            .rev()
            .find(|task| task.status == status)
            .copied()
    }

    /// True when `id` has at least one incomplete dependency.
    pub fn is_blocked(&self, id: &str, graph: &DependencyGraph) -> bool {
        graph.is_blocked(id)
    }

    /// A task can start when it is pending and not blocked.
    pub fn can_start(&self, id: &str, graph: &DependencyGraph) -> bool {
        match self.find_by_id(id) {
            Some(node) => node.status() == TaskStatus::Pending && !graph.is_blocked(id),
            None => false,
        }
    }

    /// First descendant in traversal order that can start, honouring
    /// effective-status inheritance (a pending child of a done parent is
    /// effectively done and never selected).
    pub fn next_available_task(&self, graph: &DependencyGraph) -> Option<&TaskTree> {
        self.next_available_inner(None, graph)
    }

    fn next_available_inner(
        &self,
        inherited: Option<TaskStatus>,
        graph: &DependencyGraph,
    ) -> Option<&TaskTree> {
        let effective = inherited.unwrap_or(self.task.status);
        if !ids::is_project_root(&self.task.id)
            && effective == TaskStatus::Pending
            && !graph.is_blocked(&self.task.id)
        {
            return Some(self);
        }
        let child_inherited = inherit_for_children(inherited, self.task.status);
        self.children
            .iter()
            .find_map(|child| child.next_available_inner(child_inherited, graph))
    }

    /// Direct children of `id` that can start.
    pub fn available_children(&self, id: &str, graph: &DependencyGraph) -> Vec<&TaskTree> {
        let Some(node) = self.find_by_id(id) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter(|child| {
                child.status() == TaskStatus::Pending && !graph.is_blocked(child.id())
            })
            .collect()
    }

    /// Plain serde value form.
    pub fn to_plain_object(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Flatten into owned tasks, pre-order.
    pub fn to_tasks(&self) -> Vec<Task> {
        let mut out = Vec::with_capacity(self.len());
        self.walk_inner(0, &mut |node, _| out.push(node.task.clone()));
        out
    }
}

/// Resolve an effective status from a node's own status and its ancestor
/// statuses. Priority: done > archived > cancelled > own.
pub(crate) fn effective_from<I>(own: TaskStatus, ancestors: I) -> TaskStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut archived = false;
    let mut cancelled = false;
    for status in ancestors {
        match status {
            TaskStatus::Done => return TaskStatus::Done,
            TaskStatus::Archived => archived = true,
            TaskStatus::Cancelled => cancelled = true,
            _ => {}
        }
    }
    if own == TaskStatus::Done {
        TaskStatus::Done
    } else if archived {
        TaskStatus::Archived
    } else if cancelled {
        TaskStatus::Cancelled
    } else {
        own
    }
}

/// Status override to propagate to children given the current node's own
/// status and the override already in effect. Higher-priority overrides win.
pub(crate) fn inherit_for_children(
    inherited: Option<TaskStatus>,
    own: TaskStatus,
) -> Option<TaskStatus> {
    fn rank(status: TaskStatus) -> u8 {
        match status {
            TaskStatus::Done => 3,
            TaskStatus::Archived => 2,
            TaskStatus::Cancelled => 1,
            _ => 0,
        }
    }

    let own_override = if own.is_terminal() { Some(own) } else { None };
    match (inherited, own_override) {
        (Some(a), Some(b)) => Some(if rank(a) >= rank(b) { a } else { b }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PROJECT_ROOT_ID;
    use crate::task::TaskDraft;
    use chrono::{Duration, Utc};

    fn task(id: &str, parent: &str, status: TaskStatus, score: i32, age_secs: i64) -> Task {
        let now = Utc::now() - Duration::seconds(age_secs);
        let mut task = TaskDraft::new(format!("task {id}"))
            .with_status(status)
            .with_priority_score(score)
            .into_task(id.to_string(), parent.to_string(), now);
        task.updated_at = now;
        task
    }

    fn root_task() -> Task {
        let now = Utc::now();
        Task {
            id: PROJECT_ROOT_ID.to_string(),
            parent_id: None,
            title: "Project Root".to_string(),
            description: None,
            status: TaskStatus::Pending,
            priority_score: 0,
            prd: None,
            context_digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_tree() -> TaskTree {
        // ROOT -> A(60), B(80), C(50, done)
        //   A -> A1, A2(done)
        let tasks = vec![
            root_task(),
            task("AAAA", PROJECT_ROOT_ID, TaskStatus::Pending, 60, 50),
            task("BBBB", PROJECT_ROOT_ID, TaskStatus::Pending, 80, 40),
            task("CCCC", PROJECT_ROOT_ID, TaskStatus::Done, 50, 30),
            task("AAAA-XXXX", "AAAA", TaskStatus::Pending, 50, 20),
            task("AAAA-YYYY", "AAAA", TaskStatus::Done, 90, 10),
        ];
        TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).expect("root present")
    }

    #[test]
    fn test_child_ordering() {
        let tree = sample_tree();
        let ids: Vec<&str> = tree.children().iter().map(TaskTree::id).collect();
        // Done last, then priority descending.
        assert_eq!(ids, ["BBBB", "AAAA", "CCCC"]);

        let a = tree.find_by_id("AAAA").unwrap();
        let ids: Vec<&str> = a.children().iter().map(TaskTree::id).collect();
        assert_eq!(ids, ["AAAA-XXXX", "AAAA-YYYY"]);
    }

    #[test]
    fn test_order_is_stable_across_reads(){
        let tree = sample_tree();
        let first: Vec<String> = tree.children().iter().map(|c| c.id().to_string()).collect();
        let second: Vec<String> = tree.children().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_path_and_parent() {
        let tree = sample_tree();
        let path = tree.path_to("AAAA-XXXX").expect("path");
        let ids: Vec<&str> = path.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, [PROJECT_ROOT_ID, "AAAA", "AAAA-XXXX"]);

        assert_eq!(tree.parent_of("AAAA-XXXX").unwrap().id(), "AAAA");
        assert!(tree.parent_of(PROJECT_ROOT_ID).is_none());
        assert!(tree.path_to("ZZZZ").is_none());
    }

    #[test]
    fn test_descendants() {
        let tree = sample_tree();
        let descendants = tree.descendants_of("AAAA").unwrap();
        let ids: Vec<&str> = descendants.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["AAAA-XXXX", "AAAA-YYYY"]);

        assert_eq!(tree.all_descendants().len(), 5);
    }

    #[test]
    fn test_effective_status_inheritance() {
        // Root done with an in-progress child: the child is effectively done.
        let tasks = vec![
            root_task(),
            task("RRRR", PROJECT_ROOT_ID, TaskStatus::Done, 50, 20),
            task("RRRR-XXXX", "RRRR", TaskStatus::InProgress, 50, 10),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();

        assert_eq!(
            tree.effective_status("RRRR-XXXX"),
            Some(TaskStatus::Done)
        );
        assert_eq!(tree.effective_status("RRRR"), Some(TaskStatus::Done));
        assert!(tree.has_ancestor_with_status("RRRR-XXXX", TaskStatus::Done));
        assert_eq!(
            tree.ancestor_with_status("RRRR-XXXX", TaskStatus::Done)
                .map(|t| t.id.as_str()),
            Some("RRRR")
        );
    }

    #[test]
    fn test_effective_status_priority() {
        // archived ancestor beats cancelled ancestor further down.
        let tasks = vec![
            root_task(),
            task("AAAA", PROJECT_ROOT_ID, TaskStatus::Archived, 50, 30),
            task("AAAA-BBBB", "AAAA", TaskStatus::Cancelled, 50, 20),
            task("AAAA-BBBB-CCCC", "AAAA-BBBB", TaskStatus::Pending, 50, 10),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        assert_eq!(
            tree.effective_status("AAAA-BBBB-CCCC"),
            Some(TaskStatus::Archived)
        );
    }

    #[test]
    fn test_blocked_and_can_start() {
        let tree = sample_tree();
        let graph = DependencyGraph::from_parts(
            [("BBBB".to_string(), "AAAA".to_string())],
            tree.to_tasks()
                .into_iter()
                .map(|t| (t.id.clone(), t.status)),
        );

        assert!(tree.is_blocked("BBBB", &graph));
        assert!(!tree.can_start("BBBB", &graph));
        assert!(tree.can_start("AAAA", &graph));
    }

    #[test]
    fn test_next_available_respects_blocking_and_priority() {
        let tree = sample_tree();
        let graph = DependencyGraph::from_parts(
            [("BBBB".to_string(), "AAAA".to_string())],
            tree.to_tasks()
                .into_iter()
                .map(|t| (t.id.clone(), t.status)),
        );

        // BBBB sorts first (score 80) but is blocked by AAAA.
        let next = tree.next_available_task(&graph).expect("available task");
        assert_eq!(next.id(), "AAAA");
    }

    #[test]
    fn test_next_available_skips_effectively_done() {
        let tasks = vec![
            root_task(),
            task("RRRR", PROJECT_ROOT_ID, TaskStatus::Done, 90, 20),
            task("RRRR-XXXX", "RRRR", TaskStatus::Pending, 99, 10),
            task("SSSS", PROJECT_ROOT_ID, TaskStatus::Pending, 10, 5),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        let graph = DependencyGraph::new();

        // RRRR-XXXX is pending under a done parent: effectively done.
        let next = tree.next_available_task(&graph).expect("available task");
        assert_eq!(next.id(), "SSSS");
    }

    #[test]
    fn test_available_children() {
        let tree = sample_tree();
        let graph = DependencyGraph::new();
        let available = tree.available_children("AAAA", &graph);
        let ids: Vec<&str> = available.iter().map(|c| c.id()).collect();
        assert_eq!(ids, ["AAAA-XXXX"]);
    }

    #[test]
    fn test_with_children_resorts() {
        let tree = sample_tree();
        let reversed: Vec<TaskTree> = tree.children().iter().rev().cloned().collect();
        let rebuilt = tree.with_children(reversed);
        let ids: Vec<&str> = rebuilt.children().iter().map(TaskTree::id).collect();
        assert_eq!(ids, ["BBBB", "AAAA", "CCCC"]);
    }
}
