/// Next-task selection and completion workflow automation.
///
/// The scheduler is pure over a tree snapshot, a graph snapshot and a
/// filter; its side effects are recorded on a tracking tree the caller
/// flushes.
use crate::errors::{TaskError, TaskResult};
use crate::graph::DependencyGraph;
use crate::ids;
use crate::task::{TaskStatus, TaskUpdate};
use crate::tracking_tree::TrackingTree;
use crate::tree::{child_order, effective_from, inherit_for_children, TaskTree};
use tracing::warn;

/// Filter for availability queries.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match against the task's effective status.
    pub status: Option<TaskStatus>,
    /// Lower bound on priority score.
    pub min_priority_score: Option<i32>,
    /// Direct parent.
    pub parent_id: Option<String>,
    /// Include tasks whose dependencies are incomplete.
    pub include_blocked: bool,
}

/// Knobs for the completion workflow.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Mark every descendant done as well.
    pub cascade: bool,
    /// Flip the next available task to in-progress.
    pub auto_start: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        CompletionOptions {
            cascade: false,
            auto_start: true,
        }
    }
}

/// What a completion did.
#[derive(Debug, Clone, Default)]
pub struct CompletionOutcome {
    /// Tasks whose status was set to done, the target first.
    pub completed: Vec<String>,
    /// Task auto-started, if any.
    pub started: Option<String>,
    /// Dependents whose last remaining blocker was completed here.
    pub unblocked: Vec<String>,
}

/// Tasks matching the filter, excluding blocked tasks unless asked,
/// ordered by the tree's child-ordering rule. The synthetic project root
/// is never a candidate.
pub fn available_tasks<'a>(
    tree: &'a TaskTree,
    graph: &DependencyGraph,
    filter: &TaskFilter,
) -> Vec<&'a TaskTree> {
    let mut out = Vec::new();
    collect_available(tree, None, graph, filter, &mut out);
    out.sort_by(|a, b| child_order(a.task(), b.task()));
    out
}

fn collect_available<'a>(
    node: &'a TaskTree,
    inherited: Option<TaskStatus>,
    graph: &DependencyGraph,
    filter: &TaskFilter,
    out: &mut Vec<&'a TaskTree>,
) {
    if !ids::is_project_root(node.id()) {
        let effective = effective_from(node.status(), inherited);
        let status_ok = filter.status.map_or(true, |wanted| effective == wanted);
        let score_ok = filter
            .min_priority_score
            .map_or(true, |min| node.task().priority_score >= min);
        let parent_ok = filter
            .parent_id
            .as_deref()
            .map_or(true, |parent| node.task().parent_id.as_deref() == Some(parent));
        let blocked_ok = filter.include_blocked || !graph.is_blocked(node.id());
        if status_ok && score_ok && parent_ok && blocked_ok {
            out.push(node);
        }
    }
    let child_inherited = inherit_for_children(inherited, node.status());
    for child in node.children() {
        collect_available(child, child_inherited, graph, filter, out);
    }
}

/// The task an operator or agent should pick up next: the best-ranked
/// available task that is also effectively pending.
pub fn next_task<'a>(
    tree: &'a TaskTree,
    graph: &DependencyGraph,
    filter: &TaskFilter,
) -> Option<&'a TaskTree> {
    available_tasks(tree, graph, filter).into_iter().find(|node| {
        node.status() == TaskStatus::Pending
            && tree.effective_status(node.id()) == Some(TaskStatus::Pending)
    })
}

/// Mark `task_id` done on the tracking tree, optionally cascading to its
/// descendants, report newly unblocked dependents, and (by default)
/// auto-start the next available task: first a child of the completed
/// task, then a child of each ancestor in turn up to the root level.
pub fn complete_task(
    tracking: &mut TrackingTree,
    graph: &DependencyGraph,
    task_id: &str,
    options: &CompletionOptions,
) -> TaskResult<CompletionOutcome> {
    if !tracking.contains(task_id) {
        return Err(TaskError::NotFound(format!("task {task_id}")));
    }

    let mut completed = Vec::new();
    let already_done = tracking
        .task(task_id)
        .map(|t| t.status == TaskStatus::Done)
        .unwrap_or(false);
    if !already_done {
        tracking.apply_update(task_id, TaskUpdate::status(TaskStatus::Done))?;
    }
    completed.push(task_id.to_string());

    if options.cascade {
        let descendant_ids: Vec<String> = {
            let snapshot = tracking.snapshot();
            snapshot
                .descendants_of(task_id)
                .unwrap_or_default()
                .iter()
                .filter(|t| t.status != TaskStatus::Done)
                .map(|t| t.id.clone())
                .collect()
        };
        for id in descendant_ids {
            tracking.apply_update(&id, TaskUpdate::status(TaskStatus::Done))?;
            completed.push(id);
        }
    }

    // A dependent is newly unblocked when it was blocked and every one of
    // its blockers was completed by this call.
    let mut unblocked = Vec::new();
    for dependent in graph.dependents_of(task_id) {
        let blockers = graph.blocked_by(dependent);
        if !blockers.is_empty() && blockers.iter().all(|b| completed.contains(b)) {
            unblocked.push(dependent.clone());
        }
    }

    let mut started = None;
    if options.auto_start {
        let snapshot = tracking.snapshot();
        started = find_auto_start(&snapshot, graph, &completed, task_id);
        if let Some(id) = &started {
            tracking.apply_update(id, TaskUpdate::status(TaskStatus::InProgress))?;
        }
    }

    Ok(CompletionOutcome {
        completed,
        started,
        unblocked,
    })
}

/// Auto-start ascent: the first available child of the completed task,
/// else of each ancestor walking up, ending at the root level.
fn find_auto_start(
    snapshot: &TaskTree,
    graph: &DependencyGraph,
    completed: &[String],
    from_id: &str,
) -> Option<String> {
    let mut cursor = Some(from_id.to_string());
    while let Some(current) = cursor {
        if let Some(found) = first_available_child(snapshot, graph, completed, &current) {
            return Some(found);
        }
        cursor = snapshot.parent_of(&current).map(|p| p.id().to_string());
    }
    None
}

fn first_available_child(
    snapshot: &TaskTree,
    graph: &DependencyGraph,
    completed: &[String],
    parent_id: &str,
) -> Option<String> {
    let parent = snapshot.find_by_id(parent_id)?;
    parent
        .children()
        .iter()
        .find(|child| {
            child.status() == TaskStatus::Pending
                && graph
                    .blocked_by(child.id())
                    .iter()
                    .all(|blocker| completed.contains(blocker))
        })
        .map(|child| child.id().to_string())
}

/// Flip a pending task to in-progress. Refuses while the task is blocked;
/// `force` bypasses the guard with a warning.
pub fn start_work(
    tracking: &mut TrackingTree,
    graph: &DependencyGraph,
    task_id: &str,
    force: bool,
) -> TaskResult<()> {
    let Some(task) = tracking.task(task_id) else {
        return Err(TaskError::NotFound(format!("task {task_id}")));
    };
    if task.status != TaskStatus::Pending {
        return Err(TaskError::Conflict(format!(
            "task {task_id} is {}, only pending tasks can be started",
            task.status
        )));
    }
    let blockers = graph.blocked_by(task_id);
    if !blockers.is_empty() {
        if force {
            warn!(
                task = task_id,
                blockers = %blockers.join(", "),
                "starting blocked task anyway"
            );
        } else {
            return Err(TaskError::Conflict(format!(
                "task {task_id} is blocked by {}",
                blockers.join(", ")
            )));
        }
    }
    tracking.apply_update(task_id, TaskUpdate::status(TaskStatus::InProgress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PROJECT_ROOT_ID;
    use crate::task::{Task, TaskDraft};
    use chrono::{Duration, Utc};

    fn task(id: &str, parent: &str, status: TaskStatus, score: i32, age_secs: i64) -> Task {
        let now = Utc::now() - Duration::seconds(age_secs);
        TaskDraft::new(format!("task {id}"))
            .with_status(status)
            .with_priority_score(score)
            .into_task(id.to_string(), parent.to_string(), now)
    }

    fn root() -> Task {
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

    /// Tasks A(60), B(80, depends on A), C(50), all pending at root level.
    fn scenario_three() -> (TaskTree, DependencyGraph) {
        let tasks = vec![
            root(),
            task("AAAA", PROJECT_ROOT_ID, TaskStatus::Pending, 60, 30),
            task("BBBB", PROJECT_ROOT_ID, TaskStatus::Pending, 80, 20),
            task("CCCC", PROJECT_ROOT_ID, TaskStatus::Pending, 50, 10),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        let graph = DependencyGraph::from_parts(
            [("BBBB".to_string(), "AAAA".to_string())],
            tree.to_tasks()
                .into_iter()
                .filter(|t| !t.is_project_root())
                .map(|t| (t.id.clone(), t.status)),
        );
        (tree, graph)
    }

    #[test]
    fn test_next_task_picks_unblocked_highest() {
        let (tree, graph) = scenario_three();
        // B outranks A but is blocked by it; C has a lower score than A.
        let next = next_task(&tree, &graph, &TaskFilter::default()).expect("next");
        assert_eq!(next.id(), "AAAA");
    }

    #[test]
    fn test_available_tasks_filters() {
        let (tree, graph) = scenario_three();

        let available = available_tasks(&tree, &graph, &TaskFilter::default());
        let ids: Vec<&str> = available.iter().map(|n| n.id()).collect();
        assert_eq!(ids, ["AAAA", "CCCC"]);

        let with_blocked = available_tasks(
            &tree,
            &graph,
            &TaskFilter {
                include_blocked: true,
                ..Default::default()
            },
        );
        let ids: Vec<&str> = with_blocked.iter().map(|n| n.id()).collect();
        assert_eq!(ids, ["BBBB", "AAAA", "CCCC"]);

        let scored = available_tasks(
            &tree,
            &graph,
            &TaskFilter {
                min_priority_score: Some(55),
                ..Default::default()
            },
        );
        let ids: Vec<&str> = scored.iter().map(|n| n.id()).collect();
        assert_eq!(ids, ["AAAA"]);
    }

    #[test]
    fn test_next_task_skips_effectively_done_subtrees() {
        let tasks = vec![
            root(),
            task("RRRR", PROJECT_ROOT_ID, TaskStatus::Done, 90, 20),
            task("RRRR-XXXX", "RRRR", TaskStatus::InProgress, 99, 10),
            task("SSSS", PROJECT_ROOT_ID, TaskStatus::Pending, 10, 5),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        let graph = DependencyGraph::new();

        let next = next_task(&tree, &graph, &TaskFilter::default()).expect("next");
        assert_eq!(next.id(), "SSSS");
    }

    #[test]
    fn test_complete_auto_starts_unblocked_dependent() {
        let (tree, graph) = scenario_three();
        let mut tracking = TrackingTree::from_task_tree(&tree);

        let outcome =
            complete_task(&mut tracking, &graph, "AAAA", &CompletionOptions::default()).unwrap();

        assert_eq!(outcome.completed, ["AAAA"]);
        // B is now unblocked and outranks C.
        assert_eq!(outcome.started.as_deref(), Some("BBBB"));
        assert_eq!(outcome.unblocked, ["BBBB"]);

        assert_eq!(tracking.task("AAAA").unwrap().status, TaskStatus::Done);
        assert_eq!(
            tracking.task("BBBB").unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_complete_prefers_child_of_completed_task() {
        let tasks = vec![
            root(),
            task("AAAA", PROJECT_ROOT_ID, TaskStatus::InProgress, 60, 30),
            task("AAAA-XXXX", "AAAA", TaskStatus::Pending, 40, 20),
            task("BBBB", PROJECT_ROOT_ID, TaskStatus::Pending, 90, 10),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        let graph = DependencyGraph::from_parts(
            std::iter::empty(),
            tree.to_tasks()
                .into_iter()
                .filter(|t| !t.is_project_root())
                .map(|t| (t.id.clone(), t.status)),
        );
        let mut tracking = TrackingTree::from_task_tree(&tree);

        let outcome =
            complete_task(&mut tracking, &graph, "AAAA", &CompletionOptions::default()).unwrap();
        // The completed task's own child wins over the higher-scored
        // root-level task.
        assert_eq!(outcome.started.as_deref(), Some("AAAA-XXXX"));
    }

    #[test]
    fn test_complete_with_cascade_marks_descendants() {
        let tasks = vec![
            root(),
            task("AAAA", PROJECT_ROOT_ID, TaskStatus::InProgress, 60, 30),
            task("AAAA-XXXX", "AAAA", TaskStatus::Pending, 40, 20),
            task("AAAA-XXXX-YYYY", "AAAA-XXXX", TaskStatus::InProgress, 40, 10),
        ];
        let tree = TaskTree::from_tasks(tasks, PROJECT_ROOT_ID).unwrap();
        let graph = DependencyGraph::new();
        let mut tracking = TrackingTree::from_task_tree(&tree);

        let outcome = complete_task(
            &mut tracking,
            &graph,
            "AAAA",
            &CompletionOptions {
                cascade: true,
                auto_start: true,
            },
        )
        .unwrap();

        assert_eq!(outcome.completed.len(), 3);
        assert_eq!(tracking.task("AAAA-XXXX").unwrap().status, TaskStatus::Done);
        assert_eq!(
            tracking.task("AAAA-XXXX-YYYY").unwrap().status,
            TaskStatus::Done
        );
        // Everything under AAAA is done and there is nothing else to start.
        assert!(outcome.started.is_none());
    }

    #[test]
    fn test_start_work_guard() {
        let (tree, graph) = scenario_three();
        let mut tracking = TrackingTree::from_task_tree(&tree);

        let err = start_work(&mut tracking, &graph, "BBBB", false).expect_err("blocked");
        assert!(matches!(err, TaskError::Conflict(_)));
        assert_eq!(tracking.task("BBBB").unwrap().status, TaskStatus::Pending);

        start_work(&mut tracking, &graph, "BBBB", true).expect("forced");
        assert_eq!(
            tracking.task("BBBB").unwrap().status,
            TaskStatus::InProgress
        );

        let err = start_work(&mut tracking, &graph, "BBBB", false).expect_err("not pending");
        assert!(matches!(err, TaskError::Conflict(_)));
    }

    #[test]
    fn test_complete_unknown_task() {
        let (tree, graph) = scenario_three();
        let mut tracking = TrackingTree::from_task_tree(&tree);
        assert!(matches!(
            complete_task(&mut tracking, &graph, "ZZZZ", &CompletionOptions::default()),
            Err(TaskError::NotFound(_))
        ));
    }
}
