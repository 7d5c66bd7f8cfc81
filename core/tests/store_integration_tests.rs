/// Integration tests for the store, the advisory lock protocol and the
/// tracking-overlay flush laws.
use astrotask_core::{
    DatabaseUrl, EngineConfig, LockHolder, ProcessLock, TaskDraft, TaskError, TaskListFilter,
    TaskStatus, TaskStore, TaskUpdate, TrackingGraph, TrackingTree,
};
use chrono::Utc;
use std::fs;
use tempfile::TempDir;

fn file_config(dir: &TempDir, process: &str) -> EngineConfig {
    EngineConfig::new(DatabaseUrl::Sqlite(dir.path().join("tasks.db")))
        .with_process_label(process)
}

async fn memory_store(label: &str) -> TaskStore {
    TaskStore::open(&EngineConfig::new(DatabaseUrl::Memory(format!(
        "integration-{label}"
    ))))
    .await
    .expect("open store")
}

fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn child");
    let pid = child.id();
    child.wait().expect("wait child");
    pid
}

#[tokio::test]
async fn test_lock_takeover_scenario() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("tasks.db");

    // P1 opens the database.
    let p1 = TaskStore::open(&file_config(&dir, "p1")).await.expect("p1 opens");

    // P2 opens the same path and gets Busy with P1's identity.
    let err = TaskStore::open(&file_config(&dir, "p2"))
        .await
        .expect_err("p2 is locked out");
    match err {
        TaskError::Busy { holder } => {
            assert_eq!(holder.pid, std::process::id());
            assert_eq!(holder.process, "p1");
        }
        other => panic!("expected Busy, got {other:?}"),
    }
    p1.close().await;

    // Simulate a crashed holder: a same-host lock file whose pid is dead.
    let lock_path = ProcessLock::lock_path_for(&db_path);
    let probe = ProcessLock::acquire(&db_path, "probe").expect("probe acquire");
    let host = probe.holder().host.clone();
    probe.release().expect("probe release");
    let stale = LockHolder {
        pid: dead_pid(),
        host,
        process: "crashed".to_string(),
        timestamp: Utc::now().timestamp_millis(),
    };
    fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

    // P3 opens the same path, takes the stale lock over, and the lock
    // file now bears P3's pid.
    let p3 = TaskStore::open(&file_config(&dir, "p3")).await.expect("p3 takeover");
    let holder = ProcessLock::read_holder(&db_path).expect("holder present");
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(holder.process, "p3");
    p3.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent_and_releases_lock() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("tasks.db");

    let store = TaskStore::open(&file_config(&dir, "closer")).await?;
    assert!(ProcessLock::read_holder(&db_path).is_some());

    store.close().await;
    assert!(ProcessLock::read_holder(&db_path).is_none());
    store.close().await; // second close is a no-op
    Ok(())
}

#[tokio::test]
async fn test_data_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let store = TaskStore::open(&file_config(&dir, "writer")).await?;
    let task = store.add_task(&TaskDraft::new("durable")).await?;
    store.close().await;

    let store = TaskStore::open(&file_config(&dir, "reader")).await?;
    let loaded = store.get_task(&task.id).await?.expect("persisted");
    assert_eq!(loaded.title, "durable");
    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_flush_without_pending_ops_is_a_noop() {
    let store = memory_store("noop-flush").await;
    store.add_task(&TaskDraft::new("existing")).await.unwrap();

    let tree = store
        .build_task_tree(astrotask_core::PROJECT_ROOT_ID)
        .await
        .unwrap();
    let mut tracking = TrackingTree::from_task_tree(&tree);
    assert!(!tracking.has_pending_changes());

    let flush = tracking.flush(&store).await.unwrap();
    assert!(flush.id_mappings.is_empty());

    let tasks = store.list_tasks(&TaskListFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(flush.tree.len(), 2); // root + task
}

#[tokio::test]
async fn test_tree_flush_mints_ids_and_clears_buffer() {
    let store = memory_store("tree-flush").await;

    let tree = store
        .build_task_tree(astrotask_core::PROJECT_ROOT_ID)
        .await
        .unwrap();
    let mut tracking = TrackingTree::from_task_tree(&tree);
    let epic = tracking
        .add_child(astrotask_core::PROJECT_ROOT_ID, TaskDraft::new("Epic"))
        .unwrap();
    let child = tracking.add_child(&epic, TaskDraft::new("Child")).unwrap();

    let flush = tracking.flush(&store).await.unwrap();
    assert_eq!(flush.id_mappings.len(), 2);
    assert!(!tracking.has_pending_changes());

    let epic_id = &flush.id_mappings[&epic];
    let child_id = &flush.id_mappings[&child];
    assert!(child_id.starts_with(&format!("{epic_id}-")));

    // The overlay reseeded itself onto canonical ids.
    assert!(tracking.contains(epic_id));
    assert!(!tracking.contains(&epic));
}

#[tokio::test]
async fn test_failed_flush_preserves_buffer_for_retry() {
    let store = memory_store("flush-retry").await;

    // Stage a child under a task that does not exist yet.
    let mut tracking = TrackingTree::empty("AAAA");
    tracking.add_child("AAAA", TaskDraft::new("early")).unwrap();

    let err = tracking.flush(&store).await.expect_err("parent missing");
    assert!(matches!(err, TaskError::Reconciliation { .. }));
    assert!(tracking.has_pending_changes());

    // Create the parent, then retry the same overlay.
    let now_plan = tracking.create_reconciliation_plan();
    assert_eq!(now_plan.operations.len(), 1);

    // The parent must exist with exactly the id the overlay targets;
    // reconciliation plans accept canonical ids supplied by the caller.
    let root_tree = store
        .build_task_tree(astrotask_core::PROJECT_ROOT_ID)
        .await
        .unwrap();
    assert!(root_tree.find_by_id("AAAA").is_none());
    let now = Utc::now();
    let parent = TaskDraft::new("parent").into_task(
        "temp-99".to_string(),
        astrotask_core::PROJECT_ROOT_ID.to_string(),
        now,
    );
    let plan = astrotask_core::ReconciliationPlan {
        root_id: astrotask_core::PROJECT_ROOT_ID.to_string(),
        base_version: 0,
        operations: vec![astrotask_core::TreeOperation::ChildAdd {
            parent_id: astrotask_core::PROJECT_ROOT_ID.to_string(),
            child: parent,
            timestamp: now,
        }],
    };
    let outcome = store.execute_reconciliation_operations(&plan).await.unwrap();
    let parent_id = outcome.id_mappings["temp-99"].clone();

    // Retarget cannot happen inside the overlay, so this retry still
    // fails: the overlay's root id "AAAA" was never created.
    let err = tracking.flush(&store).await.expect_err("still missing");
    assert!(matches!(err, TaskError::Reconciliation { .. }));
    assert!(tracking.has_pending_changes());

    // A fresh overlay rooted at the real parent succeeds.
    let mut tracking = TrackingTree::empty(&parent_id);
    tracking.add_child(&parent_id, TaskDraft::new("late")).unwrap();
    let flush = tracking.flush(&store).await.unwrap();
    assert_eq!(flush.id_mappings.len(), 1);
}

#[tokio::test]
async fn test_update_consolidation_round_trip() {
    let store = memory_store("update-merge").await;
    let task = store.add_task(&TaskDraft::new("start")).await.unwrap();

    let tree = store
        .build_task_tree(astrotask_core::PROJECT_ROOT_ID)
        .await
        .unwrap();
    let mut tracking = TrackingTree::from_task_tree(&tree);
    tracking
        .apply_update(
            &task.id,
            TaskUpdate {
                title: Some("renamed".to_string()),
                priority_score: Some(80),
                ..Default::default()
            },
        )
        .unwrap();
    tracking
        .apply_update(
            &task.id,
            TaskUpdate {
                title: Some("renamed again".to_string()),
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .unwrap();

    // One merged update survives consolidation.
    assert_eq!(tracking.create_reconciliation_plan().operations.len(), 1);
    tracking.flush(&store).await.unwrap();

    let loaded = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.title, "renamed again");
    assert_eq!(loaded.priority_score, 80);
    assert_eq!(loaded.status, TaskStatus::InProgress);
}

#[tokio::test]
async fn test_graph_overlay_net_zero_flush() {
    let store = memory_store("graph-net-zero").await;
    let a = store.add_task(&TaskDraft::new("a")).await.unwrap();
    let b = store.add_task(&TaskDraft::new("b")).await.unwrap();

    let graph = store.build_dependency_graph().await.unwrap();
    let mut overlay = TrackingGraph::from_graph(graph);
    overlay.add_dependency(&b.id, &a.id).unwrap();
    assert!(overlay.remove_dependency(&b.id, &a.id));

    let flushed = overlay.flush(&store).await.unwrap();
    assert_eq!(flushed.edge_count(), 0);

    let reloaded = store.build_dependency_graph().await.unwrap();
    assert_eq!(reloaded.edge_count(), 0);
}

#[tokio::test]
async fn test_graph_overlay_flush_applies_edges() {
    let store = memory_store("graph-flush").await;
    let a = store.add_task(&TaskDraft::new("a")).await.unwrap();
    let b = store.add_task(&TaskDraft::new("b")).await.unwrap();
    let c = store.add_task(&TaskDraft::new("c")).await.unwrap();

    let mut overlay = TrackingGraph::from_graph(store.build_dependency_graph().await.unwrap());
    overlay.add_dependency(&b.id, &a.id).unwrap();
    overlay.add_dependency(&c.id, &b.id).unwrap();
    let flushed = overlay.flush(&store).await.unwrap();
    assert_eq!(flushed.edge_count(), 2);
    assert!(!overlay.has_pending_changes());

    // Later overlays see the persisted edges as their base.
    let mut second = TrackingGraph::from_graph(store.build_dependency_graph().await.unwrap());
    assert!(second.remove_dependency(&c.id, &b.id));
    let flushed = second.flush(&store).await.unwrap();
    assert_eq!(flushed.edge_count(), 1);
}
