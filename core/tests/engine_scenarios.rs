/// End-to-end scenarios through the facade and the tool surface.
use astrotask_core::{
    dispatch, AddTasksArgs, Astrotask, DatabaseUrl, EngineConfig, GetNextTaskArgs, TaskEntryArgs,
    TaskError, TaskStatus, UpdateStatusArgs,
};
use serde_json::json;

async fn engine(label: &str) -> Astrotask {
    Astrotask::open(EngineConfig::new(DatabaseUrl::Memory(format!(
        "scenario-{label}"
    ))))
    .await
    .expect("open engine")
}

fn entry(title: &str, score: i32) -> TaskEntryArgs {
    TaskEntryArgs {
        title: title.to_string(),
        description: None,
        status: None,
        priority_score: Some(score),
        parent_task_id: None,
        parent_index: None,
        depends_on: None,
    }
}

/// A(60), B(80, depends on A), C(50).
async fn seed_scenario_three(engine: &Astrotask) -> Vec<String> {
    let created = engine
        .add_tasks(&AddTasksArgs {
            tasks: vec![
                entry("A", 60),
                TaskEntryArgs {
                    depends_on: Some(vec![0]),
                    ..entry("B", 80)
                },
                entry("C", 50),
            ],
        })
        .await
        .unwrap();
    created.into_iter().map(|t| t.id).collect()
}

#[tokio::test]
async fn test_batch_create_with_local_refs() {
    let engine = engine("batch-refs").await;

    let created = dispatch(
        &engine,
        "addTasks",
        json!({"tasks": [
            {"title": "Epic"},
            {"title": "Setup", "parentIndex": 0},
            {"title": "Impl", "parentIndex": 0, "dependsOn": [1]}
        ]}),
    )
    .await
    .unwrap();

    let epic_id = created[0]["id"].as_str().unwrap();
    let setup_id = created[1]["id"].as_str().unwrap();
    let impl_id = created[2]["id"].as_str().unwrap();
    assert_eq!(created[2]["parentId"].as_str().unwrap(), epic_id);

    let graph = engine.load_graph().await.unwrap();
    assert!(graph.has_edge(impl_id, setup_id));
    engine.close().await;
}

#[tokio::test]
async fn test_next_task_selection() {
    let engine = engine("next-task").await;
    let ids = seed_scenario_three(&engine).await;

    // B is blocked by A; C has a lower score than A.
    let next = engine
        .get_next_task(&GetNextTaskArgs::default())
        .await
        .unwrap()
        .expect("a task is available");
    assert_eq!(next.id(), ids[0]);
    engine.close().await;
}

#[tokio::test]
async fn test_auto_start_on_completion() {
    let engine = engine("auto-start").await;
    let ids = seed_scenario_three(&engine).await;

    let outcome = engine
        .update_status(&UpdateStatusArgs {
            task_id: ids[0].clone(),
            status: TaskStatus::Done,
            cascade: None,
        })
        .await
        .unwrap();

    // B becomes unblocked, outranks C, and is auto-started.
    assert_eq!(outcome.unblocked, [ids[1].clone()]);
    assert_eq!(outcome.started.as_deref(), Some(ids[1].as_str()));
    let b = engine.store().get_task(&ids[1]).await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::InProgress);
    engine.close().await;
}

#[tokio::test]
async fn test_cycle_rejection_leaves_graph_unchanged() {
    let engine = engine("cycle").await;
    let ids = seed_scenario_three(&engine).await;

    // B -> A exists; A -> B would close the cycle.
    let err = dispatch(
        &engine,
        "addDependency",
        json!({"dependentTaskId": ids[0], "dependencyTaskId": ids[1]}),
    )
    .await
    .expect_err("cycle refused");
    match err {
        TaskError::Conflict(message) => {
            assert!(message.contains("cycle"));
            assert!(message.contains(&ids[0]));
            assert!(message.contains(&ids[1]));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    let graph = engine.load_graph().await.unwrap();
    assert_eq!(graph.edge_count(), 1);
    assert!(graph.has_edge(&ids[1], &ids[0]));
    engine.close().await;
}

#[tokio::test]
async fn test_effective_status_hides_children_of_done_parents() {
    let engine = engine("effective").await;
    let created = engine
        .add_tasks(&AddTasksArgs {
            tasks: vec![
                entry("R", 90),
                TaskEntryArgs {
                    parent_index: Some(0),
                    status: Some(TaskStatus::InProgress),
                    ..entry("X", 99)
                },
            ],
        })
        .await
        .unwrap();

    // Mark the parent done directly in the store (no cascade): the child
    // keeps its stored status but inherits done for scheduling.
    engine
        .store()
        .update_task_status(&created[0].id, TaskStatus::Done)
        .await
        .unwrap();

    let tree = engine.load_tree().await.unwrap();
    assert_eq!(
        tree.effective_status(&created[1].id),
        Some(TaskStatus::Done)
    );
    let stored = engine.store().get_task(&created[1].id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);

    // Nothing under the done parent is offered as the next task.
    assert!(engine
        .get_next_task(&GetNextTaskArgs::default())
        .await
        .unwrap()
        .is_none());
    engine.close().await;
}

#[tokio::test]
async fn test_list_tasks_empty_statuses_means_any() {
    let engine = engine("list-any").await;
    seed_scenario_three(&engine).await;

    let all = dispatch(&engine, "listTasks", json!({"statuses": []}))
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 3);

    let with_root = dispatch(
        &engine,
        "listTasks",
        json!({"statuses": [], "includeProjectRoot": true}),
    )
    .await
    .unwrap();
    assert_eq!(with_root.as_array().unwrap().len(), 4);
    engine.close().await;
}

#[tokio::test]
async fn test_context_slices_round_trip() {
    let engine = engine("slices").await;
    let ids = seed_scenario_three(&engine).await;

    dispatch(
        &engine,
        "addTaskContext",
        json!({
            "taskId": ids[0],
            "title": "decision",
            "description": "went with the simple approach",
            "contextType": "analysis"
        }),
    )
    .await
    .unwrap();

    let slices = engine.store().list_context_slices(&ids[0]).await.unwrap();
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0].context_type, "analysis");
    engine.close().await;
}

#[tokio::test]
async fn test_priority_filter_on_next_task() {
    let engine = engine("priority-filter").await;
    seed_scenario_three(&engine).await;

    // Only C (50) and A (60) are unblocked; requiring >= 70 leaves none.
    let next = engine
        .get_next_task(&GetNextTaskArgs {
            priority_score: Some(70),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(next.is_none());
    engine.close().await;
}
