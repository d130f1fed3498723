use serde_json::{Value, json};
use tokenflow::dsl::builder::ProcessBuilder;
use tokenflow::runtime::commands::NewTask;
use tokenflow::{Engine, EngineError, TaskStatus, Variables};

fn vars(value: Value) -> Variables {
    value.as_object().cloned().expect("object")
}

fn two_task_process() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("two-tasks")
        .start("start")
        .user_task("review")
        .name("Review")
        .build()
        .user_task("approve")
        .name("Approve")
        .assignee("${manager}")
        .build()
        .timer_boundary("escalate", "approve", 60_000, true)
        .signal_boundary("cancel", "approve", "cancel-all", true)
        .end("end")
        .end("escalated")
        .end("cancelled")
        .connect("start", "review")
        .connect("review", "approve")
        .connect("approve", "end")
        .connect("escalate", "escalated")
        .connect("cancel", "cancelled")
        .build()
}

#[tokio::test]
async fn test_complete_task_round_trip() {
    let engine = Engine::new();
    engine.deploy(two_task_process()).unwrap();
    let pid = engine
        .start_process("two-tasks", vars(json!({ "manager": "bob" })))
        .await
        .unwrap();

    let review = engine.tasks(pid).await.unwrap().remove(0);
    let snapshot = engine.complete_task(review.id, vars(json!({ "v": 1 }))).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.id, review.id);

    let variables = engine.get_variables(pid).await.unwrap();
    assert_eq!(variables.iter().filter(|v| v.name == "v").count(), 1);

    // gone from the store, completing twice fails
    let err = engine.complete_task(review.id, Variables::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_two_task_scenario_and_instance_deletion() {
    let engine = Engine::new();
    engine.deploy(two_task_process()).unwrap();
    let pid = engine
        .start_process_with_business_key("two-tasks", "order-7", vars(json!({ "manager": "bob", "amount": 10 })))
        .await
        .unwrap();

    let executions = engine.executions(pid).await.unwrap();
    assert_eq!(executions[0].business_key.as_deref(), Some("order-7"));

    let review = engine.tasks(pid).await.unwrap().remove(0);
    let claimed = engine.claim_task(review.id, "alice").await.unwrap();
    assert_eq!(claimed.assignee.as_deref(), Some("alice"));
    assert_eq!(claimed.status, TaskStatus::Assigned);
    assert!(claimed.claimed_at.is_some());

    engine.complete_task(review.id, vars(json!({ "amount": 20 }))).await.unwrap();

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let approve = &tasks[0];
    assert_eq!(approve.name, "Approve");
    assert_eq!(approve.assignee.as_deref(), Some("bob"));
    assert_eq!(approve.status, TaskStatus::Assigned);
    assert_eq!(engine.task_variables(approve.id).await.unwrap().get("amount"), Some(&json!(20)));

    assert_eq!(engine.jobs(Some(pid)).await.unwrap().len(), 1);
    assert_eq!(engine.event_subscriptions(pid).await.unwrap().len(), 1);

    let cancelled = engine.delete_process_instance(pid, "cancelled by test").await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, approve.id);
    assert_eq!(cancelled[0].status, TaskStatus::Cancelled);
    assert!(engine.executions(pid).await.unwrap().is_empty());
    assert!(engine.tasks(pid).await.unwrap().is_empty());
    assert!(engine.jobs(Some(pid)).await.unwrap().is_empty());
    assert!(engine.event_subscriptions(pid).await.unwrap().is_empty());

    let err = engine.delete_process_instance(pid, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

fn parallel_tasks_process() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("parallel-tasks")
        .start("start")
        .parallel_gateway("fork")
        .user_task("task1")
        .name("Task 1")
        .build()
        .user_task("task2")
        .name("Task 2")
        .build()
        .end("end1")
        .end("end2")
        .connect("start", "fork")
        .connect("fork", "task1")
        .connect("fork", "task2")
        .connect("task1", "end1")
        .connect("task2", "end2")
        .build()
}

#[tokio::test]
async fn test_parallel_tasks_share_process_variables() {
    let engine = Engine::new();
    engine.deploy(parallel_tasks_process()).unwrap();
    let pid = engine
        .start_process("parallel-tasks", vars(json!({ "start1": "start1", "start2": "start2" })))
        .await
        .unwrap();

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 2);
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Created);
        let variables = engine.task_variables(task.id).await.unwrap();
        assert_eq!(variables.get("start1"), Some(&json!("start1")));
        assert_eq!(variables.get("start2"), Some(&json!("start2")));
    }

    let task1 = tasks
        .iter()
        .find(|t| t.task_definition_key.as_deref() == Some("task1"))
        .unwrap();
    let claimed = engine.claim_task(task1.id, "alice").await.unwrap();
    assert_eq!(claimed.status, TaskStatus::Assigned);

    let done = engine.complete_task(task1.id, vars(json!({ "start1": "modified" }))).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let variables: Vec<(String, Value)> = engine
        .get_variables(pid)
        .await
        .unwrap()
        .into_iter()
        .map(|v| (v.name, v.value))
        .collect();
    assert_eq!(
        variables,
        vec![
            ("start1".to_string(), json!("modified")),
            ("start2".to_string(), json!("start2")),
        ]
    );

    let remaining = engine.tasks(pid).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_definition_key.as_deref(), Some("task2"));

    let cancelled = engine.delete_process_instance(pid, "done testing").await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].task_definition_key.as_deref(), Some("task2"));
    assert_eq!(cancelled[0].status, TaskStatus::Cancelled);
    assert!(engine.executions(pid).await.unwrap().is_empty());
    assert!(engine.tasks(pid).await.unwrap().is_empty());
    assert!(engine.jobs(Some(pid)).await.unwrap().is_empty());
    assert!(engine.event_subscriptions(pid).await.unwrap().is_empty());
    assert!(engine.all_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_conflicts_and_unclaim() {
    let engine = Engine::new();
    engine.deploy(two_task_process()).unwrap();
    let pid = engine
        .start_process("two-tasks", vars(json!({ "manager": "bob" })))
        .await
        .unwrap();
    let task = engine.tasks(pid).await.unwrap().remove(0);

    engine.claim_task(task.id, "alice").await.unwrap();
    // claiming again by the same user is fine
    engine.claim_task(task.id, "alice").await.unwrap();
    let err = engine.claim_task(task.id, "carol").await.unwrap_err();
    assert!(matches!(err, EngineError::TaskAlreadyClaimed { ref assignee, .. } if assignee == "alice"));

    let released = engine.unclaim_task(task.id).await.unwrap();
    assert_eq!(released.status, TaskStatus::Created);
    assert!(released.assignee.is_none());
    engine.claim_task(task.id, "carol").await.unwrap();
}

#[tokio::test]
async fn test_user_task_cannot_be_triggered_directly() {
    let engine = Engine::new();
    engine.deploy(two_task_process()).unwrap();
    let pid = engine
        .start_process("two-tasks", vars(json!({ "manager": "bob" })))
        .await
        .unwrap();
    let err = engine.trigger(pid, None).await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedOperation(_)));
}

#[tokio::test]
async fn test_standalone_task_lifecycle() {
    let engine = Engine::new();
    let task = engine
        .create_task(NewTask {
            assignee: Some("dave".to_string()),
            priority: 80,
            ..NewTask::named("Call customer")
        })
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert!(task.process_instance_id.is_none());

    assert_eq!(engine.task(task.id).await.unwrap().priority, 80);
    assert!(engine.task_variables(task.id).await.unwrap().is_empty());
    assert_eq!(engine.all_tasks().await.unwrap().len(), 1);

    let done = engine.complete_task(task.id, Variables::new()).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(engine.all_tasks().await.unwrap().is_empty());
}
