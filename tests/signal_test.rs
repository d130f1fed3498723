use serde_json::{Value, json};
use tokenflow::dsl::builder::ProcessBuilder;
use tokenflow::runtime::command::Command;
use tokenflow::runtime::commands::{CompleteTaskCmd, DeliverEventCmd};
use tokenflow::runtime::context::CommandContext;
use tokenflow::runtime::model::EventType;
use tokenflow::{Engine, EngineError, Variables};

fn vars(value: Value) -> Variables {
    value.as_object().cloned().expect("object")
}

fn catch_process() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("catcher")
        .start("start")
        .signal_catch("wait_go", "go")
        .user_task("after")
        .build()
        .end("end")
        .connect("start", "wait_go")
        .connect("wait_go", "after")
        .connect("after", "end")
        .build()
}

#[tokio::test]
async fn test_global_signal_reaches_every_instance() {
    let engine = Engine::new();
    engine.deploy(catch_process()).unwrap();
    let first = engine.start_process("catcher", Variables::new()).await.unwrap();
    let second = engine.start_process("catcher", Variables::new()).await.unwrap();

    let delivery = engine.send_signal("go", Some(json!({ "reason": "batch" })), None).await.unwrap();
    assert_eq!(delivery.delivered, 2);

    for pid in [first, second] {
        let task = engine.tasks(pid).await.unwrap().remove(0);
        assert_eq!(task.task_definition_key.as_deref(), Some("after"));
        assert_eq!(engine.task_variables(task.id).await.unwrap().get("reason"), Some(&json!("batch")));
        assert!(engine.event_subscriptions(pid).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_scoped_signal_only_reaches_one_instance() {
    let engine = Engine::new();
    engine.deploy(catch_process()).unwrap();
    let first = engine.start_process("catcher", Variables::new()).await.unwrap();
    let second = engine.start_process("catcher", Variables::new()).await.unwrap();

    let delivery = engine.send_signal("go", None, Some(first)).await.unwrap();
    assert_eq!(delivery.delivered, 1);

    assert_eq!(engine.tasks(first).await.unwrap().len(), 1);
    assert!(engine.tasks(second).await.unwrap().is_empty());
    let waiting = engine.event_subscriptions(second).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].event_type, EventType::Signal);
    assert_eq!(waiting[0].event_name, "go");
}

#[tokio::test]
async fn test_signal_without_subscribers_delivers_nothing() {
    let engine = Engine::new();
    let delivery = engine.send_signal("nobody-listens", None, None).await.unwrap();
    assert_eq!(delivery.delivered, 0);
    assert!(delivery.failures.is_empty());
}

#[tokio::test]
async fn test_failing_delivery_does_not_roll_back_siblings() {
    let failing = ProcessBuilder::new("failing")
        .start("start")
        .signal_catch("wait_go", "go")
        .exclusive_gateway("check")
        .end("end")
        .connect("start", "wait_go")
        .connect("wait_go", "check")
        .connect_if("check", "end", "ok == true")
        .build();

    let engine = Engine::new();
    engine.deploy(catch_process()).unwrap();
    engine.deploy(failing).unwrap();
    let good = engine.start_process("catcher", Variables::new()).await.unwrap();
    let bad = engine.start_process("failing", vars(json!({ "ok": false }))).await.unwrap();

    let delivery = engine.send_signal("go", None, None).await.unwrap();
    assert_eq!(delivery.delivered, 1);
    assert_eq!(delivery.failures.len(), 1);
    assert!(matches!(delivery.failures[0].1, EngineError::NoOutgoingFlow { .. }));

    assert_eq!(engine.tasks(good).await.unwrap().len(), 1);
    // the failed instance still waits for the signal
    assert_eq!(engine.event_subscriptions(bad).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_message_is_correlated_to_exactly_one_instance() {
    let definition = ProcessBuilder::new("payment")
        .start("start")
        .message_catch("wait_payment", "payment-received")
        .user_task("ship")
        .build()
        .connect("start", "wait_payment")
        .connect("wait_payment", "ship")
        .build();

    let engine = Engine::new();
    engine.deploy(definition).unwrap();
    let first = engine.start_process("payment", Variables::new()).await.unwrap();
    let second = engine.start_process("payment", Variables::new()).await.unwrap();

    engine
        .correlate_message("payment-received", None, Some(json!({ "paid": 42 })))
        .await
        .unwrap();
    let shipped = engine.tasks(first).await.unwrap().len() + engine.tasks(second).await.unwrap().len();
    assert_eq!(shipped, 1);

    engine.correlate_message("payment-received", Some(second), None).await.unwrap();
    assert_eq!(engine.tasks(second).await.unwrap().len(), 1);

    let err = engine.correlate_message("payment-received", None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

fn notify_process() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("notify")
        .start("start")
        .user_task("work")
        .build()
        .signal_boundary("ping", "work", "ping", false)
        .user_task("answer_ping")
        .build()
        .end("end")
        .end("pinged")
        .connect("start", "work")
        .connect("work", "end")
        .connect("ping", "answer_ping")
        .connect("answer_ping", "pinged")
        .build()
}

#[tokio::test]
async fn test_non_interrupting_signal_boundary_forks_a_branch() {
    let engine = Engine::new();
    engine.deploy(notify_process()).unwrap();
    let pid = engine.start_process("notify", Variables::new()).await.unwrap();

    engine.send_signal("ping", None, Some(pid)).await.unwrap();
    // the boundary subscription survives a non-interrupting fire
    engine.send_signal("ping", None, Some(pid)).await.unwrap();

    let tasks = engine.tasks(pid).await.unwrap();
    let answers = tasks
        .iter()
        .filter(|t| t.task_definition_key.as_deref() == Some("answer_ping"))
        .count();
    assert_eq!(answers, 2);
    assert_eq!(tasks.len(), 3);

    for task in tasks {
        engine.complete_task(task.id, Variables::new()).await.unwrap();
    }
    assert!(engine.executions(pid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_boundary_branch_racing_the_last_completion_conflicts() {
    let engine = Engine::new();
    engine.deploy(notify_process()).unwrap();
    let pid = engine.start_process("notify", Variables::new()).await.unwrap();

    // leaves `work` as the only branch under the process instance
    engine.send_signal("ping", None, Some(pid)).await.unwrap();
    let answer = engine
        .tasks(pid)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.task_definition_key.as_deref() == Some("answer_ping"))
        .unwrap();
    engine.complete_task(answer.id, Variables::new()).await.unwrap();

    let ping = engine
        .event_subscriptions(pid)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.activity_id == "ping")
        .unwrap();
    let work = engine.tasks(pid).await.unwrap().remove(0);
    assert_eq!(work.task_definition_key.as_deref(), Some("work"));

    // both commands read the same state before either commits
    let services = engine.executor().services().clone();
    let mut deliver = CommandContext::new(services.clone());
    let deliver_cmd = DeliverEventCmd {
        subscription_id: ping.id,
        payload: None,
    };
    assert!(deliver_cmd.execute(&mut deliver).await.unwrap());
    deliver.run_agenda().await.unwrap();

    let mut complete = CommandContext::new(services);
    let complete_cmd = CompleteTaskCmd {
        task_id: work.id,
        variables: Variables::new(),
    };
    complete_cmd.execute(&mut complete).await.unwrap();
    complete.run_agenda().await.unwrap();

    deliver.commit().await.unwrap();
    let err = complete.commit().await.unwrap_err();
    assert!(err.is_concurrent_modification());

    // retried completion leaves the new branch attached to a live instance
    engine.complete_task(work.id, Variables::new()).await.unwrap();
    let executions = engine.executions(pid).await.unwrap();
    assert!(executions.iter().any(|e| e.id == pid));
    for exec in &executions {
        if let Some(parent) = exec.parent_id {
            assert!(executions.iter().any(|e| e.id == parent), "dangling execution {}", exec.id);
        }
    }
    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_definition_key.as_deref(), Some("answer_ping"));

    engine.complete_task(tasks[0].id, Variables::new()).await.unwrap();
    assert!(engine.executions(pid).await.unwrap().is_empty());
}
