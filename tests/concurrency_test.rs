use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokenflow::dsl::builder::ProcessBuilder;
use tokenflow::runtime::command::Command;
use tokenflow::runtime::context::CommandContext;
use tokenflow::{Engine, EngineError, Variables};
use tokio::sync::Barrier;
use uuid::Uuid;

fn vars(value: Value) -> Variables {
    value.as_object().cloned().expect("object")
}

/// Reads a counter, waits for the other writer, then writes counter + 1.
struct IncrementCmd {
    execution: Uuid,
    barrier: Option<Arc<Barrier>>,
}

#[async_trait]
impl Command for IncrementCmd {
    type Output = i64;

    fn name(&self) -> &'static str {
        "increment"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> tokenflow::Result<i64> {
        let current = ctx
            .get_variable(self.execution, "counter")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        ctx.set_variable(self.execution, "counter", json!(current + 1)).await?;
        Ok(current + 1)
    }
}

fn waiting_process() -> tokenflow::dsl::ProcessDefinition {
    ProcessBuilder::new("counter")
        .start("start")
        .receive_task("wait")
        .end("end")
        .connect("start", "wait")
        .connect("wait", "end")
        .build()
}

#[tokio::test]
async fn test_concurrent_writers_lose_no_update() {
    let engine = Engine::new();
    engine.deploy(waiting_process()).unwrap();
    let pid = engine.start_process("counter", vars(json!({ "counter": 0 }))).await.unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let first = IncrementCmd {
        execution: pid,
        barrier: Some(barrier.clone()),
    };
    let second = IncrementCmd {
        execution: pid,
        barrier: Some(barrier),
    };
    let (a, b) = tokio::join!(engine.execute(&first), engine.execute(&second));

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(EngineError::is_concurrent_modification)
    );

    // the loser retries from scratch
    let retried = engine
        .execute(&IncrementCmd {
            execution: pid,
            barrier: None,
        })
        .await
        .unwrap();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn test_many_tasks_retrying_on_conflict_count_exactly() {
    let engine = Engine::new();
    engine.deploy(waiting_process()).unwrap();
    let pid = engine.start_process("counter", vars(json!({ "counter": 0 }))).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let cmd = IncrementCmd {
                execution: pid,
                barrier: None,
            };
            loop {
                match engine.execute(&cmd).await {
                    Ok(_) => break,
                    Err(e) if e.is_concurrent_modification() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let variables = engine.get_variables(pid).await.unwrap();
    assert_eq!(variables.iter().find(|v| v.name == "counter").unwrap().value, json!(8));
}

#[tokio::test]
async fn test_parallel_fork_and_join_resume_once() {
    let definition = ProcessBuilder::new("fork-join")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .build()
        .user_task("b")
        .build()
        .user_task("c")
        .build()
        .parallel_gateway("join")
        .user_task("after")
        .build()
        .end("end")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("fork", "c")
        .connect("a", "join")
        .connect("b", "join")
        .connect("c", "join")
        .connect("join", "after")
        .connect("after", "end")
        .build();

    let engine = Engine::new();
    engine.deploy(definition).unwrap();
    let pid = engine.start_process("fork-join", Variables::new()).await.unwrap();

    let executions = engine.executions(pid).await.unwrap();
    let branches: Vec<_> = executions.iter().filter(|e| e.is_concurrent).collect();
    assert_eq!(branches.len(), 3);
    assert!(branches.iter().all(|e| e.is_active && e.parent_id == Some(pid)));
    assert!(!executions.iter().find(|e| e.id == pid).unwrap().is_active);

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 3);
    for task in tasks {
        engine.complete_task(task.id, Variables::new()).await.unwrap();
    }

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_definition_key.as_deref(), Some("after"));
    let executions = engine.executions(pid).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert!(executions[0].is_active);
}

#[tokio::test]
async fn test_concurrent_completion_at_join_resumes_once() {
    let definition = ProcessBuilder::new("race-join")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .build()
        .user_task("b")
        .build()
        .parallel_gateway("join")
        .user_task("after")
        .build()
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "after")
        .build();

    let engine = Engine::new();
    engine.deploy(definition).unwrap();
    let pid = engine.start_process("race-join", Variables::new()).await.unwrap();
    let tasks = engine.tasks(pid).await.unwrap();

    let mut handles = Vec::new();
    for task in tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match engine.complete_task(task.id, Variables::new()).await {
                    Ok(_) => break,
                    Err(e) if e.is_concurrent_modification() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_definition_key.as_deref(), Some("after"));
}
