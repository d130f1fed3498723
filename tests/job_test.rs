use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokenflow::actions::{DelegateExecution, DelegateRegistry, ServiceDelegate};
use tokenflow::dsl::builder::ProcessBuilder;
use tokenflow::runtime::clock::ManualClock;
use tokenflow::runtime::model::JobHandler;
use tokenflow::{Engine, EngineConfig, JobOutcome, JobState, Variables};
use tokio::sync::watch;

fn vars(value: Value) -> Variables {
    value.as_object().cloned().expect("object")
}

/// Fails until it has been called `succeed_after` times.
#[derive(Debug)]
struct FlakyDelegate {
    calls: AtomicUsize,
    succeed_after: usize,
}

#[async_trait]
impl ServiceDelegate for FlakyDelegate {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.succeed_after {
            anyhow::bail!("remote system unavailable (attempt {})", n);
        }
        execution.set_variable("attempts", n as u64).await?;
        Ok(())
    }
}

fn setup(succeed_after: usize) -> (Engine, Arc<ManualClock>, Arc<FlakyDelegate>) {
    let clock = Arc::new(ManualClock::default());
    let flaky = Arc::new(FlakyDelegate {
        calls: AtomicUsize::new(0),
        succeed_after,
    });
    let registry = DelegateRegistry::with_builtins();
    registry.register_simple(flaky.clone());
    let engine = Engine::builder()
        .config(EngineConfig {
            worker_id: "worker-a".to_string(),
            job_retries: 3,
            retry_backoff_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            ..EngineConfig::default()
        })
        .clock(clock.clone())
        .delegates(Arc::new(registry))
        .build();

    let definition = ProcessBuilder::new("async")
        .start("start")
        .service_task("call", "flaky")
        .async_before()
        .build()
        .user_task("after")
        .build()
        .connect("start", "call")
        .connect("call", "after")
        .build();
    engine.deploy(definition).unwrap();
    (engine, clock, flaky)
}

#[tokio::test]
async fn test_async_continuation_runs_on_job_execution() {
    let (engine, _clock, _) = setup(1);
    let pid = engine.start_process("async", Variables::new()).await.unwrap();

    // nothing ran yet: the token is parked behind a job
    assert!(engine.tasks(pid).await.unwrap().is_empty());
    let jobs = engine.jobs(Some(pid)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].handler, JobHandler::AsyncContinuation);

    let scheduler = engine.job_scheduler();
    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    assert!(engine.jobs(Some(pid)).await.unwrap().is_empty());
    assert_eq!(engine.tasks(pid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_job_backs_off_and_then_succeeds() {
    let (engine, clock, flaky) = setup(3);
    let pid = engine.start_process("async", Variables::new()).await.unwrap();
    let scheduler = engine.job_scheduler();

    let job = scheduler.acquire_due_jobs(10, Duration::from_secs(60)).await.unwrap().remove(0);
    let outcome = scheduler.execute(&job).await.unwrap();
    let JobOutcome::Retried { retries_left, due_at } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };
    assert_eq!(retries_left, 2);
    assert_eq!((due_at - job.due_at).num_milliseconds(), 1_000);

    // not due yet
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    clock.advance(Duration::from_millis(1_000));
    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    let job = &engine.jobs(Some(pid)).await.unwrap()[0];
    assert_eq!(job.retries, 1);
    assert!(job.exception_message.as_deref().unwrap().contains("attempt 2"));

    // second backoff doubles
    clock.advance(Duration::from_millis(1_999));
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    clock.advance(Duration::from_millis(1));
    assert_eq!(scheduler.run_once().await.unwrap(), 1);

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(engine.jobs(Some(pid)).await.unwrap().is_empty());
    let task = engine.tasks(pid).await.unwrap().remove(0);
    assert_eq!(engine.task_variables(task.id).await.unwrap().get("attempts"), Some(&json!(3)));
}

#[tokio::test]
async fn test_retries_exhausted_moves_job_to_dead_letter() {
    let (engine, clock, flaky) = setup(usize::MAX);
    let pid = engine.start_process("async", Variables::new()).await.unwrap();
    let scheduler = engine.job_scheduler();

    for _ in 0..3 {
        assert_eq!(scheduler.run_once().await.unwrap(), 1);
        clock.advance(Duration::from_secs(3600));
    }
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let dead = scheduler.dead_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].state, JobState::Dead);
    assert_eq!(dead[0].retries, 0);
    assert!(dead[0].exception_message.is_some());

    // never acquired again
    clock.advance(Duration::from_secs(3600));
    assert_eq!(scheduler.run_once().await.unwrap(), 0);
    assert!(engine.tasks(pid).await.unwrap().is_empty());

    // operator reset
    let reset = scheduler.reset_dead_job(dead[0].id, Some(1)).await.unwrap();
    assert_eq!(reset.state, JobState::Scheduled);
    assert_eq!(reset.retries, 1);
    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    assert_eq!(scheduler.dead_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reset_job_backs_off_from_its_new_retry_count() {
    let (engine, clock, _) = setup(usize::MAX);
    engine.start_process("async", Variables::new()).await.unwrap();
    let scheduler = engine.job_scheduler();

    for _ in 0..3 {
        assert_eq!(scheduler.run_once().await.unwrap(), 1);
        clock.advance(Duration::from_secs(3600));
    }
    let dead = scheduler.dead_jobs().await.unwrap().remove(0);

    let reset = scheduler.reset_dead_job(dead.id, Some(2)).await.unwrap();
    assert_eq!(reset.retries, 2);
    assert_eq!(reset.initial_retries, 2);

    // first failure after the reset is attempt one again
    let job = scheduler.acquire_due_jobs(10, Duration::from_secs(60)).await.unwrap().remove(0);
    let outcome = scheduler.execute(&job).await.unwrap();
    let JobOutcome::Retried { retries_left, due_at } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };
    assert_eq!(retries_left, 1);
    assert_eq!((due_at - job.due_at).num_milliseconds(), 1_000);
}

#[tokio::test]
async fn test_stale_lock_is_reacquired_and_lost_lock_is_rejected() {
    let (engine, clock, _) = setup(1);
    let pid = engine.start_process("async", Variables::new()).await.unwrap();

    let worker_a = engine.job_scheduler_for("worker-a");
    let worker_b = engine.job_scheduler_for("worker-b");

    let job_a = worker_a.acquire_due_jobs(10, Duration::from_secs(30)).await.unwrap().remove(0);
    // locked: nobody else gets it
    assert!(worker_b.acquire_due_jobs(10, Duration::from_secs(30)).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(31));
    let job_b = worker_b.acquire_due_jobs(10, Duration::from_secs(30)).await.unwrap().remove(0);
    assert_eq!(job_a.id, job_b.id);

    assert_eq!(worker_a.execute(&job_a).await.unwrap(), JobOutcome::Released);
    let stored = &engine.jobs(Some(pid)).await.unwrap()[0];
    assert_eq!(stored.lock_owner.as_deref(), Some("worker-b"));
    assert_eq!(stored.retries, 3);

    assert_eq!(worker_b.execute(&job_b).await.unwrap(), JobOutcome::Completed);
    assert_eq!(engine.tasks(pid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_timer_catch_fires_after_clock_advances() {
    let clock = Arc::new(ManualClock::default());
    let engine = Engine::builder().clock(clock.clone()).build();
    let definition = ProcessBuilder::new("timer")
        .start("start")
        .timer_catch("wait", 5_000)
        .user_task("after")
        .build()
        .connect("start", "wait")
        .connect("wait", "after")
        .build();
    engine.deploy(definition).unwrap();
    let pid = engine.start_process("timer", Variables::new()).await.unwrap();
    let scheduler = engine.job_scheduler();

    let jobs = engine.jobs(Some(pid)).await.unwrap();
    assert_eq!(jobs[0].handler, JobHandler::TimerCatch);
    assert_eq!(scheduler.run_once().await.unwrap(), 0);

    clock.advance(Duration::from_secs(5));
    assert_eq!(scheduler.run_once().await.unwrap(), 1);
    assert_eq!(engine.tasks(pid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_interrupting_timer_boundary_cancels_task() {
    let clock = Arc::new(ManualClock::default());
    let engine = Engine::builder().clock(clock.clone()).build();
    let definition = ProcessBuilder::new("sla")
        .start("start")
        .user_task("work")
        .build()
        .timer_boundary("late", "work", 60_000, true)
        .user_task("escalation")
        .build()
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .connect("late", "escalation")
        .build();
    engine.deploy(definition).unwrap();
    let pid = engine.start_process("sla", vars(json!({ "owner": "ops" }))).await.unwrap();

    clock.advance(Duration::from_secs(61));
    assert_eq!(engine.job_scheduler().run_once().await.unwrap(), 1);

    let tasks = engine.tasks(pid).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_definition_key.as_deref(), Some("escalation"));
    let executions = engine.executions(pid).await.unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn test_non_interrupting_timer_boundary_keeps_task() {
    let clock = Arc::new(ManualClock::default());
    let engine = Engine::builder().clock(clock.clone()).build();
    let definition = ProcessBuilder::new("reminder")
        .start("start")
        .user_task("work")
        .build()
        .timer_boundary("remind", "work", 1_000, false)
        .user_task("reminder")
        .build()
        .end("end")
        .end("reminded")
        .connect("start", "work")
        .connect("work", "end")
        .connect("remind", "reminder")
        .connect("reminder", "reminded")
        .build();
    engine.deploy(definition).unwrap();
    let pid = engine.start_process("reminder", Variables::new()).await.unwrap();

    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.job_scheduler().run_once().await.unwrap(), 1);

    let mut keys: Vec<String> = engine
        .tasks(pid)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|t| t.task_definition_key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["reminder", "work"]);

    // both branches end, then the instance
    for task in engine.tasks(pid).await.unwrap() {
        engine.complete_task(task.id, Variables::new()).await.unwrap();
    }
    assert!(engine.executions(pid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_loop_stops_on_shutdown() {
    let (engine, _clock, _) = setup(1);
    let pid = engine.start_process("async", Variables::new()).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let scheduler = engine.job_scheduler();
    let worker = tokio::spawn(async move { scheduler.run(rx).await });

    for _ in 0..100 {
        if !engine.tasks(pid).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.tasks(pid).await.unwrap().len(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
}
