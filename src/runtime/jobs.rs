use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::clock;
use crate::runtime::command::{Command, CommandExecutor};
use crate::runtime::commands::JobsCmd;
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::{Job, JobHandler, JobState, RecordKind};

/// What happened to a job handed to [`JobScheduler::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Failed, rescheduled after backoff.
    Retried { retries_left: u32, due_at: DateTime<Utc> },
    /// Failed with no retries left.
    Dead,
    /// Lost a race with another command. Back in the queue, no retry spent.
    Released,
}

// --- Job commands ---

pub struct DueJobsCmd {
    pub limit: usize,
}

#[async_trait]
impl Command for DueJobsCmd {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "due-jobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>> {
        ctx.tx().scan(RecordKind::Job, None).await?;
        let now = ctx.now();
        let mut due: Vec<Job> = ctx.tx().cached::<Job>().filter(|j| j.is_acquirable(now)).cloned().collect();
        due.sort_by_key(|j| (j.due_at, j.id));
        due.truncate(self.limit);
        Ok(due)
    }
}

pub struct LockJobCmd {
    pub job_id: Uuid,
    pub owner: String,
    pub lock_duration: Duration,
}

#[async_trait]
impl Command for LockJobCmd {
    type Output = Option<Job>;

    fn name(&self) -> &'static str {
        "lock-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<Job>> {
        let now = ctx.now();
        let Some(mut job) = ctx.tx().get::<Job>(self.job_id).await? else {
            return Ok(None);
        };
        if !job.is_acquirable(now) {
            return Ok(None);
        }
        job.state = JobState::Locked;
        job.lock_owner = Some(self.owner.clone());
        job.lock_expires_at = Some(clock::after(now, self.lock_duration));
        ctx.tx().put(job.clone());
        Ok(Some(job))
    }
}

/// Runs a locked job. The job row is deleted in the same transaction, so a
/// rollback leaves it in place for the failure path.
pub struct ExecuteJobCmd {
    pub job_id: Uuid,
    pub owner: String,
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "execute-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let job = ctx
            .tx()
            .get::<Job>(self.job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", self.job_id))?;
        if job.state != JobState::Locked || job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            return Err(EngineError::ConcurrentModification {
                kind: RecordKind::Job,
                id: job.id.to_string(),
            });
        }
        ctx.tx().remove::<Job>(job.id);

        let exec = ctx.execution(job.execution_id).await?;
        debug!(job_id = %job.id, handler = ?job.handler, execution = %exec.id, "Executing job");
        match &job.handler {
            JobHandler::AsyncContinuation => ctx.push(Operation::Execute { execution: exec.id }),
            JobHandler::TimerCatch => {
                let behavior = ctx.definition(&exec.definition_id)?.behavior(&job.activity_id)?;
                behavior.signal(ctx, exec.id, None).await?;
            }
            JobHandler::TimerBoundary { boundary } => {
                ctx.fire_boundary(exec.id, boundary).await?;
            }
        }
        Ok(())
    }
}

pub struct FailJobCmd {
    pub job_id: Uuid,
    pub owner: String,
    pub message: String,
}

#[async_trait]
impl Command for FailJobCmd {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "fail-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobOutcome> {
        let Some(mut job) = ctx.tx().get::<Job>(self.job_id).await? else {
            return Ok(JobOutcome::Released);
        };
        if job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            return Ok(JobOutcome::Released);
        }

        job.retries = job.retries.saturating_sub(1);
        job.lock_owner = None;
        job.lock_expires_at = None;
        job.exception_message = Some(self.message.clone());

        let outcome = if job.retries == 0 {
            job.state = JobState::Dead;
            warn!(job_id = %job.id, error = %self.message, "Job retries exhausted, moved to dead letter");
            JobOutcome::Dead
        } else {
            let attempt = job.initial_retries.saturating_sub(job.retries).max(1);
            let backoff = ctx.config().retry_backoff(attempt);
            job.state = JobState::Scheduled;
            job.due_at = clock::after(ctx.now(), backoff);
            info!(job_id = %job.id, retries_left = job.retries, backoff = ?backoff, "Job failed, retrying");
            JobOutcome::Retried {
                retries_left: job.retries,
                due_at: job.due_at,
            }
        };
        ctx.tx().put(job);
        Ok(outcome)
    }
}

/// Gives a lock back without spending a retry. Only the lock owner may release.
pub struct ReleaseJobCmd {
    pub job_id: Uuid,
    pub owner: String,
}

#[async_trait]
impl Command for ReleaseJobCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "release-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let Some(mut job) = ctx.tx().get::<Job>(self.job_id).await? else {
            return Ok(());
        };
        if job.state == JobState::Locked && job.lock_owner.as_deref() == Some(self.owner.as_str()) {
            job.state = JobState::Scheduled;
            job.lock_owner = None;
            job.lock_expires_at = None;
            ctx.tx().put(job);
        }
        Ok(())
    }
}

/// Brings a dead job back with fresh retries, due immediately.
pub struct ResetDeadJobCmd {
    pub job_id: Uuid,
    pub retries: Option<u32>,
}

#[async_trait]
impl Command for ResetDeadJobCmd {
    type Output = Job;

    fn name(&self) -> &'static str {
        "reset-dead-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Job> {
        let mut job = ctx
            .tx()
            .get::<Job>(self.job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", self.job_id))?;
        if job.state != JobState::Dead {
            return Err(EngineError::UnsupportedOperation(format!("job {} is not dead", job.id)));
        }
        job.state = JobState::Scheduled;
        job.retries = self.retries.unwrap_or(ctx.config().job_retries).max(1);
        job.initial_retries = job.retries;
        job.due_at = ctx.now();
        job.exception_message = None;
        ctx.tx().put(job.clone());
        Ok(job)
    }
}

// --- Scheduler ---

/// 作业调度器
///
/// Acquires due jobs under a lock owned by `worker_id` and runs each in its own
/// command. Several schedulers may share one store; the lock decides who runs a job.
#[derive(Clone)]
pub struct JobScheduler {
    executor: CommandExecutor,
    worker_id: String,
}

impl JobScheduler {
    pub fn new(executor: CommandExecutor, worker_id: impl Into<String>) -> Self {
        Self {
            executor,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Locks up to `limit` due jobs. Jobs grabbed by someone else in between are skipped.
    pub async fn acquire_due_jobs(&self, limit: usize, lock_duration: Duration) -> Result<Vec<Job>> {
        let candidates = self.executor.run(&DueJobsCmd { limit }).await?;
        let mut acquired = Vec::with_capacity(candidates.len());
        for job in candidates {
            let cmd = LockJobCmd {
                job_id: job.id,
                owner: self.worker_id.clone(),
                lock_duration,
            };
            match self.executor.run(&cmd).await {
                Ok(Some(locked)) => acquired.push(locked),
                Ok(None) => {}
                Err(e) if e.is_concurrent_modification() => {
                    debug!(job_id = %job.id, worker_id = %self.worker_id, "Job taken by another worker");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(acquired)
    }

    pub async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        let cmd = ExecuteJobCmd {
            job_id: job.id,
            owner: self.worker_id.clone(),
        };
        match self.executor.run(&cmd).await {
            Ok(()) => {
                debug!(job_id = %job.id, "Job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) if e.is_concurrent_modification() => {
                debug!(job_id = %job.id, error = %e, "Job conflicted, releasing");
                self.release(job.id).await?;
                Ok(JobOutcome::Released)
            }
            Err(e) => {
                warn!(job_id = %job.id, activity = %job.activity_id, error = %e, "Job failed");
                let fail = FailJobCmd {
                    job_id: job.id,
                    owner: self.worker_id.clone(),
                    message: e.to_string(),
                };
                match self.executor.run(&fail).await {
                    Err(e) if e.is_concurrent_modification() => Ok(JobOutcome::Released),
                    other => other,
                }
            }
        }
    }

    async fn release(&self, job_id: Uuid) -> Result<()> {
        let cmd = ReleaseJobCmd {
            job_id,
            owner: self.worker_id.clone(),
        };
        match self.executor.run(&cmd).await {
            Err(e) if e.is_concurrent_modification() => Ok(()),
            other => other,
        }
    }

    /// One acquire-and-execute round. Returns the number of jobs run.
    pub async fn run_once(&self) -> Result<usize> {
        let config = &self.executor.services().config;
        let jobs = self
            .acquire_due_jobs(config.acquire_batch_size, config.lock_duration())
            .await?;
        for job in &jobs {
            self.execute(job).await?;
        }
        Ok(jobs.len())
    }

    /// Polls until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.executor.services().config.poll_interval();
        info!(worker_id = %self.worker_id, "Job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Job round failed");
                    0
                }
            };
            if processed > 0 {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!(worker_id = %self.worker_id, "Job worker stopped");
    }

    /// Jobs that ran out of retries.
    pub async fn dead_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.executor.run(&JobsCmd { process_instance_id: None }).await?;
        Ok(jobs.into_iter().filter(|j| j.state == JobState::Dead).collect())
    }

    pub async fn reset_dead_job(&self, job_id: Uuid, retries: Option<u32>) -> Result<Job> {
        self.executor.run(&ResetDeadJobCmd { job_id, retries }).await
    }
}
