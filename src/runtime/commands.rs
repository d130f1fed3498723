use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::command::Command;
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::{
    EventSubscription, EventType, Execution, Job, RecordKind, Task, TaskSnapshot, TaskStatus, VariableInstance,
    Variables,
};

fn is_open(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Created | TaskStatus::Assigned)
}

async fn open_task(ctx: &mut CommandContext, task_id: Uuid) -> Result<Task> {
    ctx.tx()
        .get::<Task>(task_id)
        .await?
        .filter(is_open)
        .ok_or_else(|| EngineError::not_found("task", task_id))
}

async fn scan_kind(ctx: &mut CommandContext, kind: RecordKind, process_instance_id: Option<Uuid>) -> Result<()> {
    match process_instance_id {
        Some(pid) => ctx.load_instance(pid).await,
        None => ctx.tx().scan(kind, None).await,
    }
}

// --- Process instances ---

pub struct StartProcessCmd {
    pub key: String,
    pub business_key: Option<String>,
    pub variables: Variables,
}

#[async_trait]
impl Command for StartProcessCmd {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "start-process"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid> {
        let definition = ctx.services().definitions.latest(&self.key)?;
        let root = ctx.create_root(&definition, self.business_key.clone(), self.variables.clone());
        let start = definition.start_of(None)?.to_string();
        info!(instance_id = %root.id, definition_id = %definition.id, "Process instance started");
        ctx.push(Operation::Enter {
            execution: root.id,
            activity: start,
        });
        Ok(root.id)
    }
}

pub struct DeleteProcessInstanceCmd {
    pub process_instance_id: Uuid,
    pub reason: String,
}

#[async_trait]
impl Command for DeleteProcessInstanceCmd {
    type Output = Vec<TaskSnapshot>;

    fn name(&self) -> &'static str {
        "delete-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<TaskSnapshot>> {
        ctx.delete_instance(self.process_instance_id, &self.reason).await
    }
}

/// Resumes a waiting execution through its activity's `signal`.
pub struct TriggerCmd {
    pub execution: Uuid,
    pub payload: Option<Value>,
}

#[async_trait]
impl Command for TriggerCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let exec = ctx.execution(self.execution).await?;
        let activity = match (&exec.activity_id, exec.is_active) {
            (Some(activity), true) => activity.clone(),
            _ => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "execution {} is not waiting in an activity",
                    exec.id
                )));
            }
        };
        let behavior = ctx.definition(&exec.definition_id)?.behavior(&activity)?;
        behavior.signal(ctx, exec.id, self.payload.clone()).await
    }
}

// --- Tasks ---

pub struct CompleteTaskCmd {
    pub task_id: Uuid,
    pub variables: Variables,
}

#[async_trait]
impl Command for CompleteTaskCmd {
    type Output = TaskSnapshot;

    fn name(&self) -> &'static str {
        "complete-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<TaskSnapshot> {
        let task = open_task(ctx, self.task_id).await?;
        let mut snapshot = task.clone();
        snapshot.status = TaskStatus::Completed;
        ctx.tx().remove::<Task>(task.id);

        match task.execution_id {
            Some(execution) => {
                ctx.set_variables(execution, self.variables.clone()).await?;
                let exec = ctx.execution(execution).await?;
                let activity = match task.task_definition_key.clone().or(exec.activity_id.clone()) {
                    Some(activity) => activity,
                    None => return Err(EngineError::not_found("activity of task", task.id)),
                };
                let behavior = ctx.definition(&exec.definition_id)?.behavior(&activity)?;
                behavior.signal(ctx, execution, None).await?;
            }
            None if !self.variables.is_empty() => {
                debug!(task_id = %task.id, "Variables of a standalone task have nowhere to go");
            }
            None => {}
        }
        info!(task_id = %task.id, "Task completed");
        Ok(snapshot)
    }
}

pub struct ClaimTaskCmd {
    pub task_id: Uuid,
    pub user: String,
}

#[async_trait]
impl Command for ClaimTaskCmd {
    type Output = TaskSnapshot;

    fn name(&self) -> &'static str {
        "claim-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<TaskSnapshot> {
        let mut task = open_task(ctx, self.task_id).await?;
        if let Some(assignee) = task.assignee.as_ref().filter(|a| **a != self.user) {
            return Err(EngineError::TaskAlreadyClaimed {
                task_id: task.id.to_string(),
                assignee: assignee.clone(),
            });
        }
        task.assignee = Some(self.user.clone());
        task.status = TaskStatus::Assigned;
        task.claimed_at = Some(ctx.now());
        ctx.tx().put(task.clone());
        Ok(task)
    }
}

pub struct UnclaimTaskCmd {
    pub task_id: Uuid,
}

#[async_trait]
impl Command for UnclaimTaskCmd {
    type Output = TaskSnapshot;

    fn name(&self) -> &'static str {
        "unclaim-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<TaskSnapshot> {
        let mut task = open_task(ctx, self.task_id).await?;
        task.assignee = None;
        task.status = TaskStatus::Created;
        task.claimed_at = None;
        ctx.tx().put(task.clone());
        Ok(task)
    }
}

/// A task outside of any process instance.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub form_key: Option<String>,
    pub parent_task_id: Option<Uuid>,
}

impl NewTask {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            assignee: None,
            owner: None,
            priority: 50,
            due_date: None,
            form_key: None,
            parent_task_id: None,
        }
    }
}

pub struct CreateTaskCmd {
    pub task: NewTask,
}

#[async_trait]
impl Command for CreateTaskCmd {
    type Output = TaskSnapshot;

    fn name(&self) -> &'static str {
        "create-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<TaskSnapshot> {
        let now = ctx.now();
        let draft = &self.task;
        let task = Task {
            id: Uuid::now_v7(),
            name: draft.name.clone(),
            description: draft.description.clone(),
            assignee: draft.assignee.clone(),
            owner: draft.owner.clone(),
            status: if draft.assignee.is_some() { TaskStatus::Assigned } else { TaskStatus::Created },
            priority: draft.priority,
            form_key: draft.form_key.clone(),
            created_at: now,
            claimed_at: draft.assignee.as_ref().map(|_| now),
            due_date: draft.due_date,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            task_definition_key: None,
            parent_task_id: draft.parent_task_id,
        };
        ctx.tx().put(task.clone());
        Ok(task)
    }
}

// --- Events ---

pub struct FindSubscriptionsCmd {
    pub event_type: EventType,
    pub event_name: String,
    pub process_instance_id: Option<Uuid>,
}

#[async_trait]
impl Command for FindSubscriptionsCmd {
    type Output = Vec<EventSubscription>;

    fn name(&self) -> &'static str {
        "find-subscriptions"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<EventSubscription>> {
        scan_kind(ctx, RecordKind::Subscription, self.process_instance_id).await?;
        let mut found: Vec<EventSubscription> = ctx
            .tx()
            .cached::<EventSubscription>()
            .filter(|s| s.event_type == self.event_type && s.event_name == self.event_name)
            .filter(|s| self.process_instance_id.is_none_or(|pid| s.process_instance_id == pid))
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.created_at, s.id));
        Ok(found)
    }
}

/// Delivers to one subscription. `false` when it no longer exists.
pub struct DeliverEventCmd {
    pub subscription_id: Uuid,
    pub payload: Option<Value>,
}

#[async_trait]
impl Command for DeliverEventCmd {
    type Output = bool;

    fn name(&self) -> &'static str {
        "deliver-event"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        let Some(subscription) = ctx.tx().get::<EventSubscription>(self.subscription_id).await? else {
            return Ok(false);
        };
        ctx.deliver_subscription(&subscription, self.payload.clone()).await?;
        Ok(true)
    }
}

// --- Variables ---

pub struct GetVariablesCmd {
    pub execution: Uuid,
}

#[async_trait]
impl Command for GetVariablesCmd {
    type Output = Vec<VariableInstance>;

    fn name(&self) -> &'static str {
        "get-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<VariableInstance>> {
        ctx.variable_instances(self.execution).await
    }
}

pub struct SetVariablesCmd {
    pub execution: Uuid,
    pub variables: Variables,
    /// Write the nearest scope instead of the nearest definer.
    pub local: bool,
}

#[async_trait]
impl Command for SetVariablesCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        if !self.local {
            return ctx.set_variables(self.execution, self.variables.clone()).await;
        }
        for (k, v) in &self.variables {
            ctx.set_variable_local(self.execution, k, v.clone()).await?;
        }
        Ok(())
    }
}

/// Variables visible from a task's execution. Standalone tasks see none.
pub struct TaskVariablesCmd {
    pub task_id: Uuid,
}

#[async_trait]
impl Command for TaskVariablesCmd {
    type Output = Variables;

    fn name(&self) -> &'static str {
        "task-variables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Variables> {
        let task = open_task(ctx, self.task_id).await?;
        match task.execution_id {
            Some(execution) => ctx.visible_variables(execution).await,
            None => Ok(Variables::new()),
        }
    }
}

// --- Queries ---

pub struct GetTaskCmd {
    pub task_id: Uuid,
}

#[async_trait]
impl Command for GetTaskCmd {
    type Output = Task;

    fn name(&self) -> &'static str {
        "get-task"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Task> {
        open_task(ctx, self.task_id).await
    }
}

/// Open tasks of one process instance or all, oldest first.
pub struct TasksCmd {
    pub process_instance_id: Option<Uuid>,
}

#[async_trait]
impl Command for TasksCmd {
    type Output = Vec<Task>;

    fn name(&self) -> &'static str {
        "tasks"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Task>> {
        scan_kind(ctx, RecordKind::Task, self.process_instance_id).await?;
        let mut tasks: Vec<Task> = ctx
            .tx()
            .cached::<Task>()
            .filter(|t| self.process_instance_id.is_none() || t.process_instance_id == self.process_instance_id)
            .filter(|t| is_open(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }
}

pub struct ExecutionsCmd {
    pub process_instance_id: Uuid,
}

#[async_trait]
impl Command for ExecutionsCmd {
    type Output = Vec<Execution>;

    fn name(&self) -> &'static str {
        "executions"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Execution>> {
        ctx.load_instance(self.process_instance_id).await?;
        Ok(ctx
            .tx()
            .cached::<Execution>()
            .filter(|e| e.process_instance_id == self.process_instance_id)
            .cloned()
            .collect())
    }
}

pub struct JobsCmd {
    pub process_instance_id: Option<Uuid>,
}

#[async_trait]
impl Command for JobsCmd {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "jobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>> {
        scan_kind(ctx, RecordKind::Job, self.process_instance_id).await?;
        let mut jobs: Vec<Job> = ctx
            .tx()
            .cached::<Job>()
            .filter(|j| self.process_instance_id.is_none_or(|pid| j.process_instance_id == pid))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.due_at, j.id));
        Ok(jobs)
    }
}

pub struct SubscriptionsCmd {
    pub process_instance_id: Uuid,
}

#[async_trait]
impl Command for SubscriptionsCmd {
    type Output = Vec<EventSubscription>;

    fn name(&self) -> &'static str {
        "subscriptions"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<EventSubscription>> {
        ctx.load_instance(self.process_instance_id).await?;
        Ok(ctx
            .tx()
            .cached::<EventSubscription>()
            .filter(|s| s.process_instance_id == self.process_instance_id)
            .cloned()
            .collect())
    }
}
