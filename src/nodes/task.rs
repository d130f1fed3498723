use crate::error::{EngineError, Result};
use crate::nodes::ActivityBehavior;
use crate::runtime::clock;
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::expression::strip_expression;
use crate::runtime::model::{Task, TaskStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Human task. Waits until the task created on arrival is completed.
#[derive(Debug)]
pub struct UserTaskBehavior {
    pub activity: String,
    pub name: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub owner: Option<String>,
    pub priority: i32,
    pub due_in_ms: Option<u64>,
    pub form_key: Option<String>,
}

impl UserTaskBehavior {
    async fn resolve_assignee(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<Option<String>> {
        let Some(assignee) = &self.assignee else {
            return Ok(None);
        };
        if strip_expression(assignee) == assignee.trim() {
            return Ok(Some(assignee.clone()));
        }
        match ctx.evaluate(execution, assignee).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }
}

#[async_trait]
impl ActivityBehavior for UserTaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let exec = ctx.execution(execution).await?;
        let assignee = self.resolve_assignee(ctx, execution).await?;
        let now = ctx.now();
        let task = Task {
            id: Uuid::now_v7(),
            name: self.name.clone(),
            description: self.description.clone(),
            status: if assignee.is_some() { TaskStatus::Assigned } else { TaskStatus::Created },
            claimed_at: assignee.as_ref().map(|_| now),
            assignee,
            owner: self.owner.clone(),
            priority: self.priority,
            form_key: self.form_key.clone(),
            created_at: now,
            due_date: self.due_in_ms.map(|ms| clock::after(now, Duration::from_millis(ms))),
            execution_id: Some(exec.id),
            process_instance_id: Some(exec.process_instance_id),
            process_definition_id: Some(exec.definition_id.clone()),
            task_definition_key: Some(self.activity.clone()),
            parent_task_id: None,
        };
        info!(task_id = %task.id, activity = %self.activity, instance_id = %exec.process_instance_id, "User task created");
        ctx.tx().put(task);
        Ok(())
    }

    async fn signal(&self, ctx: &mut CommandContext, execution: Uuid, payload: Option<Value>) -> Result<()> {
        if !ctx.tasks_of(execution).await?.is_empty() {
            return Err(EngineError::UnsupportedOperation(format!(
                "user task `{}` can only be resumed by completing its task",
                self.activity
            )));
        }
        ctx.set_payload(execution, payload).await?;
        ctx.push(Operation::Leave { execution });
        Ok(())
    }
}

/// Waits for an external trigger.
#[derive(Debug)]
pub struct ReceiveTaskBehavior;

#[async_trait]
impl ActivityBehavior for ReceiveTaskBehavior {
    async fn execute(&self, _ctx: &mut CommandContext, _execution: Uuid) -> Result<()> {
        Ok(())
    }

    async fn signal(&self, ctx: &mut CommandContext, execution: Uuid, payload: Option<Value>) -> Result<()> {
        ctx.set_payload(execution, payload).await?;
        ctx.push(Operation::Leave { execution });
        Ok(())
    }
}
