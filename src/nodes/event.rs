use crate::dsl::EventTrigger;
use crate::error::{EngineError, Result};
use crate::nodes::ActivityBehavior;
use crate::runtime::clock;
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::{EventType, JobHandler};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Waits for a signal, a message or a timer.
#[derive(Debug)]
pub struct IntermediateCatchEventBehavior {
    pub activity: String,
    pub trigger: EventTrigger,
}

#[async_trait]
impl ActivityBehavior for IntermediateCatchEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let exec = ctx.execution(execution).await?;
        match &self.trigger {
            EventTrigger::Signal { name } => {
                ctx.subscribe(&exec, EventType::Signal, name, &self.activity, None);
            }
            EventTrigger::Message { name } => {
                ctx.subscribe(&exec, EventType::Message, name, &self.activity, None);
            }
            EventTrigger::Timer { duration_ms } => {
                let due_at = clock::after(ctx.now(), Duration::from_millis(*duration_ms));
                ctx.schedule_job(&exec, JobHandler::TimerCatch, &self.activity, due_at);
            }
            EventTrigger::Error { .. } | EventTrigger::Compensation { .. } => {
                return Err(EngineError::InvalidDefinition(format!(
                    "`{}` cannot wait for errors or compensation",
                    self.activity
                )));
            }
        }
        Ok(())
    }

    /// The awaited event happened.
    async fn signal(&self, ctx: &mut CommandContext, execution: Uuid, payload: Option<Value>) -> Result<()> {
        ctx.clear_wait_state(execution, &self.activity).await?;
        ctx.set_payload(execution, payload).await?;
        ctx.push(Operation::Leave { execution });
        Ok(())
    }
}

/// Only ever left: tokens are placed on boundary events when they fire.
#[derive(Debug)]
pub struct BoundaryEventBehavior;

#[async_trait]
impl ActivityBehavior for BoundaryEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.push(Operation::Leave { execution });
        Ok(())
    }
}
