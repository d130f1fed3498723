use crate::error::Result;
use crate::nodes::ActivityBehavior;
use crate::runtime::context::{CommandContext, Operation};
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug)]
pub struct StartEventBehavior;

#[async_trait]
impl ActivityBehavior for StartEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.push(Operation::Leave { execution });
        Ok(())
    }
}

#[derive(Debug)]
pub struct EndEventBehavior {
    pub terminate: bool,
    pub error_code: Option<String>,
}

#[async_trait]
impl ActivityBehavior for EndEventBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        if let Some(code) = &self.error_code {
            return ctx.propagate_error(execution, code).await;
        }
        if self.terminate {
            let scope = ctx.nearest_scope(execution).await?;
            ctx.delete_descendants(scope, "terminate end event").await?;
            return ctx.complete_scope(scope).await;
        }
        ctx.push(Operation::End { execution });
        Ok(())
    }

    async fn leave(&self, _ctx: &mut CommandContext, _execution: Uuid) -> Result<()> {
        // end events never take flows
        Ok(())
    }
}
