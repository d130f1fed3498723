use crate::error::Result;
use crate::nodes::ActivityBehavior;
use crate::runtime::context::{CommandContext, Operation};
use async_trait::async_trait;
use uuid::Uuid;

/// Embedded sub-process. Runs in the scope execution created when it was entered;
/// the scope completes once its last branch ends.
#[derive(Debug)]
pub struct SubProcessBehavior {
    pub activity: String,
}

#[async_trait]
impl ActivityBehavior for SubProcessBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let exec = ctx.execution(execution).await?;
        let definition = ctx.definition(&exec.definition_id)?;
        let start = definition.start_of(Some(&self.activity))?.to_string();
        ctx.push(Operation::Enter {
            execution,
            activity: start,
        });
        Ok(())
    }
}
