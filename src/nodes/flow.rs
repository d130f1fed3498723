use crate::error::{EngineError, Result};
use crate::nodes::ActivityBehavior;
use crate::runtime::context::{CommandContext, Operation};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

// --- EXCLUSIVE GATEWAY ---

#[derive(Debug)]
pub struct ExclusiveGatewayBehavior {
    pub activity: String,
    pub default_flow: Option<String>,
}

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.push(Operation::Leave { execution });
        Ok(())
    }

    /// First true guard in declaration order, then the default flow.
    async fn leave(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let exec = ctx.execution(execution).await?;
        let definition = ctx.definition(&exec.definition_id)?;

        let mut default_target = None;
        for flow in definition.outgoing(&self.activity) {
            if self.default_flow.as_deref() == Some(flow.id.as_str()) {
                default_target = Some(flow.target.clone());
                continue;
            }
            let taken = match &flow.condition {
                Some(condition) => ctx.evaluate_condition(execution, condition).await?,
                None => true,
            };
            if taken {
                debug!(gateway = %self.activity, flow = %flow.id, "Exclusive gateway selected flow");
                return ctx.take_flows(exec, vec![flow.target.clone()]).await;
            }
        }

        match default_target {
            Some(target) => ctx.take_flows(exec, vec![target]).await,
            None => Err(EngineError::NoOutgoingFlow {
                activity: self.activity.clone(),
            }),
        }
    }
}

// --- PARALLEL GATEWAY ---

#[derive(Debug)]
pub struct ParallelGatewayBehavior {
    pub activity: String,
}

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        let mut token = ctx.execution(execution).await?;
        let definition = ctx.definition(&token.definition_id)?;
        let expected = definition.incoming_count(&self.activity);
        if expected <= 1 {
            ctx.push(Operation::Leave { execution });
            return Ok(());
        }

        token.is_active = false;
        ctx.put_execution(token.clone());

        // A non-concurrent token is the scope itself and can only be waited for.
        let Some(scope_id) = token.parent_id.filter(|_| token.is_concurrent) else {
            debug!(join = %self.activity, execution = %execution, "Token waits at join without siblings");
            return Ok(());
        };
        let scope = ctx.execution(scope_id).await?;
        // arrivals at the same join must conflict with each other
        ctx.lock_for_update(scope_id);
        let siblings = ctx.children(&scope).await?;
        let mut joined: Vec<_> = siblings
            .iter()
            .filter(|c| c.id != token.id)
            .filter(|c| c.is_concurrent && !c.is_active && c.activity_id.as_deref() == Some(self.activity.as_str()))
            .cloned()
            .collect();
        let mut waiting = Vec::with_capacity(joined.len());
        for c in joined.drain(..) {
            if ctx.children(&c).await?.is_empty() {
                waiting.push(c);
            }
        }
        waiting.truncate(expected - 1);

        if waiting.len() + 1 < expected {
            debug!(join = %self.activity, arrived = waiting.len() + 1, expected, "Join waiting");
            return Ok(());
        }

        debug!(join = %self.activity, scope = %scope_id, "Join activated");
        if siblings.len() == waiting.len() + 1 {
            // every concurrent branch arrived: the scope carries on alone
            for c in waiting.iter().chain(std::iter::once(&token)) {
                ctx.remove_execution(c.id);
            }
            let mut scope = scope;
            scope.is_active = true;
            scope.activity_id = Some(self.activity.clone());
            let scope_id = scope.id;
            ctx.put_execution(scope);
            ctx.push(Operation::Leave { execution: scope_id });
        } else {
            for c in &waiting {
                ctx.remove_execution(c.id);
            }
            token.is_active = true;
            ctx.put_execution(token);
            ctx.push(Operation::Leave { execution });
        }
        Ok(())
    }
}
