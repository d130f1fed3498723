use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::actions::DelegateResolver;
use crate::compiler::core::DefinitionCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::runtime::clock::Clock;
use crate::runtime::context::CommandContext;
use crate::runtime::expression::ExpressionEvaluator;
use crate::runtime::storage::RecordStore;

/// Everything a command needs besides its own transaction.
pub struct EngineServices {
    pub config: EngineConfig,
    pub store: Arc<dyn RecordStore>,
    pub definitions: DefinitionCache,
    pub delegates: Arc<dyn DelegateResolver>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub clock: Arc<dyn Clock>,
}

/// A unit of work. Either all of its writes are committed or none.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Reads and writes through `ctx`. Operations pushed onto the agenda are drained
    /// by the executor before commit.
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output>;
}

#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Runs the command in a fresh transaction. The output is only returned once the
    /// commit succeeded; on `ConcurrentModification` nothing was written and the caller
    /// may run the command again.
    pub async fn run<C: Command>(&self, command: &C) -> Result<C::Output> {
        let mut ctx = CommandContext::new(self.services.clone());
        let result: Result<C::Output> = async {
            let output = command.execute(&mut ctx).await?;
            ctx.run_agenda().await?;
            Ok(output)
        }
        .await;

        match result {
            Ok(output) => {
                ctx.commit().await.inspect_err(|e| {
                    debug!(command = command.name(), error = %e, "Commit rejected");
                })?;
                Ok(output)
            }
            Err(e) => {
                debug!(command = command.name(), error = %e, "Command rolled back");
                Err(e)
            }
        }
    }
}
