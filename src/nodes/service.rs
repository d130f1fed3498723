use crate::actions::{Delegate, DelegateExecution};
use crate::dsl::FieldDeclaration;
use crate::error::{EngineError, Result};
use crate::nodes::ActivityBehavior;
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::Variables;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Process variable that switches skip expressions on.
pub const SKIP_EXPRESSION_ENABLED: &str = "_SKIP_EXPRESSION_ENABLED";

/// Invokes the delegate resolved from `delegate_expression`, resolved again on every call.
#[derive(Debug)]
pub struct ServiceTaskBehavior {
    pub activity: String,
    pub delegate_expression: String,
    pub skip_expression: Option<String>,
    pub fields: Vec<FieldDeclaration>,
}

impl ServiceTaskBehavior {
    async fn should_skip(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<bool> {
        let Some(skip) = &self.skip_expression else {
            return Ok(false);
        };
        let enabled = ctx.get_variable(execution, SKIP_EXPRESSION_ENABLED).await? == Some(Value::Bool(true));
        if !enabled {
            return Ok(false);
        }
        ctx.evaluate_condition(execution, skip).await
    }

    async fn field_values(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<Variables> {
        let mut values = Variables::new();
        for field in &self.fields {
            let value = match (&field.expression, &field.value) {
                (Some(expression), _) => ctx.evaluate(execution, expression).await?,
                (None, Some(value)) => value.clone(),
                (None, None) => Value::Null,
            };
            values.insert(field.name.clone(), value);
        }
        Ok(values)
    }

    async fn delegate_execution<'a>(
        &self,
        ctx: &'a mut CommandContext,
        execution: Uuid,
    ) -> Result<DelegateExecution<'a>> {
        let fields = self.field_values(ctx, execution).await?;
        let process_instance_id = ctx.execution(execution).await?.process_instance_id;
        Ok(DelegateExecution::new(
            ctx,
            execution,
            process_instance_id,
            self.activity.clone(),
            fields,
        ))
    }

    fn invalid(&self, type_name: String) -> EngineError {
        EngineError::InvalidDelegateType {
            expression: self.delegate_expression.clone(),
            type_name,
        }
    }
}

#[async_trait]
impl ActivityBehavior for ServiceTaskBehavior {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        if self.should_skip(ctx, execution).await? {
            info!(activity = %self.activity, execution = %execution, "Service task skipped");
            ctx.push(Operation::Leave { execution });
            return Ok(());
        }

        let (result, leave) = match ctx.resolve_delegate(execution, &self.delegate_expression).await? {
            Delegate::Invalid { type_name } => return Err(self.invalid(type_name)),
            Delegate::Simple(delegate) => {
                debug!(activity = %self.activity, delegate = delegate.name(), "Invoking delegate");
                let mut de = self.delegate_execution(ctx, execution).await?;
                (delegate.execute(&mut de).await, true)
            }
            Delegate::Signallable(delegate) => {
                debug!(activity = %self.activity, delegate = delegate.name(), "Invoking signallable delegate");
                let mut de = self.delegate_execution(ctx, execution).await?;
                let result = delegate.execute(&mut de).await;
                (result, de.leave_requested())
            }
        };

        match result {
            Ok(()) if leave => {
                ctx.push(Operation::Leave { execution });
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(e) => ctx.handle_delegate_error(execution, e).await,
        }
    }

    async fn signal(&self, ctx: &mut CommandContext, execution: Uuid, payload: Option<Value>) -> Result<()> {
        let delegate = match ctx.resolve_delegate(execution, &self.delegate_expression).await? {
            Delegate::Signallable(delegate) => delegate,
            Delegate::Simple(delegate) => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "delegate `{}` of service task `{}` does not accept signals",
                    delegate.name(),
                    self.activity
                )));
            }
            Delegate::Invalid { type_name } => return Err(self.invalid(type_name)),
        };

        let (result, leave) = {
            let mut de = self.delegate_execution(ctx, execution).await?;
            let result = delegate.signal(&mut de, payload).await;
            (result, de.leave_requested())
        };
        match result {
            Ok(()) if leave => {
                ctx.push(Operation::Leave { execution });
                Ok(())
            }
            Ok(()) => Ok(()),
            Err(e) => ctx.handle_delegate_error(execution, e).await,
        }
    }

    /// Runs the delegate against the execution of the compensated activity's scope.
    async fn compensate(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        info!(activity = %self.activity, execution = %execution, "Running compensation handler");
        let result = match ctx.resolve_delegate(execution, &self.delegate_expression).await? {
            Delegate::Invalid { type_name } => return Err(self.invalid(type_name)),
            Delegate::Simple(delegate) => {
                let mut de = self.delegate_execution(ctx, execution).await?;
                delegate.execute(&mut de).await
            }
            Delegate::Signallable(delegate) => {
                let mut de = self.delegate_execution(ctx, execution).await?;
                delegate.execute(&mut de).await
            }
        };
        result.map_err(CommandContext::delegate_failure)
    }
}
