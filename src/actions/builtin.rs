use async_trait::async_trait;
use serde_json::Value;
use crate::actions::{DelegateExecution, ServiceDelegate};
use anyhow::{Result, anyhow};
use std::fmt::Debug;
use tracing::info;

/// Logs the `message` field, or every visible variable when there is none.
#[derive(Debug)]
pub struct LogDelegate;

#[async_trait]
impl ServiceDelegate for LogDelegate {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()> {
        if let Some(msg) = execution.field("message") {
            let msg = msg.as_str().map(str::to_string).unwrap_or_else(|| msg.to_string());
            info!(activity = %execution.activity_id(), "[LOG] {}", msg);
        } else {
            let variables = execution.variables().await?;
            info!(activity = %execution.activity_id(), "[LOG] {:?}", variables);
        }
        Ok(())
    }
}

/// Sets variables from an `assignments` object and/or an `expression` field of the
/// form `name = <expression>`.
#[derive(Debug)]
pub struct AssignDelegate;

#[async_trait]
impl ServiceDelegate for AssignDelegate {
    fn name(&self) -> &str {
        "assign"
    }

    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()> {
        // 1. Handle "assignments" object
        if let Some(assignments) = execution.field("assignments").and_then(Value::as_object).cloned() {
            for (k, v) in assignments {
                execution.set_variable(&k, v).await?;
            }
        }

        // 2. Handle "expression"
        if let Some(expr) = execution.field_str("expression").map(str::to_string) {
            let (target_var, rhs) = split_assignment(&expr)
                .ok_or_else(|| anyhow!("`{}` is not of the form `name = expression`", expr))?;
            let value = execution.evaluate(rhs).await?;
            execution.set_variable(target_var, value).await?;
        }
        Ok(())
    }
}

/// Splits at the first `=` that is not part of `==`, `!=`, `<=` or `>=`.
pub fn split_assignment(expr: &str) -> Option<(&str, &str)> {
    let bytes = expr.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let prev = if i > 0 { bytes[i - 1] } else { b' ' };
        let next = bytes.get(i + 1).copied().unwrap_or(b' ');
        if matches!(prev, b'=' | b'!' | b'<' | b'>') || next == b'=' {
            continue;
        }
        let target = expr[..i].trim();
        let rhs = expr[i + 1..].trim();
        if target.is_empty() || rhs.is_empty() || !target.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return None;
        }
        return Some((target, rhs));
    }
    None
}
