use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::runtime::model::Variables;

type EvalValue = evalexpr::Value<DefaultNumericTypes>;

/// Evaluates guard conditions, skip expressions and field expressions against the
/// variables visible from an execution.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<Value>;

    fn evaluate_condition(&self, expression: &str, variables: &Variables) -> Result<bool> {
        match self.evaluate(expression, variables)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Evaluation {
                expression: expression.to_string(),
                reason: format!("expected a boolean, got {}", other),
            }),
        }
    }
}

/// `${x > 10}` -> `x > 10`. Plain text is returned as is.
pub fn strip_expression(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// [`ExpressionEvaluator`] backed by `evalexpr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalexprEvaluator;

impl ExpressionEvaluator for EvalexprEvaluator {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<Value> {
        let source = strip_expression(expression);
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (k, v) in variables {
            if let Some(ev) = to_eval_value(v) {
                // identifiers evalexpr rejects are simply not visible
                if let Err(e) = eval_ctx.set_value(k.clone(), ev) {
                    debug!(variable = %k, error = %e, "Variable not exposed to expression");
                }
            }
        }

        let result = eval_with_context(source, &eval_ctx).map_err(|e| EngineError::Evaluation {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(from_eval_value(result))
    }
}

pub fn to_eval_value(v: &Value) -> Option<EvalValue> {
    match v {
        Value::String(s) => Some(EvalValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(EvalValue::Int(i))
            } else {
                n.as_f64().map(EvalValue::Float)
            }
        }
        Value::Bool(b) => Some(EvalValue::Boolean(*b)),
        Value::Array(items) => items
            .iter()
            .map(to_eval_value)
            .collect::<Option<Vec<_>>>()
            .map(EvalValue::Tuple),
        Value::Null => Some(EvalValue::Empty),
        Value::Object(_) => None,
    }
}

pub fn from_eval_value(v: EvalValue) -> Value {
    match v {
        EvalValue::String(s) => Value::String(s),
        EvalValue::Int(i) => json!(i),
        EvalValue::Float(f) => json!(f),
        EvalValue::Boolean(b) => Value::Bool(b),
        EvalValue::Tuple(items) => Value::Array(items.into_iter().map(from_eval_value).collect()),
        EvalValue::Empty => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn strips_expression_markers() {
        assert_eq!(strip_expression("${ amount > 10 }"), "amount > 10");
        assert_eq!(strip_expression("mailer"), "mailer");
    }

    #[test]
    fn evaluates_conditions_against_variables() {
        let evaluator = EvalexprEvaluator;
        let v = vars(&[("amount", json!(20)), ("region", json!("eu"))]);
        assert!(evaluator.evaluate_condition("${amount > 10}", &v).unwrap());
        assert!(!evaluator.evaluate_condition("region == \"us\"", &v).unwrap());
        assert_eq!(evaluator.evaluate("amount * 2", &v).unwrap(), json!(40));
    }

    #[test]
    fn unknown_variable_is_an_evaluation_error() {
        let err = EvalexprEvaluator.evaluate_condition("missing > 1", &Variables::new()).unwrap_err();
        assert!(matches!(err, EngineError::Evaluation { .. }));
    }

    #[test]
    fn non_boolean_condition_is_rejected() {
        let v = vars(&[("amount", json!(3))]);
        assert!(EvalexprEvaluator.evaluate_condition("amount + 1", &v).is_err());
    }
}
