use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::expression::{ExpressionEvaluator, strip_expression};
use crate::runtime::model::Variables;

pub mod builtin;
pub mod http;

/// 插件接口：普通委托
/// The engine leaves the service task as soon as `execute` returns.
#[async_trait]
pub trait ServiceDelegate: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()>;
}

/// Delegate that decides itself when the task is left and accepts signals while it waits.
#[async_trait]
pub trait SignallableDelegate: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()>;
    async fn signal(&self, execution: &mut DelegateExecution<'_>, payload: Option<Value>) -> anyhow::Result<()>;
}

/// What a delegate expression resolved to.
#[derive(Debug, Clone)]
pub enum Delegate {
    Signallable(Arc<dyn SignallableDelegate>),
    Simple(Arc<dyn ServiceDelegate>),
    /// Something that is not a delegate at all.
    Invalid { type_name: String },
}

pub trait DelegateResolver: Send + Sync {
    fn resolve(&self, expression: &str, variables: &Variables, evaluator: &dyn ExpressionEvaluator) -> Result<Delegate>;
}

/// Delegates by name. `${expr}` falls back to evaluating `expr`, which must yield a
/// registered name.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: DashMap<String, Delegate>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `log`, `assign` and `http`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_simple(Arc::new(builtin::LogDelegate));
        registry.register_simple(Arc::new(builtin::AssignDelegate));
        registry.register_simple(Arc::new(http::HttpDelegate::new()));
        registry
    }

    pub fn register(&self, name: &str, delegate: Delegate) {
        self.delegates.insert(name.to_string(), delegate);
    }

    pub fn register_simple(&self, delegate: Arc<dyn ServiceDelegate>) {
        let name = delegate.name().to_string();
        self.delegates.insert(name, Delegate::Simple(delegate));
    }

    pub fn register_signallable(&self, delegate: Arc<dyn SignallableDelegate>) {
        let name = delegate.name().to_string();
        self.delegates.insert(name, Delegate::Signallable(delegate));
    }

    pub fn get(&self, name: &str) -> Option<Delegate> {
        self.delegates.get(name).map(|d| d.clone())
    }
}

impl DelegateResolver for DelegateRegistry {
    fn resolve(&self, expression: &str, variables: &Variables, evaluator: &dyn ExpressionEvaluator) -> Result<Delegate> {
        let name = strip_expression(expression);
        if let Some(delegate) = self.get(name) {
            return Ok(delegate);
        }
        if name == expression.trim() {
            return Err(EngineError::Resolution {
                expression: expression.to_string(),
                reason: "no delegate registered under this name".to_string(),
            });
        }

        let value = evaluator.evaluate(expression, variables).map_err(|e| EngineError::Resolution {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        match value {
            Value::String(resolved) => self.get(&resolved).ok_or_else(|| EngineError::Resolution {
                expression: expression.to_string(),
                reason: format!("no delegate registered under `{}`", resolved),
            }),
            other => Ok(Delegate::Invalid {
                type_name: json_type_name(&other).to_string(),
            }),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The execution as seen by delegate code.
pub struct DelegateExecution<'a> {
    ctx: &'a mut CommandContext,
    execution: Uuid,
    process_instance_id: Uuid,
    activity: String,
    fields: Variables,
    leave_requested: bool,
}

impl<'a> DelegateExecution<'a> {
    pub(crate) fn new(
        ctx: &'a mut CommandContext,
        execution: Uuid,
        process_instance_id: Uuid,
        activity: String,
        fields: Variables,
    ) -> Self {
        Self {
            ctx,
            execution,
            process_instance_id,
            activity,
            fields,
            leave_requested: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.execution
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.process_instance_id
    }

    pub fn activity_id(&self) -> &str {
        &self.activity
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    /// Injected field value, already evaluated.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Variables {
        &self.fields
    }

    pub async fn variable(&mut self, name: &str) -> Result<Option<Value>> {
        self.ctx.get_variable(self.execution, name).await
    }

    pub async fn variables(&mut self) -> Result<Variables> {
        self.ctx.visible_variables(self.execution).await
    }

    pub async fn set_variable(&mut self, name: &str, value: impl Into<Value> + Send) -> Result<()> {
        self.ctx.set_variable(self.execution, name, value.into()).await
    }

    pub async fn set_variable_local(&mut self, name: &str, value: impl Into<Value> + Send) -> Result<()> {
        self.ctx.set_variable_local(self.execution, name, value.into()).await
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        self.ctx.evaluate(self.execution, expression).await
    }

    /// Signallable delegates call this to move on; ignored for simple ones.
    pub fn leave(&mut self) {
        self.leave_requested = true;
    }

    pub(crate) fn leave_requested(&self) -> bool {
        self.leave_requested
    }
}
