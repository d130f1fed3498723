use thiserror::Error;

use crate::runtime::model::RecordKind;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// 引擎对外暴露的错误类型
#[derive(Debug, Error)]
pub enum EngineError {
    /// Optimistic-lock conflict. The whole command was rolled back; retry it from scratch.
    #[error("concurrent modification of {kind} {id}")]
    ConcurrentModification { kind: RecordKind, id: String },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("cannot resolve delegate `{expression}`: {reason}")]
    Resolution { expression: String, reason: String },

    #[error("delegate `{expression}` resolved to `{type_name}`, which is neither a signallable behavior nor a simple delegate")]
    InvalidDelegateType { expression: String, type_name: String },

    #[error("failed to evaluate `{expression}`: {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("task {task_id} is already claimed by {assignee}")]
    TaskAlreadyClaimed { task_id: String, assignee: String },

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("no outgoing sequence flow of `{activity}` can be taken")]
    NoOutgoingFlow { activity: String },

    #[error("business error `{code}` has no matching error boundary event")]
    UnhandledBusinessError { code: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound { kind, id: id.to_string() }
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, EngineError::ConcurrentModification { .. })
    }

    /// Errors that abort the command without any process-level handler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Fatal(_) | EngineError::UnhandledBusinessError { .. } | EngineError::Storage(_)
        )
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("record serialization failed: {}", e))
    }
}

/// Named BPMN error raised by delegate code.
///
/// Delegates return it anywhere in an `anyhow` chain; the engine finds it and routes
/// it to the nearest matching error boundary event.
#[derive(Debug, Clone, Error)]
#[error("BPMN error `{code}`: {message}")]
pub struct BpmnError {
    pub code: String,
    pub message: String,
}

impl BpmnError {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self { message: code.clone(), code }
    }

    pub fn with_message(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    /// Walks the causal chain of `err` looking for a business error.
    pub fn find_in(err: &anyhow::Error) -> Option<&BpmnError> {
        err.chain().find_map(|cause| cause.downcast_ref::<BpmnError>())
    }
}
