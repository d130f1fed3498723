use crate::dsl::{FlowNode, NodeType};
use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

pub mod common;
pub mod event;
pub mod flow;
pub mod service;
pub mod subprocess;
pub mod task;

/// 运行时节点接口
///
/// One prepared instance per flow node, shared by every execution of the definition.
/// Behaviors never call each other; they talk to the engine through the
/// [`CommandContext`] agenda.
#[async_trait]
pub trait ActivityBehavior: Send + Sync + Debug {
    /// Runs the node for an execution that just arrived. Either leaves or waits.
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()>;

    /// Resumes an execution waiting in this node.
    async fn signal(&self, _ctx: &mut CommandContext, _execution: Uuid, _payload: Option<Value>) -> Result<()> {
        Err(EngineError::UnsupportedOperation("activity does not wait for signals".to_string()))
    }

    /// Takes the outgoing flows once the node is done.
    async fn leave(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()> {
        ctx.take_outgoing(execution).await
    }

    /// Undoes the work of a completed activity (compensation handlers only).
    async fn compensate(&self, _ctx: &mut CommandContext, _execution: Uuid) -> Result<()> {
        Err(EngineError::UnsupportedOperation("activity is not a compensation handler".to_string()))
    }
}

/// 节点工厂
pub fn prepare(node: &FlowNode) -> Arc<dyn ActivityBehavior> {
    let id = node.id.clone();
    match &node.kind {
        NodeType::StartEvent => Arc::new(common::StartEventBehavior),
        NodeType::EndEvent { terminate, error_code } => Arc::new(common::EndEventBehavior {
            terminate: *terminate,
            error_code: error_code.clone(),
        }),
        NodeType::UserTask {
            name,
            description,
            assignee,
            owner,
            priority,
            due_in_ms,
            form_key,
        } => Arc::new(task::UserTaskBehavior {
            name: name.clone().unwrap_or_else(|| id.clone()),
            activity: id,
            description: description.clone(),
            assignee: assignee.clone(),
            owner: owner.clone(),
            priority: *priority,
            due_in_ms: *due_in_ms,
            form_key: form_key.clone(),
        }),
        NodeType::ServiceTask {
            delegate_expression,
            skip_expression,
            fields,
            ..
        } => Arc::new(service::ServiceTaskBehavior {
            activity: id,
            delegate_expression: delegate_expression.clone(),
            skip_expression: skip_expression.clone(),
            fields: fields.clone(),
        }),
        NodeType::ReceiveTask => Arc::new(task::ReceiveTaskBehavior),
        NodeType::ExclusiveGateway { default_flow } => Arc::new(flow::ExclusiveGatewayBehavior {
            activity: id,
            default_flow: default_flow.clone(),
        }),
        NodeType::ParallelGateway => Arc::new(flow::ParallelGatewayBehavior { activity: id }),
        NodeType::IntermediateCatchEvent { trigger } => Arc::new(event::IntermediateCatchEventBehavior {
            activity: id,
            trigger: trigger.clone(),
        }),
        NodeType::BoundaryEvent { .. } => Arc::new(event::BoundaryEventBehavior),
        NodeType::SubProcess => Arc::new(subprocess::SubProcessBehavior { activity: id }),
    }
}
