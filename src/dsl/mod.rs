pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::model::Variables;

/// 流程定义 (解析后的内存模型)
/// Immutable once deployed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub key: String,
    pub name: String,
    /// Defaults merged under the start variables.
    #[serde(default)]
    pub variables: Variables,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
}

/// 流程节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub id: String,
    /// Containing sub-process, `None` for top-level nodes.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(flatten)]
    pub kind: NodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NodeType {
    StartEvent,
    EndEvent {
        #[serde(default)]
        terminate: bool,
        /// Throws this BPMN error instead of ending normally.
        #[serde(default)]
        error_code: Option<String>,
    },
    UserTask {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
        /// Literal user id or `${expression}`.
        #[serde(default)]
        assignee: Option<String>,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default)]
        due_in_ms: Option<u64>,
        #[serde(default)]
        form_key: Option<String>,
    },
    ServiceTask {
        delegate_expression: String,
        #[serde(default)]
        skip_expression: Option<String>,
        #[serde(default)]
        fields: Vec<FieldDeclaration>,
        #[serde(default)]
        async_before: bool,
        /// Only reachable as a compensation handler.
        #[serde(default)]
        for_compensation: bool,
    },
    ReceiveTask,
    ExclusiveGateway {
        #[serde(default)]
        default_flow: Option<String>,
    },
    ParallelGateway,
    IntermediateCatchEvent {
        trigger: EventTrigger,
    },
    BoundaryEvent {
        attached_to: String,
        trigger: EventTrigger,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
    SubProcess,
}

fn default_priority() -> i32 {
    50
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum EventTrigger {
    Signal { name: String },
    Message { name: String },
    Timer { duration_ms: u64 },
    /// `None` catches every error code.
    Error {
        #[serde(default)]
        code: Option<String>,
    },
    Compensation { handler: String },
}

/// Value injected into a delegate at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDeclaration {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    /// Evaluated on every invocation; wins over `value`.
    #[serde(default)]
    pub expression: Option<String>,
}

/// 连线
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
}

impl NodeType {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeType::StartEvent => "start event",
            NodeType::EndEvent { .. } => "end event",
            NodeType::UserTask { .. } => "user task",
            NodeType::ServiceTask { .. } => "service task",
            NodeType::ReceiveTask => "receive task",
            NodeType::ExclusiveGateway { .. } => "exclusive gateway",
            NodeType::ParallelGateway => "parallel gateway",
            NodeType::IntermediateCatchEvent { .. } => "intermediate catch event",
            NodeType::BoundaryEvent { .. } => "boundary event",
            NodeType::SubProcess => "sub-process",
        }
    }

    /// Activities that boundary events may be attached to.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeType::UserTask { .. }
                | NodeType::ServiceTask { .. }
                | NodeType::ReceiveTask
                | NodeType::SubProcess
        )
    }

    pub fn is_async_before(&self) -> bool {
        matches!(self, NodeType::ServiceTask { async_before: true, .. })
    }
}
