use crate::dsl::{EventTrigger, FieldDeclaration, FlowNode, NodeType, ProcessDefinition, SequenceFlow};
use crate::runtime::model::Variables;
use serde_json::Value;

/// Fluent construction of a [`ProcessDefinition`]. Nothing is validated until deploy.
pub struct ProcessBuilder {
    key: String,
    name: String,
    variables: Variables,
    pub nodes: Vec<FlowNode>, // public for manual manipulation in tests
    flows: Vec<SequenceFlow>,
    scopes: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            name: key.to_string(),
            variables: Variables::new(),
            nodes: Vec::new(),
            flows: Vec::new(),
            scopes: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn node(mut self, id: &str, kind: NodeType) -> Self {
        self.nodes.push(FlowNode {
            id: id.to_string(),
            parent: self.scopes.last().cloned(),
            kind,
        });
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeType::StartEvent)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeType::EndEvent { terminate: false, error_code: None })
    }

    pub fn terminate_end(self, id: &str) -> Self {
        self.node(id, NodeType::EndEvent { terminate: true, error_code: None })
    }

    pub fn error_end(self, id: &str, code: &str) -> Self {
        self.node(
            id,
            NodeType::EndEvent {
                terminate: false,
                error_code: Some(code.to_string()),
            },
        )
    }

    pub fn user_task(self, id: &str) -> UserTaskBuilder {
        UserTaskBuilder {
            process_builder: self,
            id: id.to_string(),
            name: None,
            description: None,
            assignee: None,
            owner: None,
            priority: 50,
            due_in_ms: None,
            form_key: None,
        }
    }

    pub fn service_task(self, id: &str, delegate_expression: &str) -> ServiceTaskBuilder {
        ServiceTaskBuilder {
            process_builder: self,
            id: id.to_string(),
            delegate_expression: delegate_expression.to_string(),
            skip_expression: None,
            fields: Vec::new(),
            async_before: false,
            for_compensation: false,
        }
    }

    pub fn receive_task(self, id: &str) -> Self {
        self.node(id, NodeType::ReceiveTask)
    }

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.node(id, NodeType::ExclusiveGateway { default_flow: None })
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.node(id, NodeType::ParallelGateway)
    }

    pub fn signal_catch(self, id: &str, signal: &str) -> Self {
        self.node(
            id,
            NodeType::IntermediateCatchEvent {
                trigger: EventTrigger::Signal { name: signal.to_string() },
            },
        )
    }

    pub fn message_catch(self, id: &str, message: &str) -> Self {
        self.node(
            id,
            NodeType::IntermediateCatchEvent {
                trigger: EventTrigger::Message { name: message.to_string() },
            },
        )
    }

    pub fn timer_catch(self, id: &str, duration_ms: u64) -> Self {
        self.node(
            id,
            NodeType::IntermediateCatchEvent {
                trigger: EventTrigger::Timer { duration_ms },
            },
        )
    }

    pub fn boundary(self, id: &str, attached_to: &str, trigger: EventTrigger, cancel_activity: bool) -> Self {
        self.node(
            id,
            NodeType::BoundaryEvent {
                attached_to: attached_to.to_string(),
                trigger,
                cancel_activity,
            },
        )
    }

    pub fn error_boundary(self, id: &str, attached_to: &str, code: Option<&str>) -> Self {
        let trigger = EventTrigger::Error { code: code.map(str::to_string) };
        self.boundary(id, attached_to, trigger, true)
    }

    pub fn signal_boundary(self, id: &str, attached_to: &str, signal: &str, cancel_activity: bool) -> Self {
        let trigger = EventTrigger::Signal { name: signal.to_string() };
        self.boundary(id, attached_to, trigger, cancel_activity)
    }

    pub fn timer_boundary(self, id: &str, attached_to: &str, duration_ms: u64, cancel_activity: bool) -> Self {
        self.boundary(id, attached_to, EventTrigger::Timer { duration_ms }, cancel_activity)
    }

    pub fn compensation_boundary(self, id: &str, attached_to: &str, handler: &str) -> Self {
        let trigger = EventTrigger::Compensation { handler: handler.to_string() };
        self.boundary(id, attached_to, trigger, true)
    }

    /// Adds the sub-process node; nodes added until [`ProcessBuilder::end_sub_process`]
    /// are placed inside it.
    pub fn sub_process(self, id: &str) -> Self {
        let mut builder = self.node(id, NodeType::SubProcess);
        builder.scopes.push(id.to_string());
        builder
    }

    pub fn end_sub_process(mut self) -> Self {
        self.scopes.pop();
        self
    }

    pub fn connect(self, source: &str, target: &str) -> Self {
        self.flow(source, target, None)
    }

    pub fn connect_if(self, source: &str, target: &str, condition: &str) -> Self {
        self.flow(source, target, Some(condition.to_string()))
    }

    /// Connects and marks the flow as the gateway's default.
    pub fn connect_default(mut self, gateway: &str, target: &str) -> Self {
        let flow_id = Self::flow_id(gateway, target);
        for node in self.nodes.iter_mut().filter(|n| n.id == gateway) {
            if let NodeType::ExclusiveGateway { default_flow } = &mut node.kind {
                *default_flow = Some(flow_id.clone());
            }
        }
        self.flow(gateway, target, None)
    }

    fn flow(mut self, source: &str, target: &str, condition: Option<String>) -> Self {
        self.flows.push(SequenceFlow {
            id: Self::flow_id(source, target),
            source: source.to_string(),
            target: target.to_string(),
            condition,
        });
        self
    }

    pub fn flow_id(source: &str, target: &str) -> String {
        format!("{}->{}", source, target)
    }

    pub fn build(self) -> ProcessDefinition {
        ProcessDefinition {
            key: self.key,
            name: self.name,
            variables: self.variables,
            nodes: self.nodes,
            flows: self.flows,
        }
    }
}

pub struct UserTaskBuilder {
    process_builder: ProcessBuilder,
    id: String,
    name: Option<String>,
    description: Option<String>,
    assignee: Option<String>,
    owner: Option<String>,
    priority: i32,
    due_in_ms: Option<u64>,
    form_key: Option<String>,
}

impl UserTaskBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn due_in_ms(mut self, ms: u64) -> Self {
        self.due_in_ms = Some(ms);
        self
    }

    pub fn form_key(mut self, key: &str) -> Self {
        self.form_key = Some(key.to_string());
        self
    }

    pub fn build(self) -> ProcessBuilder {
        let kind = NodeType::UserTask {
            name: self.name,
            description: self.description,
            assignee: self.assignee,
            owner: self.owner,
            priority: self.priority,
            due_in_ms: self.due_in_ms,
            form_key: self.form_key,
        };
        self.process_builder.node(&self.id, kind)
    }
}

pub struct ServiceTaskBuilder {
    process_builder: ProcessBuilder,
    id: String,
    delegate_expression: String,
    skip_expression: Option<String>,
    fields: Vec<FieldDeclaration>,
    async_before: bool,
    for_compensation: bool,
}

impl ServiceTaskBuilder {
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.push(FieldDeclaration {
            name: name.to_string(),
            value: Some(value.into()),
            expression: None,
        });
        self
    }

    pub fn field_expression(mut self, name: &str, expression: &str) -> Self {
        self.fields.push(FieldDeclaration {
            name: name.to_string(),
            value: None,
            expression: Some(expression.to_string()),
        });
        self
    }

    pub fn skip_expression(mut self, expression: &str) -> Self {
        self.skip_expression = Some(expression.to_string());
        self
    }

    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    pub fn for_compensation(mut self) -> Self {
        self.for_compensation = true;
        self
    }

    pub fn build(self) -> ProcessBuilder {
        let kind = NodeType::ServiceTask {
            delegate_expression: self.delegate_expression,
            skip_expression: self.skip_expression,
            fields: self.fields,
            async_before: self.async_before,
            for_compensation: self.for_compensation,
        };
        self.process_builder.node(&self.id, kind)
    }
}
