use crate::dsl::{EventTrigger, FlowNode, NodeType, ProcessDefinition, SequenceFlow};
use crate::error::{EngineError, Result};
use crate::nodes::{self, ActivityBehavior};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// A validated, indexed and versioned process definition.
#[derive(Debug)]
pub struct DeployedDefinition {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub definition: ProcessDefinition,
    node_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, usize>,
    boundaries: HashMap<String, Vec<usize>>,
    starts: HashMap<Option<String>, String>,
    behaviors: HashMap<String, Arc<dyn ActivityBehavior>>,
}

impl DeployedDefinition {
    pub fn node(&self, id: &str) -> Result<&FlowNode> {
        self.node_index
            .get(id)
            .map(|&idx| &self.definition.nodes[idx])
            .ok_or_else(|| EngineError::InvalidDefinition(format!("activity `{}` is not part of {}", id, self.id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn behavior(&self, id: &str) -> Result<Arc<dyn ActivityBehavior>> {
        self.behaviors
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidDefinition(format!("activity `{}` is not part of {}", id, self.id)))
    }

    /// Outgoing flows in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&SequenceFlow> {
        self.outgoing
            .get(id)
            .map(|flows| flows.iter().map(|&i| &self.definition.flows[i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.incoming.get(id).copied().unwrap_or(0)
    }

    /// Boundary events attached to `activity`.
    pub fn boundaries(&self, activity: &str) -> Vec<&FlowNode> {
        self.boundaries
            .get(activity)
            .map(|nodes| nodes.iter().map(|&i| &self.definition.nodes[i]).collect())
            .unwrap_or_default()
    }

    /// Start event of the process (`None`) or of a sub-process.
    pub fn start_of(&self, scope: Option<&str>) -> Result<&str> {
        self.starts
            .get(&scope.map(str::to_string))
            .map(String::as_str)
            .ok_or_else(|| {
                EngineError::InvalidDefinition(format!("no start event in scope {}", scope.unwrap_or(&self.key)))
            })
    }

    /// Activities that run in a scope execution of their own: sub-processes and
    /// anything with boundary events.
    pub fn needs_scope(&self, activity: &str) -> bool {
        let is_sub_process = self
            .node(activity)
            .map(|n| matches!(n.kind, NodeType::SubProcess))
            .unwrap_or(false);
        is_sub_process || self.boundaries.contains_key(activity)
    }

    /// `(boundary id, handler id)` of the compensation boundary attached to `activity`.
    pub fn compensation_boundary(&self, activity: &str) -> Option<(&str, &str)> {
        self.boundaries(activity).into_iter().find_map(|b| match &b.kind {
            NodeType::BoundaryEvent {
                trigger: EventTrigger::Compensation { handler },
                ..
            } => Some((b.id.as_str(), handler.as_str())),
            _ => None,
        })
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::InvalidDefinition(msg)
}

pub struct Compiler;

impl Compiler {
    pub fn compile(definition: ProcessDefinition, version: u32) -> Result<DeployedDefinition> {
        // 1. Pass 1: Indexing
        let mut node_index = HashMap::new();
        for (idx, node) in definition.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), idx).is_some() {
                return Err(invalid(format!("duplicate node id `{}`", node.id)));
            }
        }
        let lookup = |id: &str| node_index.get(id).map(|&i| &definition.nodes[i]);

        for node in &definition.nodes {
            if let Some(parent) = &node.parent {
                match lookup(parent) {
                    Some(FlowNode { kind: NodeType::SubProcess, .. }) => {}
                    _ => return Err(invalid(format!("parent of `{}` is not a sub-process", node.id))),
                }
            }
        }

        // 2. Pass 2: Flows
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, usize> = HashMap::new();
        let mut flow_ids = HashSet::new();
        for (idx, flow) in definition.flows.iter().enumerate() {
            if !flow_ids.insert(flow.id.as_str()) {
                return Err(invalid(format!("duplicate flow id `{}`", flow.id)));
            }
            let source = lookup(&flow.source)
                .ok_or_else(|| invalid(format!("flow `{}` starts at unknown node `{}`", flow.id, flow.source)))?;
            let target = lookup(&flow.target)
                .ok_or_else(|| invalid(format!("flow `{}` ends at unknown node `{}`", flow.id, flow.target)))?;
            if source.parent != target.parent {
                return Err(invalid(format!("flow `{}` crosses a sub-process boundary", flow.id)));
            }
            if matches!(source.kind, NodeType::EndEvent { .. }) {
                return Err(invalid(format!("end event `{}` cannot have outgoing flows", source.id)));
            }
            if matches!(target.kind, NodeType::StartEvent | NodeType::BoundaryEvent { .. }) {
                return Err(invalid(format!("`{}` cannot have incoming flows", target.id)));
            }
            outgoing.entry(flow.source.clone()).or_default().push(idx);
            *incoming.entry(flow.target.clone()).or_default() += 1;
        }

        // 3. Pass 3: Node rules
        let mut starts = HashMap::new();
        let mut boundaries: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, node) in definition.nodes.iter().enumerate() {
            match &node.kind {
                NodeType::StartEvent => {
                    if starts.insert(node.parent.clone(), node.id.clone()).is_some() {
                        return Err(invalid(format!(
                            "more than one start event in scope {}",
                            node.parent.as_deref().unwrap_or(&definition.key)
                        )));
                    }
                }
                NodeType::BoundaryEvent {
                    attached_to,
                    trigger,
                    cancel_activity,
                } => {
                    let host = lookup(attached_to)
                        .ok_or_else(|| invalid(format!("boundary `{}` attached to unknown `{}`", node.id, attached_to)))?;
                    if !host.kind.is_activity() || host.parent != node.parent {
                        return Err(invalid(format!(
                            "boundary `{}` must be attached to an activity of its own scope",
                            node.id
                        )));
                    }
                    // the failed activity cannot be resumed, so these always interrupt
                    if !*cancel_activity && matches!(trigger, EventTrigger::Error { .. } | EventTrigger::Compensation { .. }) {
                        return Err(invalid(format!(
                            "error and compensation boundary `{}` must be interrupting",
                            node.id
                        )));
                    }
                    if let EventTrigger::Compensation { handler } = trigger {
                        match lookup(handler) {
                            Some(FlowNode {
                                kind: NodeType::ServiceTask { for_compensation: true, .. },
                                ..
                            }) => {}
                            _ => {
                                return Err(invalid(format!(
                                    "compensation handler `{}` must be a service task marked for compensation",
                                    handler
                                )));
                            }
                        }
                    }
                    boundaries.entry(attached_to.clone()).or_default().push(idx);
                }
                NodeType::IntermediateCatchEvent { trigger } => {
                    if matches!(trigger, EventTrigger::Error { .. } | EventTrigger::Compensation { .. }) {
                        return Err(invalid(format!(
                            "`{}`: error and compensation triggers are only allowed on boundary events",
                            node.id
                        )));
                    }
                }
                NodeType::ExclusiveGateway { default_flow: Some(flow) } => {
                    let valid = outgoing
                        .get(&node.id)
                        .is_some_and(|flows| flows.iter().any(|&i| &definition.flows[i].id == flow));
                    if !valid {
                        return Err(invalid(format!(
                            "default flow `{}` is not an outgoing flow of `{}`",
                            flow, node.id
                        )));
                    }
                }
                _ => {}
            }
        }

        if !starts.contains_key(&None) {
            return Err(invalid(format!("process `{}` has no start event", definition.key)));
        }
        for node in &definition.nodes {
            if matches!(node.kind, NodeType::SubProcess) && !starts.contains_key(&Some(node.id.clone())) {
                return Err(invalid(format!("sub-process `{}` has no start event", node.id)));
            }
        }

        let behaviors = definition
            .nodes
            .iter()
            .map(|node| (node.id.clone(), nodes::prepare(node)))
            .collect();

        Ok(DeployedDefinition {
            id: format!("{}:{}", definition.key, version),
            key: definition.key.clone(),
            version,
            definition,
            node_index,
            outgoing,
            incoming,
            boundaries,
            starts,
            behaviors,
        })
    }
}

/// Every deployed version, addressable by id (`key:version`) or by key (latest).
#[derive(Default)]
pub struct DefinitionCache {
    definitions: DashMap<String, Arc<DeployedDefinition>>,
    latest: DashMap<String, Arc<DeployedDefinition>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<DeployedDefinition>> {
        // compiled under the key's entry lock so versions of one key never collide
        let deployed = match self.latest.entry(definition.key.clone()) {
            Entry::Occupied(mut entry) => {
                let deployed = Arc::new(Compiler::compile(definition, entry.get().version + 1)?);
                entry.insert(deployed.clone());
                deployed
            }
            Entry::Vacant(entry) => {
                let deployed = Arc::new(Compiler::compile(definition, 1)?);
                entry.insert(deployed.clone());
                deployed
            }
        };
        self.definitions.insert(deployed.id.clone(), deployed.clone());
        info!(definition_id = %deployed.id, "Process definition deployed");
        Ok(deployed)
    }

    pub fn get(&self, id: &str) -> Result<Arc<DeployedDefinition>> {
        self.definitions
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::not_found("process definition", id))
    }

    pub fn latest(&self, key: &str) -> Result<Arc<DeployedDefinition>> {
        self.latest
            .get(key)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::not_found("process definition", key))
    }
}
