use chrono::TimeDelta;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compiler::core::DeployedDefinition;
use crate::dsl::{EventTrigger, NodeType};
use crate::error::{EngineError, Result};
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::{EventSubscription, EventType, Execution, JobHandler};

/// Signals, messages, timers, BPMN errors and compensation.
impl CommandContext {
    /// Subscriptions and timer jobs for the boundary events of `activity`, owned by the
    /// scope execution created for it.
    pub(crate) fn register_boundary_events(
        &mut self,
        scope: &Execution,
        definition: &DeployedDefinition,
        activity: &str,
    ) -> Result<()> {
        for boundary in definition.boundaries(activity) {
            let NodeType::BoundaryEvent { trigger, .. } = &boundary.kind else {
                continue;
            };
            match trigger {
                EventTrigger::Signal { name } => {
                    self.subscribe(scope, EventType::Signal, name, &boundary.id, None);
                }
                EventTrigger::Message { name } => {
                    self.subscribe(scope, EventType::Message, name, &boundary.id, None);
                }
                EventTrigger::Error { code } => {
                    let code = code.as_deref().unwrap_or("");
                    self.subscribe(scope, EventType::Error, code, &boundary.id, None);
                }
                EventTrigger::Timer { duration_ms } => {
                    let now = self.now();
                    let due_at = i64::try_from(*duration_ms)
                        .ok()
                        .and_then(TimeDelta::try_milliseconds)
                        .and_then(|delay| now.checked_add_signed(delay))
                        .ok_or_else(|| {
                            EngineError::InvalidDefinition(format!("timer of `{}` is out of range", boundary.id))
                        })?;
                    let handler = JobHandler::TimerBoundary {
                        boundary: boundary.id.clone(),
                    };
                    self.schedule_job(scope, handler, &boundary.id, due_at);
                }
                // registered when the activity completes
                EventTrigger::Compensation { .. } => {}
            }
        }
        Ok(())
    }

    /// Hands an event to the node that subscribed to it.
    pub async fn deliver_subscription(&mut self, subscription: &EventSubscription, payload: Option<Value>) -> Result<()> {
        let execution = self.execution(subscription.execution_id).await?;
        let definition = self.definition(&execution.definition_id)?;
        let node = definition.node(&subscription.activity_id)?;
        match &node.kind {
            NodeType::BoundaryEvent { .. } => {
                let target = self.fire_boundary(execution.id, &node.id).await?;
                self.set_payload(target, payload).await
            }
            NodeType::IntermediateCatchEvent { .. } => {
                let behavior = definition.behavior(&node.id)?;
                behavior.signal(self, execution.id, payload).await
            }
            other => Err(EngineError::UnsupportedOperation(format!(
                "{} `{}` does not catch events",
                other.type_name(),
                node.id
            ))),
        }
    }

    /// Fires a boundary event of the activity running in `scope`.
    ///
    /// Interrupting: compensates and deletes the activity's subtree, then the parent
    /// continues at the boundary. Non-interrupting: a new concurrent branch starts at the
    /// boundary while the activity keeps running. Returns the execution now at the boundary.
    pub async fn fire_boundary(&mut self, scope: Uuid, boundary: &str) -> Result<Uuid> {
        let exec = self.execution(scope).await?;
        let definition = self.definition(&exec.definition_id)?;
        let NodeType::BoundaryEvent { cancel_activity, attached_to, .. } = &definition.node(boundary)?.kind else {
            return Err(EngineError::InvalidDefinition(format!("`{}` is not a boundary event", boundary)));
        };
        let holder = exec
            .parent_id
            .ok_or_else(|| EngineError::InvalidDefinition(format!("`{}` fired on a process instance", boundary)))?;
        info!(
            boundary,
            activity = %attached_to,
            instance_id = %exec.process_instance_id,
            interrupting = *cancel_activity,
            "Boundary event fired"
        );

        if *cancel_activity {
            self.run_compensation(scope).await?;
            self.delete_subtree(scope, "interrupted by boundary event").await?;
            let mut parent = self.execution(holder).await?;
            parent.is_active = true;
            parent.activity_id = Some(boundary.to_string());
            self.put_execution(parent);
            self.push(Operation::Leave { execution: holder });
            return Ok(holder);
        }

        let concurrency_root = self.concurrent_token_scope(holder).await?;
        let root = self.execution(concurrency_root).await?;
        // a branch ending concurrently must see this one before it completes the scope
        self.lock_for_update(concurrency_root);
        let branch = self.create_concurrent_child(&root, Some(boundary.to_string()));
        self.push(Operation::Leave { execution: branch.id });
        Ok(branch.id)
    }

    /// Finds the nearest error boundary for `code`, walking outward from `execution`.
    /// An exact code match beats a catch-all in the same scope.
    pub async fn propagate_error(&mut self, execution: Uuid, code: &str) -> Result<()> {
        let chain = self.ancestors(execution).await?;
        for scope in chain.iter().filter(|e| e.is_scope) {
            let handlers: Vec<EventSubscription> = self
                .subscriptions_of(scope.id)
                .await?
                .into_iter()
                .filter(|s| s.event_type == EventType::Error)
                .collect();
            let matched = handlers
                .iter()
                .find(|s| s.event_name == code)
                .or_else(|| handlers.iter().find(|s| s.event_name.is_empty()));
            if let Some(handler) = matched {
                info!(code, boundary = %handler.activity_id, "BPMN error caught");
                self.fire_boundary(scope.id, &handler.activity_id).await?;
                return Ok(());
            }
        }
        warn!(code, execution = %execution, "BPMN error has no matching boundary event");
        Err(EngineError::UnhandledBusinessError { code: code.to_string() })
    }

    /// Runs the compensation handlers registered inside `scope`: deepest scope first,
    /// most recently completed activity first.
    pub async fn run_compensation(&mut self, scope: Uuid) -> Result<()> {
        let root = self.execution(scope).await?;
        let definition = self.definition(&root.definition_id)?;

        let mut pending = Vec::new();
        for (exec, depth) in self.subtree(&root).await? {
            for sub in self.subscriptions_of(exec.id).await? {
                if sub.event_type == EventType::Compensate {
                    pending.push((depth, sub));
                }
            }
        }
        pending.sort_by(|(da, a), (db, b)| {
            db.cmp(da)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        });

        for (_, sub) in pending {
            self.tx.remove::<EventSubscription>(sub.id);
            let Some(handler) = sub.configuration.as_deref() else {
                continue;
            };
            info!(activity = %sub.event_name, handler, "Compensating activity");
            definition.behavior(handler)?.compensate(self, sub.execution_id).await?;
        }
        Ok(())
    }
}
