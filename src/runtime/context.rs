use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::actions::Delegate;
use crate::compiler::core::DeployedDefinition;
use crate::config::EngineConfig;
use crate::error::{BpmnError, EngineError, Result};
use crate::runtime::command::EngineServices;
use crate::runtime::model::{EventSubscription, EventType, Execution, Job, JobHandler, JobState, RecordKind, Task};
use crate::runtime::transaction::Transaction;

/// One step of the in-command agenda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Move the execution onto an activity and run it (or park it for an async job).
    Enter { execution: Uuid, activity: String },
    /// Run the activity the execution is positioned at.
    Execute { execution: Uuid },
    /// Leave the current activity through its outgoing flows.
    Leave { execution: Uuid },
    /// Finish the branch.
    End { execution: Uuid },
}

impl Operation {
    pub fn execution(&self) -> Uuid {
        match self {
            Operation::Enter { execution, .. }
            | Operation::Execute { execution }
            | Operation::Leave { execution }
            | Operation::End { execution } => *execution,
        }
    }
}

/// 运行时上下文 (Runtime Context)
///
/// Everything one command reads and writes goes through here: the transaction, the
/// agenda of pending operations, and the engine services.
pub struct CommandContext {
    pub(crate) services: Arc<EngineServices>,
    pub(crate) tx: Transaction,
    agenda: VecDeque<Operation>,
    steps: usize,
    loaded_instances: HashSet<Uuid>,
}

impl CommandContext {
    pub fn new(services: Arc<EngineServices>) -> Self {
        let tx = Transaction::begin(services.store.clone());
        Self {
            services,
            tx,
            agenda: VecDeque::new(),
            steps: 0,
            loaded_instances: HashSet::new(),
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn tx(&mut self) -> &mut Transaction {
        &mut self.tx
    }

    pub fn definition(&self, id: &str) -> Result<Arc<DeployedDefinition>> {
        self.services.definitions.get(id)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await
    }

    // --- Records ---

    pub async fn find_execution(&mut self, id: Uuid) -> Result<Option<Execution>> {
        self.tx.get::<Execution>(id).await
    }

    pub async fn execution(&mut self, id: Uuid) -> Result<Execution> {
        self.find_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", id))
    }

    pub fn put_execution(&mut self, execution: Execution) {
        self.tx.put(execution);
    }

    /// Removes a single execution row. Use [`CommandContext::delete_subtree`] for anything
    /// that may own children, tasks, jobs or subscriptions.
    pub fn remove_execution(&mut self, id: Uuid) {
        self.tx.remove::<Execution>(id);
    }

    /// Forces a revision bump on the execution so concurrent commands touching it conflict.
    pub fn lock_for_update(&mut self, id: Uuid) {
        self.tx.touch::<Execution>(id);
    }

    /// Pulls every runtime record of a process instance into the transaction.
    pub async fn load_instance(&mut self, process_instance_id: Uuid) -> Result<()> {
        if !self.loaded_instances.insert(process_instance_id) {
            return Ok(());
        }
        for kind in RecordKind::ALL {
            self.tx.scan(kind, Some(process_instance_id)).await?;
        }
        Ok(())
    }

    /// Marks a freshly created instance as fully loaded.
    pub(crate) fn mark_loaded(&mut self, process_instance_id: Uuid) {
        self.loaded_instances.insert(process_instance_id);
        for kind in RecordKind::ALL {
            self.tx.mark_scanned(kind, Some(process_instance_id));
        }
    }

    /// Direct children in creation order.
    pub async fn children(&mut self, parent: &Execution) -> Result<Vec<Execution>> {
        self.load_instance(parent.process_instance_id).await?;
        Ok(self
            .tx
            .cached::<Execution>()
            .filter(|e| e.parent_id == Some(parent.id))
            .cloned()
            .collect())
    }

    pub async fn tasks_of(&mut self, execution: Uuid) -> Result<Vec<Task>> {
        let exec = self.execution(execution).await?;
        self.load_instance(exec.process_instance_id).await?;
        Ok(self
            .tx
            .cached::<Task>()
            .filter(|t| t.execution_id == Some(execution))
            .cloned()
            .collect())
    }

    pub async fn jobs_of(&mut self, execution: Uuid) -> Result<Vec<Job>> {
        let exec = self.execution(execution).await?;
        self.load_instance(exec.process_instance_id).await?;
        Ok(self.tx.cached::<Job>().filter(|j| j.execution_id == execution).cloned().collect())
    }

    pub async fn subscriptions_of(&mut self, execution: Uuid) -> Result<Vec<EventSubscription>> {
        let exec = self.execution(execution).await?;
        self.load_instance(exec.process_instance_id).await?;
        Ok(self
            .tx
            .cached::<EventSubscription>()
            .filter(|s| s.execution_id == execution)
            .cloned()
            .collect())
    }

    pub fn schedule_job(&mut self, execution: &Execution, handler: JobHandler, activity: &str, due_at: DateTime<Utc>) {
        let job = Job {
            id: Uuid::now_v7(),
            handler,
            execution_id: execution.id,
            process_instance_id: execution.process_instance_id,
            activity_id: activity.to_string(),
            state: JobState::Scheduled,
            due_at,
            retries: self.services.config.job_retries,
            initial_retries: self.services.config.job_retries,
            lock_owner: None,
            lock_expires_at: None,
            exception_message: None,
            created_at: self.now(),
        };
        debug!(job_id = %job.id, handler = ?job.handler, due_at = %due_at, "Job scheduled");
        self.tx.put(job);
    }

    pub fn subscribe(
        &mut self,
        execution: &Execution,
        event_type: EventType,
        event_name: &str,
        activity: &str,
        configuration: Option<String>,
    ) {
        let subscription = EventSubscription {
            id: Uuid::now_v7(),
            event_type,
            event_name: event_name.to_string(),
            execution_id: execution.id,
            process_instance_id: execution.process_instance_id,
            activity_id: activity.to_string(),
            configuration,
            created_at: self.now(),
        };
        self.tx.put(subscription);
    }

    /// Drops the subscriptions and timer jobs an execution holds for one catching node.
    pub async fn clear_wait_state(&mut self, execution: Uuid, activity: &str) -> Result<()> {
        for sub in self.subscriptions_of(execution).await? {
            if sub.activity_id == activity {
                self.tx.remove::<EventSubscription>(sub.id);
            }
        }
        for job in self.jobs_of(execution).await? {
            if job.activity_id == activity {
                self.tx.remove::<Job>(job.id);
            }
        }
        Ok(())
    }

    // --- Expressions & delegates ---

    pub async fn evaluate(&mut self, execution: Uuid, expression: &str) -> Result<Value> {
        let variables = self.visible_variables(execution).await?;
        self.services.evaluator.evaluate(expression, &variables)
    }

    pub async fn evaluate_condition(&mut self, execution: Uuid, expression: &str) -> Result<bool> {
        let variables = self.visible_variables(execution).await?;
        self.services.evaluator.evaluate_condition(expression, &variables)
    }

    pub async fn resolve_delegate(&mut self, execution: Uuid, expression: &str) -> Result<Delegate> {
        let variables = self.visible_variables(execution).await?;
        self.services
            .delegates
            .resolve(expression, &variables, self.services.evaluator.as_ref())
    }

    /// Engine errors raised inside delegate code keep their identity; everything else is fatal.
    pub fn delegate_failure(err: anyhow::Error) -> EngineError {
        match err.downcast::<EngineError>() {
            Ok(e) => e,
            Err(e) => EngineError::Fatal(e),
        }
    }

    /// Routes a BPMN error to its boundary event, fails the command otherwise.
    pub async fn handle_delegate_error(&mut self, execution: Uuid, err: anyhow::Error) -> Result<()> {
        if let Some(bpmn) = BpmnError::find_in(&err) {
            let code = bpmn.code.clone();
            debug!(execution = %execution, code = %code, message = %bpmn.message, "Delegate raised BPMN error");
            return self.propagate_error(execution, &code).await;
        }
        Err(Self::delegate_failure(err))
    }

    // --- Agenda ---

    pub fn push(&mut self, op: Operation) {
        trace!(?op, "Agenda push");
        self.agenda.push_back(op);
    }

    /// Drains the agenda. Operations on executions deleted in the meantime are dropped.
    pub async fn run_agenda(&mut self) -> Result<()> {
        while let Some(op) = self.agenda.pop_front() {
            self.steps += 1;
            if self.steps > self.services.config.max_agenda_steps {
                return Err(EngineError::Fatal(anyhow!(
                    "agenda exceeded {} operations, the process probably loops without a wait state",
                    self.services.config.max_agenda_steps
                )));
            }

            let Some(execution) = self.find_execution(op.execution()).await? else {
                trace!(?op, "Execution gone, operation dropped");
                continue;
            };

            match op {
                Operation::Enter { activity, .. } => self.enter_activity(execution, activity).await?,
                Operation::Execute { .. } => {
                    let activity = current_activity(&execution)?;
                    let behavior = self.definition(&execution.definition_id)?.behavior(&activity)?;
                    behavior.execute(self, execution.id).await?;
                }
                Operation::Leave { .. } => self.leave_activity(execution).await?,
                Operation::End { .. } => self.end_branch(execution.id).await?,
            }
        }
        Ok(())
    }

    async fn enter_activity(&mut self, mut execution: Execution, activity: String) -> Result<()> {
        let definition = self.definition(&execution.definition_id)?;
        let is_async = definition.node(&activity)?.kind.is_async_before();
        trace!(execution = %execution.id, activity = %activity, "Entering activity");

        execution.activity_id = Some(activity.clone());
        execution.is_active = true;
        let target = if definition.needs_scope(&activity) {
            execution.is_active = false;
            let child = self.create_scope_child(&execution, &activity);
            self.put_execution(execution);
            self.register_boundary_events(&child, &definition, &activity)?;
            child
        } else {
            self.put_execution(execution.clone());
            execution
        };

        if is_async {
            let now = self.now();
            self.schedule_job(&target, JobHandler::AsyncContinuation, &activity, now);
        } else {
            self.push(Operation::Execute { execution: target.id });
        }
        Ok(())
    }

    async fn leave_activity(&mut self, execution: Execution) -> Result<()> {
        let activity = current_activity(&execution)?;
        let mut current = execution.id;
        if execution.scope_activity.as_deref() == Some(activity.as_str()) && !execution.is_process_instance() {
            current = self.pop_scope(execution.id).await?;
        }
        let behavior = self.definition(&execution.definition_id)?.behavior(&activity)?;
        behavior.leave(self, current).await
    }

    /// Default leave: every unguarded or true outgoing flow.
    pub async fn take_outgoing(&mut self, execution: Uuid) -> Result<()> {
        let exec = self.execution(execution).await?;
        let activity = current_activity(&exec)?;
        let definition = self.definition(&exec.definition_id)?;

        let mut targets = Vec::new();
        for flow in definition.outgoing(&activity) {
            let taken = match &flow.condition {
                Some(condition) => self.evaluate_condition(execution, condition).await?,
                None => true,
            };
            if taken {
                targets.push(flow.target.clone());
            }
        }
        if targets.is_empty() {
            return Err(EngineError::NoOutgoingFlow { activity });
        }
        self.take_flows(exec, targets).await
    }

    /// One target continues with the execution itself, several fork concurrent children.
    pub async fn take_flows(&mut self, execution: Execution, targets: Vec<String>) -> Result<()> {
        if targets.len() <= 1 {
            let activity = targets.into_iter().next().ok_or_else(|| EngineError::NoOutgoingFlow {
                activity: execution.activity_id.clone().unwrap_or_default(),
            })?;
            self.push(Operation::Enter {
                execution: execution.id,
                activity,
            });
            return Ok(());
        }

        debug!(execution = %execution.id, branches = targets.len(), "Forking");
        let fork_activity = execution.activity_id.clone();
        let mut targets = targets.into_iter();
        let scope = match execution.parent_id.filter(|_| execution.is_concurrent) {
            Some(parent) => {
                // reuse the concurrent execution for the first branch
                if let Some(first) = targets.next() {
                    self.push(Operation::Enter {
                        execution: execution.id,
                        activity: first,
                    });
                }
                let scope = self.execution(parent).await?;
                self.lock_for_update(parent);
                scope
            }
            None => {
                let mut scope = execution;
                scope.is_active = false;
                self.put_execution(scope.clone());
                scope
            }
        };
        for activity in targets {
            let child = self.create_concurrent_child(&scope, fork_activity.clone());
            self.push(Operation::Enter {
                execution: child.id,
                activity,
            });
        }
        Ok(())
    }
}

pub(crate) fn current_activity(execution: &Execution) -> Result<String> {
    execution.activity_id.clone().ok_or_else(|| {
        EngineError::Fatal(anyhow!("execution {} is not positioned at an activity", execution.id))
    })
}
