use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::{DelegateRegistry, DelegateResolver};
use crate::compiler::core::{DefinitionCache, DeployedDefinition};
use crate::config::EngineConfig;
use crate::dsl::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::runtime::clock::{Clock, SystemClock};
use crate::runtime::command::{Command, CommandExecutor, EngineServices};
use crate::runtime::commands::*;
use crate::runtime::expression::{EvalexprEvaluator, ExpressionEvaluator};
use crate::runtime::jobs::JobScheduler;
use crate::runtime::model::{
    EventSubscription, EventType, Execution, Job, Task, TaskSnapshot, VariableInstance, Variables,
};
use crate::runtime::storage::{InMemoryRecordStore, RecordStore};

/// Result of a signal broadcast. One failing delivery does not undo the others.
#[derive(Debug, Default)]
pub struct SignalDelivery {
    pub delivered: usize,
    pub failures: Vec<(Uuid, EngineError)>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    delegates: Option<Arc<dyn DelegateResolver>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn delegates(mut self, delegates: Arc<dyn DelegateResolver>) -> Self {
        self.delegates = Some(delegates);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Engine {
        let services = EngineServices {
            config: self.config,
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryRecordStore::new())),
            definitions: DefinitionCache::new(),
            delegates: self
                .delegates
                .unwrap_or_else(|| Arc::new(DelegateRegistry::with_builtins())),
            evaluator: self.evaluator.unwrap_or_else(|| Arc::new(EvalexprEvaluator)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        Engine {
            executor: CommandExecutor::new(Arc::new(services)),
        }
    }
}

/// 流程引擎
///
/// Thin facade over the command executor. Every method is one command, i.e. one
/// transaction; `ConcurrentModification` means nothing was written and the call can
/// be repeated.
#[derive(Clone)]
pub struct Engine {
    executor: CommandExecutor,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            store: None,
            delegates: None,
            evaluator: None,
            clock: None,
        }
    }

    /// In-memory engine with the built-in delegates.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.executor.services().config
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Runs a custom command in its own transaction.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.executor.run(command).await
    }

    // --- Definitions ---

    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<DeployedDefinition>> {
        self.executor.services().definitions.deploy(definition)
    }

    pub fn definition(&self, id: &str) -> Result<Arc<DeployedDefinition>> {
        self.executor.services().definitions.get(id)
    }

    // --- Process instances ---

    pub async fn start_process(&self, key: &str, variables: Variables) -> Result<Uuid> {
        self.start(key, None, variables).await
    }

    pub async fn start_process_with_business_key(
        &self,
        key: &str,
        business_key: &str,
        variables: Variables,
    ) -> Result<Uuid> {
        self.start(key, Some(business_key.to_string()), variables).await
    }

    async fn start(&self, key: &str, business_key: Option<String>, variables: Variables) -> Result<Uuid> {
        self.executor
            .run(&StartProcessCmd {
                key: key.to_string(),
                business_key,
                variables,
            })
            .await
    }

    /// Force-deletes the instance. The open tasks come back with status `Cancelled`.
    pub async fn delete_process_instance(&self, process_instance_id: Uuid, reason: &str) -> Result<Vec<TaskSnapshot>> {
        self.executor
            .run(&DeleteProcessInstanceCmd {
                process_instance_id,
                reason: reason.to_string(),
            })
            .await
    }

    pub async fn trigger(&self, execution: Uuid, payload: Option<Value>) -> Result<()> {
        self.executor.run(&TriggerCmd { execution, payload }).await
    }

    pub async fn executions(&self, process_instance_id: Uuid) -> Result<Vec<Execution>> {
        self.executor.run(&ExecutionsCmd { process_instance_id }).await
    }

    // --- Tasks ---

    pub async fn complete_task(&self, task_id: Uuid, variables: Variables) -> Result<TaskSnapshot> {
        self.executor.run(&CompleteTaskCmd { task_id, variables }).await
    }

    pub async fn claim_task(&self, task_id: Uuid, user: &str) -> Result<TaskSnapshot> {
        self.executor
            .run(&ClaimTaskCmd {
                task_id,
                user: user.to_string(),
            })
            .await
    }

    pub async fn unclaim_task(&self, task_id: Uuid) -> Result<TaskSnapshot> {
        self.executor.run(&UnclaimTaskCmd { task_id }).await
    }

    pub async fn create_task(&self, task: NewTask) -> Result<TaskSnapshot> {
        self.executor.run(&CreateTaskCmd { task }).await
    }

    pub async fn task(&self, task_id: Uuid) -> Result<Task> {
        self.executor.run(&GetTaskCmd { task_id }).await
    }

    /// Open tasks of one process instance.
    pub async fn tasks(&self, process_instance_id: Uuid) -> Result<Vec<Task>> {
        self.executor
            .run(&TasksCmd {
                process_instance_id: Some(process_instance_id),
            })
            .await
    }

    pub async fn all_tasks(&self) -> Result<Vec<Task>> {
        self.executor.run(&TasksCmd { process_instance_id: None }).await
    }

    pub async fn task_variables(&self, task_id: Uuid) -> Result<Variables> {
        self.executor.run(&TaskVariablesCmd { task_id }).await
    }

    // --- Variables ---

    pub async fn get_variables(&self, execution: Uuid) -> Result<Vec<VariableInstance>> {
        self.executor.run(&GetVariablesCmd { execution }).await
    }

    pub async fn set_variables(&self, execution: Uuid, variables: Variables) -> Result<()> {
        self.executor
            .run(&SetVariablesCmd {
                execution,
                variables,
                local: false,
            })
            .await
    }

    pub async fn set_variables_local(&self, execution: Uuid, variables: Variables) -> Result<()> {
        self.executor
            .run(&SetVariablesCmd {
                execution,
                variables,
                local: true,
            })
            .await
    }

    // --- Events ---

    /// Delivers a signal to every matching subscription, globally or within one
    /// process instance. Each delivery is its own command.
    pub async fn send_signal(
        &self,
        name: &str,
        payload: Option<Value>,
        process_instance_id: Option<Uuid>,
    ) -> Result<SignalDelivery> {
        let subscriptions = self.find_subscriptions(EventType::Signal, name, process_instance_id).await?;
        let mut delivery = SignalDelivery::default();
        for subscription in subscriptions {
            let cmd = DeliverEventCmd {
                subscription_id: subscription.id,
                payload: payload.clone(),
            };
            match self.executor.run(&cmd).await {
                Ok(true) => delivery.delivered += 1,
                // consumed by an earlier delivery, e.g. an interrupting sibling boundary
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        signal = name,
                        subscription_id = %subscription.id,
                        instance_id = %subscription.process_instance_id,
                        error = %e,
                        "Signal delivery failed"
                    );
                    delivery.failures.push((subscription.id, e));
                }
            }
        }
        info!(signal = name, delivered = delivery.delivered, failed = delivery.failures.len(), "Signal sent");
        Ok(delivery)
    }

    /// Delivers a message to exactly one waiting subscription, the oldest one.
    pub async fn correlate_message(
        &self,
        name: &str,
        process_instance_id: Option<Uuid>,
        payload: Option<Value>,
    ) -> Result<()> {
        let subscriptions = self.find_subscriptions(EventType::Message, name, process_instance_id).await?;
        for subscription in subscriptions {
            let cmd = DeliverEventCmd {
                subscription_id: subscription.id,
                payload: payload.clone(),
            };
            if self.executor.run(&cmd).await? {
                return Ok(());
            }
        }
        Err(EngineError::not_found("message subscription", name))
    }

    async fn find_subscriptions(
        &self,
        event_type: EventType,
        name: &str,
        process_instance_id: Option<Uuid>,
    ) -> Result<Vec<EventSubscription>> {
        self.executor
            .run(&FindSubscriptionsCmd {
                event_type,
                event_name: name.to_string(),
                process_instance_id,
            })
            .await
    }

    pub async fn event_subscriptions(&self, process_instance_id: Uuid) -> Result<Vec<EventSubscription>> {
        self.executor.run(&SubscriptionsCmd { process_instance_id }).await
    }

    // --- Jobs ---

    pub async fn jobs(&self, process_instance_id: Option<Uuid>) -> Result<Vec<Job>> {
        self.executor.run(&JobsCmd { process_instance_id }).await
    }

    /// Scheduler locking jobs under the configured worker id.
    pub fn job_scheduler(&self) -> JobScheduler {
        self.job_scheduler_for(&self.config().worker_id)
    }

    pub fn job_scheduler_for(&self, worker_id: &str) -> JobScheduler {
        JobScheduler::new(self.executor.clone(), worker_id)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
