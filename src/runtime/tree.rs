use anyhow::anyhow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::compiler::core::DeployedDefinition;
use crate::error::{EngineError, Result};
use crate::runtime::context::{CommandContext, Operation};
use crate::runtime::model::{EventSubscription, EventType, Execution, Job, Task, TaskSnapshot, TaskStatus, Variables};

fn orphan(execution: Uuid) -> EngineError {
    EngineError::Fatal(anyhow!("execution {} has no parent", execution))
}

impl CommandContext {
    pub(crate) fn create_root(
        &mut self,
        definition: &DeployedDefinition,
        business_key: Option<String>,
        variables: Variables,
    ) -> Execution {
        let id = Uuid::now_v7();
        let mut initial = definition.definition.variables.clone();
        for (k, v) in variables {
            initial.insert(k, v);
        }
        let root = Execution {
            id,
            process_instance_id: id,
            parent_id: None,
            definition_id: definition.id.clone(),
            business_key,
            activity_id: None,
            is_active: true,
            is_scope: true,
            is_concurrent: false,
            scope_activity: None,
            variables: initial,
            started_at: self.now(),
        };
        self.mark_loaded(id);
        self.put_execution(root.clone());
        root
    }

    /// Scope execution carrying the token through `activity`.
    pub(crate) fn create_scope_child(&mut self, parent: &Execution, activity: &str) -> Execution {
        let child = Execution {
            id: Uuid::now_v7(),
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent.id),
            definition_id: parent.definition_id.clone(),
            business_key: None,
            activity_id: Some(activity.to_string()),
            is_active: true,
            is_scope: true,
            is_concurrent: false,
            scope_activity: Some(activity.to_string()),
            variables: Variables::new(),
            started_at: self.now(),
        };
        self.put_execution(child.clone());
        child
    }

    pub(crate) fn create_concurrent_child(&mut self, scope: &Execution, activity: Option<String>) -> Execution {
        let child = Execution {
            id: Uuid::now_v7(),
            process_instance_id: scope.process_instance_id,
            parent_id: Some(scope.id),
            definition_id: scope.definition_id.clone(),
            business_key: None,
            activity_id: activity,
            is_active: true,
            is_scope: false,
            is_concurrent: true,
            scope_activity: None,
            variables: Variables::new(),
            started_at: self.now(),
        };
        self.put_execution(child.clone());
        child
    }

    /// The execution itself followed by its ancestors up to the process instance.
    pub async fn ancestors(&mut self, execution: Uuid) -> Result<Vec<Execution>> {
        let mut chain = vec![self.execution(execution).await?];
        while let Some(parent) = chain.last().and_then(|e| e.parent_id) {
            chain.push(self.execution(parent).await?);
        }
        Ok(chain)
    }

    pub async fn nearest_scope(&mut self, execution: Uuid) -> Result<Uuid> {
        self.ancestors(execution)
            .await?
            .into_iter()
            .find(|e| e.is_scope)
            .map(|e| e.id)
            .ok_or_else(|| EngineError::Fatal(anyhow!("execution {} has no scope", execution)))
    }

    /// The execution and all its descendants, breadth first, with their depth below `root`.
    pub async fn subtree(&mut self, root: &Execution) -> Result<Vec<(Execution, usize)>> {
        let mut nodes = vec![(root.clone(), 0)];
        let mut i = 0;
        while i < nodes.len() {
            let (parent, depth) = nodes[i].clone();
            for child in self.children(&parent).await? {
                nodes.push((child, depth + 1));
            }
            i += 1;
        }
        Ok(nodes)
    }

    /// Removes the execution and everything below it, bottom-up: tasks, jobs and event
    /// subscriptions first, then the execution rows.
    pub async fn delete_subtree(&mut self, execution: Uuid, reason: &str) -> Result<()> {
        let Some(root) = self.find_execution(execution).await? else {
            return Ok(());
        };
        let nodes = self.subtree(&root).await?;
        for (exec, _) in nodes.iter().rev() {
            for task in self.tasks_of(exec.id).await? {
                self.cancel_task(task, reason);
            }
            for job in self.jobs_of(exec.id).await? {
                self.tx.remove::<Job>(job.id);
            }
            for sub in self.subscriptions_of(exec.id).await? {
                self.tx.remove::<EventSubscription>(sub.id);
            }
            self.remove_execution(exec.id);
        }
        debug!(execution = %execution, removed = nodes.len(), reason, "Execution subtree deleted");
        Ok(())
    }

    pub async fn delete_descendants(&mut self, execution: Uuid, reason: &str) -> Result<()> {
        let exec = self.execution(execution).await?;
        for child in self.children(&exec).await? {
            self.delete_subtree(child.id, reason).await?;
        }
        Ok(())
    }

    /// Drops an open task together with its execution. The returned snapshot is `Cancelled`.
    fn cancel_task(&mut self, task: Task, reason: &str) -> TaskSnapshot {
        let mut snapshot = task;
        snapshot.status = TaskStatus::Cancelled;
        info!(task_id = %snapshot.id, reason, "Task cancelled");
        self.tx.remove::<Task>(snapshot.id);
        snapshot
    }

    /// Removes every runtime record of a process instance. Returns the tasks that were
    /// still open.
    pub async fn delete_instance(&mut self, process_instance_id: Uuid, reason: &str) -> Result<Vec<TaskSnapshot>> {
        self.load_instance(process_instance_id).await?;
        let executions: Vec<Uuid> = self
            .tx
            .cached::<Execution>()
            .filter(|e| e.process_instance_id == process_instance_id)
            .map(|e| e.id)
            .collect();
        if executions.is_empty() {
            return Err(EngineError::not_found("process instance", process_instance_id));
        }
        let tasks: Vec<Task> = self
            .tx
            .cached::<Task>()
            .filter(|t| t.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect();
        let jobs: Vec<Uuid> = self
            .tx
            .cached::<Job>()
            .filter(|j| j.process_instance_id == process_instance_id)
            .map(|j| j.id)
            .collect();
        let subscriptions: Vec<Uuid> = self
            .tx
            .cached::<EventSubscription>()
            .filter(|s| s.process_instance_id == process_instance_id)
            .map(|s| s.id)
            .collect();

        let cancelled: Vec<TaskSnapshot> = tasks.into_iter().map(|task| self.cancel_task(task, reason)).collect();
        for id in jobs {
            self.tx.remove::<Job>(id);
        }
        for id in subscriptions {
            self.tx.remove::<EventSubscription>(id);
        }
        for id in executions {
            self.remove_execution(id);
        }
        info!(instance_id = %process_instance_id, reason, "Process instance ended");
        Ok(cancelled)
    }

    /// A branch reached a plain end event.
    pub async fn end_branch(&mut self, execution: Uuid) -> Result<()> {
        let exec = self.execution(execution).await?;
        if !exec.is_concurrent {
            return self.complete_scope(execution).await;
        }

        let scope_id = exec.parent_id.ok_or_else(|| orphan(execution))?;
        let scope = self.execution(scope_id).await?;
        // the last two branches ending concurrently must not both miss the completion
        self.lock_for_update(scope_id);
        self.delete_subtree(execution, "branch ended").await?;
        if self.children(&scope).await?.is_empty() {
            self.complete_scope(scope_id).await?;
        }
        Ok(())
    }

    /// Ends a scope whose work is done: the process instance ends, a sub-process scope
    /// is popped and its parent leaves the sub-process.
    pub async fn complete_scope(&mut self, scope: Uuid) -> Result<()> {
        let exec = self.execution(scope).await?;
        if exec.is_process_instance() {
            self.delete_instance(exec.process_instance_id, "completed").await?;
            return Ok(());
        }
        let parent = self.pop_scope(scope).await?;
        self.push(Operation::Leave { execution: parent });
        Ok(())
    }

    /// Removes a finished scope execution and hands the token back to its parent.
    ///
    /// Compensation subscriptions collected inside move to the enclosing scope, and the
    /// scope's own activity registers its compensation handler there.
    pub async fn pop_scope(&mut self, scope: Uuid) -> Result<Uuid> {
        let exec = self.execution(scope).await?;
        let parent_id = exec.parent_id.ok_or_else(|| orphan(scope))?;
        let mut parent = self.execution(parent_id).await?;
        let enclosing = self.nearest_scope(parent_id).await?;

        for mut sub in self.subscriptions_of(scope).await? {
            if sub.event_type == EventType::Compensate {
                sub.execution_id = enclosing;
                self.tx.put(sub);
            }
        }
        if let Some(activity) = &exec.scope_activity {
            let definition = self.definition(&exec.definition_id)?;
            if let Some((boundary, handler)) = definition.compensation_boundary(activity) {
                let enclosing_exec = self.execution(enclosing).await?;
                self.subscribe(&enclosing_exec, EventType::Compensate, activity, boundary, Some(handler.to_string()));
            }
        }

        self.delete_subtree(scope, "scope completed").await?;
        parent.is_active = true;
        self.put_execution(parent);
        Ok(parent_id)
    }

    /// Makes room for an extra concurrent branch next to the token at `holder`.
    ///
    /// A concurrent holder simply gets a sibling. A scope carrying the token itself
    /// hands it down to a new concurrent child first. Returns the scope the new branch
    /// is created under.
    pub async fn concurrent_token_scope(&mut self, holder: Uuid) -> Result<Uuid> {
        let exec = self.execution(holder).await?;
        if exec.is_concurrent {
            return exec.parent_id.ok_or_else(|| orphan(holder));
        }

        let children = self.children(&exec).await?;
        let mut token = self.create_concurrent_child(&exec, exec.activity_id.clone());
        token.is_active = exec.is_active;
        self.put_execution(token.clone());
        for mut child in children {
            child.parent_id = Some(token.id);
            self.put_execution(child);
        }
        let mut scope = exec;
        scope.is_active = false;
        self.put_execution(scope);
        Ok(holder)
    }
}
