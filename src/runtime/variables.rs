use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::context::CommandContext;
use crate::runtime::model::{VariableInstance, Variables};

/// Variable scoping. Reads walk from the execution up to the process instance; the
/// nearest definition wins.
impl CommandContext {
    pub async fn get_variable(&mut self, execution: Uuid, name: &str) -> Result<Option<Value>> {
        Ok(self
            .ancestors(execution)
            .await?
            .into_iter()
            .find_map(|e| e.variables.get(name).cloned()))
    }

    /// All visible variables in declaration order, outermost scope first.
    pub async fn visible_variables(&mut self, execution: Uuid) -> Result<Variables> {
        let chain = self.ancestors(execution).await?;
        let mut merged = Variables::new();
        for exec in chain.iter().rev() {
            for (k, v) in &exec.variables {
                // an existing key keeps its position
                merged.insert(k.clone(), v.clone());
            }
        }
        Ok(merged)
    }

    pub async fn variable_instances(&mut self, execution: Uuid) -> Result<Vec<VariableInstance>> {
        let chain = self.ancestors(execution).await?;
        let mut instances: Vec<VariableInstance> = Vec::new();
        for exec in chain.iter().rev() {
            for (k, v) in &exec.variables {
                match instances.iter_mut().find(|vi| &vi.name == k) {
                    Some(shadowed) => {
                        shadowed.value = v.clone();
                        shadowed.execution_id = exec.id;
                    }
                    None => instances.push(VariableInstance {
                        name: k.clone(),
                        value: v.clone(),
                        execution_id: exec.id,
                        process_instance_id: exec.process_instance_id,
                    }),
                }
            }
        }
        Ok(instances)
    }

    /// Updates the nearest scope defining `name`, or creates it on the process instance.
    pub async fn set_variable(&mut self, execution: Uuid, name: &str, value: Value) -> Result<()> {
        let chain = self.ancestors(execution).await?;
        let owner = chain
            .iter()
            .position(|e| e.variables.contains_key(name))
            .unwrap_or(chain.len() - 1);
        let mut exec = chain
            .into_iter()
            .nth(owner)
            .ok_or_else(|| EngineError::not_found("execution", execution))?;
        exec.variables.insert(name.to_string(), value);
        self.put_execution(exec);
        Ok(())
    }

    /// Writes the nearest scope only, shadowing outer definitions.
    pub async fn set_variable_local(&mut self, execution: Uuid, name: &str, value: Value) -> Result<()> {
        let scope = self.nearest_scope(execution).await?;
        let mut exec = self.execution(scope).await?;
        exec.variables.insert(name.to_string(), value);
        self.put_execution(exec);
        Ok(())
    }

    pub async fn set_variables(&mut self, execution: Uuid, variables: Variables) -> Result<()> {
        for (k, v) in variables {
            self.set_variable(execution, &k, v).await?;
        }
        Ok(())
    }

    /// Event and trigger payloads: objects become variables, anything else is dropped.
    pub async fn set_payload(&mut self, execution: Uuid, payload: Option<Value>) -> Result<()> {
        match payload {
            Some(Value::Object(variables)) => self.set_variables(execution, variables).await,
            None | Some(Value::Null) => Ok(()),
            Some(other) => {
                debug!(execution = %execution, payload = %other, "Non-object payload ignored");
                Ok(())
            }
        }
    }
}
