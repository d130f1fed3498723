use async_trait::async_trait;
use serde_json::{Value, json};
use crate::actions::{DelegateExecution, ServiceDelegate};
use anyhow::{Result, anyhow};
use std::fmt::Debug;
use reqwest::Client;
use tracing::debug;

/// Calls an HTTP endpoint. Fields: `url`, `method` (GET), `body`, `headers`,
/// `output` (variable receiving `{ status, data }`, default `response`).
#[derive(Debug)]
pub struct HttpDelegate {
    client: Client,
}

impl HttpDelegate {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpDelegate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDelegate for HttpDelegate {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()> {
        let url = execution.field_str("url")
            .ok_or_else(|| anyhow!("Missing required field: url"))?
            .to_string();

        let method_str = execution.field_str("method").unwrap_or("GET");
        let method = method_str.parse::<reqwest::Method>()
            .map_err(|_| anyhow!("Invalid HTTP method: {}", method_str))?;

        let mut builder = self.client.request(method, &url);

        // Handle Body (JSON)
        if let Some(body) = execution.field("body").filter(|b| !b.is_null()) {
            builder = builder.json(body);
        }

        // Handle Headers
        if let Some(headers) = execution.field("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v_str) = v.as_str() {
                    builder = builder.header(k, v_str);
                }
            }
        }

        let output = execution.field_str("output").unwrap_or("response").to_string();

        let response = builder.send().await?;
        let status = response.status().as_u16();
        debug!(url = %url, status, "HTTP delegate finished");

        // Non-JSON bodies are recorded as null
        let data = response.json::<Value>().await.unwrap_or(Value::Null);

        execution.set_variable(&output, json!({
            "status": status,
            "data": data
        })).await?;
        Ok(())
    }
}
