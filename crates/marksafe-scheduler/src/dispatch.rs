//! Execution engine client — hands backup requests to the engine over HTTP.
//! The request JSON is POSTed to the configured endpoint; the response body
//! is the engine's reply.

use std::time::Duration;

use async_trait::async_trait;
use marksafe_core::config::EngineConfig;
use marksafe_core::error::{MarkSafeError, Result};
use marksafe_core::traits::ExecutionEngine;
use marksafe_core::types::{DispatchReply, DispatchRequest};

pub struct HttpEngine {
    client: reqwest::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl HttpEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MarkSafeError::engine(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl ExecutionEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchReply> {
        let mut req = self.client.post(&self.endpoint).json(&request);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| MarkSafeError::engine(format!("send to {} failed: {e}", self.endpoint)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MarkSafeError::engine(format!(
                "engine returned HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let reply: DispatchReply = resp
            .json()
            .await
            .map_err(|e| MarkSafeError::engine(format!("invalid engine reply: {e}")))?;
        tracing::debug!(
            "📨 Engine replied {:?} for {}",
            reply.status,
            request.backup_id.as_deref().unwrap_or("-")
        );
        Ok(reply)
    }
}
