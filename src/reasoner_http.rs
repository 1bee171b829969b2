//! HTTP client for the reasoning capability.
//!
//! POSTs `{"task": "...", "input": {...}}` and returns the response body
//! as JSON. Callers treat whatever comes back as untrusted and validate
//! it, so this client does no schema checking of its own.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use fedsearch_core::reasoning::{Reasoner, ReasoningTask};

use crate::config::ReasoningConfig;

pub struct HttpReasoner {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpReasoner {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, task: ReasoningTask, input: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({"task": task.as_str(), "input": input}))
            .send()
            .await
            .with_context(|| format!("Reasoning request to {} failed", self.endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Reasoning endpoint error ({}): {}", status, body);
        }

        resp.json()
            .await
            .context("Failed to parse reasoning response")
    }
}

/// The reasoner selected by `[reasoning]`, if any.
pub fn reasoner_from_config(config: &ReasoningConfig) -> Result<Option<Arc<dyn Reasoner>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => {
            let endpoint = config
                .endpoint
                .as_deref()
                .context("reasoning.endpoint must be specified when provider is 'http'")?;
            Ok(Some(Arc::new(HttpReasoner::new(endpoint, config.timeout_secs)?)))
        }
        other => bail!("Unknown reasoning provider: '{}'", other),
    }
}
