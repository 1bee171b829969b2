//! JSON-over-HTTP backend adapter.
//!
//! Each step is POSTed as JSON to the configured endpoint. The service
//! answers `{"results": [...]}` where every item carries at least an `id`.
//! Count and aggregate steps go to the same endpoint with `mode` set and
//! are answered with `{"total": n, "aggregates": [{"value", "count"}]}`.
//!
//! Failure mapping:
//!
//! | Condition                       | Error                |
//! |---------------------------------|----------------------|
//! | client timeout                  | `Timeout`            |
//! | 400 / 422                       | `InvalidStep`        |
//! | other non-2xx, connect, decode  | `SourceUnavailable`  |

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use fedsearch_core::capabilities::SourceCapabilities;
use fedsearch_core::error::BackendError;
use fedsearch_core::models::{AggregateGroup, MethodScores, SearchMode, SearchResult, SearchStep, Tally};

use crate::traits::Backend;

pub struct HttpBackend {
    caps: SourceCapabilities,
    endpoint: String,
    description: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<WireResult>,
}

#[derive(Deserialize)]
struct TallyResponse {
    #[serde(alias = "count")]
    total: u64,
    #[serde(default, alias = "groups")]
    aggregates: Vec<WireGroup>,
}

#[derive(Deserialize)]
struct WireGroup {
    #[serde(alias = "group_value")]
    value: serde_json::Value,
    count: u64,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
struct WireResult {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    provenance: Option<String>,
    #[serde(default)]
    scores: MethodScores,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl HttpBackend {
    pub fn new(caps: SourceCapabilities, endpoint: String, timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let description = format!("HTTP backend at {}", endpoint);
        Ok(Self {
            caps,
            endpoint,
            description,
            timeout,
            client,
        })
    }

    fn unavailable(&self, reason: impl Into<String>) -> BackendError {
        BackendError::SourceUnavailable {
            source_name: self.caps.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.caps.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capabilities(&self) -> &SourceCapabilities {
        &self.caps
    }

    async fn search(&self, step: &SearchStep) -> Result<Vec<SearchResult>, BackendError> {
        let body: SearchResponse = self.post(step).await?;
        Ok(body
            .results
            .into_iter()
            .map(|w| {
                let mut r = SearchResult::new(self.caps.name.as_str(), w.id, w.title);
                r.snippet = w.snippet;
                r.provenance = w.provenance;
                r.scores = w.scores;
                r.timestamp = w.timestamp;
                r.metadata = w.metadata;
                r
            })
            .collect())
    }

    async fn tally(&self, step: &SearchStep) -> Result<Tally, BackendError> {
        let body: TallyResponse = self.post(step).await?;
        match (step.mode, step.group_by.as_deref()) {
            (SearchMode::Aggregate, Some(field)) => {
                let mut groups: Vec<AggregateGroup> = body
                    .aggregates
                    .into_iter()
                    .map(|g| {
                        let value = match g.value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        AggregateGroup {
                            value,
                            count: g.count,
                            label: g.label,
                        }
                    })
                    .collect();
                groups.sort_by(|a, b| b.count.cmp(&a.count));
                groups.truncate(step.limit.max(1));
                Ok(Tally::aggregate(self.caps.name.as_str(), field, body.total, groups))
            }
            (SearchMode::Count, _) => Ok(Tally::count(self.caps.name.as_str(), body.total)),
            _ => Err(BackendError::InvalidStep {
                source_name: self.caps.name.clone(),
                reason: format!("cannot tally a {} step", step.mode),
            }),
        }
    }
}

impl HttpBackend {
    /// POST `step` and decode the body, mapping transport and status
    /// failures onto [`BackendError`].
    async fn post<T: DeserializeOwned>(&self, step: &SearchStep) -> Result<T, BackendError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(step)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout {
                        source_name: self.caps.name.clone(),
                        after_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    self.unavailable(format!("request failed: {}", e))
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::InvalidStep {
                source_name: self.caps.name.clone(),
                reason: format!("backend rejected step ({}): {}", status, body),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("HTTP {}: {}", status, body)));
        }

        resp.json()
            .await
            .map_err(|e| self.unavailable(format!("invalid response body: {}", e)))
    }
}
