//! TOML configuration.
//!
//! A config file declares the orchestration knobs, the optional reasoning
//! capability, logging, and one `[[sources]]` entry per backend. Each
//! source entry is a capability descriptor plus an `adapter` table saying
//! how to reach it:
//!
//! ```toml
//! [orchestration]
//! step_timeout_ms = 8000
//! reference_date = "2026-10-18"
//!
//! [[sources]]
//! name = "email"
//! kind = "mail"
//! methods = ["structured", "fulltext", "vector"]
//! aliases = ["mail", "inbox"]
//! modes = ["count", "aggregate"]
//! group_by = ["from_email"]
//!
//! [[sources.filters]]
//! field = "from_email"
//! operators = ["eq"]
//!
//! [sources.adapter]
//! type = "http"
//! endpoint = "http://127.0.0.1:7700/search/email"
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use fedsearch_core::capabilities::SourceCapabilities;
use fedsearch_core::models::SearchMode;
use fedsearch_core::refine::RefinementPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrchestrationConfig {
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    /// Values above the hard cap of 2 are clamped.
    #[serde(default = "default_max_refinement_rounds")]
    pub max_refinement_rounds: usize,
    #[serde(default = "default_max_refinement_steps")]
    pub max_refinement_steps: usize,
    #[serde(default = "default_resolution_top_n")]
    pub resolution_top_n: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_min_satisfying_results")]
    pub min_satisfying_results: usize,
    #[serde(default = "default_saturation_threshold")]
    pub saturation_threshold: usize,
    /// Mean best score under which a source's results are retried with
    /// other retrieval methods.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// "Today" for temporal filters. Defaults to the local date.
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
    #[serde(default)]
    pub rerank_with_reasoning: bool,
}

fn default_step_timeout_ms() -> u64 {
    8000
}
fn default_turn_timeout_ms() -> u64 {
    30_000
}
fn default_max_refinement_rounds() -> usize {
    2
}
fn default_max_refinement_steps() -> usize {
    4
}
fn default_resolution_top_n() -> usize {
    10
}
fn default_final_limit() -> usize {
    20
}
fn default_min_satisfying_results() -> usize {
    3
}
fn default_saturation_threshold() -> usize {
    10
}
fn default_min_confidence() -> f64 {
    0.7
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
            max_refinement_rounds: default_max_refinement_rounds(),
            max_refinement_steps: default_max_refinement_steps(),
            resolution_top_n: default_resolution_top_n(),
            final_limit: default_final_limit(),
            min_satisfying_results: default_min_satisfying_results(),
            saturation_threshold: default_saturation_threshold(),
            min_confidence: default_min_confidence(),
            reference_date: None,
            rerank_with_reasoning: false,
        }
    }
}

impl OrchestrationConfig {
    pub fn refinement_policy(&self) -> RefinementPolicy {
        RefinementPolicy {
            max_rounds: self.max_refinement_rounds,
            max_steps_per_round: self.max_refinement_steps,
            min_satisfying_results: self.min_satisfying_results,
            saturation_threshold: self.saturation_threshold,
            min_confidence: self.min_confidence,
        }
    }

    /// The configured reference date, or today.
    pub fn reference(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_ms == 0 {
            anyhow::bail!("orchestration.step_timeout_ms must be > 0");
        }
        if self.turn_timeout_ms == 0 {
            anyhow::bail!("orchestration.turn_timeout_ms must be > 0");
        }
        if !(1..=50).contains(&self.resolution_top_n) {
            anyhow::bail!("orchestration.resolution_top_n must be in [1, 50]");
        }
        if self.final_limit == 0 {
            anyhow::bail!("orchestration.final_limit must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("orchestration.min_confidence must be in [0, 1]");
        }
        if self.max_refinement_steps == 0 && self.max_refinement_rounds > 0 {
            anyhow::bail!("orchestration.max_refinement_steps must be >= 1 when refinement is enabled");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_reasoning_timeout() -> u64 {
    30
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            timeout_secs: default_reasoning_timeout(),
        }
    }
}

impl ReasoningConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// One backend: what it can do, and how to reach it.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub capabilities: SourceCapabilities,
    pub adapter: AdapterConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Never answers; the step deadline fires.
    Timeout,
    /// Answers with `SourceUnavailable` straight away.
    Unavailable,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// In-memory items, inline or from a JSON file.
    Fixture {
        #[serde(default)]
        items: Vec<FixtureItem>,
        #[serde(default)]
        items_path: Option<PathBuf>,
        #[serde(default)]
        latency_ms: u64,
        #[serde(default)]
        fail: Option<FailureMode>,
    },
    /// JSON over HTTP: the step is POSTed, `{"results": [...]}` comes back.
    Http {
        endpoint: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    10
}

/// A canned item served by a fixture backend.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FixtureItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub provenance: Option<String>,
    /// RFC 3339, quoted in TOML.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Checks shared by the main config and benchmark documents.
pub fn validate_sources<'a>(sources: impl IntoIterator<Item = &'a SourceCapabilities>) -> Result<()> {
    let mut seen = HashSet::new();
    let mut count = 0;
    for caps in sources {
        count += 1;
        if caps.name.trim().is_empty() {
            anyhow::bail!("sources[{}].name must not be empty", count - 1);
        }
        if !seen.insert(caps.name.clone()) {
            anyhow::bail!("Duplicate source name: '{}'", caps.name);
        }
        if caps.methods.is_empty() {
            anyhow::bail!("Source '{}' must declare at least one method", caps.name);
        }
        for filter in &caps.filters {
            if filter.operators.is_empty() {
                anyhow::bail!(
                    "Source '{}' filter '{}' must declare at least one operator",
                    caps.name,
                    filter.field
                );
            }
        }
        if caps.default_limit == 0 {
            anyhow::bail!("Source '{}' default_limit must be >= 1", caps.name);
        }
        if caps.supports_mode(SearchMode::Aggregate) && caps.group_by.is_empty() {
            anyhow::bail!(
                "Source '{}' declares the aggregate mode but no group_by fields",
                caps.name
            );
        }
    }
    if count == 0 {
        anyhow::bail!("At least one [[sources]] entry is required");
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.orchestration.validate()?;
    validate_sources(config.sources.iter().map(|s| &s.capabilities))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for source in &mut config.sources {
        match &mut source.adapter {
            AdapterConfig::Http {
                endpoint,
                timeout_secs,
            } => {
                if endpoint.trim().is_empty() {
                    anyhow::bail!(
                        "Source '{}' uses an http adapter but has no endpoint",
                        source.capabilities.name
                    );
                }
                if *timeout_secs == 0 {
                    anyhow::bail!(
                        "Source '{}' adapter.timeout_secs must be > 0",
                        source.capabilities.name
                    );
                }
            }
            AdapterConfig::Fixture { items_path, .. } => {
                if let Some(p) = items_path {
                    if p.is_relative() {
                        *p = base.join(&*p);
                    }
                }
            }
        }
    }

    match config.reasoning.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.reasoning.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
                anyhow::bail!("reasoning.endpoint must be specified when provider is 'http'");
            }
            if config.reasoning.timeout_secs == 0 {
                anyhow::bail!("reasoning.timeout_secs must be > 0");
            }
        }
        other => anyhow::bail!(
            "Unknown reasoning provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging format: '{}'. Must be text or json.", other),
    }

    Ok(config)
}
