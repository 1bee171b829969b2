//! Backend adapter contract and registry.
//!
//! A backend is anything that can answer a [`SearchStep`]: a mail index, a
//! chat archive, a browser history store, a web search API. The
//! orchestrator never looks inside one. It only needs the backend to
//! report its capabilities once at registration and to answer steps with
//! results or a typed [`BackendError`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              BackendRegistry               │
//! │  ┌──────────┐ ┌──────────┐ ┌────────────┐  │
//! │  │ Fixture  │ │  HTTP    │ │  Custom    │  │
//! │  │ (memory) │ │  (JSON)  │ │  (Rust)    │  │
//! │  └──────────┘ └──────────┘ └────────────┘  │
//! └──────────────┬─────────────────────────────┘
//!                ▼
//!     capability_registry() → planner / executor
//! ```
//!
//! Adding a backend means implementing [`Backend`] and calling
//! [`BackendRegistry::register`]; no central type changes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use fedsearch_core::capabilities::{CapabilityRegistry, SourceCapabilities};
use fedsearch_core::error::BackendError;
use fedsearch_core::models::{SearchResult, SearchStep, Tally};

use crate::config::{AdapterConfig, Config, FixtureItem};

// ═══════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════

/// A searchable source.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use fedsearch::traits::Backend;
/// use fedsearch_core::capabilities::SourceCapabilities;
/// use fedsearch_core::error::BackendError;
/// use fedsearch_core::models::{RetrievalMethod, SearchResult, SearchStep};
///
/// pub struct TicketBackend {
///     caps: SourceCapabilities,
/// }
///
/// #[async_trait]
/// impl Backend for TicketBackend {
///     fn name(&self) -> &str { "tickets" }
///     fn description(&self) -> &str { "Issue tracker" }
///     fn capabilities(&self) -> &SourceCapabilities { &self.caps }
///
///     async fn search(&self, step: &SearchStep) -> Result<Vec<SearchResult>, BackendError> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name; steps address the backend by it.
    fn name(&self) -> &str;

    /// One-line description for `fedsearch sources`.
    fn description(&self) -> &str;

    /// Methods and filters this backend accepts. Read once at
    /// registration.
    fn capabilities(&self) -> &SourceCapabilities;

    /// Answer one step.
    ///
    /// The executor has already validated the step against
    /// [`capabilities`](Backend::capabilities) and enforces the deadline,
    /// so implementations may take as long as they need. Zero results is
    /// `Ok(vec![])`, not an error.
    async fn search(&self, step: &SearchStep) -> Result<Vec<SearchResult>, BackendError>;

    /// Answer a count or aggregate step.
    ///
    /// Only called for modes the backend declares in its capabilities.
    /// Backends that declare none can keep this default.
    async fn tally(&self, step: &SearchStep) -> Result<Tally, BackendError> {
        Err(BackendError::InvalidStep {
            source_name: self.name().to_string(),
            reason: format!("mode '{}' not implemented", step.mode),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registered backends, in registration order.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Build every backend declared in `[[sources]]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::backend_fixture::FixtureBackend;
        use crate::backend_http::HttpBackend;

        let reference = config.orchestration.reference();
        let mut registry = Self::new();

        for source in &config.sources {
            let caps = source.capabilities.clone();
            match &source.adapter {
                AdapterConfig::Fixture {
                    items,
                    items_path,
                    latency_ms,
                    fail,
                } => {
                    let mut all = items.clone();
                    if let Some(path) = items_path {
                        all.extend(load_fixture_items(path)?);
                    }
                    let backend = FixtureBackend::new(caps, all, reference)
                        .with_latency_ms(*latency_ms)
                        .with_failure(*fail);
                    registry.register(Arc::new(backend));
                }
                AdapterConfig::Http {
                    endpoint,
                    timeout_secs,
                } => {
                    let backend = HttpBackend::new(caps, endpoint.clone(), *timeout_secs)?;
                    registry.register(Arc::new(backend));
                }
            }
        }

        Ok(registry)
    }

    /// Register a backend. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.retain(|b| b.name() != backend.name());
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Snapshot of every backend's capability descriptor.
    pub fn capability_registry(&self) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for backend in &self.backends {
            registry.register(backend.capabilities().clone());
        }
        registry
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}

fn load_fixture_items(path: &std::path::Path) -> Result<Vec<FixtureItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture items: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse fixture items: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_fixture::FixtureBackend;
    use chrono::NaiveDate;
    use fedsearch_core::models::RetrievalMethod::*;
    use fedsearch_core::models::SearchMode;

    fn fixture(name: &str) -> Arc<dyn Backend> {
        Arc::new(FixtureBackend::new(
            SourceCapabilities::new(name, &[Fulltext]),
            Vec::new(),
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
        ))
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = BackendRegistry::new();
        registry.register(fixture("notes"));
        registry.register(fixture("email"));
        registry.register(fixture("notes"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["email", "notes"]);
    }

    #[tokio::test]
    async fn tally_defaults_to_invalid_step() {
        struct SearchOnly(SourceCapabilities);

        #[async_trait]
        impl Backend for SearchOnly {
            fn name(&self) -> &str {
                &self.0.name
            }
            fn description(&self) -> &str {
                "search only"
            }
            fn capabilities(&self) -> &SourceCapabilities {
                &self.0
            }
            async fn search(&self, _step: &SearchStep) -> Result<Vec<SearchResult>, BackendError> {
                Ok(Vec::new())
            }
        }

        let backend = SearchOnly(SourceCapabilities::new("notes", &[Fulltext]));
        let step = SearchStep::new("notes", &[Fulltext], "").with_mode(SearchMode::Count, None);
        let err = backend.tally(&step).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_step");
        assert!(err.to_string().contains("count"), "{}", err);
    }

    #[test]
    fn capability_registry_mirrors_backends() {
        let mut registry = BackendRegistry::new();
        registry.register(fixture("notes"));
        let caps = registry.capability_registry();
        assert!(caps.contains("notes"));
        assert!(caps.capabilities("email").is_err());
    }

    #[test]
    fn from_config_reads_items_path() {
        let dir = tempfile::tempdir().unwrap();
        let items = dir.path().join("notes.json");
        std::fs::write(&items, r#"[{"id": "n1", "title": "Quarterly plan"}]"#).unwrap();
        let path = dir.path().join("fedsearch.toml");
        std::fs::write(
            &path,
            r#"
[[sources]]
name = "notes"
methods = ["fulltext"]

[sources.adapter]
type = "fixture"
items_path = "notes.json"
"#,
        )
        .unwrap();
        let config = crate::config::load_config(&path).unwrap();
        let registry = BackendRegistry::from_config(&config).unwrap();
        assert!(registry.find("notes").is_some());
    }

    #[test]
    fn from_config_reports_missing_items_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fedsearch.toml");
        std::fs::write(
            &path,
            r#"
[[sources]]
name = "notes"
methods = ["fulltext"]

[sources.adapter]
type = "fixture"
items_path = "missing.json"
"#,
        )
        .unwrap();
        let config = crate::config::load_config(&path).unwrap();
        let err = BackendRegistry::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("Failed to read fixture items"), "{}", err);
    }
}
