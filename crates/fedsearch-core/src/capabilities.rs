//! Backend capability registry.
//!
//! Every backend declares, once at registration time, which retrieval
//! methods it supports and which filter fields (with which operators) it
//! accepts. The planner and the executor both consult the registry before
//! accepting a step, so a step that names an unsupported method or filter
//! is rejected with [`SearchError::InvalidStep`] instead of being sent to a
//! backend that would silently ignore part of it.
//!
//! The registry is read-only once built and may be shared freely across
//! concurrent stages.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SearchError;
use crate::models::{FilterOperator, RetrievalMethod, SearchMode, SearchStep};

/// Broad kind of data a source holds. Drives source appropriateness in
/// ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Mail,
    Chat,
    Calendar,
    Tasks,
    BrowserHistory,
    Bookmarks,
    Web,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    #[default]
    Personal,
    Web,
}

/// A filterable field and the operators allowed on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    pub operators: BTreeSet<FilterOperator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityParser {
    /// Use the metadata value as-is.
    #[default]
    Plain,
    /// Parse `Name <address>` / `address` / `Name`.
    EmailFromHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTarget {
    Name,
    Address,
}

/// How to read the actor of a result from its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRule {
    pub metadata_key: String,
    #[serde(default)]
    pub parser: EntityParser,
    pub target: EntityTarget,
}

/// Capability descriptor for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCapabilities {
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub class: SourceClass,
    pub methods: BTreeSet<RetrievalMethod>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// When true, a step must carry a query or at least one filter.
    #[serde(default)]
    pub requires_query: bool,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default)]
    pub entity_rules: Vec<EntityRule>,
    /// Modes beyond plain search (`count`, `aggregate`).
    #[serde(default)]
    pub modes: BTreeSet<SearchMode>,
    /// Fields an aggregate step may group by.
    #[serde(default)]
    pub group_by: Vec<String>,
}

fn default_limit() -> usize {
    10
}

impl SourceCapabilities {
    pub fn new(name: impl Into<String>, methods: &[RetrievalMethod]) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Other,
            class: SourceClass::Personal,
            methods: methods.iter().copied().collect(),
            filters: Vec::new(),
            aliases: Vec::new(),
            requires_query: false,
            default_limit: default_limit(),
            entity_rules: Vec::new(),
            modes: BTreeSet::new(),
            group_by: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        if kind == SourceKind::Web {
            self.class = SourceClass::Web;
        }
        self
    }

    pub fn with_filter(mut self, field: &str, operators: &[FilterOperator]) -> Self {
        self.filters.push(FilterSpec {
            field: field.to_string(),
            operators: operators.iter().copied().collect(),
        });
        self
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases.extend(aliases.iter().map(|a| a.to_string()));
        self
    }

    pub fn with_entity_rule(mut self, metadata_key: &str, parser: EntityParser, target: EntityTarget) -> Self {
        self.entity_rules.push(EntityRule {
            metadata_key: metadata_key.to_string(),
            parser,
            target,
        });
        self
    }

    pub fn with_modes(mut self, modes: &[SearchMode]) -> Self {
        self.modes.extend(modes.iter().copied());
        self
    }

    pub fn with_group_by(mut self, fields: &[&str]) -> Self {
        self.group_by.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn requiring_query(mut self) -> Self {
        self.requires_query = true;
        self
    }

    pub fn supports_method(&self, method: RetrievalMethod) -> bool {
        self.methods.contains(&method)
    }

    /// Search is always supported; other modes must be declared.
    pub fn supports_mode(&self, mode: SearchMode) -> bool {
        mode.is_search() || self.modes.contains(&mode)
    }

    pub fn supports_group_by(&self, field: &str) -> bool {
        self.group_by.iter().any(|f| f == field)
    }

    /// The grouping field for an aggregate step: `requested` when declared,
    /// otherwise the first declared field.
    pub fn pick_group_by(&self, requested: Option<&str>) -> Option<&str> {
        requested
            .and_then(|r| self.group_by.iter().find(|f| f.as_str() == r))
            .or_else(|| self.group_by.first())
            .map(String::as_str)
    }

    pub fn filter_spec(&self, field: &str) -> Option<&FilterSpec> {
        self.filters.iter().find(|f| f.field == field)
    }

    pub fn supports_field(&self, field: &str) -> bool {
        self.filter_spec(field).is_some()
    }

    pub fn supports_filter(&self, field: &str, operator: FilterOperator) -> bool {
        self.filter_spec(field)
            .map(|spec| spec.operators.contains(&operator))
            .unwrap_or(false)
    }

    /// First field from `candidates` the source declares, with the operator
    /// to use on it (`contains` preferred over `eq`).
    pub fn pick_field(&self, candidates: &[&str]) -> Option<(String, FilterOperator)> {
        candidates.iter().find_map(|field| {
            let spec = self.filter_spec(field)?;
            [FilterOperator::Contains, FilterOperator::Eq]
                .into_iter()
                .find(|op| spec.operators.contains(op))
                .map(|op| (spec.field.clone(), op))
        })
    }

    /// True when the source can take a free-text query.
    pub fn accepts_text_query(&self) -> bool {
        self.supports_method(RetrievalMethod::Fulltext) || self.supports_method(RetrievalMethod::Vector)
    }

    /// Lowercase names a user might use for this source: the name itself,
    /// its words, the declared aliases.
    pub fn alias_set(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let name = self.name.to_lowercase();
        out.insert(name.replace('_', " "));
        for token in name.split(|c: char| !c.is_ascii_alphanumeric()) {
            if token.len() >= 3 {
                out.insert(token.to_string());
            }
        }
        out.insert(name);
        for alias in &self.aliases {
            let alias = alias.trim().to_lowercase();
            if !alias.is_empty() {
                out.insert(alias);
            }
        }
        out
    }
}

/// Registry of capability descriptors, keyed by source name.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    sources: BTreeMap<String, SourceCapabilities>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a source's capabilities.
    pub fn register(&mut self, caps: SourceCapabilities) {
        tracing::debug!(
            source = %caps.name,
            methods = ?caps.methods,
            filters = caps.filters.len(),
            "registered capabilities"
        );
        self.sources.insert(caps.name.clone(), caps);
    }

    /// Look up a source's capabilities.
    pub fn capabilities(&self, source: &str) -> Result<&SourceCapabilities, SearchError> {
        self.sources
            .get(source)
            .ok_or_else(|| SearchError::UnknownSource(source.to_string()))
    }

    pub fn get(&self, source: &str) -> Option<&SourceCapabilities> {
        self.sources.get(source)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    /// Registered source names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceCapabilities> {
        self.sources.values()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Map a free-form source mention (`"gmail"`, `"browser history"`) to a
    /// registered name.
    pub fn resolve_name(&self, mention: &str) -> Option<String> {
        let needle = mention.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        if self.sources.contains_key(&needle) {
            return Some(needle);
        }
        self.sources
            .values()
            .find(|caps| caps.alias_set().contains(&needle))
            .map(|caps| caps.name.clone())
    }

    /// Check a step against its source's declared capabilities.
    pub fn validate_step(&self, step: &SearchStep) -> Result<(), SearchError> {
        let caps = self.capabilities(&step.source)?;

        if step.methods.is_empty() {
            return Err(SearchError::invalid_step(&step.source, "no retrieval methods"));
        }
        for method in &step.methods {
            if !caps.supports_method(*method) {
                return Err(SearchError::invalid_step(
                    &step.source,
                    format!("method '{}' not supported", method),
                ));
            }
        }
        for filter in &step.filters {
            let spec = caps.filter_spec(&filter.field).ok_or_else(|| {
                SearchError::invalid_step(
                    &step.source,
                    format!("filter field '{}' not declared", filter.field),
                )
            })?;
            if !spec.operators.contains(&filter.operator) {
                return Err(SearchError::invalid_step(
                    &step.source,
                    format!(
                        "operator '{}' not allowed on field '{}'",
                        filter.operator.as_str(),
                        filter.field
                    ),
                ));
            }
        }
        if !caps.supports_mode(step.mode) {
            return Err(SearchError::invalid_step(
                &step.source,
                format!("mode '{}' not supported", step.mode),
            ));
        }
        match (step.mode, step.group_by.as_deref()) {
            (SearchMode::Aggregate, None) => {
                return Err(SearchError::invalid_step(&step.source, "aggregate step without group_by"));
            }
            (SearchMode::Aggregate, Some(field)) if !caps.supports_group_by(field) => {
                return Err(SearchError::invalid_step(
                    &step.source,
                    format!("group_by field '{}' not declared", field),
                ));
            }
            (SearchMode::Search | SearchMode::Count, Some(_)) => {
                return Err(SearchError::invalid_step(
                    &step.source,
                    "group_by only applies to aggregate steps",
                ));
            }
            _ => {}
        }
        if step.query.trim().is_empty() && step.filters.is_empty() && caps.requires_query {
            return Err(SearchError::invalid_step(
                &step.source,
                "empty query without filters",
            ));
        }
        if step.limit == 0 {
            return Err(SearchError::invalid_step(&step.source, "limit must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterClause;
    use FilterOperator::*;
    use RetrievalMethod::*;

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register(
            SourceCapabilities::new("email", &[Structured, Fulltext, Vector])
                .with_kind(SourceKind::Mail)
                .with_filter("from_name", &[Contains, Eq])
                .with_filter("date_after", &[Gte])
                .with_aliases(&["mail", "gmail", "inbox"]),
        );
        reg.register(
            SourceCapabilities::new("browser_history", &[Structured, Vector])
                .with_kind(SourceKind::BrowserHistory)
                .with_filter("time_range", &[Eq])
                .requiring_query(),
        );
        reg
    }

    #[test]
    fn test_unknown_source_is_reported() {
        let reg = registry();
        let err = reg.capabilities("slack").unwrap_err();
        assert_eq!(err, SearchError::UnknownSource("slack".to_string()));
    }

    #[test]
    fn test_valid_step_passes() {
        let reg = registry();
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("from_name", Contains, "Alex"));
        assert!(reg.validate_step(&step).is_ok());
    }

    #[test]
    fn test_undeclared_filter_field_is_rejected() {
        let reg = registry();
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("label", Eq, "inbox"));
        match reg.validate_step(&step) {
            Err(SearchError::InvalidStep { source_name, reason }) => {
                assert_eq!(source_name, "email");
                assert!(reason.contains("label"));
            }
            other => panic!("expected InvalidStep, got {:?}", other),
        }
    }

    #[test]
    fn test_disallowed_operator_is_rejected() {
        let reg = registry();
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("date_after", Lte, "2026-01-01"));
        assert!(matches!(
            reg.validate_step(&step),
            Err(SearchError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_unsupported_method_is_rejected() {
        let reg = registry();
        let step = SearchStep::new("browser_history", &[Fulltext], "rust");
        assert!(reg.validate_step(&step).is_err());
    }

    #[test]
    fn test_empty_query_rule() {
        let reg = registry();
        let bare = SearchStep::new("browser_history", &[Structured], "");
        assert!(reg.validate_step(&bare).is_err());

        let filtered = SearchStep::new("browser_history", &[Structured], "")
            .with_filter(FilterClause::new("time_range", Eq, "7d"));
        assert!(reg.validate_step(&filtered).is_ok());

        // email does not require a query
        let email = SearchStep::new("email", &[Structured], "");
        assert!(reg.validate_step(&email).is_ok());
    }

    #[test]
    fn test_modes_must_be_declared() {
        let mut reg = registry();
        let count = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("date_after", Gte, "2026-10-01"))
            .with_mode(SearchMode::Count, None);
        assert!(reg.validate_step(&count).is_err());

        reg.register(
            SourceCapabilities::new("email", &[Structured])
                .with_filter("date_after", &[Gte])
                .with_modes(&[SearchMode::Count, SearchMode::Aggregate])
                .with_group_by(&["from_email"]),
        );
        assert!(reg.validate_step(&count).is_ok());

        let grouped = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("date_after", Gte, "2026-10-01"))
            .with_mode(SearchMode::Aggregate, Some("from_email"));
        assert!(reg.validate_step(&grouped).is_ok());

        let bad_field = grouped.clone().with_mode(SearchMode::Aggregate, Some("label"));
        match reg.validate_step(&bad_field) {
            Err(SearchError::InvalidStep { reason, .. }) => assert!(reason.contains("label")),
            other => panic!("expected InvalidStep, got {:?}", other),
        }
        assert!(reg.validate_step(&grouped.clone().with_mode(SearchMode::Aggregate, None)).is_err());
        assert!(reg.validate_step(&grouped.with_mode(SearchMode::Count, Some("from_email"))).is_err());
    }

    #[test]
    fn test_pick_group_by_falls_back_to_first_declared() {
        let caps = SourceCapabilities::new("chat", &[Structured]).with_group_by(&["sender", "chat_id"]);
        assert_eq!(caps.pick_group_by(Some("chat_id")), Some("chat_id"));
        assert_eq!(caps.pick_group_by(Some("label")), Some("sender"));
        assert_eq!(caps.pick_group_by(None), Some("sender"));
        assert_eq!(SourceCapabilities::new("x", &[Structured]).pick_group_by(None), None);
    }

    #[test]
    fn test_resolve_name_through_aliases() {
        let reg = registry();
        assert_eq!(reg.resolve_name("Gmail"), Some("email".to_string()));
        assert_eq!(reg.resolve_name("browser history"), Some("browser_history".to_string()));
        assert_eq!(reg.resolve_name("history"), Some("browser_history".to_string()));
        assert_eq!(reg.resolve_name("slack"), None);
    }

    #[test]
    fn test_pick_field_prefers_contains() {
        let reg = registry();
        let caps = reg.get("email").unwrap();
        assert_eq!(
            caps.pick_field(&["from_email", "from_name"]),
            Some(("from_name".to_string(), Contains))
        );
        assert_eq!(caps.pick_field(&["participant"]), None);
    }
}
