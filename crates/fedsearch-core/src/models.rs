//! Core data types that flow through a search turn.
//!
//! [`Intent`] and the plan types are created fresh per user turn and
//! discarded afterwards. [`SearchResult`] lists live only while a turn is
//! ranking and refining.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the user is trying to achieve with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    FindInformation,
    FindPerson,
    FindEvent,
    CheckStatus,
    GetUpdate,
    Compare,
    Recall,
    Verify,
}

impl Goal {
    pub const ALL: [Goal; 8] = [
        Goal::FindInformation,
        Goal::FindPerson,
        Goal::FindEvent,
        Goal::CheckStatus,
        Goal::GetUpdate,
        Goal::Compare,
        Goal::Recall,
        Goal::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::FindInformation => "find_information",
            Goal::FindPerson => "find_person",
            Goal::FindEvent => "find_event",
            Goal::CheckStatus => "check_status",
            Goal::GetUpdate => "get_update",
            Goal::Compare => "compare",
            Goal::Recall => "recall",
            Goal::Verify => "verify",
        }
    }

    /// Parse a goal label, tolerating case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Goal> {
        let needle = raw.trim().to_ascii_lowercase();
        Goal::ALL.into_iter().find(|g| g.as_str() == needle)
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part an entity plays in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Sender,
    Recipient,
    Participant,
    Organization,
    Topic,
    Other,
}

impl EntityRole {
    pub fn parse(raw: &str) -> EntityRole {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sender" | "from" | "author" => EntityRole::Sender,
            "recipient" | "to" => EntityRole::Recipient,
            "participant" | "attendee" | "contact" | "person" => EntityRole::Participant,
            "organization" | "org" | "company" | "domain" => EntityRole::Organization,
            "topic" | "subject" => EntityRole::Topic,
            _ => EntityRole::Other,
        }
    }
}

/// A named thing the request refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub role: EntityRole,
    /// Identifying attribute such as an email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, role: EntityRole) -> Self {
        Self {
            name: name.into(),
            role,
            attribute: None,
        }
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    MultiHop,
}

/// One hop of a multi-hop retrieval plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopDescriptor {
    pub sources: Vec<String>,
    pub goal: String,
    #[serde(default)]
    pub entity_from_previous: bool,
}

impl HopDescriptor {
    pub fn new(sources: &[&str], goal: impl Into<String>) -> Self {
        Self {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            goal: goal.into(),
            entity_from_previous: false,
        }
    }

    pub fn from_previous(mut self) -> Self {
        self.entity_from_previous = true;
        self
    }
}

/// Retrieval method a backend can apply to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Structured,
    Fulltext,
    Vector,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMethod::Structured => "structured",
            RetrievalMethod::Fulltext => "fulltext",
            RetrievalMethod::Vector => "vector",
        }
    }

    pub fn parse(raw: &str) -> Option<RetrievalMethod> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "structured" => Some(RetrievalMethod::Structured),
            "fulltext" | "keyword" => Some(RetrievalMethod::Fulltext),
            "vector" | "semantic" => Some(RetrievalMethod::Vector),
            _ => None,
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step asks the backend for: matching items, how many items
/// match, or the top groups of matching items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Search,
    Count,
    Aggregate,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Search => "search",
            SearchMode::Count => "count",
            SearchMode::Aggregate => "aggregate",
        }
    }

    pub fn parse(raw: &str) -> Option<SearchMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "search" => Some(SearchMode::Search),
            "count" => Some(SearchMode::Count),
            "aggregate" | "group" | "group_by" => Some(SearchMode::Aggregate),
            _ => None,
        }
    }

    pub fn is_search(&self) -> bool {
        *self == SearchMode::Search
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured interpretation of a conversational request.
///
/// Invariant: when `complexity` is [`Complexity::MultiHop`] the
/// `retrieval_plan` is non-empty and its first hop never sets
/// `entity_from_previous`. [`crate::intent::validate_intent`] enforces this
/// for anything coming from the reasoning capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub goal: Goal,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub temporal: Option<String>,
    /// Registered backend names, unique, in order of relevance.
    #[serde(default)]
    pub source_hints: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub retrieval_plan: Vec<HopDescriptor>,
    #[serde(default)]
    pub retrieval_hints: BTreeSet<RetrievalMethod>,
    #[serde(default)]
    pub ambiguities: Vec<String>,
    /// Topical terms left after temporal, scope, and source words are
    /// removed. Empty for purely temporal requests.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub mode: SearchMode,
    /// Requested grouping field for [`SearchMode::Aggregate`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    /// Requested number of groups for [`SearchMode::Aggregate`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
}

impl Intent {
    pub fn new(goal: Goal) -> Self {
        Self {
            goal,
            entities: Vec::new(),
            temporal: None,
            source_hints: Vec::new(),
            complexity: Complexity::Simple,
            retrieval_plan: Vec::new(),
            retrieval_hints: BTreeSet::new(),
            ambiguities: Vec::new(),
            keywords: Vec::new(),
            mode: SearchMode::Search,
            group_by: None,
            top_n: None,
        }
    }

    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.source_hints = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_temporal(mut self, phrase: impl Into<String>) -> Self {
        self.temporal = Some(phrase.into());
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_plan(mut self, hops: Vec<HopDescriptor>) -> Self {
        self.complexity = Complexity::MultiHop;
        self.retrieval_plan = hops;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_multi_hop(&self) -> bool {
        self.complexity == Complexity::MultiHop && !self.retrieval_plan.is_empty()
    }

    /// The topical query string, or empty when no topical terms exist.
    pub fn query_text(&self) -> String {
        self.keywords.join(" ")
    }
}

/// Comparison applied by a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Contains,
    Gte,
    Lte,
    In,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Contains => "contains",
            FilterOperator::Gte => "gte",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
        }
    }
}

/// Filter fields that carry temporal scope rather than topical content.
pub const TEMPORAL_FIELDS: [&str; 3] = ["time_range", "date_after", "date_before"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub operator: FilterOperator,
    pub value: String,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn is_temporal(&self) -> bool {
        TEMPORAL_FIELDS.contains(&self.field.as_str())
    }
}

impl fmt::Display for FilterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator.as_str(), self.value)
    }
}

/// A single query against one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStep {
    pub source: String,
    pub methods: BTreeSet<RetrievalMethod>,
    /// Topical query. May be empty when filters are present or the source
    /// needs no query.
    pub query: String,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    /// Caps results, or groups in aggregate mode.
    pub limit: usize,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    /// Why this step exists (`filters`, `keyword`, `vector`, `bound`,
    /// `widen`, ...). Informational only.
    #[serde(default)]
    pub label: String,
}

impl SearchStep {
    pub fn new(source: impl Into<String>, methods: &[RetrievalMethod], query: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            methods: methods.iter().copied().collect(),
            query: query.into(),
            filters: Vec::new(),
            limit: 10,
            mode: SearchMode::Search,
            group_by: None,
            label: String::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterClause) -> Self {
        self.filters.push(filter);
        self
    }

    /// Switch to `mode`. `group_by` only applies to aggregate steps.
    pub fn with_mode(mut self, mode: SearchMode, group_by: Option<&str>) -> Self {
        self.mode = mode;
        self.group_by = group_by.map(str::to_string);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn has_temporal_filter(&self) -> bool {
        self.filters.iter().any(|f| f.is_temporal())
    }

    /// Identity used to avoid reissuing a step unchanged.
    pub fn dedupe_key(&self) -> StepKey {
        let mut filters: Vec<(String, FilterOperator, String)> = self
            .filters
            .iter()
            .map(|f| (f.field.clone(), f.operator, f.value.trim().to_lowercase()))
            .collect();
        filters.sort();
        filters.dedup();
        StepKey {
            source: self.source.clone(),
            query: normalize_query(&self.query),
            filters,
            mode: self.mode,
            group_by: self.group_by.clone(),
        }
    }
}

impl fmt::Display for SearchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.methods.iter().map(|m| m.as_str()).collect();
        write!(f, "{}[{}] q={:?}", self.source, methods.join(","), self.query)?;
        for filter in &self.filters {
            write!(f, " {}", filter)?;
        }
        match (&self.mode, &self.group_by) {
            (SearchMode::Search, _) => Ok(()),
            (mode, Some(field)) => write!(f, " mode={} by {}", mode, field),
            (mode, None) => write!(f, " mode={}", mode),
        }
    }
}

/// Normalized identity of a [`SearchStep`]: source, lowercase
/// whitespace-collapsed query, and the sorted filter set. Count and
/// aggregate steps also key on their mode and grouping field.
///
/// Retrieval methods are not part of the key; the refiner tracks them per
/// key instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    pub source: String,
    pub query: String,
    pub filters: Vec<(String, FilterOperator, String)>,
    pub mode: SearchMode,
    pub group_by: Option<String>,
}

pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where a step sits in a turn: refinement round (0 = initial plan),
/// stage, and position within the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId {
    pub round: usize,
    pub stage: usize,
    pub index: usize,
}

impl StepId {
    pub fn new(round: usize, stage: usize, index: usize) -> Self {
        Self { round, stage, index }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.s{}.{}", self.round, self.stage, self.index)
    }
}

/// Per-method match scores, each optional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulltext: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<f64>,
}

impl MethodScores {
    pub fn get(&self, method: RetrievalMethod) -> Option<f64> {
        match method {
            RetrievalMethod::Structured => self.structured,
            RetrievalMethod::Fulltext => self.fulltext,
            RetrievalMethod::Vector => self.vector,
        }
    }

    pub fn set(&mut self, method: RetrievalMethod, score: f64) {
        match method {
            RetrievalMethod::Structured => self.structured = Some(score),
            RetrievalMethod::Fulltext => self.fulltext = Some(score),
            RetrievalMethod::Vector => self.vector = Some(score),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RetrievalMethod, f64)> + '_ {
        [
            RetrievalMethod::Structured,
            RetrievalMethod::Fulltext,
            RetrievalMethod::Vector,
        ]
        .into_iter()
        .filter_map(|m| self.get(m).map(|s| (m, s)))
    }

    /// Keep the higher score per method.
    pub fn merge_max(&mut self, other: &MethodScores) {
        for (method, score) in other.iter() {
            match self.get(method) {
                Some(existing) if existing >= score => {}
                _ => self.set(method, score),
            }
        }
    }

    /// True when a structured or fulltext score is present.
    pub fn has_exact_match(&self) -> bool {
        self.structured.is_some() || self.fulltext.is_some()
    }

    pub fn is_vector_only(&self) -> bool {
        self.vector.is_some() && !self.has_exact_match()
    }
}

/// A result returned by a backend. Identity is `(source, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub source: String,
    /// Opaque, source-scoped identifier.
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(default)]
    pub scores: MethodScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Steps that produced this result. Filled in by the executor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<StepId>,
}

impl SearchResult {
    pub fn new(source: impl Into<String>, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
            title: title.into(),
            snippet: String::new(),
            provenance: None,
            scores: MethodScores::default(),
            timestamp: None,
            metadata: BTreeMap::new(),
            origins: Vec::new(),
        }
    }

    pub fn identity(&self) -> (&str, &str) {
        (&self.source, &self.id)
    }

    /// The earliest refinement round this result was seen in.
    pub fn first_round(&self) -> usize {
        self.origins.iter().map(|o| o.round).min().unwrap_or(0)
    }

    /// A metadata value rendered as text, if present.
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// One group of an aggregate answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateGroup {
    /// Value of the grouping field.
    pub value: String,
    pub count: u64,
    /// Display form of `value`, e.g. a contact name for a chat id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AggregateGroup {
    pub fn new(value: impl Into<String>, count: u64) -> Self {
        Self {
            value: value.into(),
            count,
            label: None,
        }
    }

    pub fn display(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.value)
    }
}

/// Answer to a count or aggregate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub source: String,
    pub mode: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    /// Items matching the step.
    pub total: u64,
    /// Largest groups first. Empty for count steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<AggregateGroup>,
    /// Step that produced the tally. Filled in by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<StepId>,
}

impl Tally {
    pub fn count(source: impl Into<String>, total: u64) -> Self {
        Self {
            source: source.into(),
            mode: SearchMode::Count,
            group_by: None,
            total,
            groups: Vec::new(),
            origin: None,
        }
    }

    pub fn aggregate(source: impl Into<String>, group_by: impl Into<String>, total: u64, groups: Vec<AggregateGroup>) -> Self {
        Self {
            source: source.into(),
            mode: SearchMode::Aggregate,
            group_by: Some(group_by.into()),
            total,
            groups,
            origin: None,
        }
    }

    /// The largest group, if any.
    pub fn top_group(&self) -> Option<&AggregateGroup> {
        self.groups.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_parse_is_lenient_about_case() {
        assert_eq!(Goal::parse(" Find_Person "), Some(Goal::FindPerson));
        assert_eq!(Goal::parse("summarize"), None);
    }

    #[test]
    fn test_goal_serde_uses_snake_case() {
        let json = serde_json::to_string(&Goal::CheckStatus).unwrap();
        assert_eq!(json, "\"check_status\"");
    }

    #[test]
    fn test_dedupe_key_ignores_case_whitespace_and_filter_order() {
        let a = SearchStep::new("email", &[RetrievalMethod::Fulltext], "  Quarterly   Report ")
            .with_filter(FilterClause::new("from_name", FilterOperator::Contains, "Alex"))
            .with_filter(FilterClause::new("date_after", FilterOperator::Gte, "2026-01-01"));
        let b = SearchStep::new("email", &[RetrievalMethod::Vector], "quarterly report")
            .with_filter(FilterClause::new("date_after", FilterOperator::Gte, "2026-01-01"))
            .with_filter(FilterClause::new("from_name", FilterOperator::Contains, "alex"));
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn test_dedupe_key_separates_count_from_search() {
        let search = SearchStep::new("email", &[RetrievalMethod::Structured], "")
            .with_filter(FilterClause::new("date_after", FilterOperator::Gte, "2026-10-01"));
        let count = search.clone().with_mode(SearchMode::Count, None);
        assert_ne!(search.dedupe_key(), count.dedupe_key());
        assert_eq!(count.to_string(), "email[structured] q=\"\" date_after gte 2026-10-01 mode=count");
    }

    #[test]
    fn test_search_mode_parse_and_default() {
        assert_eq!(SearchMode::parse(" Aggregate "), Some(SearchMode::Aggregate));
        assert_eq!(SearchMode::parse("sum"), None);
        let step: SearchStep = serde_json::from_value(serde_json::json!({
            "source": "email", "methods": ["fulltext"], "query": "x", "limit": 5
        }))
        .unwrap();
        assert_eq!(step.mode, SearchMode::Search);
        assert!(step.group_by.is_none());
    }

    #[test]
    fn test_dedupe_key_differs_by_source() {
        let a = SearchStep::new("email", &[RetrievalMethod::Fulltext], "report");
        let b = SearchStep::new("tasks", &[RetrievalMethod::Fulltext], "report");
        assert_ne!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn test_method_scores_merge_keeps_max() {
        let mut a = MethodScores {
            vector: Some(0.4),
            ..Default::default()
        };
        let b = MethodScores {
            vector: Some(0.7),
            fulltext: Some(0.2),
            ..Default::default()
        };
        a.merge_max(&b);
        assert_eq!(a.vector, Some(0.7));
        assert_eq!(a.fulltext, Some(0.2));
        assert!(a.has_exact_match());
    }

    #[test]
    fn test_vector_only_detection() {
        let scores = MethodScores {
            vector: Some(0.9),
            ..Default::default()
        };
        assert!(scores.is_vector_only());
        assert!(!MethodScores::default().is_vector_only());
    }

    #[test]
    fn test_result_deserializes_with_defaults() {
        let r: SearchResult = serde_json::from_value(serde_json::json!({
            "source": "email",
            "id": "m1",
            "scores": { "vector": 0.5 },
            "timestamp": "2026-10-01T09:00:00Z"
        }))
        .unwrap();
        assert_eq!(r.identity(), ("email", "m1"));
        assert_eq!(r.scores.vector, Some(0.5));
        assert!(r.timestamp.is_some());
        assert_eq!(r.first_round(), 0);
    }

    #[test]
    fn test_first_round_is_min_origin_round() {
        let mut r = SearchResult::new("email", "m1", "t");
        r.origins = vec![StepId::new(2, 0, 1), StepId::new(1, 0, 0)];
        assert_eq!(r.first_round(), 1);
    }
}
