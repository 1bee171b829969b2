//! In-memory backend.
//!
//! Serves a fixed item list and honours the parts of a step a real index
//! would: filters narrow the candidates, each requested method scores
//! them, and the best scores come back first. Latency and failure can be
//! simulated so the executor's deadline and isolation paths can be
//! exercised without a network.
//!
//! Scoring is deliberately simple:
//!
//! - `structured`: 1.0 for any item passing a non-empty filter set.
//! - `fulltext`: fraction of query terms found verbatim.
//! - `vector`: fraction of query terms sharing a four-letter prefix with
//!   some word of the item, mapped into `0.3..=0.9`.
//!
//! Count and aggregate steps match items the same way but ignore the limit
//! when totalling. Aggregate groups are keyed by the metadata field named
//! in `group_by`, largest first, ties by value.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

use fedsearch_core::capabilities::SourceCapabilities;
use fedsearch_core::error::BackendError;
use fedsearch_core::models::{
    AggregateGroup, FilterClause, FilterOperator, RetrievalMethod, SearchMode, SearchResult, SearchStep, Tally,
};
use fedsearch_core::temporal::window_days;

use crate::config::{FailureMode, FixtureItem};
use crate::traits::Backend;

const PREFIX_LEN: usize = 4;

pub struct FixtureBackend {
    caps: SourceCapabilities,
    description: String,
    items: Vec<FixtureItem>,
    reference: NaiveDate,
    latency_ms: u64,
    failure: Option<FailureMode>,
}

impl FixtureBackend {
    pub fn new(caps: SourceCapabilities, items: Vec<FixtureItem>, reference: NaiveDate) -> Self {
        let description = format!("In-memory fixture ({} items)", items.len());
        Self {
            caps,
            description,
            items,
            reference,
            latency_ms: 0,
            failure: None,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_failure(mut self, failure: Option<FailureMode>) -> Self {
        self.failure = failure;
        self
    }

    fn to_result(&self, item: &FixtureItem) -> SearchResult {
        let mut r = SearchResult::new(self.caps.name.as_str(), item.id.as_str(), item.title.as_str());
        r.snippet = item.snippet.clone();
        r.provenance = item.provenance.clone();
        r.timestamp = item.timestamp;
        r.metadata = item.metadata.clone();
        r
    }

    fn passes(&self, result: &SearchResult, filter: &FilterClause) -> bool {
        let day = result.timestamp.map(|t| t.date_naive());
        match filter.field.as_str() {
            "time_range" => {
                let Some(day) = day else { return false };
                match filter.value.as_str() {
                    "today" => day == self.reference,
                    "yesterday" => day == self.reference - Duration::days(1),
                    _ => match window_days(std::slice::from_ref(filter), self.reference) {
                        Some(days) => day >= self.reference - Duration::days(days) && day <= self.reference,
                        None => false,
                    },
                }
            }
            "date_after" | "date_before" => {
                let (Some(day), Ok(bound)) = (day, NaiveDate::parse_from_str(&filter.value, "%Y-%m-%d")) else {
                    return false;
                };
                match filter.operator {
                    FilterOperator::Gte => day >= bound,
                    FilterOperator::Lte => day <= bound,
                    _ => day == bound,
                }
            }
            field => {
                let Some(actual) = result.metadata_text(field) else {
                    return false;
                };
                let actual = actual.to_lowercase();
                let wanted = filter.value.to_lowercase();
                match filter.operator {
                    FilterOperator::Eq => actual == wanted,
                    FilterOperator::Contains => actual.contains(&wanted),
                    FilterOperator::Gte => actual >= wanted,
                    FilterOperator::Lte => actual <= wanted,
                    FilterOperator::In => wanted.split(',').any(|v| v.trim() == actual),
                }
            }
        }
    }

    fn score(&self, result: &mut SearchResult, step: &SearchStep, terms: &[String]) -> bool {
        let text = searchable_text(result);
        let words: BTreeSet<&str> = text
            .split(|c: char| !c.is_alphanumeric() && c != '@' && c != '-')
            .filter(|w| !w.is_empty())
            .collect();

        let mut matched = false;
        for method in &step.methods {
            let score = match method {
                RetrievalMethod::Structured => {
                    (!step.filters.is_empty() && terms.is_empty()).then_some(1.0)
                }
                RetrievalMethod::Fulltext if !terms.is_empty() => {
                    let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
                    (hits > 0).then(|| hits as f64 / terms.len() as f64)
                }
                RetrievalMethod::Vector if !terms.is_empty() => {
                    let hits = terms.iter().filter(|t| shares_prefix(t, &words)).count();
                    (hits > 0).then(|| 0.3 + 0.6 * hits as f64 / terms.len() as f64)
                }
                _ => None,
            };
            if let Some(score) = score {
                result.scores.set(*method, score);
                matched = true;
            }
        }

        // filter-only browse with a method that needs text
        if !matched && terms.is_empty() {
            if let Some(first) = step.methods.iter().next() {
                result.scores.set(*first, 0.5);
                matched = true;
            }
        }
        matched
    }
}

fn searchable_text(result: &SearchResult) -> String {
    let mut text = format!("{} {}", result.title, result.snippet);
    if let Some(p) = &result.provenance {
        text.push(' ');
        text.push_str(p);
    }
    for key in result.metadata.keys() {
        if let Some(v) = result.metadata_text(key) {
            text.push(' ');
            text.push_str(&v);
        }
    }
    text.to_lowercase()
}

fn shares_prefix(term: &str, words: &BTreeSet<&str>) -> bool {
    let prefix: String = term.chars().take(PREFIX_LEN).collect();
    words.iter().any(|w| w.starts_with(prefix.as_str()))
}

#[async_trait]
impl Backend for FixtureBackend {
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
        self.simulate().await?;
        let mut out = self.matching(step);

        let best = |r: &SearchResult| r.scores.iter().map(|(_, s)| s).fold(0.0, f64::max);
        out.sort_by(|a, b| {
            best(b)
                .partial_cmp(&best(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        out.truncate(step.limit);

        tracing::debug!(source = %self.caps.name, step = %step, count = out.len(), "fixture search");
        Ok(out)
    }

    async fn tally(&self, step: &SearchStep) -> Result<Tally, BackendError> {
        self.simulate().await?;
        let matched = self.matching(step);
        let total = matched.len() as u64;

        let tally = match (step.mode, step.group_by.as_deref()) {
            (SearchMode::Aggregate, Some(field)) => {
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for result in &matched {
                    if let Some(value) = result.metadata_text(field) {
                        *counts.entry(value).or_default() += 1;
                    }
                }
                let mut groups: Vec<AggregateGroup> =
                    counts.into_iter().map(|(value, count)| AggregateGroup::new(value, count)).collect();
                // stable sort keeps the map's value order among ties
                groups.sort_by(|a, b| b.count.cmp(&a.count));
                groups.truncate(step.limit.max(1));
                Tally::aggregate(self.caps.name.as_str(), field, total, groups)
            }
            (SearchMode::Count, _) => Tally::count(self.caps.name.as_str(), total),
            _ => {
                return Err(BackendError::InvalidStep {
                    source_name: self.caps.name.clone(),
                    reason: format!("cannot tally a {} step", step.mode),
                })
            }
        };

        tracing::debug!(source = %self.caps.name, step = %step, total, groups = tally.groups.len(), "fixture tally");
        Ok(tally)
    }
}

impl FixtureBackend {
    /// Configured latency and failure, applied before any work.
    async fn simulate(&self) -> Result<(), BackendError> {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
        match self.failure {
            Some(FailureMode::Timeout) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(FailureMode::Unavailable) => Err(BackendError::SourceUnavailable {
                source_name: self.caps.name.clone(),
                reason: "fixture configured as unavailable".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Items passing every filter and scored by at least one method.
    fn matching(&self, step: &SearchStep) -> Vec<SearchResult> {
        let terms: Vec<String> = step
            .query
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let mut out: Vec<SearchResult> = Vec::new();
        for item in &self.items {
            let mut result = self.to_result(item);
            if !step.filters.iter().all(|f| self.passes(&result, f)) {
                continue;
            }
            if self.score(&mut result, step, &terms) {
                out.push(result);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fedsearch_core::models::RetrievalMethod::*;
    use serde_json::json;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn item(id: &str, title: &str, day: u32, from: &str) -> FixtureItem {
        FixtureItem {
            id: id.to_string(),
            title: title.to_string(),
            snippet: String::new(),
            provenance: None,
            timestamp: Some(Utc.with_ymd_and_hms(2026, 10, day, 9, 0, 0).unwrap()),
            metadata: [("from_name".to_string(), json!(from))].into_iter().collect(),
        }
    }

    fn backend() -> FixtureBackend {
        let caps = SourceCapabilities::new("email", &[Structured, Fulltext, Vector])
            .with_filter("date_after", &[FilterOperator::Gte])
            .with_filter("time_range", &[FilterOperator::Eq])
            .with_filter("from_name", &[FilterOperator::Contains]);
        FixtureBackend::new(
            caps,
            vec![
                item("m1", "Roadmap review", 17, "Maria Chen"),
                item("m2", "Lunch plans", 2, "Alex"),
                item("m3", "Invoice INV-2291", 16, "Billing"),
            ],
            reference(),
        )
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn filter_only_step_scores_structured() {
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("date_after", FilterOperator::Gte, "2026-10-11"));
        let results = backend().search(&step).await.unwrap();
        assert_eq!(ids(&results), vec!["m1", "m3"]);
        assert_eq!(results[0].scores.structured, Some(1.0));
    }

    #[tokio::test]
    async fn time_range_preset_is_honoured() {
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("time_range", FilterOperator::Eq, "7d"));
        let results = backend().search(&step).await.unwrap();
        assert_eq!(ids(&results), vec!["m1", "m3"]);

        let yesterday = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("time_range", FilterOperator::Eq, "yesterday"));
        assert_eq!(ids(&backend().search(&yesterday).await.unwrap()), vec!["m1"]);
    }

    #[tokio::test]
    async fn fulltext_matches_terms() {
        let step = SearchStep::new("email", &[Fulltext], "roadmap");
        let results = backend().search(&step).await.unwrap();
        assert_eq!(ids(&results), vec!["m1"]);
        assert_eq!(results[0].scores.fulltext, Some(1.0));
        assert!(results[0].scores.vector.is_none());
    }

    #[tokio::test]
    async fn vector_matches_by_prefix_only() {
        let step = SearchStep::new("email", &[Vector], "invoices");
        let results = backend().search(&step).await.unwrap();
        assert_eq!(ids(&results), vec!["m3"]);
        assert!(results[0].scores.is_vector_only());
    }

    #[tokio::test]
    async fn metadata_filters_are_case_insensitive() {
        let step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("from_name", FilterOperator::Contains, "maria"));
        assert_eq!(ids(&backend().search(&step).await.unwrap()), vec!["m1"]);
    }

    #[tokio::test]
    async fn limit_truncates() {
        let mut step = SearchStep::new("email", &[Fulltext], "");
        step.limit = 1;
        assert_eq!(backend().search(&step).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn count_ignores_the_limit() {
        let mut step = SearchStep::new("email", &[Structured], "")
            .with_filter(FilterClause::new("date_after", FilterOperator::Gte, "2026-10-01"))
            .with_mode(SearchMode::Count, None);
        step.limit = 1;
        let tally = backend().tally(&step).await.unwrap();
        assert_eq!(tally.mode, SearchMode::Count);
        assert_eq!(tally.total, 3);
        assert!(tally.groups.is_empty());
    }

    #[tokio::test]
    async fn aggregate_groups_largest_first() {
        let caps = SourceCapabilities::new("chat", &[Structured, Fulltext])
            .with_filter("time_range", &[FilterOperator::Eq])
            .with_modes(&[SearchMode::Count, SearchMode::Aggregate])
            .with_group_by(&["from_name"]);
        let chat = FixtureBackend::new(
            caps,
            vec![
                item("c1", "see you", 17, "Sam"),
                item("c2", "ok", 16, "Alex"),
                item("c3", "call me", 15, "Sam"),
                item("c4", "lunch?", 14, "Bea"),
                item("c5", "old", 1, "Alex"),
            ],
            reference(),
        );
        let mut step = SearchStep::new("chat", &[Structured], "")
            .with_filter(FilterClause::new("time_range", FilterOperator::Eq, "7d"))
            .with_mode(SearchMode::Aggregate, Some("from_name"));
        step.limit = 2;
        let tally = chat.tally(&step).await.unwrap();
        assert_eq!(tally.total, 4);
        assert_eq!(tally.group_by.as_deref(), Some("from_name"));
        let groups: Vec<(&str, u64)> = tally.groups.iter().map(|g| (g.value.as_str(), g.count)).collect();
        assert_eq!(groups, vec![("Sam", 2), ("Alex", 1)]);
        assert_eq!(tally.top_group().map(|g| g.display()), Some("Sam"));
    }

    #[tokio::test]
    async fn search_step_cannot_be_tallied() {
        let err = backend().tally(&SearchStep::new("email", &[Fulltext], "x")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_step");
    }

    #[tokio::test]
    async fn unavailable_failure_is_typed() {
        let b = backend().with_failure(Some(FailureMode::Unavailable));
        let err = b.search(&SearchStep::new("email", &[Fulltext], "x")).await.unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }
}
