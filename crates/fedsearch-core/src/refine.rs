//! Bounded refinement.
//!
//! After a round of execution the refiner looks at the merged results and
//! proposes a few more steps, or none. Termination is guaranteed twice
//! over: rounds are hard-capped at [`MAX_REFINEMENT_ROUNDS`], and a step
//! that [`IssuedSteps`] has already seen is never proposed again. Temporal
//! windows only move within `1..=365` days and a key can only gain the
//! three retrieval methods, so every strategy runs out of new steps on its
//! own.
//!
//! Count and aggregate turns are answered by their tallies and are never
//! refined.

use std::collections::{BTreeMap, BTreeSet};

use crate::capabilities::CapabilityRegistry;
use crate::models::{Intent, RetrievalMethod, SearchResult, SearchStep, StepKey};
use crate::planner::{entity_filter, is_entity_field, Planner};
use crate::temporal::{self, MAX_WINDOW_DAYS};

/// Upper bound on refinement rounds per turn, whatever the configuration.
pub const MAX_REFINEMENT_ROUNDS: usize = 2;

/// Window assumed when a temporal filter's width cannot be read back.
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Text methods tried when a source's matches are weak.
const TEXT_METHODS: [RetrievalMethod; 2] = [RetrievalMethod::Fulltext, RetrievalMethod::Vector];

#[derive(Debug, Clone, PartialEq)]
pub struct RefinementPolicy {
    pub max_rounds: usize,
    pub max_steps_per_round: usize,
    pub min_satisfying_results: usize,
    pub saturation_threshold: usize,
    /// Mean best score below which a source's results count as weak.
    pub min_confidence: f64,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            max_rounds: MAX_REFINEMENT_ROUNDS,
            max_steps_per_round: 4,
            min_satisfying_results: 3,
            saturation_threshold: 10,
            min_confidence: 0.7,
        }
    }
}

impl RefinementPolicy {
    /// Configured rounds, clamped to the hard cap.
    pub fn rounds(&self) -> usize {
        self.max_rounds.min(MAX_REFINEMENT_ROUNDS)
    }
}

/// Mean of each result's best method score; unscored results count as 0.
pub fn mean_confidence<'r>(results: impl IntoIterator<Item = &'r SearchResult>) -> Option<f64> {
    let (sum, n) = results.into_iter().fold((0.0, 0usize), |(sum, n), r| {
        let best = r.scores.iter().map(|(_, s)| s).fold(0.0, f64::max);
        (sum + best, n + 1)
    });
    (n > 0).then(|| sum / n as f64)
}

/// Steps issued in a turn, keyed by [`StepKey`], with the retrieval methods
/// each key has been tried with.
///
/// A step is a reissue when its key is known and every one of its methods
/// has already run under that key.
#[derive(Debug, Clone, Default)]
pub struct IssuedSteps {
    methods: BTreeMap<StepKey, BTreeSet<RetrievalMethod>>,
}

impl IssuedSteps {
    pub fn from_steps<'s>(steps: impl IntoIterator<Item = &'s SearchStep>) -> Self {
        let mut issued = Self::default();
        for step in steps {
            issued.record(step);
        }
        issued
    }

    pub fn is_reissue(&self, step: &SearchStep) -> bool {
        self.methods
            .get(&step.dedupe_key())
            .map(|known| step.methods.is_subset(known))
            .unwrap_or(false)
    }

    /// Record `step`. Returns false when it was a reissue.
    pub fn record(&mut self, step: &SearchStep) -> bool {
        let fresh = !self.is_reissue(step);
        self.methods
            .entry(step.dedupe_key())
            .or_default()
            .extend(step.methods.iter().copied());
        fresh
    }
}

/// What the refiner sees after a round.
pub struct RefineInput<'a> {
    pub original_request: &'a str,
    pub intent: &'a Intent,
    pub results: &'a [SearchResult],
    /// Every step issued so far this turn, across rounds.
    pub previous_steps: &'a [SearchStep],
    /// Sources of stages that were skipped; never retried.
    pub skipped_sources: &'a BTreeSet<String>,
}

pub struct Refiner<'a> {
    planner: &'a Planner<'a>,
    policy: RefinementPolicy,
}

impl<'a> Refiner<'a> {
    pub fn new(planner: &'a Planner<'a>, policy: RefinementPolicy) -> Self {
        Self { planner, policy }
    }

    pub fn policy(&self) -> &RefinementPolicy {
        &self.policy
    }

    fn registry(&self) -> &CapabilityRegistry {
        self.planner.registry()
    }

    /// Sources the turn is expected to cover, in hint order.
    fn target_sources(&self, input: &RefineInput<'_>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let hop_sources = input.intent.retrieval_plan.iter().flat_map(|h| h.sources.iter());
        for source in input.intent.source_hints.iter().chain(hop_sources) {
            if !out.contains(source) && self.registry().contains(source) && !input.skipped_sources.contains(source) {
                out.push(source.clone());
            }
        }
        out
    }

    /// Every target source has results, there are enough of them, they are
    /// confident enough, and the intent carries no open ambiguity.
    pub fn is_satisfied(&self, input: &RefineInput<'_>) -> bool {
        input.intent.ambiguities.is_empty()
            && input.results.len() >= self.policy.min_satisfying_results
            && mean_confidence(input.results).map_or(false, |c| c >= self.policy.min_confidence)
            && self
                .target_sources(input)
                .iter()
                .all(|s| input.results.iter().any(|r| r.source == *s))
    }

    /// Steps for the next round; empty when satisfied or out of ideas.
    pub fn propose(&self, input: &RefineInput<'_>) -> Vec<SearchStep> {
        if !input.intent.mode.is_search() || self.is_satisfied(input) {
            return Vec::new();
        }

        let mut issued = IssuedSteps::from_steps(input.previous_steps);
        let mut out: Vec<SearchStep> = Vec::new();
        let exact_terms = exact_terms(input.original_request, input.intent);

        for source in self.target_sources(input) {
            let count = input.results.iter().filter(|r| r.source == source).count();
            let previous: Vec<&SearchStep> = input.previous_steps.iter().filter(|s| s.source == source).collect();

            let candidates = if previous.is_empty() {
                self.planner.steps_for_source(&source, input.intent)
            } else if count == 0 {
                self.widen_or_broaden(&source, &previous)
            } else {
                let mut steps = Vec::new();
                let vector_only = input
                    .results
                    .iter()
                    .filter(|r| r.source == source)
                    .all(|r| r.scores.is_vector_only());
                if vector_only && !exact_terms.is_empty() {
                    steps.extend(self.exact_step(&source, &exact_terms, input.intent));
                }
                if count >= self.policy.saturation_threshold {
                    steps.extend(self.rescale(&previous, |days| days / 2, "narrow"));
                }
                let weak = mean_confidence(input.results.iter().filter(|r| r.source == source))
                    .map_or(false, |c| c < self.policy.min_confidence);
                if weak {
                    steps.extend(self.diversify(&source, &previous));
                }
                steps
            };

            for step in candidates {
                if out.len() >= self.policy.max_steps_per_round {
                    break;
                }
                if let Err(e) = self.registry().validate_step(&step) {
                    tracing::debug!(source = %step.source, error = %e, "discarding refinement step");
                    continue;
                }
                if issued.record(&step) {
                    out.push(step);
                }
            }
        }

        if !out.is_empty() {
            tracing::debug!(proposed = out.len(), "refinement proposed steps");
        }
        out
    }

    fn widen_or_broaden(&self, source: &str, previous: &[&SearchStep]) -> Vec<SearchStep> {
        if previous.iter().any(|s| s.has_temporal_filter()) {
            return self.rescale(previous, |days| days * 2, "widen");
        }
        let Some(caps) = self.registry().get(source) else {
            return Vec::new();
        };
        previous
            .iter()
            .map(|step| {
                let mut broader = (*step).clone();
                broader.filters.retain(|f| is_entity_field(&f.field));
                if broader.filters.len() == step.filters.len() {
                    // nothing to drop: relax the query to its longest term
                    if let Some(term) = step.query.split_whitespace().max_by_key(|w| w.len()) {
                        if term != step.query.trim() {
                            broader.query = term.to_string();
                        }
                    }
                }
                if caps.supports_method(RetrievalMethod::Vector) && !broader.query.is_empty() {
                    broader.methods.insert(RetrievalMethod::Vector);
                }
                broader.label = "broaden".to_string();
                broader
            })
            .collect()
    }

    /// Retry weak queries with the text methods they have not used yet.
    fn diversify(&self, source: &str, previous: &[&SearchStep]) -> Vec<SearchStep> {
        let Some(caps) = self.registry().get(source) else {
            return Vec::new();
        };
        previous
            .iter()
            .filter(|s| !s.query.trim().is_empty() && s.mode.is_search())
            .filter_map(|step| {
                let missing: BTreeSet<RetrievalMethod> = TEXT_METHODS
                    .into_iter()
                    .filter(|m| caps.supports_method(*m) && !step.methods.contains(m))
                    .collect();
                if missing.is_empty() {
                    return None;
                }
                let mut next = (*step).clone();
                next.methods = missing;
                next.label = "diversify".to_string();
                Some(next)
            })
            .collect()
    }

    fn rescale(&self, previous: &[&SearchStep], scale: impl Fn(i64) -> i64, label: &str) -> Vec<SearchStep> {
        let reference = self.planner.reference();
        previous
            .iter()
            .filter(|s| s.has_temporal_filter())
            .filter_map(|step| {
                let caps = self.registry().get(&step.source)?;
                let days = temporal::window_days(&step.filters, reference).unwrap_or(DEFAULT_WINDOW_DAYS);
                let target = scale(days).clamp(1, MAX_WINDOW_DAYS);
                if target == days {
                    return None;
                }
                let filters = temporal::with_window(&step.filters, caps, reference, target)?;
                let mut next = (*step).clone();
                next.filters = filters;
                next.label = label.to_string();
                Some(next)
            })
            .collect()
    }

    /// Re-ask a source that only produced vector-tier matches, with an
    /// exact phrase or an entity filter.
    fn exact_step(&self, source: &str, terms: &[String], intent: &Intent) -> Option<SearchStep> {
        let caps = self.registry().get(source)?;
        if caps.supports_method(RetrievalMethod::Fulltext) {
            let mut step = SearchStep::new(source, &[RetrievalMethod::Fulltext], terms.join(" ")).with_label("exact");
            step.limit = caps.default_limit.max(1);
            return Some(step);
        }
        if !caps.supports_method(RetrievalMethod::Structured) {
            return None;
        }
        let filter = intent
            .entities
            .iter()
            .find_map(|e| entity_filter(caps, e.role, &e.name, e.attribute.as_deref()))?;
        let mut step = SearchStep::new(source, &[RetrievalMethod::Structured], "")
            .with_filter(filter)
            .with_label("exact");
        step.limit = caps.default_limit.max(1);
        Some(step)
    }
}

/// Terms the user expects to match literally: quoted phrases, entity
/// addresses, and identifier-like keywords (digits, `@`, `-`).
pub fn exact_terms(request: &str, intent: &Intent) -> Vec<String> {
    let mut out: Vec<String> = request
        .split('"')
        .skip(1)
        .step_by(2)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    for entity in &intent.entities {
        if let Some(attr) = &entity.attribute {
            out.push(attr.clone());
        }
    }
    for kw in &intent.keywords {
        if kw.chars().any(|c| c.is_ascii_digit() || c == '@' || c == '-') && !out.contains(kw) {
            out.push(kw.clone());
        }
    }
    out
}
