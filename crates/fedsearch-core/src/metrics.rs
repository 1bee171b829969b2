//! Evaluation gate metrics and the pass/fail decision.
//!
//! Pure functions over per-case observations. Running the cases and
//! writing the artifacts happens in the application crate.
//!
//! Benchmark-wide [`Thresholds`] and the baseline are checked on the
//! aggregate. A case may also carry its own [`CaseThresholds`], and a case
//! whose expected sources came back empty fails on its own, so one broken
//! case is reported even when the averages still pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::SearchError;

/// Case name used for failures of an aggregate metric.
pub const AGGREGATE_CASE: &str = "*";

/// Absorbs float noise in `baseline - observed` comparisons.
const EPSILON: f64 = 1e-9;

/// A violated threshold or regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFailure {
    pub metric: String,
    pub case: String,
    pub observed: f64,
    pub threshold_or_baseline: f64,
}

impl fmt::Display for MetricFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: observed {:.4}, limit {:.4}",
            self.metric, self.case, self.observed, self.threshold_or_baseline
        )
    }
}

/// Result identity `(source, id)`.
pub type ResultKey = (String, String);

/// Relevant results in the top `k` over `min(k, returned)`.
///
/// 1.0 when nothing is expected, 0.0 when something is expected but
/// nothing came back.
pub fn precision_at_k(ranked: &[ResultKey], expected: &BTreeSet<ResultKey>, k: usize) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let window = k.min(ranked.len());
    if window == 0 {
        return 0.0;
    }
    let hits = ranked[..window].iter().filter(|r| expected.contains(*r)).count();
    hits as f64 / window as f64
}

/// Fraction of expected results found in the first `window` ranked.
pub fn coverage(ranked: &[ResultKey], expected: &BTreeSet<ResultKey>, window: usize) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let found: BTreeSet<&ResultKey> = ranked.iter().take(window).filter(|r| expected.contains(*r)).collect();
    found.len() as f64 / expected.len() as f64
}

/// Nearest-rank 95th percentile. 0 for no samples.
pub fn p95(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((0.95 * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}

/// Limits for a single case. Unset limits are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseThresholds {
    #[serde(default)]
    pub min_precision_at_k: Option<f64>,
    #[serde(default)]
    pub min_coverage: Option<f64>,
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    /// Whether a correct result must (or must not) come from refinement.
    #[serde(default)]
    pub expect_refinement: Option<bool>,
}

/// Observations for one benchmark case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMetrics {
    pub case: String,
    pub precision_at_k: f64,
    pub coverage: f64,
    pub latency_ms: f64,
    /// A correct result first appeared in a refinement round.
    pub refinement_hit: bool,
    pub returned: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Expected sources that returned nothing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<CaseThresholds>,
}

impl CaseMetrics {
    pub fn new(case: impl Into<String>) -> Self {
        Self {
            case: case.into(),
            precision_at_k: 0.0,
            coverage: 0.0,
            latency_ms: 0.0,
            refinement_hit: false,
            returned: 0,
            errors: Vec::new(),
            missing_sources: Vec::new(),
            thresholds: None,
        }
    }

    /// Violations of this case's own limits and expected sources.
    pub fn failures(&self) -> Vec<MetricFailure> {
        let mut out = Vec::new();
        let mut fail = |metric: String, observed: f64, limit: f64| {
            out.push(MetricFailure {
                metric,
                case: self.case.clone(),
                observed,
                threshold_or_baseline: limit,
            });
        };

        for source in &self.missing_sources {
            fail(format!("expected_source:{}", source), 0.0, 1.0);
        }

        let Some(t) = &self.thresholds else {
            return out;
        };
        if let Some(l) = t.min_precision_at_k.filter(|l| self.precision_at_k + EPSILON < *l) {
            fail("precision_at_k".to_string(), self.precision_at_k, l);
        }
        if let Some(l) = t.min_coverage.filter(|l| self.coverage + EPSILON < *l) {
            fail("coverage".to_string(), self.coverage, l);
        }
        if let Some(l) = t.max_latency_ms.filter(|l| self.latency_ms > *l + EPSILON) {
            fail("latency_ms".to_string(), self.latency_ms, l);
        }
        if let Some(expected) = t.expect_refinement.filter(|e| *e != self.refinement_hit) {
            let as_f64 = |b: bool| if b { 1.0 } else { 0.0 };
            fail("refinement_hit".to_string(), as_f64(self.refinement_hit), as_f64(expected));
        }
        out
    }
}

/// Aggregate metric values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub precision_at_k: f64,
    pub coverage: f64,
    pub p95_latency_ms: f64,
    pub refinement_hit_rate: f64,
}

impl MetricSnapshot {
    /// Means over cases, except latency which is p95.
    pub fn aggregate(cases: &[CaseMetrics]) -> Self {
        let n = cases.len().max(1) as f64;
        let mean = |f: fn(&CaseMetrics) -> f64| cases.iter().map(f).sum::<f64>() / n;
        let latencies: Vec<f64> = cases.iter().map(|c| c.latency_ms).collect();
        Self {
            precision_at_k: mean(|c| c.precision_at_k),
            coverage: mean(|c| c.coverage),
            p95_latency_ms: p95(&latencies),
            refinement_hit_rate: mean(|c| if c.refinement_hit { 1.0 } else { 0.0 }),
        }
    }
}

/// Absolute limits. Unset limits are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub min_precision_at_k: Option<f64>,
    #[serde(default)]
    pub min_coverage: Option<f64>,
    #[serde(default)]
    pub max_p95_latency_ms: Option<f64>,
    #[serde(default)]
    pub min_refinement_hit_rate: Option<f64>,
}

/// Allowed regression versus the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    #[serde(default = "default_drop")]
    pub max_precision_drop: f64,
    #[serde(default = "default_drop")]
    pub max_coverage_drop: f64,
    #[serde(default = "default_latency_increase")]
    pub max_latency_increase_ms: f64,
    #[serde(default = "default_hit_rate_drop")]
    pub max_refinement_hit_rate_drop: f64,
}

fn default_drop() -> f64 {
    0.05
}

fn default_latency_increase() -> f64 {
    250.0
}

fn default_hit_rate_drop() -> f64 {
    0.10
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            max_precision_drop: default_drop(),
            max_coverage_drop: default_drop(),
            max_latency_increase_ms: default_latency_increase(),
            max_refinement_hit_rate_drop: default_hit_rate_drop(),
        }
    }
}

/// Last accepted metric snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub metrics: MetricSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub benchmark: String,
    pub generated_at: DateTime<Utc>,
    /// Per-case values.
    pub precision_at_k: BTreeMap<String, f64>,
    pub coverage: BTreeMap<String, f64>,
    pub latency_ms: BTreeMap<String, f64>,
    pub refinement_hit_rate: BTreeMap<String, f64>,
    pub aggregate: MetricSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<MetricSnapshot>,
    pub passed: bool,
    pub failures: Vec<MetricFailure>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub cases: Vec<CaseMetrics>,
}

impl BenchmarkReport {
    /// `Err(GateFailure)` when the gate did not pass.
    pub fn verdict(&self) -> Result<(), SearchError> {
        if self.passed {
            Ok(())
        } else {
            Err(SearchError::GateFailure(self.failures.clone()))
        }
    }
}

/// Compare case metrics against thresholds and the baseline.
pub fn evaluate(
    benchmark: &str,
    cases: Vec<CaseMetrics>,
    thresholds: &Thresholds,
    tolerances: &Tolerances,
    baseline: Option<&BaselineSnapshot>,
) -> BenchmarkReport {
    let aggregate = MetricSnapshot::aggregate(&cases);
    let mut failures = Vec::new();
    let mut notes = Vec::new();

    let mut fail = |metric: &str, observed: f64, limit: f64| {
        failures.push(MetricFailure {
            metric: metric.to_string(),
            case: AGGREGATE_CASE.to_string(),
            observed,
            threshold_or_baseline: limit,
        });
    };

    let below = |limit: Option<f64>, observed: f64| limit.filter(|l| observed + EPSILON < *l);
    if let Some(l) = below(thresholds.min_precision_at_k, aggregate.precision_at_k) {
        fail("precision_at_k", aggregate.precision_at_k, l);
    }
    if let Some(l) = below(thresholds.min_coverage, aggregate.coverage) {
        fail("coverage", aggregate.coverage, l);
    }
    if let Some(l) = below(thresholds.min_refinement_hit_rate, aggregate.refinement_hit_rate) {
        fail("refinement_hit_rate", aggregate.refinement_hit_rate, l);
    }
    if let Some(l) = thresholds.max_p95_latency_ms.filter(|l| aggregate.p95_latency_ms > *l + EPSILON) {
        fail("p95_latency_ms", aggregate.p95_latency_ms, l);
    }

    match baseline {
        Some(base) => {
            let b = &base.metrics;
            let dropped = |base: f64, observed: f64, tol: f64| base - observed > tol + EPSILON;
            if dropped(b.precision_at_k, aggregate.precision_at_k, tolerances.max_precision_drop) {
                fail("precision_at_k", aggregate.precision_at_k, b.precision_at_k);
            }
            if dropped(b.coverage, aggregate.coverage, tolerances.max_coverage_drop) {
                fail("coverage", aggregate.coverage, b.coverage);
            }
            if dropped(b.refinement_hit_rate, aggregate.refinement_hit_rate, tolerances.max_refinement_hit_rate_drop) {
                fail("refinement_hit_rate", aggregate.refinement_hit_rate, b.refinement_hit_rate);
            }
            if aggregate.p95_latency_ms - b.p95_latency_ms > tolerances.max_latency_increase_ms + EPSILON {
                fail("p95_latency_ms", aggregate.p95_latency_ms, b.p95_latency_ms);
            }
        }
        None => notes.push("no baseline found; regression check skipped".to_string()),
    }

    for case in &cases {
        failures.extend(case.failures());
        for error in &case.errors {
            notes.push(format!("{}: {}", case.case, error));
        }
    }

    let per_case = |f: fn(&CaseMetrics) -> f64| cases.iter().map(|c| (c.case.clone(), f(c))).collect();
    let report = BenchmarkReport {
        benchmark: benchmark.to_string(),
        generated_at: Utc::now(),
        precision_at_k: per_case(|c| c.precision_at_k),
        coverage: per_case(|c| c.coverage),
        latency_ms: per_case(|c| c.latency_ms),
        refinement_hit_rate: per_case(|c| if c.refinement_hit { 1.0 } else { 0.0 }),
        aggregate,
        baseline: baseline.map(|b| b.metrics),
        passed: failures.is_empty(),
        failures,
        notes,
        cases,
    };
    tracing::info!(
        benchmark,
        passed = report.passed,
        failures = report.failures.len(),
        precision = report.aggregate.precision_at_k,
        coverage = report.aggregate.coverage,
        "gate evaluated"
    );
    report
}
