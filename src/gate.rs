//! Evaluation gate.
//!
//! Replays a benchmark of labeled queries through the live pipeline, each
//! against its own in-memory fixture backends, and compares the metrics
//! with static thresholds and the stored baseline.
//!
//! A benchmark document is TOML:
//!
//! ```toml
//! name = "personal-search"
//!
//! [thresholds]
//! min_precision_at_k = 0.6
//!
//! [regression]
//! max_precision_drop = 0.05
//!
//! [orchestration]
//! reference_date = "2026-10-18"
//!
//! [[sources]]
//! name = "email"
//! methods = ["structured", "fulltext"]
//!
//! [[cases]]
//! id = "roadmap-mail"
//! query = "roadmap emails"
//! expected = [{ source = "email", id = "m1" }]
//! expected_sources = ["email"]
//!
//! [cases.thresholds]
//! min_precision_at_k = 1.0
//! max_latency_ms = 500.0
//!
//! [[cases.fixtures.email.items]]
//! id = "m1"
//! title = "Roadmap"
//! ```
//!
//! `[thresholds]` applies to the aggregate; `[cases.thresholds]` to one
//! case. An expected source that returns nothing fails its case.
//!
//! The run writes a JSON report and a Markdown summary. The baseline is
//! only read here; [`promote`] is the one place that writes it.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

use fedsearch_core::capabilities::{CapabilityRegistry, SourceCapabilities};
use fedsearch_core::intent::{validate_intent, Conversation, IntentExtractor};
use fedsearch_core::metrics::{
    coverage, evaluate, precision_at_k, BaselineSnapshot, BenchmarkReport, CaseMetrics, CaseThresholds, ResultKey,
    Thresholds, Tolerances,
};
use fedsearch_core::models::Intent;

use crate::backend_fixture::FixtureBackend;
use crate::config::{validate_sources, FailureMode, FixtureItem, OrchestrationConfig};
use crate::orchestrator::Orchestrator;
use crate::traits::BackendRegistry;

#[derive(Debug, Deserialize, Clone)]
pub struct BenchmarkConfig {
    #[serde(default = "default_benchmark_name")]
    pub name: String,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub regression: Tolerances,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    pub sources: Vec<SourceCapabilities>,
    pub cases: Vec<BenchCase>,
}

fn default_benchmark_name() -> String {
    "benchmark".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BenchCase {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub expected_sources: Vec<String>,
    #[serde(default)]
    pub expected: Vec<ExpectedResult>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_coverage_window")]
    pub coverage_window: usize,
    /// JSON standing in for the reasoning capability's intent output.
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub thresholds: Option<CaseThresholds>,
    /// Per-source items and behavior, keyed by source name.
    #[serde(default)]
    pub fixtures: BTreeMap<String, FixtureSpec>,
}

fn default_top_k() -> usize {
    3
}
fn default_coverage_window() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpectedResult {
    pub source: String,
    pub id: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FixtureSpec {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub fail: Option<FailureMode>,
    #[serde(default)]
    pub items: Vec<FixtureItem>,
}

pub fn load_benchmark(path: &Path) -> Result<BenchmarkConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read benchmark file: {}", path.display()))?;
    let bench: BenchmarkConfig =
        toml::from_str(&content).with_context(|| "Failed to parse benchmark file")?;

    bench.orchestration.validate()?;
    validate_sources(&bench.sources)?;
    if bench.cases.is_empty() {
        bail!("Benchmark must declare at least one [[cases]] entry");
    }

    let names: HashSet<&str> = bench.sources.iter().map(|s| s.name.as_str()).collect();
    let mut ids = HashSet::new();
    for case in &bench.cases {
        if !ids.insert(case.id.as_str()) {
            bail!("Duplicate case id: '{}'", case.id);
        }
        if case.top_k == 0 {
            bail!("Case '{}' top_k must be >= 1", case.id);
        }
        if case.coverage_window == 0 {
            bail!("Case '{}' coverage_window must be >= 1", case.id);
        }
        if let Some(t) = &case.thresholds {
            let in_unit = |v: Option<f64>| v.map_or(true, |v| (0.0..=1.0).contains(&v));
            if !in_unit(t.min_precision_at_k) || !in_unit(t.min_coverage) {
                bail!("Case '{}' thresholds must be in [0, 1]", case.id);
            }
        }
        let referenced = case
            .fixtures
            .keys()
            .map(String::as_str)
            .chain(case.expected.iter().map(|e| e.source.as_str()))
            .chain(case.expected_sources.iter().map(String::as_str));
        for source in referenced {
            if !names.contains(source) {
                bail!("Case '{}' references undeclared source '{}'", case.id, source);
            }
        }
    }
    Ok(bench)
}

/// Read the baseline if one exists.
pub fn read_baseline(path: &Path) -> Result<Option<BaselineSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read baseline: {}", path.display()))?;
    let baseline = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse baseline: {}", path.display()))?;
    Ok(Some(baseline))
}

fn case_backends(bench: &BenchmarkConfig, case: &BenchCase) -> BackendRegistry {
    let reference = bench.orchestration.reference();
    let mut backends = BackendRegistry::new();
    for caps in &bench.sources {
        let spec = case.fixtures.get(&caps.name).cloned().unwrap_or_default();
        let backend = FixtureBackend::new(caps.clone(), spec.items, reference)
            .with_latency_ms(spec.latency_ms)
            .with_failure(spec.fail);
        backends.register(Arc::new(backend));
    }
    backends
}

async fn case_intent(case: &BenchCase, registry: &CapabilityRegistry) -> Intent {
    let conversation = Conversation::from_request(case.query.as_str());
    let deterministic = IntentExtractor::new(registry, None).extract(&conversation).await;
    let Some(raw) = &case.intent else {
        return deterministic;
    };
    match validate_intent(&Value::String(raw.clone()), registry, &deterministic) {
        Ok(intent) => intent,
        Err(e) => {
            tracing::warn!(case = %case.id, error = %e, "scripted intent rejected; using analyzer intent");
            deterministic
        }
    }
}

/// Run one case through the pipeline and score it.
pub async fn run_case(bench: &BenchmarkConfig, case: &BenchCase) -> CaseMetrics {
    let orchestrator = Orchestrator::new(case_backends(bench, case), None, bench.orchestration.clone());
    let expected: BTreeSet<ResultKey> = case
        .expected
        .iter()
        .map(|e| (e.source.clone(), e.id.clone()))
        .collect();

    let started = Instant::now();
    let intent = case_intent(case, orchestrator.capabilities()).await;
    let outcome = orchestrator.run_with_intent(&case.query, intent).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut errors = Vec::new();
    let (ranked, first_rounds): (Vec<ResultKey>, Vec<usize>) = match outcome {
        Ok(resp) => {
            errors.extend(resp.errors.iter().map(|e| format!("{} {}: {}", e.source, e.kind, e.message)));
            resp.results
                .iter()
                .map(|r| ((r.result.source.clone(), r.result.id.clone()), r.round))
                .unzip()
        }
        Err(e) => {
            errors.push(e.to_string());
            (Vec::new(), Vec::new())
        }
    };

    let missing_sources: Vec<String> = case
        .expected_sources
        .iter()
        .filter(|source| !ranked.iter().any(|(s, _)| s == *source))
        .cloned()
        .collect();

    let refinement_hit = ranked
        .iter()
        .zip(&first_rounds)
        .any(|(key, round)| *round > 0 && expected.contains(key));

    let metrics = CaseMetrics {
        case: case.id.clone(),
        precision_at_k: precision_at_k(&ranked, &expected, case.top_k),
        coverage: coverage(&ranked, &expected, case.coverage_window),
        latency_ms,
        refinement_hit,
        returned: ranked.len(),
        errors,
        missing_sources,
        thresholds: case.thresholds.clone(),
    };
    tracing::info!(
        case = %metrics.case,
        precision = metrics.precision_at_k,
        coverage = metrics.coverage,
        latency_ms = metrics.latency_ms,
        "case finished"
    );
    metrics
}

/// Run every case concurrently and evaluate the gate.
pub async fn run_benchmark(bench: &BenchmarkConfig, baseline: Option<&BaselineSnapshot>) -> BenchmarkReport {
    let cases = futures::future::join_all(bench.cases.iter().map(|case| run_case(bench, case))).await;
    evaluate(&bench.name, cases, &bench.thresholds, &bench.regression, baseline)
}

/// Load, run, and write both artifacts. The caller decides the exit code
/// from [`BenchmarkReport::passed`].
pub async fn run_gate(bench_path: &Path, report_path: &Path, summary_path: &Path, baseline_path: &Path) -> Result<BenchmarkReport> {
    let bench = load_benchmark(bench_path)?;
    let baseline = read_baseline(baseline_path)?;
    tracing::info!(
        benchmark = %bench.name,
        cases = bench.cases.len(),
        baseline = baseline.is_some(),
        "running benchmark"
    );

    let report = run_benchmark(&bench, baseline.as_ref()).await;

    write_file(report_path, &serde_json::to_string_pretty(&report)?)?;
    write_file(summary_path, &render_summary(&report))?;

    if report.passed {
        tracing::info!(benchmark = %report.benchmark, "gate passed");
    } else {
        for failure in &report.failures {
            tracing::warn!(%failure, "gate violation");
        }
    }
    Ok(report)
}

/// Write the aggregate of a report as the new baseline.
///
/// A failed report is refused unless `force` is set.
pub fn promote(report_path: &Path, baseline_path: &Path, force: bool) -> Result<BaselineSnapshot> {
    let content = std::fs::read_to_string(report_path)
        .with_context(|| format!("Failed to read report: {}", report_path.display()))?;
    let report: BenchmarkReport = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report: {}", report_path.display()))?;

    if !report.passed && !force {
        bail!(
            "Refusing to promote a failed report ({} violation(s)); pass --force to override",
            report.failures.len()
        );
    }

    let snapshot = BaselineSnapshot {
        metrics: report.aggregate,
        promoted_at: Some(Utc::now()),
        benchmark: Some(report.benchmark.clone()),
    };
    write_file(baseline_path, &serde_json::to_string_pretty(&snapshot)?)?;
    tracing::info!(baseline = %baseline_path.display(), forced = !report.passed, "baseline promoted");
    Ok(snapshot)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Human-readable Markdown form of a report.
pub fn render_summary(report: &BenchmarkReport) -> String {
    let mut out = String::new();
    let verdict = if report.passed { "PASSED" } else { "FAILED" };
    let _ = writeln!(out, "# Benchmark `{}`: {}\n", report.benchmark, verdict);
    let _ = writeln!(out, "Generated {}\n", report.generated_at.to_rfc3339());

    let base = report.baseline.as_ref();
    let fmt_base = |v: Option<f64>| v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "n/a".to_string());
    let _ = writeln!(out, "| Metric | Observed | Baseline |");
    let _ = writeln!(out, "|--------|----------|----------|");
    let rows = [
        ("precision@k", report.aggregate.precision_at_k, base.map(|b| b.precision_at_k)),
        ("coverage", report.aggregate.coverage, base.map(|b| b.coverage)),
        ("p95 latency (ms)", report.aggregate.p95_latency_ms, base.map(|b| b.p95_latency_ms)),
        ("refinement hit rate", report.aggregate.refinement_hit_rate, base.map(|b| b.refinement_hit_rate)),
    ];
    for (name, observed, baseline) in rows {
        let _ = writeln!(out, "| {} | {:.4} | {} |", name, observed, fmt_base(baseline));
    }

    let _ = writeln!(out, "\n## Cases\n");
    let _ = writeln!(out, "| Case | precision@k | coverage | latency (ms) | refinement hit | returned |");
    let _ = writeln!(out, "|------|-------------|----------|--------------|----------------|----------|");
    for case in &report.cases {
        let _ = writeln!(
            out,
            "| {} | {:.4} | {:.4} | {:.1} | {} | {} |",
            case.case,
            case.precision_at_k,
            case.coverage,
            case.latency_ms,
            if case.refinement_hit { "yes" } else { "no" },
            case.returned
        );
    }

    if !report.failures.is_empty() {
        let _ = writeln!(out, "\n## Failures\n");
        for failure in &report.failures {
            let _ = writeln!(out, "- {}", failure);
        }
    }

    let case_errors: Vec<String> = report
        .cases
        .iter()
        .flat_map(|c| c.errors.iter().map(move |e| format!("{}: {}", c.case, e)))
        .collect();
    if !report.notes.is_empty() || !case_errors.is_empty() {
        let _ = writeln!(out, "\n## Notes\n");
        for note in report.notes.iter().chain(case_errors.iter()) {
            let _ = writeln!(out, "- {}", note);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENCH: &str = r#"
name = "unit"

[thresholds]
min_precision_at_k = 0.5

[orchestration]
reference_date = "2026-10-18"

[[sources]]
name = "email"
kind = "mail"
methods = ["structured", "fulltext"]

[[sources.filters]]
field = "date_after"
operators = ["gte"]

[[cases]]
id = "roadmap"
query = "roadmap in email"
expected = [{ source = "email", id = "m1" }]
top_k = 1

[[cases.fixtures.email.items]]
id = "m1"
title = "Roadmap review"
timestamp = "2026-10-17T09:00:00Z"

[[cases.fixtures.email.items]]
id = "m2"
title = "Lunch"
timestamp = "2026-10-16T09:00:00Z"
"#;

    fn bench() -> BenchmarkConfig {
        toml::from_str(BENCH).unwrap()
    }

    #[tokio::test]
    async fn case_scores_expected_hit() {
        let bench = bench();
        let metrics = run_case(&bench, &bench.cases[0]).await;
        assert_eq!(metrics.precision_at_k, 1.0);
        assert_eq!(metrics.coverage, 1.0);
        assert!(!metrics.refinement_hit);
        assert!(metrics.errors.is_empty(), "{:?}", metrics.errors);
    }

    #[tokio::test]
    async fn report_without_baseline_notes_skipped_regression() {
        let bench = bench();
        let report = run_benchmark(&bench, None).await;
        assert!(report.passed);
        assert!(report.notes.iter().any(|n| n.contains("no baseline")));
    }

    const SECOND_CASE: &str = r#"
[[cases]]
id = "lunch"
query = "lunch in email"
expected = [{ source = "email", id = "m2" }]
expected_sources = ["email"]
top_k = 1

[cases.thresholds]
min_precision_at_k = 1.0
expect_refinement = true

[[cases.fixtures.email.items]]
id = "m2"
title = "Lunch"
timestamp = "2026-10-16T09:00:00Z"

[[cases]]
id = "ghost"
query = "roadmap in email"
expected_sources = ["email"]
"#;

    #[tokio::test]
    async fn one_failing_case_fails_the_gate_while_aggregate_passes() {
        let bench: BenchmarkConfig = toml::from_str(&format!("{}{}", BENCH, SECOND_CASE)).unwrap();
        let report = run_benchmark(&bench, None).await;

        // precision averages 1.0 over the three cases
        assert_eq!(report.aggregate.precision_at_k, 1.0);
        assert!(!report.passed);
        let failed: Vec<(&str, &str)> = report
            .failures
            .iter()
            .map(|f| (f.case.as_str(), f.metric.as_str()))
            .collect();
        assert_eq!(
            failed,
            vec![("lunch", "refinement_hit"), ("ghost", "expected_source:email")]
        );
        assert!(render_summary(&report).contains("expected_source:email [ghost]"));
    }

    #[test]
    fn rejects_case_threshold_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        let bad = format!("{}\n[cases.thresholds]\nmin_coverage = 1.5\n", BENCH);
        std::fs::write(&path, bad).unwrap();
        let err = load_benchmark(&path).unwrap_err();
        assert!(err.to_string().contains("thresholds must be in [0, 1]"), "{}", err);
    }

    #[test]
    fn rejects_case_with_undeclared_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, BENCH.replace("source = \"email\", id = \"m1\"", "source = \"calendar\", id = \"m1\"")).unwrap();
        let err = load_benchmark(&path).unwrap_err();
        assert!(err.to_string().contains("undeclared source 'calendar'"), "{}", err);
    }

    #[test]
    fn missing_baseline_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_baseline(&dir.path().join("baseline.json")).unwrap().is_none());
    }

    #[tokio::test]
    async fn promote_refuses_failed_report_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = bench();
        bench.thresholds.min_precision_at_k = Some(1.1);
        let report = run_benchmark(&bench, None).await;
        assert!(!report.passed);

        let report_path = dir.path().join("report.json");
        let baseline_path = dir.path().join("baseline.json");
        std::fs::write(&report_path, serde_json::to_string(&report).unwrap()).unwrap();

        assert!(promote(&report_path, &baseline_path, false).is_err());
        assert!(!baseline_path.exists());

        let snapshot = promote(&report_path, &baseline_path, true).unwrap();
        assert!(snapshot.promoted_at.is_some());
        assert_eq!(read_baseline(&baseline_path).unwrap().unwrap().metrics, report.aggregate);
    }

    #[test]
    fn summary_lists_failures() {
        let report = evaluate(
            "unit",
            vec![CaseMetrics {
                precision_at_k: 0.2,
                coverage: 1.0,
                latency_ms: 12.0,
                returned: 5,
                errors: vec!["email timeout: slow".to_string()],
                ..CaseMetrics::new("a")
            }],
            &Thresholds {
                min_precision_at_k: Some(0.5),
                ..Thresholds::default()
            },
            &Tolerances::default(),
            None,
        );
        let md = render_summary(&report);
        assert!(md.contains("FAILED"));
        assert!(md.contains("precision_at_k [*]"));
        assert!(md.contains("a: email timeout: slow"));
    }
}
