//! Result fusion and ranking.
//!
//! [`fuse`] merges per-step result lists into one deduplicated list ordered
//! by a weighted fusion score. [`rank`] then produces a permutation over
//! that list. Ranking never drops a result: low-relevance items sort to the
//! tail and truncation is left to the caller.

use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::capabilities::{CapabilityRegistry, SourceClass, SourceKind};
use crate::models::{Goal, Intent, RetrievalMethod, SearchResult};
use crate::reasoning::{parse_json_lenient, Reasoner, ReasoningTask};
use crate::temporal;

const PERSONAL_BOOST: f64 = 0.05;

fn method_weight(method: RetrievalMethod) -> f64 {
    match method {
        RetrievalMethod::Structured => 1.0,
        RetrievalMethod::Fulltext => 0.85,
        RetrievalMethod::Vector => 0.7,
    }
}

/// Best weighted method score plus the class boost.
pub fn fused_score(result: &SearchResult, registry: &CapabilityRegistry) -> f64 {
    let best = result
        .scores
        .iter()
        .map(|(m, s)| method_weight(m) * s)
        .fold(0.0_f64, f64::max);
    let boost = match registry.get(&result.source).map(|c| c.class) {
        Some(SourceClass::Personal) => PERSONAL_BOOST,
        _ => 0.0,
    };
    best + boost
}

/// Merge result lists, deduplicating by `(source, id)`.
///
/// Duplicates keep the first occurrence's position, the max score per
/// method, and the union of their origins. The merged list is ordered by
/// [`fused_score`], ties in first-seen order.
pub fn fuse(lists: Vec<Vec<SearchResult>>, registry: &CapabilityRegistry) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for result in lists.into_iter().flatten() {
        let key = (result.source.clone(), result.id.clone());
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.scores.merge_max(&result.scores);
                for origin in result.origins {
                    if !existing.origins.contains(&origin) {
                        existing.origins.push(origin);
                    }
                }
                if existing.timestamp.is_none() {
                    existing.timestamp = result.timestamp;
                }
                for (k, v) in result.metadata {
                    existing.metadata.entry(k).or_insert(v);
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(result);
            }
        }
    }

    let mut scored: Vec<(f64, SearchResult)> = merged
        .into_iter()
        .map(|r| (fused_score(&r, registry), r))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored.into_iter().map(|(_, r)| r).collect()
}

/// Literal strings from the intent that count toward direct relevance:
/// topical terms, entity names and attributes.
pub fn intent_literals(intent: &Intent) -> Vec<String> {
    let mut out: BTreeSet<String> = intent
        .keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();
    for entity in &intent.entities {
        out.insert(entity.name.to_lowercase());
        if let Some(attr) = &entity.attribute {
            out.insert(attr.to_lowercase());
        }
    }
    out.retain(|l| !l.trim().is_empty());
    out.into_iter().collect()
}

/// Source kinds best suited to a goal.
pub fn preferred_kinds(goal: Goal) -> &'static [SourceKind] {
    match goal {
        Goal::FindPerson | Goal::GetUpdate => &[SourceKind::Mail, SourceKind::Chat],
        Goal::FindEvent => &[SourceKind::Calendar],
        Goal::CheckStatus => &[SourceKind::Tasks],
        Goal::Recall => &[SourceKind::BrowserHistory, SourceKind::Bookmarks],
        Goal::Verify | Goal::Compare => &[SourceKind::Web],
        Goal::FindInformation => &[],
    }
}

fn relevance(result: &SearchResult, literals: &[String]) -> usize {
    if literals.is_empty() {
        return 0;
    }
    let mut haystack = format!("{} {}", result.title, result.snippet).to_lowercase();
    if let Some(p) = &result.provenance {
        haystack.push(' ');
        haystack.push_str(&p.to_lowercase());
    }
    for key in result.metadata.keys() {
        if let Some(text) = result.metadata_text(key) {
            haystack.push(' ');
            haystack.push_str(&text.to_lowercase());
        }
    }
    literals.iter().filter(|l| haystack.contains(l.as_str())).count()
}

fn appropriateness(result: &SearchResult, intent: &Intent, registry: &CapabilityRegistry) -> u8 {
    let kind = registry.get(&result.source).map(|c| c.kind);
    if kind.map(|k| preferred_kinds(intent.goal).contains(&k)).unwrap_or(false) {
        2
    } else if intent.source_hints.iter().any(|h| *h == result.source) {
        1
    } else {
        0
    }
}

/// A total order over `results`, as a permutation of `0..results.len()`.
///
/// Precedence: relevance to intent literals, source appropriateness for
/// the goal, recency (only when the temporal phrase implies it), exact
/// match over vector-only, then input position.
pub fn rank(results: &[SearchResult], intent: &Intent, registry: &CapabilityRegistry) -> Vec<usize> {
    let literals = intent_literals(intent);
    let by_recency = intent
        .temporal
        .as_deref()
        .and_then(temporal::detect)
        .map(|t| t.implies_recency())
        .unwrap_or(false);

    let keys: Vec<(usize, u8, bool)> = results
        .iter()
        .map(|r| (relevance(r, &literals), appropriateness(r, intent, registry), r.scores.has_exact_match()))
        .collect();

    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| {
        let (rel_a, app_a, exact_a) = keys[a];
        let (rel_b, app_b, exact_b) = keys[b];
        rel_b
            .cmp(&rel_a)
            .then(app_b.cmp(&app_a))
            .then_with(|| {
                if !by_recency {
                    return Ordering::Equal;
                }
                match (results[a].timestamp, results[b].timestamp) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            })
            .then(exact_b.cmp(&exact_a))
            .then(a.cmp(&b))
    });
    order
}

/// True when `perm` contains every index `0..n` exactly once.
pub fn is_permutation(perm: &[usize], n: usize) -> bool {
    if perm.len() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for &i in perm {
        if i >= n || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}

/// Turn an untrusted index list into a permutation of `0..n`.
///
/// Out-of-range and duplicate indices are dropped; missing indices are
/// appended in the order of `fallback`.
pub fn repair_permutation(raw: &[i64], n: usize, fallback: &[usize]) -> Vec<usize> {
    let mut seen = vec![false; n];
    let mut out = Vec::with_capacity(n);
    for &i in raw {
        if i < 0 {
            continue;
        }
        let i = i as usize;
        if i < n && !seen[i] {
            seen[i] = true;
            out.push(i);
        }
    }
    for i in fallback.iter().copied().chain(0..n) {
        if i < n && !seen[i] {
            seen[i] = true;
            out.push(i);
        }
    }
    out
}

/// Reorder `items` by `perm`. `perm` must be a permutation of the indices.
pub fn apply_permutation<T>(items: Vec<T>, perm: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    perm.iter().filter_map(|&i| slots.get_mut(i).and_then(Option::take)).collect()
}

/// [`rank`], with the reasoner given the chance to supply the order.
///
/// Reasoner output is repaired into a permutation; any failure falls back
/// to the deterministic order.
pub async fn rank_with_reasoner(
    results: &[SearchResult],
    intent: &Intent,
    registry: &CapabilityRegistry,
    reasoner: &dyn Reasoner,
) -> Vec<usize> {
    let deterministic = rank(results, intent, registry);
    if results.len() < 2 {
        return deterministic;
    }
    let items: Vec<Value> = results
        .iter()
        .enumerate()
        .map(|(i, r)| json!({"index": i, "source": r.source, "title": r.title, "snippet": r.snippet}))
        .collect();
    let input = json!({"intent": intent, "results": items});

    let output = match reasoner.complete(ReasoningTask::Rerank, &input).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "rerank reasoning failed; keeping deterministic order");
            return deterministic;
        }
    };
    let parsed = match output {
        Value::String(s) => parse_json_lenient(&s).unwrap_or(Value::Null),
        other => other,
    };
    let raw = match &parsed {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => obj.get("order").and_then(Value::as_array).cloned().unwrap_or_default(),
        _ => Vec::new(),
    };
    let indices: Vec<i64> = raw.iter().filter_map(Value::as_i64).collect();
    if indices.is_empty() {
        tracing::warn!("rerank reasoning returned no order; keeping deterministic order");
        return deterministic;
    }
    let perm = repair_permutation(&indices, results.len(), &deterministic);
    if indices.len() != results.len() {
        tracing::debug!(returned = indices.len(), expected = results.len(), "repaired rerank permutation");
    }
    perm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SourceCapabilities;
    use crate::models::{Entity, EntityRole, StepId};
    use crate::reasoning::ScriptedReasoner;
    use chrono::{TimeZone, Utc};
    use futures::executor::block_on;
    use RetrievalMethod::*;

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register(SourceCapabilities::new("email", &[Structured, Fulltext, Vector]).with_kind(SourceKind::Mail));
        reg.register(SourceCapabilities::new("web", &[Vector]).with_kind(SourceKind::Web));
        reg.register(SourceCapabilities::new("notes", &[Fulltext, Vector]));
        reg
    }

    fn scored(source: &str, id: &str, method: RetrievalMethod, score: f64) -> SearchResult {
        let mut r = SearchResult::new(source, id, id);
        r.scores.set(method, score);
        r
    }

    #[test]
    fn test_fuse_dedupes_and_merges_scores() {
        let mut a = scored("email", "1", Fulltext, 0.4);
        a.origins.push(StepId::new(0, 0, 0));
        let mut b = scored("email", "1", Vector, 0.9);
        b.origins.push(StepId::new(0, 0, 1));
        let fused = fuse(vec![vec![a], vec![b, scored("web", "1", Vector, 0.2)]], &registry());
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].scores.fulltext, Some(0.4));
        assert_eq!(fused[0].scores.vector, Some(0.9));
        assert_eq!(fused[0].origins.len(), 2);
    }

    #[test]
    fn test_fuse_orders_by_weighted_score() {
        let fused = fuse(
            vec![vec![scored("web", "w", Vector, 0.9), scored("email", "e", Structured, 0.7)]],
            &registry(),
        );
        // 0.7 * 1.0 + boost beats 0.9 * 0.7
        assert_eq!(fused[0].id, "e");
    }

    #[test]
    fn test_relevance_dominates() {
        let mut hit = SearchResult::new("notes", "hit", "Quarterly roadmap");
        hit.snippet = "draft".to_string();
        let miss = SearchResult::new("email", "miss", "Lunch");
        let intent = Intent::new(Goal::FindPerson).with_keywords(&["roadmap"]);
        assert_eq!(rank(&[miss, hit], &intent, &registry()), vec![1, 0]);
    }

    #[test]
    fn test_entity_literal_matches_metadata() {
        let mut from_maria = SearchResult::new("notes", "a", "Re: plan");
        from_maria.metadata.insert("from".to_string(), json!("Maria Chen <maria@acme.com>"));
        let other = SearchResult::new("notes", "b", "Re: plan");
        let intent = Intent::new(Goal::FindInformation).with_entity(Entity::new("Maria Chen", EntityRole::Sender));
        assert_eq!(rank(&[other, from_maria], &intent, &registry()), vec![1, 0]);
    }

    #[test]
    fn test_appropriateness_then_hint() {
        let results = vec![
            SearchResult::new("notes", "n", "x"),
            SearchResult::new("web", "w", "x"),
            SearchResult::new("email", "e", "x"),
        ];
        let intent = Intent::new(Goal::FindPerson).with_sources(&["web"]);
        assert_eq!(rank(&results, &intent, &registry()), vec![2, 1, 0]);
    }

    #[test]
    fn test_recency_only_when_implied() {
        let mut old = SearchResult::new("notes", "old", "x");
        old.timestamp = Some(Utc.timestamp_opt(100, 0).unwrap());
        let mut new = SearchResult::new("notes", "new", "x");
        new.timestamp = Some(Utc.timestamp_opt(200, 0).unwrap());
        let results = vec![old, new];

        let plain = Intent::new(Goal::FindInformation);
        assert_eq!(rank(&results, &plain, &registry()), vec![0, 1]);
        let recent = Intent::new(Goal::FindInformation).with_temporal("latest");
        assert_eq!(rank(&results, &recent, &registry()), vec![1, 0]);
    }

    #[test]
    fn test_exact_match_beats_vector_only() {
        let results = vec![scored("notes", "v", Vector, 0.9), scored("notes", "f", Fulltext, 0.1)];
        assert_eq!(rank(&results, &Intent::new(Goal::FindInformation), &registry()), vec![1, 0]);
    }

    #[test]
    fn test_repair_permutation() {
        let perm = repair_permutation(&[2, 2, 7, -1, 0], 4, &[3, 1, 0, 2]);
        assert_eq!(perm, vec![2, 0, 3, 1]);
        assert!(is_permutation(&perm, 4));
        assert!(repair_permutation(&[], 0, &[]).is_empty());
    }

    #[test]
    fn test_apply_permutation() {
        assert_eq!(apply_permutation(vec!["a", "b", "c"], &[2, 0, 1]), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_reasoner_order_is_repaired() {
        let results = vec![
            SearchResult::new("notes", "a", "a"),
            SearchResult::new("notes", "b", "b"),
            SearchResult::new("notes", "c", "c"),
        ];
        let reasoner = ScriptedReasoner::new().with_output(ReasoningTask::Rerank, json!({"order": [2, 2, 9]}));
        let perm = block_on(rank_with_reasoner(&results, &Intent::new(Goal::FindInformation), &registry(), &reasoner));
        assert_eq!(perm, vec![2, 0, 1]);
    }

    #[test]
    fn test_reasoner_failure_keeps_deterministic_order() {
        let results = vec![scored("notes", "v", Vector, 0.9), scored("notes", "f", Fulltext, 0.1)];
        let reasoner = ScriptedReasoner::new();
        let perm = block_on(rank_with_reasoner(&results, &Intent::new(Goal::FindInformation), &registry(), &reasoner));
        assert_eq!(perm, vec![1, 0]);
    }
}
