//! Entity resolution between hops.
//!
//! Reduces the top-N ranked results of a stage to the single actor the
//! next stage should search for. Most recent item wins; items without a
//! timestamp come after timestamped ones; ties keep rank order. When
//! nothing qualifies the result is [`Resolution::Unresolved`], which makes
//! the dependent stage skip instead of guessing.
//!
//! After an aggregate stage the entity is the largest group instead; see
//! [`resolve_from_tallies`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::capabilities::{CapabilityRegistry, EntityParser, EntityRule, EntityTarget};
use crate::models::{SearchResult, Tally};
use crate::reasoning::{parse_json_lenient, Reasoner, ReasoningTask};

/// Metadata keys tried when a source declares no entity rules.
const DEFAULT_ACTOR_KEYS: [&str; 4] = ["from", "sender", "author", "organizer"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEntity {
    pub name: String,
    pub address: Option<String>,
    /// Result the entity was read from, as `(source, id)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<(String, String)>,
}

impl ResolvedEntity {
    pub fn new(name: impl Into<String>, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            address,
            origin: None,
        }
    }

    /// `Name <address>` or just the name.
    pub fn display(&self) -> String {
        match &self.address {
            Some(addr) if *addr != self.name => format!("{} <{}>", self.name, addr),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "entity")]
pub enum Resolution {
    Resolved(ResolvedEntity),
    Unresolved,
}

/// Parse an actor header: `"Maria Chen" <maria@acme.com>`, `maria@acme.com`,
/// or a bare name.
pub fn parse_actor(raw: &str) -> Option<ResolvedEntity> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            let address = raw[open + 1..close].trim().to_string();
            let name = clean_name(&raw[..open]);
            let address = (!address.is_empty()).then_some(address);
            return match (name.is_empty(), address) {
                (true, None) => None,
                (true, Some(addr)) => Some(ResolvedEntity::new(addr.clone(), Some(addr))),
                (false, addr) => Some(ResolvedEntity::new(name, addr)),
            };
        }
    }
    if raw.contains('@') && !raw.contains(char::is_whitespace) {
        return Some(ResolvedEntity::new(raw, Some(raw.to_string())));
    }
    let name = clean_name(raw);
    (!name.is_empty()).then(|| ResolvedEntity::new(name, None))
}

fn clean_name(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

/// Parse the reasoner's entity string: `Name (address)`, `Name`, or `NONE`.
pub fn parse_entity_string(raw: &str) -> Resolution {
    let raw = raw.trim().trim_matches('"').trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Resolution::Unresolved;
    }
    if let (Some(open), true) = (raw.rfind('('), raw.ends_with(')')) {
        let address = raw[open + 1..raw.len() - 1].trim();
        let name = clean_name(&raw[..open]);
        if !name.is_empty() {
            let address = (address.contains('@')).then(|| address.to_string());
            return Resolution::Resolved(ResolvedEntity::new(name, address));
        }
    }
    match parse_actor(raw) {
        Some(entity) => Resolution::Resolved(entity),
        None => Resolution::Unresolved,
    }
}

/// Entity named by the largest group among `tallies`. The label is the
/// name when present; the grouped value is the address when it looks like
/// one.
pub fn resolve_from_tallies(tallies: &[Tally]) -> Resolution {
    let top = tallies
        .iter()
        .filter_map(|t| t.top_group().map(|g| (t, g)))
        .max_by(|(_, a), (_, b)| a.count.cmp(&b.count).then_with(|| b.value.cmp(&a.value)));
    let Some((tally, group)) = top else {
        return Resolution::Unresolved;
    };

    let entity = match &group.label {
        Some(label) if !label.trim().is_empty() => {
            let address = (group.value.contains('@')).then(|| group.value.clone());
            Some(ResolvedEntity::new(clean_name(label), address))
        }
        _ => parse_actor(&group.value),
    };
    match entity {
        Some(mut entity) => {
            entity.origin = Some((tally.source.clone(), group.value.clone()));
            Resolution::Resolved(entity)
        }
        None => Resolution::Unresolved,
    }
}

/// Read the actor of one result through its source's entity rules.
pub fn actor_of(result: &SearchResult, registry: &CapabilityRegistry) -> Option<ResolvedEntity> {
    let rules: &[EntityRule] = registry
        .get(&result.source)
        .map(|caps| caps.entity_rules.as_slice())
        .unwrap_or(&[]);

    if rules.is_empty() {
        return DEFAULT_ACTOR_KEYS
            .iter()
            .find_map(|key| result.metadata_text(key).and_then(|v| parse_actor(&v)));
    }

    let mut name: Option<String> = None;
    let mut address: Option<String> = None;
    for rule in rules {
        let Some(value) = result.metadata_text(&rule.metadata_key) else {
            continue;
        };
        match (rule.parser, rule.target) {
            (EntityParser::EmailFromHeader, _) => {
                if let Some(parsed) = parse_actor(&value) {
                    if name.is_none() && parsed.address.as_deref() != Some(parsed.name.as_str()) {
                        name = Some(parsed.name.clone());
                    }
                    address = address.or(parsed.address);
                }
            }
            (EntityParser::Plain, EntityTarget::Name) => {
                name = name.or_else(|| Some(clean_name(&value)).filter(|n| !n.is_empty()));
            }
            (EntityParser::Plain, EntityTarget::Address) => {
                address = address.or_else(|| Some(value.trim().to_string()).filter(|a| !a.is_empty()));
            }
        }
    }
    match (name, address) {
        (Some(name), address) => Some(ResolvedEntity::new(name, address)),
        (None, Some(address)) => Some(ResolvedEntity::new(address.clone(), Some(address))),
        (None, None) => None,
    }
}

/// Deterministic reduction over the first `top_n` ranked results.
pub fn resolve_entity(
    ranked: &[SearchResult],
    registry: &CapabilityRegistry,
    top_n: usize,
    requires_address: bool,
) -> Resolution {
    let mut candidates: Vec<(usize, Option<DateTime<Utc>>, ResolvedEntity)> = ranked
        .iter()
        .take(top_n)
        .enumerate()
        .filter_map(|(rank, result)| {
            let mut entity = actor_of(result, registry)?;
            if requires_address && entity.address.is_none() {
                return None;
            }
            entity.origin = Some((result.source.clone(), result.id.clone()));
            Some((rank, result.timestamp, entity))
        })
        .collect();

    // newest first, untimestamped last, rank order on ties
    candidates.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => y.cmp(&x).then(a.0.cmp(&b.0)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.0.cmp(&b.0),
    });

    match candidates.into_iter().next() {
        Some((_, _, entity)) => Resolution::Resolved(entity),
        None => Resolution::Unresolved,
    }
}

/// [`resolve_entity`], then the reasoner when metadata yields nothing.
pub async fn resolve_with_fallback(
    ranked: &[SearchResult],
    registry: &CapabilityRegistry,
    top_n: usize,
    requires_address: bool,
    reasoner: Option<&dyn Reasoner>,
) -> Resolution {
    let resolution = resolve_entity(ranked, registry, top_n, requires_address);
    let Some(reasoner) = reasoner.filter(|_| resolution == Resolution::Unresolved && !ranked.is_empty()) else {
        return resolution;
    };

    let items: Vec<_> = ranked
        .iter()
        .take(top_n)
        .map(|r| json!({"source": r.source, "title": r.title, "snippet": r.snippet, "timestamp": r.timestamp}))
        .collect();
    let input = json!({"results": items, "requires_address": requires_address});
    let output = match reasoner.complete(ReasoningTask::Entity, &input).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "entity reasoning failed");
            return Resolution::Unresolved;
        }
    };

    let text = match &output {
        serde_json::Value::String(s) => match parse_json_lenient(s) {
            Some(serde_json::Value::Object(obj)) => obj.get("entity").and_then(|v| v.as_str()).map(str::to_string),
            _ => Some(s.clone()),
        },
        serde_json::Value::Object(obj) => obj.get("entity").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    };
    let Some(text) = text else {
        tracing::warn!("entity reasoning returned no entity string");
        return Resolution::Unresolved;
    };
    match parse_entity_string(&text) {
        Resolution::Resolved(entity) if requires_address && entity.address.is_none() => Resolution::Unresolved,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SourceCapabilities;
    use crate::models::RetrievalMethod;
    use crate::reasoning::ScriptedReasoner;
    use chrono::TimeZone;
    use futures::executor::block_on;

    fn result(id: &str, from: Option<&str>, ts: Option<i64>) -> SearchResult {
        let mut r = SearchResult::new("whatsapp", id, id);
        if let Some(f) = from {
            r.metadata.insert("from".to_string(), json!(f));
        }
        r.timestamp = ts.map(|s| Utc.timestamp_opt(s, 0).unwrap());
        r
    }

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register(SourceCapabilities::new("whatsapp", &[RetrievalMethod::Structured]));
        reg
    }

    #[test]
    fn test_parse_actor_forms() {
        assert_eq!(
            parse_actor("\"Maria Chen\" <maria@acme.com>"),
            Some(ResolvedEntity::new("Maria Chen", Some("maria@acme.com".to_string())))
        );
        assert_eq!(
            parse_actor("maria@acme.com"),
            Some(ResolvedEntity::new("maria@acme.com", Some("maria@acme.com".to_string())))
        );
        assert_eq!(parse_actor(" Alex "), Some(ResolvedEntity::new("Alex", None)));
        assert_eq!(parse_actor("  "), None);
    }

    #[test]
    fn test_parse_entity_string() {
        assert_eq!(
            parse_entity_string("Maria Chen (maria@acme.com)"),
            Resolution::Resolved(ResolvedEntity::new("Maria Chen", Some("maria@acme.com".to_string())))
        );
        assert_eq!(parse_entity_string("NONE"), Resolution::Unresolved);
        assert_eq!(parse_entity_string("Alex"), Resolution::Resolved(ResolvedEntity::new("Alex", None)));
    }

    #[test]
    fn test_most_recent_actor_wins() {
        let ranked = vec![
            result("1", Some("Bob"), Some(100)),
            result("2", Some("\"Maria Chen\" <maria@acme.com>"), Some(300)),
            result("3", Some("Carol"), None),
        ];
        let Resolution::Resolved(entity) = resolve_entity(&ranked, &registry(), 10, false) else {
            panic!("expected resolution");
        };
        assert_eq!(entity.display(), "Maria Chen <maria@acme.com>");
        assert_eq!(entity.origin, Some(("whatsapp".to_string(), "2".to_string())));
    }

    #[test]
    fn test_equal_timestamps_keep_rank_order() {
        let ranked = vec![result("1", Some("Bob"), Some(100)), result("2", Some("Alex"), Some(100))];
        let Resolution::Resolved(entity) = resolve_entity(&ranked, &registry(), 10, false) else {
            panic!("expected resolution");
        };
        assert_eq!(entity.name, "Bob");
    }

    #[test]
    fn test_untimestamped_results_use_rank_order() {
        let ranked = vec![result("1", Some("Bob"), None), result("2", Some("Alex"), None)];
        let Resolution::Resolved(entity) = resolve_entity(&ranked, &registry(), 10, false) else {
            panic!("expected resolution");
        };
        assert_eq!(entity.name, "Bob");
    }

    #[test]
    fn test_address_requirement_filters_candidates() {
        let ranked = vec![result("1", Some("Bob"), Some(200)), result("2", Some("Ann <ann@x.org>"), Some(100))];
        let Resolution::Resolved(entity) = resolve_entity(&ranked, &registry(), 10, true) else {
            panic!("expected resolution");
        };
        assert_eq!(entity.name, "Ann");
        assert_eq!(resolve_entity(&ranked[..1], &registry(), 10, true), Resolution::Unresolved);
    }

    #[test]
    fn test_top_n_bounds_the_scan() {
        let ranked = vec![result("1", None, Some(100)), result("2", Some("Alex"), Some(200))];
        assert_eq!(resolve_entity(&ranked, &registry(), 1, false), Resolution::Unresolved);
    }

    #[test]
    fn test_declared_rules_are_used() {
        let mut reg = CapabilityRegistry::new();
        reg.register(
            SourceCapabilities::new("whatsapp", &[RetrievalMethod::Structured])
                .with_entity_rule("contact", EntityParser::Plain, EntityTarget::Name)
                .with_entity_rule("phone", EntityParser::Plain, EntityTarget::Address),
        );
        let mut r = result("1", Some("ignored"), Some(1));
        r.metadata.insert("contact".to_string(), json!("Alex"));
        r.metadata.insert("phone".to_string(), json!("+15551234"));
        assert_eq!(
            actor_of(&r, &reg),
            Some(ResolvedEntity::new("Alex", Some("+15551234".to_string())))
        );
    }

    #[test]
    fn test_reasoner_fallback_when_metadata_is_empty() {
        let ranked = vec![result("1", None, Some(1))];
        let reasoner = ScriptedReasoner::new().with_output(ReasoningTask::Entity, json!({"entity": "Alex (alex@x.org)"}));
        let resolution = block_on(resolve_with_fallback(&ranked, &registry(), 10, false, Some(&reasoner)));
        assert_eq!(
            resolution,
            Resolution::Resolved(ResolvedEntity::new("Alex", Some("alex@x.org".to_string())))
        );
    }

    #[test]
    fn test_reasoner_none_stays_unresolved() {
        let ranked = vec![result("1", None, Some(1))];
        let reasoner = ScriptedReasoner::new().with_output(ReasoningTask::Entity, json!("NONE"));
        let resolution = block_on(resolve_with_fallback(&ranked, &registry(), 10, false, Some(&reasoner)));
        assert_eq!(resolution, Resolution::Unresolved);
    }

    #[test]
    fn test_largest_group_becomes_the_entity() {
        use crate::models::AggregateGroup;
        let mut labelled = AggregateGroup::new("sam@acme.com", 4);
        labelled.label = Some("Sam Ortiz".to_string());
        let tallies = vec![
            Tally::aggregate("email", "from_email", 6, vec![labelled, AggregateGroup::new("bea@acme.com", 2)]),
            Tally::aggregate("whatsapp", "sender", 3, vec![AggregateGroup::new("Alex", 3)]),
            Tally::count("notes", 40),
        ];
        match resolve_from_tallies(&tallies) {
            Resolution::Resolved(e) => {
                assert_eq!(e.name, "Sam Ortiz");
                assert_eq!(e.address.as_deref(), Some("sam@acme.com"));
                assert_eq!(e.origin, Some(("email".to_string(), "sam@acme.com".to_string())));
            }
            other => panic!("expected entity, got {:?}", other),
        }

        let bare = vec![Tally::aggregate("whatsapp", "sender", 3, vec![AggregateGroup::new("Alex", 3)])];
        assert_eq!(
            resolve_from_tallies(&bare),
            Resolution::Resolved(ResolvedEntity {
                name: "Alex".to_string(),
                address: None,
                origin: Some(("whatsapp".to_string(), "Alex".to_string())),
            })
        );
        assert_eq!(resolve_from_tallies(&[Tally::count("notes", 40)]), Resolution::Unresolved);
    }
}
