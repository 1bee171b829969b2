//! Intent extraction: conversation → [`Intent`].
//!
//! Extraction runs in two layers:
//!
//! 1. A deterministic analyzer ([`analyze`]) reads the latest request and
//!    picks out source mentions, a temporal phrase, sender/recipient
//!    entities, and topical keywords. When it finds at least one source
//!    it is trusted as-is.
//! 2. Otherwise the reasoning capability is asked for an intent. Its JSON
//!    output is untrusted and goes through [`validate_intent`], which
//!    repairs what it can and records every repair as an ambiguity note.
//!
//! Neither layer can fail the turn: a reasoner error or unusable output
//! falls back to the deterministic intent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::capabilities::CapabilityRegistry;
use crate::error::SearchError;
use crate::models::{Complexity, Entity, EntityRole, Goal, HopDescriptor, Intent, RetrievalMethod, SearchMode};
use crate::reasoning::{parse_json_lenient, Reasoner, ReasoningTask};
use crate::temporal;

/// Requests longer than this are truncated before analysis.
pub const MAX_REQUEST_CHARS: usize = 200;

/// Words that never carry topical meaning on their own: function words,
/// request verbs, and scope nouns like "history" or "stuff".
const STOPWORDS: &[&str] = &[
    "a", "about", "activity", "all", "an", "and", "any", "anything", "are", "at", "be", "been", "but",
    "by", "can", "contact", "contacts", "could", "did", "do", "does", "entries", "entry", "every",
    "everything", "find", "for", "from", "get", "give", "had", "has", "have", "history", "how", "i",
    "in", "is", "it", "item", "items", "its", "last", "latest", "list", "look", "me", "message",
    "messages", "mine", "month", "most", "my", "new", "newest", "of", "on", "or", "people", "person",
    "please", "recent", "recently", "search", "should", "show", "some", "someone", "something",
    "stuff", "tell", "that", "the", "their", "them", "there", "these", "they", "thing", "things",
    "this", "those", "to", "today", "up", "was", "week", "were", "what", "when", "where", "which",
    "who", "whom", "whose", "why", "with", "would", "yesterday", "you", "your", "since", "before",
    "after", "until", "sender", "senders", "recipient", "recipients",
];

const NEGATIONS: &[&str] = &["not", "without", "except", "excluding"];

const CROSS_REFERENCES: &[&str] = &["that", "those", "them", "they", "their", "same"];

const COUNT_PHRASES: &[&str] = &["how many", "count", "number of", "total"];
const AGGREGATE_PHRASES: &[&str] = &["top", "breakdown", "grouped", "group by", "per"];

/// Groups returned by an aggregate step unless the request asks otherwise.
pub const DEFAULT_TOP_N: usize = 10;
/// Upper bound on requested groups.
pub const MAX_TOP_N: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

/// The conversation a turn is extracted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A conversation consisting of a single user request.
    pub fn from_request(text: impl Into<String>) -> Self {
        let mut c = Self::default();
        c.push(Role::User, text);
        c
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        self.messages.push(Message {
            role,
            text: text.into(),
        });
    }

    /// The latest user message, trimmed and capped at
    /// [`MAX_REQUEST_CHARS`].
    pub fn latest_request(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User && !m.text.trim().is_empty())
            .map(|m| m.text.trim().chars().take(MAX_REQUEST_CHARS).collect())
            .unwrap_or_default()
    }
}

/// Output of the deterministic analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub intent: Intent,
    /// True when the request names at least one registered source.
    pub confident: bool,
}

/// Deterministic intent analysis of a single request.
pub fn analyze(request: &str, registry: &CapabilityRegistry) -> Analysis {
    let lower = request.to_lowercase();
    let words = words_of(&lower);

    let source_hints = mentioned_sources(&words, registry);
    let temporal_spec = temporal::detect(request);
    let entities = extract_entities(request, registry);

    let mut intent = Intent::new(infer_goal(&words));
    intent.temporal = temporal_spec.as_ref().map(|t| t.phrase());
    intent.entities = entities;
    intent.keywords = topical_terms(request, &intent, registry);
    intent.mode = detect_mode(&words);
    strip_mode_words(&mut intent);

    let cross_ref = words.iter().any(|w| CROSS_REFERENCES.contains(&w.as_str()));
    if source_hints.len() >= 2 && cross_ref {
        intent.complexity = Complexity::MultiHop;
        intent.retrieval_plan = source_hints
            .iter()
            .enumerate()
            .map(|(i, source)| HopDescriptor {
                sources: vec![source.clone()],
                goal: format!("step_{}", i + 1),
                entity_from_previous: i > 0,
            })
            .collect();
    }
    intent.source_hints = source_hints;

    Analysis {
        confident: !intent.source_hints.is_empty(),
        intent,
    }
}

fn words_of(lower: &str) -> Vec<String> {
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '@' || c == '.' || c == '_' || c == '-' || c == '\''))
        .map(|w| w.trim_matches(|c: char| c == '.' || c == '\'' || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn is_alias_word(word: &str, registry: &CapabilityRegistry) -> bool {
    let singular = word.strip_suffix('s').unwrap_or(word);
    registry.iter().any(|caps| {
        caps.alias_set().iter().any(|alias| {
            alias == word || alias == singular || alias.split(' ').any(|part| part == word || part == singular)
        })
    })
}

/// Registered sources mentioned in the request, in order of first mention.
/// Negated mentions ("not email") are excluded.
fn mentioned_sources(words: &[String], registry: &CapabilityRegistry) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    let joined = words.join(" ");

    for caps in registry.iter() {
        let mut first: Option<usize> = None;
        let mut negated = false;
        for alias in caps.alias_set() {
            let alias_words: Vec<&str> = alias.split(' ').collect();
            for start in 0..words.len() {
                let end = start + alias_words.len();
                if end > words.len() {
                    break;
                }
                let matches = words[start..end].iter().zip(&alias_words).all(|(w, a)| {
                    w == a || w.strip_suffix('s') == Some(*a)
                });
                if !matches {
                    continue;
                }
                if start > 0 && NEGATIONS.contains(&words[start - 1].as_str()) {
                    negated = true;
                    continue;
                }
                first = Some(first.map_or(start, |f| f.min(start)));
            }
        }
        if negated && first.is_none() {
            tracing::debug!(source = %caps.name, text = %joined, "source mention negated");
        }
        if let Some(pos) = first {
            found.push((pos, caps.name.clone()));
        }
    }

    found.sort();
    found.into_iter().map(|(_, name)| name).collect()
}

/// `from <Name|address>` → sender, `to <Name|address>` → recipient.
///
/// Names must be capitalized in the original text, which keeps
/// "from yesterday" or "to do" from turning into entities.
fn extract_entities(request: &str, registry: &CapabilityRegistry) -> Vec<Entity> {
    let tokens: Vec<&str> = request
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| matches!(c, ',' | '?' | '!' | ';' | ':' | '"' | '(' | ')')))
        .collect();
    let mut out = Vec::new();

    for i in 0..tokens.len() {
        let role = match tokens[i].to_lowercase().as_str() {
            "from" => EntityRole::Sender,
            "to" => EntityRole::Recipient,
            _ => continue,
        };
        let Some(next) = tokens.get(i + 1) else {
            continue;
        };
        let next = next.trim_end_matches('.');
        if next.contains('@') {
            out.push(Entity::new(next, role).with_attribute(next));
            continue;
        }
        let name: Vec<&str> = tokens[i + 1..]
            .iter()
            .map(|t| t.trim_end_matches('.'))
            .take_while(|t| {
                t.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
                    && !is_alias_word(&t.to_lowercase(), registry)
            })
            .take(3)
            .collect();
        if !name.is_empty() {
            out.push(Entity::new(name.join(" "), role));
        }
    }
    out
}

fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let parts: Vec<&str> = phrase.split(' ').collect();
    words.windows(parts.len()).any(|w| w.iter().zip(&parts).all(|(a, b)| a == b))
}

/// `how many` / `count` ask for a count; `top` / `breakdown` / `per` ask
/// for groups. Count wins when both appear.
pub fn detect_mode(words: &[String]) -> SearchMode {
    if COUNT_PHRASES.iter().any(|p| contains_phrase(words, p)) {
        SearchMode::Count
    } else if AGGREGATE_PHRASES.iter().any(|p| contains_phrase(words, p)) {
        SearchMode::Aggregate
    } else {
        SearchMode::Search
    }
}

/// Drop the words that selected the intent's mode from its keywords.
fn strip_mode_words(intent: &mut Intent) {
    let phrases = match intent.mode {
        SearchMode::Search => return,
        SearchMode::Count => COUNT_PHRASES,
        SearchMode::Aggregate => AGGREGATE_PHRASES,
    };
    intent
        .keywords
        .retain(|k| !phrases.iter().any(|p| p.split(' ').any(|w| w == k)));
}

fn infer_goal(words: &[String]) -> Goal {
    let has = |cands: &[&str]| words.iter().any(|w| cands.contains(&w.as_str()));
    if has(&["who", "contact", "person", "someone", "whom"]) {
        Goal::FindPerson
    } else if has(&["meeting", "meetings", "event", "events", "appointment", "calendar", "scheduled"]) {
        Goal::FindEvent
    } else if has(&["status", "done", "pending", "overdue", "todo", "task", "tasks"]) {
        Goal::CheckStatus
    } else if has(&["update", "updates", "progress"]) {
        Goal::GetUpdate
    } else if has(&["compare", "versus", "vs", "difference"]) {
        Goal::Compare
    } else if has(&["remember", "recall", "visited", "saw"]) {
        Goal::Recall
    } else if has(&["verify", "confirm", "true"]) {
        Goal::Verify
    } else {
        Goal::FindInformation
    }
}

/// Topical terms of `text`: everything left after stop/scope words,
/// source names, the temporal phrase, dates, and entity names are removed.
pub fn topical_terms(text: &str, intent: &Intent, registry: &CapabilityRegistry) -> Vec<String> {
    let lower = text.to_lowercase();
    let temporal_words: BTreeSet<String> = intent
        .temporal
        .as_deref()
        .map(|t| words_of(&t.to_lowercase()).into_iter().collect())
        .unwrap_or_default();
    let entity_words: BTreeSet<String> = intent
        .entities
        .iter()
        .filter(|e| e.role != EntityRole::Topic)
        .flat_map(|e| {
            let mut w = words_of(&e.name.to_lowercase());
            if let Some(attr) = &e.attribute {
                w.push(attr.to_lowercase());
            }
            w
        })
        .collect();

    let mut out: Vec<String> = Vec::new();
    for word in words_of(&lower) {
        if STOPWORDS.contains(&word.as_str())
            || temporal_words.contains(&word)
            || entity_words.contains(&word)
            || is_alias_word(&word, registry)
            || chrono::NaiveDate::parse_from_str(&word, "%Y-%m-%d").is_ok()
            || word.chars().all(|c| !c.is_alphanumeric())
        {
            continue;
        }
        if !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

/// Validate and repair intent JSON from the reasoning capability.
///
/// `fallback` is the deterministic intent for the same request; it
/// supplies keywords when the upstream output has none. Only a non-object
/// payload is rejected outright.
pub fn validate_intent(raw: &Value, registry: &CapabilityRegistry, fallback: &Intent) -> Result<Intent, SearchError> {
    let parsed;
    let raw = match raw {
        Value::String(text) => {
            parsed = parse_json_lenient(text)
                .ok_or_else(|| SearchError::malformed("intent", "output is not JSON"))?;
            &parsed
        }
        other => other,
    };
    let obj = raw
        .as_object()
        .ok_or_else(|| SearchError::malformed("intent", "output is not a JSON object"))?;

    let mut notes: Vec<String> = Vec::new();

    let goal_raw = obj
        .get("goal")
        .or_else(|| obj.get("intent"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let goal = Goal::parse(goal_raw).unwrap_or_else(|| {
        notes.push(format!("unrecognized goal '{}'; using find_information", goal_raw));
        Goal::FindInformation
    });
    let mut intent = Intent::new(goal);

    let mut hints: Vec<String> = Vec::new();
    for hint in string_list(obj.get("source_hints")) {
        match registry.resolve_name(&hint) {
            Some(name) if !hints.contains(&name) => hints.push(name),
            Some(_) => {}
            None => notes.push(format!("unknown source '{}' ignored", hint)),
        }
    }
    intent.source_hints = hints;

    if let Some(entities) = obj.get("entities").and_then(Value::as_array) {
        for e in entities {
            if let Some(entity) = entity_from_json(e) {
                intent.entities.push(entity);
            }
        }
    }

    intent.temporal = obj
        .get("temporal")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if let Some(t) = &intent.temporal {
        if temporal::detect(t).is_none() {
            notes.push(format!("temporal phrase '{}' not understood", t));
        }
    }

    for hint in string_list(obj.get("retrieval_hints")) {
        if let Some(method) = RetrievalMethod::parse(&hint) {
            intent.retrieval_hints.insert(method);
        }
    }

    let complexity = obj
        .get("complexity")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let wants_multi_hop = matches!(complexity.as_str(), "multi_hop" | "multihop" | "multi-hop" | "complex");
    if wants_multi_hop {
        match plan_from_json(obj.get("retrieval_plan"), registry, &mut notes) {
            Some(plan) => {
                intent.complexity = Complexity::MultiHop;
                intent.retrieval_plan = plan;
            }
            None => {
                notes.push("multi-hop plan missing or malformed; planning from source hints".to_string());
            }
        }
    } else if obj.get("retrieval_plan").map(|p| !p.is_null()).unwrap_or(false) {
        tracing::debug!("discarding retrieval_plan on a simple intent");
    }

    let upstream_keywords = string_list(obj.get("keywords")).join(" ");
    let topic_words: Vec<String> = intent
        .entities
        .iter()
        .filter(|e| e.role == EntityRole::Topic)
        .map(|e| e.name.clone())
        .collect();
    let keyword_text = if upstream_keywords.trim().is_empty() {
        fallback.keywords.join(" ")
    } else {
        upstream_keywords
    };
    intent.keywords = topical_terms(&format!("{} {}", keyword_text, topic_words.join(" ")), &intent, registry);

    let mode_raw = obj
        .get("search_mode")
        .or_else(|| obj.get("mode"))
        .and_then(Value::as_str)
        .unwrap_or("");
    intent.mode = if mode_raw.trim().is_empty() {
        fallback.mode
    } else {
        SearchMode::parse(mode_raw).unwrap_or_else(|| {
            notes.push(format!("unrecognized search mode '{}'; using {}", mode_raw, fallback.mode));
            fallback.mode
        })
    };
    if intent.mode == SearchMode::Aggregate {
        intent.group_by = obj
            .get("aggregate_group_by")
            .or_else(|| obj.get("group_by"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);
        intent.top_n = obj
            .get("aggregate_top_n")
            .or_else(|| obj.get("top_n"))
            .and_then(Value::as_u64)
            .map(|n| (n as usize).clamp(1, MAX_TOP_N));
    }
    strip_mode_words(&mut intent);

    intent.ambiguities = string_list(obj.get("ambiguities"));
    intent.ambiguities.extend(notes);
    Ok(intent)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn entity_from_json(value: &Value) -> Option<Entity> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(Value::as_str).unwrap_or("").trim().to_string();
    let attribute = ["attribute", "email", "address"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    let role = EntityRole::parse(obj.get("role").and_then(Value::as_str).unwrap_or(""));
    match (name.is_empty(), attribute) {
        (true, None) => None,
        (true, Some(attr)) => Some(Entity::new(attr.clone(), role).with_attribute(attr)),
        (false, attr) => Some(Entity {
            name,
            role,
            attribute: attr,
        }),
    }
}

/// Returns `None` when the plan is absent or any hop is unusable.
fn plan_from_json(value: Option<&Value>, registry: &CapabilityRegistry, notes: &mut Vec<String>) -> Option<Vec<HopDescriptor>> {
    let hops = value?.as_array()?;
    if hops.is_empty() {
        return None;
    }
    let mut plan = Vec::with_capacity(hops.len());
    for (i, hop) in hops.iter().enumerate() {
        let obj = hop.as_object()?;
        let mut sources: Vec<String> = Vec::new();
        for s in string_list(obj.get("sources")) {
            match registry.resolve_name(&s) {
                Some(name) if !sources.contains(&name) => sources.push(name),
                Some(_) => {}
                None => notes.push(format!("hop {} names unknown source '{}'", i + 1, s)),
            }
        }
        if sources.is_empty() {
            return None;
        }
        let goal = ["goal", "step", "query_focus"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("hop_{}", i + 1));
        let mut from_previous = obj
            .get("entity_from_previous")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if i == 0 && from_previous {
            notes.push("first hop cannot depend on a previous hop".to_string());
            from_previous = false;
        }
        plan.push(HopDescriptor {
            sources,
            goal,
            entity_from_previous: from_previous,
        });
    }
    Some(plan)
}

/// Turns a conversation into a validated [`Intent`].
pub struct IntentExtractor<'a> {
    registry: &'a CapabilityRegistry,
    reasoner: Option<&'a dyn Reasoner>,
}

impl<'a> IntentExtractor<'a> {
    pub fn new(registry: &'a CapabilityRegistry, reasoner: Option<&'a dyn Reasoner>) -> Self {
        Self { registry, reasoner }
    }

    /// Extract the intent for the latest request in `conversation`.
    ///
    /// Deterministic given the same reasoning output.
    pub async fn extract(&self, conversation: &Conversation) -> Intent {
        let request = conversation.latest_request();
        let analysis = analyze(&request, self.registry);

        let reasoner = match self.reasoner {
            Some(r) if !analysis.confident => r,
            _ => {
                tracing::debug!(
                    hints = ?analysis.intent.source_hints,
                    temporal = ?analysis.intent.temporal,
                    "intent (deterministic)"
                );
                return analysis.intent;
            }
        };

        let input = json!({
            "request": request,
            "conversation": conversation.messages,
            "sources": self.registry.names(),
            "goals": Goal::ALL.iter().map(Goal::as_str).collect::<Vec<_>>(),
        });

        let mut fallback = analysis.intent;
        match reasoner.complete(ReasoningTask::Intent, &input).await {
            Ok(output) => match validate_intent(&output, self.registry, &fallback) {
                Ok(intent) => {
                    tracing::debug!(
                        goal = %intent.goal,
                        hints = ?intent.source_hints,
                        complexity = ?intent.complexity,
                        repairs = intent.ambiguities.len(),
                        "intent (reasoner)"
                    );
                    intent
                }
                Err(e) => {
                    tracing::warn!(error = %e, "falling back to deterministic intent");
                    fallback.ambiguities.push(e.to_string());
                    fallback
                }
            },
            Err(e) => {
                tracing::warn!(reasoner = reasoner.name(), error = %e, "reasoner failed; using deterministic intent");
                fallback.ambiguities.push("reasoning capability unavailable".to_string());
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{SourceCapabilities, SourceKind};
    use crate::models::RetrievalMethod::*;
    use crate::reasoning::ScriptedReasoner;
    use futures::executor::block_on;

    fn registry() -> CapabilityRegistry {
        let mut reg = CapabilityRegistry::new();
        reg.register(
            SourceCapabilities::new("email", &[Structured, Fulltext, Vector])
                .with_kind(SourceKind::Mail)
                .with_aliases(&["mail", "gmail", "inbox"]),
        );
        reg.register(
            SourceCapabilities::new("whatsapp", &[Structured, Fulltext])
                .with_kind(SourceKind::Chat)
                .with_aliases(&["chat"]),
        );
        reg.register(SourceCapabilities::new("browser_history", &[Structured, Vector]).with_kind(SourceKind::BrowserHistory));
        reg
    }

    #[test]
    fn test_latest_request_picks_last_user_message() {
        let mut c = Conversation::from_request("first");
        c.push(Role::Assistant, "answer");
        c.push(Role::User, "  second  ");
        assert_eq!(c.latest_request(), "second");
    }

    #[test]
    fn test_purely_temporal_request_has_no_keywords() {
        let a = analyze("show me my recent history", &registry());
        assert!(a.intent.keywords.is_empty(), "keywords: {:?}", a.intent.keywords);
        assert_eq!(a.intent.temporal.as_deref(), Some("recent"));
        assert_eq!(a.intent.source_hints, vec!["browser_history".to_string()]);
    }

    #[test]
    fn test_topical_terms_survive() {
        let a = analyze("find the quarterly roadmap email from Maria Chen last week", &registry());
        assert_eq!(a.intent.keywords, vec!["quarterly".to_string(), "roadmap".to_string()]);
        assert_eq!(a.intent.entities, vec![Entity::new("Maria Chen", EntityRole::Sender)]);
        assert_eq!(a.intent.temporal.as_deref(), Some("last week"));
        assert!(a.confident);
    }

    #[test]
    fn test_sender_address_is_attribute() {
        let a = analyze("mail from maria@acme.com", &registry());
        assert_eq!(a.intent.entities[0].attribute.as_deref(), Some("maria@acme.com"));
        assert!(a.intent.keywords.is_empty());
    }

    #[test]
    fn test_negated_source_is_not_hinted() {
        let a = analyze("budget notes, not email", &registry());
        assert!(a.intent.source_hints.is_empty());
        assert!(!a.confident);
    }

    #[test]
    fn test_cross_reference_builds_multi_hop_plan() {
        let a = analyze("who did I chat with last on whatsapp and what did they email me", &registry());
        assert_eq!(a.intent.complexity, Complexity::MultiHop);
        assert_eq!(a.intent.retrieval_plan.len(), 2);
        assert_eq!(a.intent.retrieval_plan[0].sources, vec!["whatsapp".to_string()]);
        assert!(!a.intent.retrieval_plan[0].entity_from_previous);
        assert!(a.intent.retrieval_plan[1].entity_from_previous);
    }

    #[test]
    fn test_count_request_is_detected() {
        let a = analyze("how many emails did I get yesterday", &registry());
        assert_eq!(a.intent.mode, SearchMode::Count);
        assert!(a.intent.keywords.iter().all(|k| k != "many"), "keywords: {:?}", a.intent.keywords);
        assert_eq!(a.intent.temporal.as_deref(), Some("yesterday"));
    }

    #[test]
    fn test_breakdown_request_is_aggregate() {
        let a = analyze("top senders in my inbox this month", &registry());
        assert_eq!(a.intent.mode, SearchMode::Aggregate);
        assert!(a.intent.keywords.is_empty(), "keywords: {:?}", a.intent.keywords);

        let plain = analyze("budget email", &registry());
        assert_eq!(plain.intent.mode, SearchMode::Search);
    }

    #[test]
    fn test_validate_reads_aggregate_fields() {
        let raw = json!({
            "goal": "find_person",
            "source_hints": ["whatsapp"],
            "search_mode": "aggregate",
            "aggregate_group_by": "sender",
            "aggregate_top_n": 500
        });
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::FindPerson)).unwrap();
        assert_eq!(intent.mode, SearchMode::Aggregate);
        assert_eq!(intent.group_by.as_deref(), Some("sender"));
        assert_eq!(intent.top_n, Some(MAX_TOP_N));

        let unknown = json!({"goal": "find_person", "search_mode": "sum"});
        let fallback = Intent::new(Goal::FindPerson).with_mode(SearchMode::Count);
        let intent = validate_intent(&unknown, &registry(), &fallback).unwrap();
        assert_eq!(intent.mode, SearchMode::Count);
        assert!(intent.ambiguities.iter().any(|n| n.contains("sum")));
    }

    #[test]
    fn test_validate_repairs_unknown_sources_and_goal() {
        let raw = json!({
            "goal": "summarize",
            "source_hints": ["gmail", "slack"],
            "complexity": "simple"
        });
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::FindInformation)).unwrap();
        assert_eq!(intent.goal, Goal::FindInformation);
        assert_eq!(intent.source_hints, vec!["email".to_string()]);
        assert!(intent.ambiguities.iter().any(|n| n.contains("slack")));
        assert!(intent.ambiguities.iter().any(|n| n.contains("summarize")));
    }

    #[test]
    fn test_validate_downgrades_empty_multi_hop() {
        let raw = json!({"goal": "find_person", "complexity": "multi_hop", "retrieval_plan": []});
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::FindInformation)).unwrap();
        assert_eq!(intent.complexity, Complexity::Simple);
        assert!(intent.retrieval_plan.is_empty());
    }

    #[test]
    fn test_validate_downgrades_plan_with_unusable_hop() {
        let raw = json!({
            "goal": "find_person",
            "complexity": "multi_hop",
            "retrieval_plan": [{"sources": ["whatsapp"]}, {"sources": ["slack"], "entity_from_previous": true}]
        });
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::FindInformation)).unwrap();
        assert_eq!(intent.complexity, Complexity::Simple);
    }

    #[test]
    fn test_validate_clears_first_hop_dependency() {
        let raw = json!({
            "goal": "find_person",
            "complexity": "multi_hop",
            "retrieval_plan": [
                {"sources": ["whatsapp"], "goal": "find_latest_contact", "entity_from_previous": true},
                {"sources": ["email"], "goal": "find_email_from_contact", "entity_from_previous": true}
            ]
        });
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::FindInformation)).unwrap();
        assert!(intent.is_multi_hop());
        assert!(!intent.retrieval_plan[0].entity_from_previous);
        assert!(intent.retrieval_plan[1].entity_from_previous);
    }

    #[test]
    fn test_validate_strips_temporal_words_from_keywords() {
        let raw = json!({"goal": "recall", "temporal": "recent", "keywords": ["recent", "history"]});
        let intent = validate_intent(&raw, &registry(), &Intent::new(Goal::Recall)).unwrap();
        assert!(intent.keywords.is_empty());
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let err = validate_intent(&json!([1, 2]), &registry(), &Intent::new(Goal::Recall)).unwrap_err();
        assert!(matches!(err, SearchError::MalformedUpstreamOutput { .. }));
    }

    #[test]
    fn test_extractor_skips_reasoner_when_confident() {
        let reg = registry();
        let reasoner = ScriptedReasoner::new();
        let extractor = IntentExtractor::new(&reg, Some(&reasoner));
        let intent = block_on(extractor.extract(&Conversation::from_request("latest whatsapp messages")));
        assert_eq!(intent.source_hints, vec!["whatsapp".to_string()]);
        assert!(reasoner.calls().is_empty());
    }

    #[test]
    fn test_extractor_falls_back_when_reasoner_fails() {
        let reg = registry();
        let reasoner = ScriptedReasoner::new();
        let extractor = IntentExtractor::new(&reg, Some(&reasoner));
        let intent = block_on(extractor.extract(&Conversation::from_request("what was the budget number")));
        assert_eq!(reasoner.calls(), vec![ReasoningTask::Intent]);
        assert!(intent.ambiguities.iter().any(|n| n.contains("unavailable")));
        assert_eq!(intent.keywords, vec!["budget".to_string(), "number".to_string()]);
    }

    #[test]
    fn test_extractor_uses_validated_reasoner_output() {
        let reg = registry();
        let reasoner = ScriptedReasoner::new().with_output(
            ReasoningTask::Intent,
            Value::String("```json\n{\"goal\": \"find_information\", \"source_hints\": [\"mail\"]}\n```".to_string()),
        );
        let extractor = IntentExtractor::new(&reg, Some(&reasoner));
        let intent = block_on(extractor.extract(&Conversation::from_request("what was the budget number")));
        assert_eq!(intent.source_hints, vec!["email".to_string()]);
        assert_eq!(intent.keywords, vec!["budget".to_string(), "number".to_string()]);
    }
}
