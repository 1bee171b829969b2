//! Search planner: [`Intent`] + available backends → [`Plan`].
//!
//! Planning and binding are separate operations. A hop that depends on an
//! entity from the previous hop is planned as a [`StageTemplate`] that
//! knows which fields it will filter on; the literal values are filled in
//! by [`Planner::bind`] once the coordinator has resolved the entity.
//!
//! Temporal and scope words never reach a step's `query`. They exist only
//! as filters built from the target source's declared fields.
//!
//! Count and aggregate intents become a single tally step per source that
//! declares the mode. Other sources are searched as usual.

use chrono::NaiveDate;
use serde::Serialize;

use crate::capabilities::{CapabilityRegistry, SourceCapabilities, SourceClass};
use crate::error::SearchError;
use crate::intent::{DEFAULT_TOP_N, MAX_TOP_N};
use crate::models::{EntityRole, FilterClause, FilterOperator, Intent, RetrievalMethod, SearchMode, SearchStep};
use crate::resolve::ResolvedEntity;
use crate::temporal;

/// Fields that hold an actor's address, in preference order.
pub const ADDRESS_FIELDS: [&str; 2] = ["from_email", "sender_email"];
/// Fields that hold an actor's display name, in preference order.
pub const NAME_FIELDS: [&str; 4] = ["from_name", "sender", "participant", "from"];

const RECIPIENT_ADDRESS_FIELDS: [&str; 2] = ["to_email", "recipient_email"];
const RECIPIENT_NAME_FIELDS: [&str; 3] = ["to_name", "recipient", "to"];
const PARTICIPANT_FIELDS: [&str; 2] = ["participant", "attendee"];

/// Sources searched when nothing was hinted.
const BROAD_SEARCH_SOURCES: usize = 3;

/// How a dependent stage's source will receive the resolved entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceBinding {
    pub source: String,
    pub address_field: Option<(String, FilterOperator)>,
    pub name_field: Option<(String, FilterOperator)>,
    /// True when the name can be sent as a text query instead.
    pub query_fallback: bool,
    /// Filters that do not depend on the entity (temporal scope).
    pub base_filters: Vec<FilterClause>,
    /// Topical query carried over from the request. Empty when the source
    /// takes no text or the request had no topic.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
}

impl SourceBinding {
    fn can_bind(&self) -> bool {
        self.address_field.is_some() || self.name_field.is_some() || self.query_fallback
    }
}

/// A stage whose steps are finalized only after entity resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTemplate {
    pub bindings: Vec<SourceBinding>,
}

impl StageTemplate {
    /// True when every binding can only be expressed with an address.
    pub fn requires_address(&self) -> bool {
        !self.bindings.is_empty()
            && self
                .bindings
                .iter()
                .all(|b| b.address_field.is_some() && b.name_field.is_none() && !b.query_fallback)
    }

    pub fn sources(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.source.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum StageKind {
    Ready(Vec<SearchStep>),
    Dependent(StageTemplate),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub index: usize,
    pub goal: String,
    pub kind: StageKind,
}

impl Stage {
    pub fn sources(&self) -> Vec<String> {
        match &self.kind {
            StageKind::Ready(steps) => {
                let mut out: Vec<String> = Vec::new();
                for step in steps {
                    if !out.contains(&step.source) {
                        out.push(step.source.clone());
                    }
                }
                out
            }
            StageKind::Dependent(template) => template.sources(),
        }
    }
}

/// Ordered stages. Steps within a stage run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub stages: Vec<Stage>,
    pub notes: Vec<String>,
}

impl Plan {
    pub fn step_count(&self) -> usize {
        self.stages
            .iter()
            .map(|s| match &s.kind {
                StageKind::Ready(steps) => steps.len(),
                StageKind::Dependent(t) => t.bindings.len(),
            })
            .sum()
    }
}

pub struct Planner<'a> {
    registry: &'a CapabilityRegistry,
    reference: NaiveDate,
}

impl<'a> Planner<'a> {
    /// `reference` is the date relative temporal phrases are measured from.
    pub fn new(registry: &'a CapabilityRegistry, reference: NaiveDate) -> Self {
        Self { registry, reference }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.registry
    }

    pub fn reference(&self) -> NaiveDate {
        self.reference
    }

    /// Build the plan for `intent` over the `available` backends.
    pub fn plan(&self, intent: &Intent, available: &[String]) -> Result<Plan, SearchError> {
        let available: Vec<&SourceCapabilities> = available
            .iter()
            .filter_map(|name| {
                let caps = self.registry.get(name);
                if caps.is_none() {
                    tracing::warn!(source = %name, "available backend has no registered capabilities");
                }
                caps
            })
            .collect();
        if available.is_empty() {
            return Err(SearchError::Planning("no backends available".to_string()));
        }
        let is_available = |name: &str| available.iter().any(|c| c.name == name);

        let mut notes = Vec::new();
        let mut stages = Vec::new();

        if intent.is_multi_hop() {
            for (i, hop) in intent.retrieval_plan.iter().enumerate() {
                let sources: Vec<&str> = hop
                    .sources
                    .iter()
                    .map(String::as_str)
                    .filter(|s| {
                        let ok = is_available(*s);
                        if !ok {
                            notes.push(format!("hop {}: source '{}' unavailable", i + 1, s));
                        }
                        ok
                    })
                    .collect();
                let kind = if hop.entity_from_previous && i > 0 {
                    StageKind::Dependent(self.template_for(&sources, intent))
                } else {
                    self.note_untallied(&sources, intent, &mut notes);
                    StageKind::Ready(sources.iter().flat_map(|s| self.steps_for_source(s, intent)).collect())
                };
                stages.push(Stage {
                    index: i,
                    goal: hop.goal.clone(),
                    kind,
                });
            }
        } else {
            let mut sources: Vec<&str> = Vec::new();
            for hint in &intent.source_hints {
                if is_available(hint.as_str()) {
                    sources.push(hint);
                } else {
                    notes.push(format!("source '{}' unavailable", hint));
                }
            }
            if intent.source_hints.is_empty() {
                sources = available
                    .iter()
                    .filter(|c| c.class == SourceClass::Personal)
                    .take(BROAD_SEARCH_SOURCES)
                    .map(|c| c.name.as_str())
                    .collect();
                if sources.is_empty() {
                    sources = available.iter().take(BROAD_SEARCH_SOURCES).map(|c| c.name.as_str()).collect();
                }
                notes.push(format!("no source mentioned; searching {}", sources.join(", ")));
            }
            self.note_untallied(&sources, intent, &mut notes);
            stages.push(Stage {
                index: 0,
                goal: intent.goal.to_string(),
                kind: StageKind::Ready(sources.iter().flat_map(|s| self.steps_for_source(s, intent)).collect()),
            });
        }

        let plan = Plan { stages, notes };
        if plan.step_count() == 0 {
            return Err(SearchError::Planning(
                "no search step can be built for the requested sources".to_string(),
            ));
        }
        tracing::debug!(stages = plan.stages.len(), steps = plan.step_count(), "planned");
        Ok(plan)
    }

    /// Steps for one source of a simple intent or a non-dependent hop.
    ///
    /// Invalid steps are dropped with a warning.
    pub fn steps_for_source(&self, source: &str, intent: &Intent) -> Vec<SearchStep> {
        let Some(caps) = self.registry.get(source) else {
            tracing::warn!(source, "skipping unregistered source");
            return Vec::new();
        };

        let mut filters = self.temporal_filters(intent, caps);
        let mut terms = intent.keywords.clone();
        for entity in &intent.entities {
            match entity_filter(caps, entity.role, &entity.name, entity.attribute.as_deref()) {
                Some(filter) => filters.push(filter),
                None if caps.accepts_text_query() && entity.role != EntityRole::Topic => {
                    terms.push(entity.name.clone());
                }
                None => {}
            }
            if entity.role == EntityRole::Topic && !terms.contains(&entity.name) {
                terms.push(entity.name.clone());
            }
        }
        let query = terms.join(" ");
        let limit = caps.default_limit.max(1);

        if !intent.mode.is_search() {
            if let Some(step) = tally_step(caps, intent, &query, &filters) {
                match self.registry.validate_step(&step) {
                    Ok(()) => return vec![step],
                    Err(e) => tracing::debug!(source, error = %e, "tally step rejected; planning a search"),
                }
            }
        }

        let mut steps = Vec::new();
        if !filters.is_empty() && caps.supports_method(RetrievalMethod::Structured) {
            steps.push(step_with(source, &[RetrievalMethod::Structured], "", &filters, limit, "filters"));
        }
        if !query.is_empty() {
            if caps.supports_method(RetrievalMethod::Fulltext) {
                let mut methods = vec![RetrievalMethod::Fulltext];
                if !filters.is_empty() && caps.supports_method(RetrievalMethod::Structured) {
                    methods.push(RetrievalMethod::Structured);
                }
                steps.push(step_with(source, &methods, &query, &filters, limit, "keyword"));
            }
            if caps.supports_method(RetrievalMethod::Vector) {
                steps.push(step_with(source, &[RetrievalMethod::Vector], &query, &filters, limit, "vector"));
            }
        }
        if steps.is_empty() && !caps.requires_query {
            if let Some(first) = caps.methods.iter().next() {
                steps.push(step_with(source, &[*first], "", &filters, limit, "fallback"));
            }
        }

        steps
            .into_iter()
            .filter(|step| match self.registry.validate_step(step) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(source, step = %step, error = %e, "dropping invalid step");
                    false
                }
            })
            .collect()
    }

    fn note_untallied(&self, sources: &[&str], intent: &Intent, notes: &mut Vec<String>) {
        if intent.mode.is_search() {
            return;
        }
        for source in sources {
            let Some(caps) = self.registry.get(source) else { continue };
            let grouped = intent.mode != SearchMode::Aggregate || caps.pick_group_by(intent.group_by.as_deref()).is_some();
            if !caps.supports_mode(intent.mode) || !grouped {
                notes.push(format!("'{}' cannot answer {} requests; searching instead", source, intent.mode));
            }
        }
    }

    fn temporal_filters(&self, intent: &Intent, caps: &SourceCapabilities) -> Vec<FilterClause> {
        intent
            .temporal
            .as_deref()
            .and_then(temporal::detect)
            .map(|spec| temporal::temporal_filters(&spec, caps, self.reference))
            .unwrap_or_default()
    }

    fn template_for(&self, sources: &[&str], intent: &Intent) -> StageTemplate {
        let bindings = sources
            .iter()
            .filter_map(|s| self.registry.get(s))
            .map(|caps| SourceBinding {
                source: caps.name.clone(),
                address_field: caps.pick_field(&ADDRESS_FIELDS),
                name_field: caps.pick_field(&NAME_FIELDS),
                query_fallback: caps.accepts_text_query(),
                base_filters: self.temporal_filters(intent, caps),
                topic: if caps.accepts_text_query() { topic_query(intent) } else { String::new() },
            })
            .filter(|b| {
                if !b.can_bind() {
                    tracing::warn!(source = %b.source, "source cannot take a resolved entity");
                }
                b.can_bind()
            })
            .collect();
        StageTemplate { bindings }
    }

    /// Finalize a dependent stage with the entity resolved from the
    /// previous stage.
    ///
    /// Address fields win when an address is known, then name fields, then
    /// the name as a text query. The request's topic rides along as the
    /// query wherever the source can take text.
    pub fn bind(&self, template: &StageTemplate, entity: &ResolvedEntity) -> Vec<SearchStep> {
        let mut out = Vec::new();
        for binding in &template.bindings {
            let Some(caps) = self.registry.get(&binding.source) else {
                continue;
            };
            let limit = caps.default_limit.max(1);
            let text_methods: Vec<RetrievalMethod> = [RetrievalMethod::Fulltext, RetrievalMethod::Vector]
                .into_iter()
                .filter(|m| caps.supports_method(*m))
                .collect();

            let entity_filter = match (&binding.address_field, &entity.address, &binding.name_field) {
                (Some((field, op)), Some(address), _) => Some(FilterClause::new(field.clone(), *op, address.clone())),
                (_, _, Some((field, op))) => Some(FilterClause::new(field.clone(), *op, entity.name.clone())),
                _ => None,
            };

            let step = match entity_filter {
                Some(filter) => {
                    let mut filters = binding.base_filters.clone();
                    filters.push(filter);
                    let methods: Vec<RetrievalMethod> = if binding.topic.is_empty() {
                        [RetrievalMethod::Structured, RetrievalMethod::Fulltext, RetrievalMethod::Vector]
                            .into_iter()
                            .filter(|m| caps.supports_method(*m))
                            .take(1)
                            .collect()
                    } else {
                        let mut methods: Vec<RetrievalMethod> = text_methods.iter().copied().take(1).collect();
                        if caps.supports_method(RetrievalMethod::Structured) {
                            methods.push(RetrievalMethod::Structured);
                        }
                        methods
                    };
                    step_with(&binding.source, &methods, &binding.topic, &filters, limit, "bound")
                }
                None if binding.query_fallback => {
                    let query = format!("{} {}", entity.name, binding.topic);
                    step_with(&binding.source, &text_methods, query.trim(), &binding.base_filters, limit, "bound")
                }
                None => continue,
            };
            match self.registry.validate_step(&step) {
                Ok(()) => out.push(step),
                Err(e) => tracing::warn!(source = %binding.source, error = %e, "dropping invalid bound step"),
            }
        }
        out
    }
}

/// Keywords plus topic entities, as one query string.
fn topic_query(intent: &Intent) -> String {
    let mut terms = intent.keywords.clone();
    for entity in &intent.entities {
        if entity.role == EntityRole::Topic && !terms.contains(&entity.name) {
            terms.push(entity.name.clone());
        }
    }
    terms.join(" ")
}

/// A filter expressing `role` for this source, if it declares a suitable
/// field.
pub fn entity_filter(
    caps: &SourceCapabilities,
    role: EntityRole,
    name: &str,
    attribute: Option<&str>,
) -> Option<FilterClause> {
    let (address_fields, name_fields): (&[&str], &[&str]) = match role {
        EntityRole::Sender => (&ADDRESS_FIELDS, &NAME_FIELDS),
        EntityRole::Recipient => (&RECIPIENT_ADDRESS_FIELDS, &RECIPIENT_NAME_FIELDS),
        EntityRole::Participant => (&[], &PARTICIPANT_FIELDS),
        _ => return None,
    };
    if let Some(address) = attribute.filter(|a| a.contains('@')) {
        if let Some((field, op)) = caps.pick_field(address_fields) {
            return Some(FilterClause::new(field, op, address));
        }
    }
    caps.pick_field(name_fields)
        .map(|(field, op)| FilterClause::new(field, op, name))
}

/// True when `field` is one of the entity-bearing filter fields.
pub fn is_entity_field(field: &str) -> bool {
    ADDRESS_FIELDS.contains(&field)
        || NAME_FIELDS.contains(&field)
        || RECIPIENT_ADDRESS_FIELDS.contains(&field)
        || RECIPIENT_NAME_FIELDS.contains(&field)
        || PARTICIPANT_FIELDS.contains(&field)
}

/// A count or aggregate step for `caps`, when the source declares the
/// intent's mode (and, for aggregates, some grouping field).
fn tally_step(caps: &SourceCapabilities, intent: &Intent, query: &str, filters: &[FilterClause]) -> Option<SearchStep> {
    if !caps.supports_mode(intent.mode) {
        return None;
    }
    let (group_by, limit) = match intent.mode {
        SearchMode::Aggregate => (
            Some(caps.pick_group_by(intent.group_by.as_deref())?),
            intent.top_n.unwrap_or(DEFAULT_TOP_N).clamp(1, MAX_TOP_N),
        ),
        _ => (None, caps.default_limit.max(1)),
    };
    let preferred: &[RetrievalMethod] = if query.is_empty() {
        &[RetrievalMethod::Structured, RetrievalMethod::Fulltext, RetrievalMethod::Vector]
    } else {
        &[RetrievalMethod::Fulltext, RetrievalMethod::Vector, RetrievalMethod::Structured]
    };
    let method = preferred.iter().copied().find(|m| caps.supports_method(*m))?;
    let step = step_with(&caps.name, &[method], query, filters, limit, intent.mode.as_str());
    Some(step.with_mode(intent.mode, group_by))
}

fn step_with(
    source: &str,
    methods: &[RetrievalMethod],
    query: &str,
    filters: &[FilterClause],
    limit: usize,
    label: &str,
) -> SearchStep {
    let mut step = SearchStep::new(source, methods, query).with_label(label);
    step.filters = filters.to_vec();
    step.limit = limit;
    step
}
