//! Turn orchestration.
//!
//! One call to [`Orchestrator::handle_turn`] takes a conversation through
//! the whole pipeline:
//!
//! ```text
//! conversation ─▶ IntentExtractor ─▶ Planner ─▶ Coordinator ─▶ fuse
//!                                                   │            │
//!                                  refinement round ◀────────────┘ (≤ 2)
//!                                                   │
//!                                              rank ─▶ truncate ─▶ TurnResponse
//! ```
//!
//! Only a planning failure ends a turn early. Backend failures show up in
//! [`TurnResponse::errors`]; skipped stages in [`TurnResponse::stages`].
//! Count and aggregate answers come back in [`TurnResponse::tallies`],
//! next to any results from sources that could only be searched.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use fedsearch_core::capabilities::CapabilityRegistry;
use fedsearch_core::error::SearchError;
use fedsearch_core::intent::{Conversation, IntentExtractor};
use fedsearch_core::models::{Intent, SearchResult, SearchStep, StepId, Tally};
use fedsearch_core::planner::Planner;
use fedsearch_core::rank::{apply_permutation, fuse, rank, rank_with_reasoner};
use fedsearch_core::reasoning::Reasoner;
use fedsearch_core::refine::{RefineInput, Refiner};

use crate::config::{Config, OrchestrationConfig};
use crate::coordinator::{Coordinator, StageReport};
use crate::executor::{Executor, StepOutcome, StepStatus};
use crate::reasoner_http::reasoner_from_config;
use crate::traits::BackendRegistry;

/// A ranked result and the round it first appeared in (0 = initial plan).
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    #[serde(flatten)]
    pub result: SearchResult,
    pub round: usize,
}

/// A step that failed during the turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnError {
    pub source: String,
    pub step: StepId,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: usize,
    pub steps: Vec<StepOutcome>,
    /// Results first seen in this round.
    pub new_results: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub turn_id: Uuid,
    pub intent: Intent,
    pub results: Vec<TurnResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tallies: Vec<Tally>,
    pub errors: Vec<TurnError>,
    pub notes: Vec<String>,
    pub stages: Vec<StageReport>,
    pub rounds: Vec<RoundReport>,
    pub timing_ms: u64,
}

pub struct Orchestrator {
    backends: BackendRegistry,
    capabilities: Arc<CapabilityRegistry>,
    executor: Executor,
    reasoner: Option<Arc<dyn Reasoner>>,
    settings: OrchestrationConfig,
}

impl Orchestrator {
    pub fn new(backends: BackendRegistry, reasoner: Option<Arc<dyn Reasoner>>, settings: OrchestrationConfig) -> Self {
        let capabilities = Arc::new(backends.capability_registry());
        let executor = Executor::new(
            backends.clone(),
            capabilities.clone(),
            Duration::from_millis(settings.step_timeout_ms),
        );
        Self {
            backends,
            capabilities,
            executor,
            reasoner,
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let backends = BackendRegistry::from_config(config)?;
        let reasoner = reasoner_from_config(&config.reasoning)?;
        Ok(Self::new(backends, reasoner, config.orchestration.clone()))
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn settings(&self) -> &OrchestrationConfig {
        &self.settings
    }

    /// Run one turn for the latest user message of `conversation`.
    pub async fn handle_turn(&self, conversation: &Conversation) -> Result<TurnResponse, SearchError> {
        let request = conversation.latest_request();
        let extractor = IntentExtractor::new(&self.capabilities, self.reasoner.as_deref());
        let intent = extractor.extract(conversation).await;
        self.run_with_intent(&request, intent).await
    }

    /// Run one turn for an already-extracted intent.
    pub async fn run_with_intent(&self, request: &str, intent: Intent) -> Result<TurnResponse, SearchError> {
        let turn_id = Uuid::new_v4();
        let span = tracing::info_span!("turn", turn_id = %turn_id);
        self.run_turn(turn_id, request, intent).instrument(span).await
    }

    async fn run_turn(&self, turn_id: Uuid, request: &str, intent: Intent) -> Result<TurnResponse, SearchError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.settings.turn_timeout_ms);
        let registry: &CapabilityRegistry = &self.capabilities;
        tracing::info!(goal = %intent.goal, sources = ?intent.source_hints, multi_hop = intent.is_multi_hop(), "turn started");

        let planner = Planner::new(registry, self.settings.reference());
        let plan = match planner.plan(&intent, &self.backends.names()) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "planning failed");
                return Err(e);
            }
        };
        let mut notes = plan.notes.clone();
        tracing::debug!(stages = plan.stages.len(), steps = plan.step_count(), "plan ready");

        let coordinator = Coordinator::new(&planner, &self.executor, self.reasoner.as_deref(), self.settings.resolution_top_n);
        let outcome = coordinator.run(&plan, &intent, deadline).await;

        let mut lists = outcome.lists;
        let mut issued = outcome.issued;
        let mut tallies = outcome.tallies;
        let mut merged = fuse(lists.clone(), registry);

        let refiner = Refiner::new(&planner, self.settings.refinement_policy());
        let mut rounds: Vec<RoundReport> = Vec::new();
        for round in 1..=refiner.policy().rounds() {
            if Instant::now() >= deadline {
                notes.push("refinement stopped: turn deadline reached".to_string());
                break;
            }
            let proposed = refiner.propose(&RefineInput {
                original_request: request,
                intent: &intent,
                results: &merged,
                previous_steps: &issued,
                skipped_sources: &outcome.skipped_sources,
            });
            if proposed.is_empty() {
                tracing::debug!(round, "refinement converged");
                break;
            }
            tracing::info!(round, steps = proposed.len(), "refinement round");

            let batch: Vec<(StepId, SearchStep)> = proposed
                .into_iter()
                .enumerate()
                .map(|(i, step)| (StepId::new(round, 0, i), step))
                .collect();
            issued.extend(batch.iter().map(|(_, s)| s.clone()));
            let steps = self.executor.execute_all(batch, deadline).await;

            let known: BTreeSet<(String, String)> =
                merged.iter().map(|r| (r.source.clone(), r.id.clone())).collect();
            lists.extend(steps.iter().map(|o| o.results.clone()));
            tallies.extend(steps.iter().filter_map(|o| o.tally.clone()));
            merged = fuse(lists.clone(), registry);
            let new_results = merged
                .iter()
                .filter(|r| !known.contains(&(r.source.clone(), r.id.clone())))
                .count();

            rounds.push(RoundReport {
                round,
                steps,
                new_results,
            });
        }

        let perm = match (&self.reasoner, self.settings.rerank_with_reasoning) {
            (Some(reasoner), true) => rank_with_reasoner(&merged, &intent, registry, reasoner.as_ref()).await,
            _ => rank(&merged, &intent, registry),
        };
        let mut ranked = apply_permutation(merged, &perm);
        ranked.truncate(self.settings.final_limit);

        let all_outcomes = outcome
            .stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .chain(rounds.iter().flat_map(|r| r.steps.iter()));
        let errors: Vec<TurnError> = all_outcomes
            .filter_map(|o| match &o.status {
                StepStatus::Failed { kind, message } => Some(TurnError {
                    source: o.step.source.clone(),
                    step: o.id,
                    kind: kind.clone(),
                    message: message.clone(),
                }),
                _ => None,
            })
            .collect();

        let results: Vec<TurnResult> = ranked
            .into_iter()
            .map(|result| {
                let round = result.first_round();
                TurnResult { result, round }
            })
            .collect();

        let timing_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            results = results.len(),
            tallies = tallies.len(),
            errors = errors.len(),
            rounds = rounds.len(),
            elapsed_ms = timing_ms,
            "turn finished"
        );

        Ok(TurnResponse {
            turn_id,
            intent,
            results,
            tallies,
            errors,
            notes,
            stages: outcome.stages,
            rounds,
            timing_ms,
        })
    }
}
