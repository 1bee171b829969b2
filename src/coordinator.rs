//! Multi-hop coordinator.
//!
//! Executes a [`Plan`] stage by stage. Steps inside a stage fan out
//! concurrently; stages run strictly in order because a dependent stage
//! needs the entity resolved from the stage before it.
//!
//! ```text
//! Pending ─▶ Executing(0) ─▶ Resolving(0) ─▶ Executing(1) ─▶ … ─▶ Done
//!                                  │
//!                                  └─ Unresolved ─▶ stage 1 Skipped
//! ```
//!
//! A broken link never fails the plan. When resolution finds nobody, or
//! the previous stage was itself skipped, the dependent stage is marked
//! [`StageStatus::Skipped`] and the coordinator moves on with whatever the
//! earlier stages found.
//!
//! When the previous stage answered with aggregate groups rather than
//! results, the largest group is the entity the dependent stage binds to.

use serde::Serialize;
use std::collections::BTreeSet;
use tokio::time::Instant;

use fedsearch_core::models::{Intent, SearchResult, SearchStep, StepId, Tally};
use fedsearch_core::planner::{Plan, Planner, StageKind};
use fedsearch_core::rank::{apply_permutation, fuse, rank};
use fedsearch_core::reasoning::Reasoner;
use fedsearch_core::resolve::{resolve_from_tallies, resolve_with_fallback, Resolution, ResolvedEntity};

use crate::executor::{Executor, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum CoordinatorState {
    Pending,
    Executing(usize),
    Resolving(usize),
    Done,
    /// The plan itself was inconsistent, e.g. a dependent first stage.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub goal: String,
    #[serde(flatten)]
    pub status: StageStatus,
    /// Entity the stage was bound to, for dependent stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedEntity>,
    pub steps: Vec<StepOutcome>,
}

impl StageReport {
    fn skipped(index: usize, goal: &str, reason: impl Into<String>) -> Self {
        Self {
            index,
            goal: goal.to_string(),
            status: StageStatus::Skipped { reason: reason.into() },
            resolved: None,
            steps: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, StageStatus::Skipped { .. })
    }
}

/// Everything a plan run produced.
#[derive(Debug, Default)]
pub struct PlanOutcome {
    pub stages: Vec<StageReport>,
    /// One result list per executed step.
    pub lists: Vec<Vec<SearchResult>>,
    /// Every step dispatched, bound steps included.
    pub issued: Vec<SearchStep>,
    /// Count and aggregate answers, in dispatch order.
    pub tallies: Vec<Tally>,
    /// Sources of skipped stages; refinement leaves them alone.
    pub skipped_sources: BTreeSet<String>,
    pub transitions: Vec<CoordinatorState>,
}

impl PlanOutcome {
    pub fn final_state(&self) -> CoordinatorState {
        self.transitions.last().copied().unwrap_or(CoordinatorState::Pending)
    }

    fn enter(&mut self, state: CoordinatorState) {
        tracing::debug!(?state, "coordinator transition");
        self.transitions.push(state);
    }
}

pub struct Coordinator<'a> {
    planner: &'a Planner<'a>,
    executor: &'a Executor,
    reasoner: Option<&'a dyn Reasoner>,
    top_n: usize,
}

impl<'a> Coordinator<'a> {
    pub fn new(planner: &'a Planner<'a>, executor: &'a Executor, reasoner: Option<&'a dyn Reasoner>, top_n: usize) -> Self {
        Self {
            planner,
            executor,
            reasoner,
            top_n,
        }
    }

    /// Execute `plan` for the initial round of a turn.
    pub async fn run(&self, plan: &Plan, intent: &Intent, turn_deadline: Instant) -> PlanOutcome {
        let registry = self.planner.registry();
        let mut out = PlanOutcome::default();
        out.enter(CoordinatorState::Pending);

        // ranked results of the previous stage; None when it was skipped
        let mut previous: Option<Vec<SearchResult>> = None;
        let mut previous_tallies: Vec<Tally> = Vec::new();

        for (pos, stage) in plan.stages.iter().enumerate() {
            if out.final_state() == CoordinatorState::Failed {
                out.skipped_sources.extend(stage.sources());
                out.stages.push(StageReport::skipped(stage.index, &stage.goal, "plan aborted"));
                continue;
            }
            let last_tallies = std::mem::take(&mut previous_tallies);
            if Instant::now() >= turn_deadline {
                tracing::warn!(stage = stage.index, "turn deadline reached; skipping stage");
                out.skipped_sources.extend(stage.sources());
                out.stages.push(StageReport::skipped(stage.index, &stage.goal, "turn deadline reached"));
                previous = None;
                continue;
            }

            let mut resolved = None;
            let steps = match &stage.kind {
                StageKind::Ready(steps) => steps.clone(),
                StageKind::Dependent(template) => {
                    if pos == 0 {
                        tracing::error!(stage = stage.index, "dependent stage has no predecessor");
                        out.enter(CoordinatorState::Failed);
                        out.skipped_sources.extend(stage.sources());
                        out.stages.push(StageReport::skipped(
                            stage.index,
                            &stage.goal,
                            "dependent stage has no predecessor",
                        ));
                        continue;
                    }
                    let Some(ranked) = previous.as_deref() else {
                        out.skipped_sources.extend(stage.sources());
                        out.stages.push(StageReport::skipped(
                            stage.index,
                            &stage.goal,
                            "previous stage was skipped",
                        ));
                        continue;
                    };

                    out.enter(CoordinatorState::Resolving(plan.stages[pos - 1].index));
                    let resolution = match resolve_from_tallies(&last_tallies) {
                        found @ Resolution::Resolved(_) => found,
                        Resolution::Unresolved => {
                            resolve_with_fallback(
                                ranked,
                                registry,
                                self.top_n,
                                template.requires_address(),
                                self.reasoner,
                            )
                            .await
                        }
                    };
                    let entity = match resolution {
                        Resolution::Resolved(entity) => entity,
                        Resolution::Unresolved => {
                            tracing::info!(stage = stage.index, "no entity resolved; skipping dependent stage");
                            out.skipped_sources.extend(stage.sources());
                            out.stages.push(StageReport::skipped(
                                stage.index,
                                &stage.goal,
                                "no entity resolved from previous stage",
                            ));
                            previous = None;
                            continue;
                        }
                    };
                    tracing::info!(stage = stage.index, entity = %entity.display(), "bound dependent stage");
                    let bound = self.planner.bind(template, &entity);
                    resolved = Some(entity);
                    bound
                }
            };

            if steps.is_empty() {
                out.skipped_sources.extend(stage.sources());
                let mut report = StageReport::skipped(stage.index, &stage.goal, "no executable step");
                report.resolved = resolved;
                out.stages.push(report);
                previous = None;
                continue;
            }

            out.enter(CoordinatorState::Executing(stage.index));
            let batch: Vec<(StepId, SearchStep)> = steps
                .into_iter()
                .enumerate()
                .map(|(i, step)| (StepId::new(0, stage.index, i), step))
                .collect();
            out.issued.extend(batch.iter().map(|(_, s)| s.clone()));

            let outcomes = self.executor.execute_all(batch, turn_deadline).await;
            if !outcomes.is_empty() && outcomes.iter().all(StepOutcome::is_failed) {
                tracing::warn!(stage = stage.index, "every step in stage failed");
            }

            let stage_lists: Vec<Vec<SearchResult>> =
                outcomes.iter().map(|o| o.results.clone()).collect();
            previous_tallies = outcomes.iter().filter_map(|o| o.tally.clone()).collect();
            out.tallies.extend(previous_tallies.iter().cloned());
            let fused = fuse(stage_lists.clone(), registry);
            let perm = rank(&fused, intent, registry);
            previous = Some(apply_permutation(fused, &perm));
            out.lists.extend(stage_lists);

            out.stages.push(StageReport {
                index: stage.index,
                goal: stage.goal.clone(),
                status: StageStatus::Completed,
                resolved,
                steps: outcomes,
            });
        }

        if out.final_state() != CoordinatorState::Failed {
            out.enter(CoordinatorState::Done);
        }
        out
    }
}
