//! Backend executor.
//!
//! Runs one [`SearchStep`] against its backend under a deadline and turns
//! whatever happens into a [`StepOutcome`]. The executor re-checks the
//! step against the capability registry before dispatch, so a step the
//! planner should never have produced still cannot reach a backend.
//!
//! Steps of one stage run concurrently through [`Executor::execute_all`];
//! a failing or slow step never holds up its siblings. Count and aggregate
//! steps go through [`Executor::tally`] under the same rules.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use fedsearch_core::capabilities::CapabilityRegistry;
use fedsearch_core::error::{BackendError, SearchError};
use fedsearch_core::models::{SearchResult, SearchStep, StepId, Tally};

use crate::traits::{Backend, BackendRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Ok { count: usize },
    /// Zero results. Not a failure.
    Empty,
    /// A count or aggregate step answered.
    Tallied { total: u64 },
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub id: StepId,
    pub step: SearchStep,
    pub status: StepStatus,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<Tally>,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed { .. })
    }
}

pub struct Executor {
    backends: BackendRegistry,
    capabilities: Arc<CapabilityRegistry>,
    step_timeout: Duration,
}

impl Executor {
    pub fn new(backends: BackendRegistry, capabilities: Arc<CapabilityRegistry>, step_timeout: Duration) -> Self {
        Self {
            backends,
            capabilities,
            step_timeout,
        }
    }

    /// Re-check `step` and find the backend that answers it.
    fn dispatch_target(&self, step: &SearchStep) -> Result<Arc<dyn Backend>, BackendError> {
        self.capabilities.validate_step(step).map_err(|e| match e {
            SearchError::InvalidStep { source_name, reason } => BackendError::InvalidStep { source_name, reason },
            other => BackendError::InvalidStep {
                source_name: step.source.clone(),
                reason: other.to_string(),
            },
        })?;

        self.backends.find(&step.source).ok_or_else(|| BackendError::SourceUnavailable {
            source_name: step.source.clone(),
            reason: "no adapter registered".to_string(),
        })
    }

    /// Await `call` until the earlier of the step timeout and
    /// `turn_deadline`.
    async fn bounded<T>(
        &self,
        step: &SearchStep,
        turn_deadline: Instant,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let started = Instant::now();
        let deadline = (started + self.step_timeout).min(turn_deadline);
        match tokio::time::timeout_at(deadline, call).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout {
                source_name: step.source.clone(),
                after_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Run one search step. The effective deadline is the earlier of the
    /// step timeout and `turn_deadline`.
    pub async fn execute(
        &self,
        id: StepId,
        step: &SearchStep,
        turn_deadline: Instant,
    ) -> Result<Vec<SearchResult>, BackendError> {
        let backend = self.dispatch_target(step)?;
        let mut results = self.bounded(step, turn_deadline, backend.search(step)).await?;
        for r in &mut results {
            r.source = step.source.clone();
            r.origins = vec![id];
        }
        Ok(results)
    }

    /// Run one count or aggregate step, under the same checks and
    /// deadline as [`execute`](Executor::execute).
    pub async fn tally(&self, id: StepId, step: &SearchStep, turn_deadline: Instant) -> Result<Tally, BackendError> {
        let backend = self.dispatch_target(step)?;
        let mut tally = self.bounded(step, turn_deadline, backend.tally(step)).await?;
        tally.source = step.source.clone();
        tally.origin = Some(id);
        Ok(tally)
    }

    /// Run `step` in its mode, recorded as an outcome.
    pub async fn run(&self, id: StepId, step: SearchStep, turn_deadline: Instant) -> StepOutcome {
        let started = Instant::now();
        let result = if step.mode.is_search() {
            self.execute(id, &step, turn_deadline).await.map(|r| (r, None))
        } else {
            self.tally(id, &step, turn_deadline).await.map(|t| (Vec::new(), Some(t)))
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, results, tally) = match result {
            Ok((results, Some(tally))) => (StepStatus::Tallied { total: tally.total }, results, Some(tally)),
            Ok((results, None)) if results.is_empty() => (StepStatus::Empty, results, None),
            Ok((results, None)) => (StepStatus::Ok { count: results.len() }, results, None),
            Err(e) => {
                tracing::warn!(source = %step.source, step = %id, elapsed_ms, error = %e, "step failed");
                (
                    StepStatus::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    },
                    Vec::new(),
                    None,
                )
            }
        };
        if !matches!(status, StepStatus::Failed { .. }) {
            tracing::debug!(source = %step.source, step = %id, elapsed_ms, count = results.len(), "step done");
        }

        StepOutcome {
            id,
            step,
            status,
            elapsed_ms,
            results,
            tally,
        }
    }

    /// Run a stage's steps concurrently. Outcomes keep input order.
    pub async fn execute_all(&self, steps: Vec<(StepId, SearchStep)>, turn_deadline: Instant) -> Vec<StepOutcome> {
        let futures = steps
            .into_iter()
            .map(|(id, step)| self.run(id, step, turn_deadline));
        futures::future::join_all(futures).await
    }
}
