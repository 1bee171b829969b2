//! Error taxonomy for the orchestration core.
//!
//! Only [`SearchError::Planning`] and [`SearchError::GateFailure`] are
//! meant to reach a caller. Everything else is recovered close to where it
//! happens: malformed upstream output is repaired, invalid steps are
//! dropped, and backend failures are isolated to the step that caused them.

use thiserror::Error;

use crate::metrics::MetricFailure;

/// Errors raised by the orchestration core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    /// A source name that is not present in the capability registry.
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    /// A step that does not fit its source's declared capabilities.
    #[error("invalid step for source '{source_name}': {reason}")]
    InvalidStep { source_name: String, reason: String },

    /// No viable plan could be built. Fatal to the turn.
    #[error("cannot search: {0}")]
    Planning(String),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Structured output from the reasoning capability failed validation.
    #[error("malformed {what} from reasoning capability: {detail}")]
    MalformedUpstreamOutput { what: String, detail: String },

    /// One or more gate thresholds or regression tolerances were violated.
    #[error("benchmark gate failed with {} violation(s)", .0.len())]
    GateFailure(Vec<MetricFailure>),
}

impl SearchError {
    pub fn invalid_step(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedUpstreamOutput {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

/// Failure of a single step execution against one backend.
///
/// An empty result list is not represented here; zero results is a valid
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("source '{source_name}' timed out after {after_ms}ms")]
    Timeout { source_name: String, after_ms: u64 },

    #[error("source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("source '{source_name}' rejected step: {reason}")]
    InvalidStep { source_name: String, reason: String },
}

impl BackendError {
    pub fn source_name(&self) -> &str {
        match self {
            Self::Timeout { source_name, .. }
            | Self::SourceUnavailable { source_name, .. }
            | Self::InvalidStep { source_name, .. } => source_name,
        }
    }

    /// Short machine-readable label, used in stage reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::InvalidStep { .. } => "invalid_step",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_converts_into_search_error() {
        let err: SearchError = BackendError::Timeout {
            source_name: "email".to_string(),
            after_ms: 250,
        }
        .into();
        assert_eq!(err.to_string(), "source 'email' timed out after 250ms");
    }

    #[test]
    fn test_backend_error_kind_and_source() {
        let err = BackendError::SourceUnavailable {
            source_name: "tasks".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.kind(), "source_unavailable");
        assert_eq!(err.source_name(), "tasks");
    }

    #[test]
    fn test_planning_error_message_is_user_facing() {
        let err = SearchError::Planning("no backends available".to_string());
        assert_eq!(err.to_string(), "cannot search: no backends available");
    }
}
