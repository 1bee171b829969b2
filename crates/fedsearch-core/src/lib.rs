//! # fedsearch core
//!
//! Pure orchestration logic for federated retrieval: the data model,
//! backend capability registry, intent validation, search planning,
//! entity resolution between hops, result fusion and ranking, the
//! refinement policy, and evaluation-gate metrics.
//!
//! This crate performs no I/O and carries no async runtime. Backend
//! adapters, deadlines, and the turn loop live in the `fedsearch` crate,
//! which calls into these modules.
//!
//! ```text
//! conversation ─▶ intent ─▶ planner ─▶ (execute) ─▶ rank::fuse ─▶ rank::rank
//!                                ▲            │
//!                                └─ resolve ◀─┘   refine ─▶ more steps
//! ```

pub mod capabilities;
pub mod error;
pub mod intent;
pub mod metrics;
pub mod models;
pub mod planner;
pub mod rank;
pub mod reasoning;
pub mod refine;
pub mod resolve;
pub mod temporal;

pub use capabilities::{CapabilityRegistry, SourceCapabilities};
pub use error::{BackendError, SearchError};
pub use models::{Intent, SearchResult, SearchStep};
