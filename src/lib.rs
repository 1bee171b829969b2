//! # fedsearch
//!
//! Federated retrieval orchestration over personal-data and web backends.
//!
//! A user turn is interpreted into an intent, planned into per-source
//! search steps (possibly in dependent multi-hop stages), executed
//! concurrently under deadlines, fused into one ranked list, and refined
//! for at most two extra rounds. An offline evaluation gate replays
//! labeled queries and fails on threshold violations or regressions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │ IntentExtr.  │──▶│ Planner  │──▶│ Coordinator │──▶│ Executor │──▶ backends
//! └──────────────┘   └──────────┘   └──────┬──────┘   └──────────┘
//!                                          ▼
//!                               fuse ─▶ rank ─▶ refine (≤ 2 rounds)
//! ```
//!
//! Pure logic (data model, planning, ranking, metrics) lives in the
//! `fedsearch-core` crate. This crate adds the async runtime side.
//!
//! ## Quick Start
//!
//! ```bash
//! fedsearch sources
//! fedsearch search "what did Maria send me last week"
//! fedsearch gate run --bench bench/fedsearch-bench.toml \
//!     --report target/gate/report.json --summary target/gate/summary.md \
//!     --baseline bench/baseline.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`traits`] | `Backend` adapter trait and `BackendRegistry` |
//! | [`backend_fixture`] | In-memory backend |
//! | [`backend_http`] | JSON-over-HTTP backend |
//! | [`reasoner_http`] | JSON-over-HTTP reasoning capability |
//! | [`executor`] | Single-step execution under a deadline |
//! | [`coordinator`] | Stage-by-stage multi-hop execution |
//! | [`orchestrator`] | Whole-turn pipeline |
//! | [`gate`] | Evaluation gate runner and baseline promotion |
//! | [`search`] | `fedsearch search` |
//! | [`sources`] | `fedsearch sources` |

pub mod backend_fixture;
pub mod backend_http;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod gate;
pub mod orchestrator;
pub mod reasoner_http;
pub mod search;
pub mod sources;
pub mod traits;

pub use fedsearch_core as core;
