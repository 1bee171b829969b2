//! # fedsearch CLI
//!
//! ## Usage
//!
//! ```bash
//! fedsearch --config ./config/fedsearch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fedsearch sources` | List configured backends and their capabilities |
//! | `fedsearch search "<request>"` | Run one federated search turn |
//! | `fedsearch gate run` | Run the evaluation gate over a benchmark |
//! | `fedsearch gate promote` | Promote a report's metrics to the baseline |
//!
//! Logging goes to stderr. `FEDSEARCH_LOG` overrides `[logging].level`
//! with any `tracing` filter directive.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use fedsearch::config::{self, LoggingConfig};
use fedsearch::{gate, search, sources};

/// Federated search over personal-data and web backends.
#[derive(Parser)]
#[command(
    name = "fedsearch",
    about = "Federated retrieval orchestration: plan, execute, fuse and refine searches across backends",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fedsearch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured backends, their methods and filters.
    Sources,

    /// Run one search turn for a natural-language request.
    Search {
        request: String,

        /// Print the full turn response as JSON.
        #[arg(long)]
        json: bool,

        /// Maximum results to return (overrides orchestration.final_limit).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Offline evaluation gate.
    Gate {
        #[command(subcommand)]
        action: GateAction,
    },
}

#[derive(Subcommand)]
enum GateAction {
    /// Replay a benchmark; exit non-zero when the gate fails.
    Run {
        /// Benchmark definition (TOML).
        #[arg(long)]
        bench: PathBuf,

        /// Machine-readable report output (JSON).
        #[arg(long)]
        report: PathBuf,

        /// Human-readable summary output (Markdown).
        #[arg(long)]
        summary: PathBuf,

        /// Baseline snapshot to compare against. Read only.
        #[arg(long)]
        baseline: PathBuf,
    },

    /// Write a report's aggregate metrics as the new baseline.
    Promote {
        #[arg(long)]
        report: PathBuf,

        #[arg(long)]
        baseline: PathBuf,

        /// Promote even if the report failed.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("FEDSEARCH_LOG")
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Logging settings from the config file when it loads, defaults otherwise.
fn logging_for(path: &Path) -> LoggingConfig {
    config::load_config(path)
        .map(|c| c.logging)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // the gate does not need the main config
    if let Commands::Gate { action } = &cli.command {
        init_tracing(&logging_for(&cli.config));
        match action {
            GateAction::Run {
                bench,
                report,
                summary,
                baseline,
            } => {
                let result = gate::run_gate(bench, report, summary, baseline).await?;
                print!("{}", gate::render_summary(&result));
                result.verdict()?;
            }
            GateAction::Promote {
                report,
                baseline,
                force,
            } => {
                let snapshot = gate::promote(report, baseline, *force)?;
                println!(
                    "Baseline written to {} (precision@k {:.4}, coverage {:.4}, p95 {:.1}ms, refinement hit rate {:.4})",
                    baseline.display(),
                    snapshot.metrics.precision_at_k,
                    snapshot.metrics.coverage,
                    snapshot.metrics.p95_latency_ms,
                    snapshot.metrics.refinement_hit_rate
                );
            }
        }
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Search {
            request,
            json,
            limit,
        } => {
            search::run_search(&cfg, &request, json, limit).await?;
        }
        Commands::Gate { .. } => {}
    }

    Ok(())
}
