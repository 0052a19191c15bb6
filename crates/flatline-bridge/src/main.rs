//! `flatline`: multi-reviewer consensus runs over a planning document.
//!
//! ```bash
//! flatline run docs/prd.md --mode autonomous --depth 5
//! flatline resume run-6f1c…
//! flatline rollback --manifest 0b7e…
//! flatline status run-6f1c…
//! ```
//!
//! Configuration comes from `flatline.toml` (or `--config`), then
//! `FLATLINE_*` environment variables, then flags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flatline_bridge::telemetry;
use flatline_bridge::{BackendPool, FlatlineConfig, Orchestrator, RunOptions, RunResult};
use flatline_coordination::bridge::RunMode;
use flatline_coordination::consensus::ThresholdOverride;
use flatline_coordination::integration::FsDocumentStore;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flatline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-reviewer consensus and safe integration for planning documents", long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, default_value = "flatline.toml", env = "FLATLINE_CONFIG")]
    config: PathBuf,

    /// State directory (overrides config and FLATLINE_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run against a target document
    Run {
        target: String,

        /// interactive | autonomous
        #[arg(long)]
        mode: Option<RunMode>,

        /// Iterations to run if convergence is not reached first
        #[arg(long)]
        depth: Option<u32>,

        /// Hard iteration cap (circuit breaker)
        #[arg(long)]
        max_iterations: Option<u32>,

        #[arg(long)]
        high_threshold: Option<u32>,
        #[arg(long)]
        low_threshold: Option<u32>,
        #[arg(long)]
        dispute_delta: Option<u32>,
        #[arg(long)]
        blocker_threshold: Option<u32>,
    },

    /// Continue a persisted run
    Resume { run_id: String },

    /// Restore the pre-image recorded by an integration manifest
    Rollback {
        #[arg(long)]
        manifest: Uuid,
    },

    /// Show the persisted state of a run
    Status { run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = FlatlineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }

    match cli.command {
        Commands::Run {
            target,
            mode,
            depth,
            max_iterations,
            high_threshold,
            low_threshold,
            dispute_delta,
            blocker_threshold,
        } => {
            if let Some(n) = max_iterations {
                config.breaker.max_iterations = n;
            }
            let mut opts = RunOptions::new(
                target,
                mode.unwrap_or(config.mode),
                depth.unwrap_or(config.depth),
            );
            opts.thresholds_override = ThresholdOverride {
                high: high_threshold,
                low: low_threshold,
                dispute_delta,
                blocker: blocker_threshold,
                min_votes: None,
            };
            let orchestrator = build(config)?;
            let result = orchestrator.run(opts).await.context("run failed")?;
            report(&result)
        }
        Commands::Resume { run_id } => {
            let orchestrator = build(config)?;
            let result = orchestrator
                .resume(&run_id)
                .await
                .with_context(|| format!("resuming {run_id}"))?;
            report(&result)
        }
        Commands::Rollback { manifest } => {
            let orchestrator = build(config)?;
            let outcome = orchestrator
                .rollback(manifest)
                .await
                .with_context(|| format!("rolling back manifest {manifest}"))?;
            println!(
                "Restored {} to {} (replaced {})",
                outcome.target,
                outcome.restored_hash.short(),
                outcome.replaced_hash.short()
            );
            Ok(())
        }
        Commands::Status { run_id } => {
            let orchestrator = build(config)?;
            let record = orchestrator
                .status(&run_id)
                .with_context(|| format!("loading {run_id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn build(config: FlatlineConfig) -> Result<Orchestrator> {
    if config.backends.is_empty() {
        bail!("no [[backends]] configured");
    }
    let pool = BackendPool::from_configs(&config.backends).context("building backends")?;
    let orchestrator = Orchestrator::new(config, pool, Arc::new(FsDocumentStore::new()))
        .context("initialising state directory")?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; halting after the current transaction");
            cancel.cancel();
        }
    });
    Ok(orchestrator)
}

fn report(result: &RunResult) -> Result<()> {
    print!("{}", result.summary.narrative());
    if let Some(escalation) = &result.escalation {
        println!();
        print!("{}", escalation.to_markdown());
    }
    for path in &result.artifacts {
        info!(path = %path.display(), "Report written");
    }
    if !result.is_success() {
        bail!("run {} halted", result.run_id);
    }
    Ok(())
}
