//! querybench: database load-testing from the command line
//!
//! Loads a JSON run configuration, drives the orchestration engine against
//! a Postgres target (or the synthetic one for dry runs), streams phase
//! transitions to the terminal, and prints a summary table at the end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use querybench_common::{RunConfig, RunEvent};
use querybench_engine::orchestrator::{Orchestrator, RunOutcome};
use querybench_engine::synthetic::{SyntheticFactory, SyntheticProfile};
use querybench_engine::target::{ConnectionFactory, PostgresFactory};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "querybench")]
#[command(about = "Database load testing with phase-managed benchmark runs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Arguments for the run command
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to the JSON run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Postgres connection string
    /// (default: $QUERYBENCH_DSN)
    #[arg(long, env = "QUERYBENCH_DSN")]
    dsn: Option<String>,

    /// Run against the built-in synthetic target instead of a database
    #[arg(long)]
    synthetic: bool,

    /// Output JSON file for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print every metric snapshot, not just phase transitions
    #[arg(long)]
    verbose_metrics: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a benchmark run
    Run(RunArgs),

    /// Validate a run configuration without connecting anywhere
    Validate {
        /// Path to the JSON run configuration
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run(run_args) => execute_run(run_args).await,
        Command::Validate { config } => {
            let config = RunConfig::from_json_file(&config)?;
            info!(
                mode = config.scaling.mode_name(),
                workers = config.workers,
                pool_size = config.pool.size,
                warmup_seconds = config.warmup_seconds,
                run_seconds = config.run_seconds,
                "configuration is valid"
            );
            Ok(())
        }
    }
}

async fn execute_run(args: RunArgs) -> Result<()> {
    let config = RunConfig::from_json_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let factory: Arc<dyn ConnectionFactory> = if args.synthetic {
        Arc::new(SyntheticFactory::new(SyntheticProfile::default()))
    } else {
        let dsn = args
            .dsn
            .as_deref()
            .context("--dsn (or QUERYBENCH_DSN) is required unless --synthetic is set")?;
        Arc::new(PostgresFactory::new(dsn)?)
    };

    info!(
        target = factory.target_name(),
        mode = config.scaling.mode_name(),
        "starting benchmark run"
    );

    let orchestrator = Orchestrator::connect(factory).await?;
    let handle = orchestrator.start_run(config)?;
    let run_id = handle.run_id();
    info!(run_id = %run_id, "run started");

    // Stream events to the terminal while the run progresses
    let mut events = handle.subscribe();
    let verbose = args.verbose_metrics;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::PhaseChanged(change) => {
                    info!(
                        phase = %change.phase,
                        seq = change.seq,
                        reason = change.reason.as_deref().unwrap_or(""),
                        "phase changed"
                    );
                }
                RunEvent::Metrics(m) if verbose => {
                    info!(
                        ops_per_sec = format!("{:.1}", m.ops_per_sec),
                        p95_ms = format!("{:.2}", m.latency.p95),
                        errors = m.errors,
                        workers = m.active_workers,
                        target = m.target_virtual_users,
                        "snapshot"
                    );
                }
                RunEvent::Metrics(_) => {}
            }
        }
    });

    // Ctrl-C requests a soft cancel; the run drains and reports normally
    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            canceller.cancel("interrupted by user").await;
        }
    });

    let outcome = handle.wait().await?;
    printer.abort();
    orchestrator.shutdown().await;

    print_summary(&outcome);
    if let Some(path) = &args.output {
        write_results(path, &outcome)
            .with_context(|| format!("writing results to {}", path.display()))?;
        info!(path = %path.display(), "results written");
    }

    if !outcome.succeeded() {
        anyhow::bail!(
            "run cancelled: {}",
            outcome.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![
        Cell::new("Run ID"),
        Cell::new(outcome.run_id.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Final phase"),
        Cell::new(outcome.final_phase.to_string()),
    ]);
    if let Some(reason) = &outcome.reason {
        table.add_row(vec![Cell::new("Reason"), Cell::new(reason)]);
    }
    table.add_row(vec![
        Cell::new("Measured"),
        Cell::new(format!("{:.1}s", outcome.measured_seconds)),
    ]);
    table.add_row(vec![
        Cell::new("Operations"),
        Cell::new(outcome.total_ops.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Errors"),
        Cell::new(outcome.total_errors.to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Throughput"),
        Cell::new(format!("{:.1} ops/s", outcome.mean_ops_per_sec)),
    ]);
    table.add_row(vec![
        Cell::new("Latency p50/p95/p99"),
        Cell::new(format!(
            "{:.2} / {:.2} / {:.2} ms",
            outcome.latency.p50, outcome.latency.p95, outcome.latency.p99
        )),
    ]);
    if let Some(max) = outcome.discovered_max {
        table.add_row(vec![
            Cell::new("Max sustainable concurrency"),
            Cell::new(max.to_string()),
        ]);
    }
    println!("{table}");
}

fn write_results(path: &std::path::Path, outcome: &RunOutcome) -> Result<()> {
    let phase_history: Vec<_> = outcome
        .phase_history
        .iter()
        .map(|(phase, at)| {
            serde_json::json!({
                "phase": phase,
                "entered_at": at.to_rfc3339(),
            })
        })
        .collect();
    let results = serde_json::json!({
        "run_id": outcome.run_id,
        "final_phase": outcome.final_phase,
        "reason": outcome.reason,
        "started_at": outcome.started_at.to_rfc3339(),
        "finished_at": outcome.finished_at.to_rfc3339(),
        "measured_seconds": outcome.measured_seconds,
        "total_ops": outcome.total_ops,
        "total_errors": outcome.total_errors,
        "mean_ops_per_sec": outcome.mean_ops_per_sec,
        "latency_ms": outcome.latency,
        "discovered_max": outcome.discovered_max,
        "phase_history": phase_history,
    });
    std::fs::write(path, serde_json::to_string_pretty(&results)?)?;
    Ok(())
}
