use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sisu_sync::{EntityOutcome, PeriodicRunner, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sisu-cli")]
#[command(about = "SISU cut-score reconciliation")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fill in cut scores for every course still missing day 2.
    Sync {
        /// Read provider payloads from `<dir>/<code>.json` instead of the live provider.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Print the run summary and per-course outcomes as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List courses missing day 2 without contacting the provider.
    Missing {
        #[arg(long)]
        count: bool,
    },
    /// Create or rename a course from the provider and reconcile it.
    Register {
        #[arg(long)]
        code: i64,
    },
    /// Run `sync` now and then every SISU_SYNC_INTERVAL_MINUTES.
    Watch {
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command.unwrap_or(Commands::Sync {
        fixtures: None,
        json: false,
    }) {
        Commands::Sync { fixtures, json } => {
            let (summary, run) = sisu_sync::run_sync_once_from_env(fixtures).await?;
            if json {
                let out = serde_json::json!({ "summary": summary, "courses": run.reports });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "sync complete: run_id={} missing={} processed={} with_day2={} errors={} no_data={} verdict={:?}",
                    summary.run_id,
                    summary.stats.scheduled,
                    summary.stats.processed,
                    summary.stats.with_target_day,
                    summary.stats.errors(),
                    summary.stats.no_data + summary.stats.no_year,
                    summary.verdict
                );
            }
        }
        Commands::Missing { count } => {
            let detection = sisu_sync::detect_missing_from_env().await?;
            if count {
                println!("{}", detection.incomplete.len());
            } else {
                for course in &detection.incomplete {
                    println!("{}\t{}\t{}", course.id, course.code, course.name.as_deref().unwrap_or(""));
                }
            }
        }
        Commands::Register { code } => {
            let registration = sisu_sync::register_course_from_env(code).await?;
            info!(course_id = registration.course.id, code, outcome = ?registration.outcome, "register finished");
            let outcome = match &registration.outcome {
                EntityOutcome::Ok {
                    source_year,
                    upserted,
                    has_target_day,
                    ..
                } => format!("{upserted} rows from {source_year}, day2={has_target_day}"),
                other => format!("{other:?}"),
            };
            println!(
                "registered course id={} code={}: {outcome}",
                registration.course.id, registration.course.code
            );
        }
        Commands::Watch { fixtures } => {
            let config = SyncConfig::from_env()?;
            let program = std::env::current_exe().context("locating sisu-cli binary")?;
            let runner = PeriodicRunner::new(program, child_args(cli.log_json, fixtures));
            let interval = Duration::from_secs(config.sync_interval_minutes.max(1) * 60);
            info!(every_minutes = interval.as_secs() / 60, "periodic sync starting");
            sisu_sync::run_periodically(runner, interval, sisu_sync::shutdown_signal()).await?;
        }
        Commands::Serve => sisu_web::serve_from_env().await?,
    }

    Ok(())
}

fn child_args(log_json: bool, fixtures: Option<PathBuf>) -> Vec<String> {
    let mut args = vec!["sync".to_string()];
    if log_json {
        args.push("--log-json".to_string());
    }
    if let Some(dir) = fixtures {
        args.push("--fixtures".to_string());
        args.push(dir.display().to_string());
    }
    args
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SISU_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}
