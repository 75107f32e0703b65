//! Periodic re-execution of the sync command in a child process.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const TAIL_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous run was still going.
    Skipped,
    Completed { success: bool, code: Option<i32> },
    SpawnFailed(String),
}

/// Runs one child at a time; ticks that arrive while a child is running are skipped.
#[derive(Debug)]
pub struct PeriodicRunner {
    program: PathBuf,
    args: Vec<String>,
    busy: Arc<Mutex<()>>,
}

impl PeriodicRunner {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            busy: Arc::new(Mutex::new(())),
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.busy.try_lock() else {
            warn!("previous sync still running; skipping this tick");
            return TickOutcome::Skipped;
        };

        info!(program = %self.program.display(), "starting scheduled sync");
        let output = match Command::new(&self.program).args(&self.args).output().await {
            Ok(output) => output,
            Err(err) => {
                error!(%err, "could not start sync process");
                return TickOutcome::SpawnFailed(err.to_string());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        for line in &lines[lines.len().saturating_sub(TAIL_LINES)..] {
            info!(target: "sisu_sync::child", "{line}");
        }

        let success = output.status.success();
        let code = output.status.code();
        if success {
            info!(?code, "scheduled sync finished");
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(?code, stderr = %stderr.trim(), "scheduled sync failed");
        }
        TickOutcome::Completed { success, code }
    }
}

/// Runs once right away, then every `interval` until `shutdown` resolves.
pub async fn run_periodically<S>(runner: PeriodicRunner, interval: Duration, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let runner = Arc::new(runner);
    let first = runner.clone();
    tokio::spawn(async move {
        first.tick().await;
    });

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_runner = runner.clone();
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let runner = job_runner.clone();
        Box::pin(async move {
            runner.tick().await;
        })
    })
    .with_context(|| format!("creating sync job every {interval:?}"))?;
    sched.add(job).await.context("adding sync job")?;
    sched.start().await.context("starting scheduler")?;
    info!(every_secs = interval.as_secs(), "periodic sync scheduled");

    shutdown.await;
    info!("stopping periodic sync");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
