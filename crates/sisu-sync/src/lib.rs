mod config;
mod detector;
mod orchestrator;
mod reconciler;
mod report;
mod schedule;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sisu_adapters::{FixtureSource, ProviderSource, RemoteSource, SourceError};
use sisu_core::{Course, NewCourse};
use sisu_storage::{CourseStore, RestStore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, SyncConfig};
pub use detector::{find_incomplete, is_complete, CompletenessIndex, Detection};
pub use orchestrator::{EngineConfig, EngineRun, SyncEngine};
pub use reconciler::YearReconciler;
pub use report::{EntityOutcome, EntityReport, RunStats, RunSummary, RunVerdict};
pub use schedule::{run_periodically, PeriodicRunner, TickOutcome};

pub const CRATE_NAME: &str = "sisu-sync";

/// One detection pass followed by reconciliation of every incomplete course.
pub async fn run_sync_once<S>(
    config: &EngineConfig,
    store: Arc<dyn CourseStore>,
    source: Arc<dyn RemoteSource>,
    shutdown: S,
) -> Result<(RunSummary, EngineRun)>
where
    S: Future<Output = ()>,
{
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("sync_run", %run_id, target_year = config.target_year, source = source.source_id());

    async move {
        let detection = find_incomplete(store.as_ref(), config.target_year, config.page_size)
            .await
            .context("detecting courses missing the target day")?;

        let run = if detection.incomplete.is_empty() {
            EngineRun::default()
        } else {
            SyncEngine::new(store, source, config.clone())
                .run_until(detection.incomplete, shutdown)
                .await
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            target_year: config.target_year,
            source_year_priority: config.source_years.clone(),
            courses_total: detection.courses_total,
            already_complete: detection.already_complete,
            detection_partial: detection.partial,
            verdict: run.stats.verdict(detection.partial),
            stats: run.stats.clone(),
        };
        summary.log();
        Ok((summary, run))
    }
    .instrument(span)
    .await
}

pub fn store_from_config(config: &SyncConfig) -> Result<Arc<dyn CourseStore>> {
    let store: Arc<dyn CourseStore> = Arc::new(RestStore::new(config.store())?);
    Ok(store)
}

/// Provider source from config, or a fixture directory when one is given.
pub fn source_from_config(config: &SyncConfig, fixtures: Option<PathBuf>) -> Result<Arc<dyn RemoteSource>> {
    let source: Arc<dyn RemoteSource> = match fixtures {
        Some(dir) => Arc::new(FixtureSource::new(dir)),
        None => Arc::new(ProviderSource::new(config.provider_url.clone(), &config.http())?),
    };
    Ok(source)
}

pub async fn run_sync_once_from_env(fixtures: Option<PathBuf>) -> Result<(RunSummary, EngineRun)> {
    let config = SyncConfig::from_env()?;
    let store = store_from_config(&config)?;
    let source = source_from_config(&config, fixtures)?;
    run_sync_once(&config.engine(), store, source, shutdown_signal()).await
}

pub async fn detect_missing_from_env() -> Result<Detection> {
    let config = SyncConfig::from_env()?;
    let store = store_from_config(&config)?;
    let detection = find_incomplete(store.as_ref(), config.target_year, config.page_size).await?;
    Ok(detection)
}

/// Resolves on ctrl-c. If the handler cannot be installed it never resolves.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub course: Course,
    pub outcome: EntityOutcome,
}

/// Creates or renames a course from the provider's record, then reconciles it.
/// A provider with nothing for the code is an error: there is no name to store.
pub async fn register_course(
    config: &EngineConfig,
    store: Arc<dyn CourseStore>,
    source: Arc<dyn RemoteSource>,
    code: i64,
) -> Result<Registration> {
    let record = match source.fetch(code).await {
        Ok(record) => record,
        Err(SourceError::NoData) => anyhow::bail!("provider has no data for course code {code}"),
        Err(err) => return Err(err).with_context(|| format!("fetching course code {code}")),
    };

    let name = record.name.clone().unwrap_or_else(|| format!("course {code}"));
    let course = store
        .save_course(&NewCourse { code, name })
        .await
        .with_context(|| format!("saving course code {code}"))?;
    info!(course_id = course.id, code, "course registered");

    let outcome = SyncEngine::new(store, source, config.clone())
        .apply_record(&course, &record)
        .await;
    Ok(Registration { course, outcome })
}

pub async fn register_course_from_env(code: i64) -> Result<Registration> {
    let config = SyncConfig::from_env()?;
    let store = store_from_config(&config)?;
    let source = source_from_config(&config, None)?;
    register_course(&config.engine(), store, source, code).await
}
