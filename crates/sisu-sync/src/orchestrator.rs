//! Bounded-concurrency reconciliation of incomplete courses.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sisu_adapters::{RemoteSource, SourceError};
use sisu_core::{Course, RemoteRecord, TARGET_DAY};
use sisu_storage::CourseStore;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::reconciler::YearReconciler;
use crate::report::{EntityOutcome, EntityReport, RunStats};

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub target_year: i32,
    pub source_years: Vec<i32>,
    pub pool_width: usize,
    pub page_size: usize,
    /// Upper bound on a single provider call, on top of the HTTP client timeout.
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    pub stats: RunStats,
    /// Completion order, not input order.
    pub reports: Vec<EntityReport>,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn CourseStore>,
    source: Arc<dyn RemoteSource>,
    config: EngineConfig,
    reconciler: YearReconciler,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn CourseStore>, source: Arc<dyn RemoteSource>, config: EngineConfig) -> Self {
        let reconciler = YearReconciler::new(config.source_years.clone(), config.target_year);
        Self {
            store,
            source,
            config,
            reconciler,
        }
    }

    /// Fetch, select a year and write one course. Never fails; every failure is an outcome.
    pub async fn sync_course(&self, course: &Course) -> EntityOutcome {
        let fetched = tokio::time::timeout(self.config.call_timeout, self.source.fetch(course.code)).await;
        let record = match fetched {
            Ok(Ok(record)) => record,
            Ok(Err(SourceError::NoData)) => return EntityOutcome::NoData,
            Ok(Err(SourceError::Api { status })) => return EntityOutcome::ApiError { http_status: status },
            Ok(Err(SourceError::Transport(message))) => return EntityOutcome::TransportError { message },
            Err(_) => {
                return EntityOutcome::TransportError {
                    message: format!("provider call timed out after {:?}", self.config.call_timeout),
                }
            }
        };
        self.apply_record(course, &record).await
    }

    /// Writes the selected year's modalities one by one. A failed write is logged
    /// and skipped; the remaining modalities are still written.
    pub async fn apply_record(&self, course: &Course, record: &RemoteRecord) -> EntityOutcome {
        let Some(snapshot) = self.reconciler.select(record) else {
            debug!(code = course.code, "no acceptable year in provider record");
            return EntityOutcome::NoYear;
        };

        let rows = self.reconciler.canonical_rows(course.id, snapshot);
        let mut upserted = 0;
        let mut write_failures = 0;
        let mut has_target_day = false;

        for (modality, row) in snapshot.modalities.iter().zip(&rows) {
            match self.store.upsert_cut_score(row).await {
                Ok(()) => {
                    upserted += 1;
                    has_target_day |= modality.has_day(TARGET_DAY);
                }
                Err(err) => {
                    write_failures += 1;
                    warn!(
                        course_id = course.id,
                        modality = %row.modality_code,
                        %err,
                        "cut score write failed"
                    );
                }
            }
        }

        EntityOutcome::Ok {
            source_year: snapshot.year,
            upserted,
            write_failures,
            has_target_day,
        }
    }

    pub async fn run(&self, courses: Vec<Course>) -> EngineRun {
        self.run_until(courses, std::future::pending::<()>()).await
    }

    /// Processes `courses` with at most `pool_width` in flight. Once `shutdown`
    /// resolves, courses that have not started are reported as abandoned and the
    /// in-flight ones are allowed to finish.
    pub async fn run_until<S>(&self, courses: Vec<Course>, shutdown: S) -> EngineRun
    where
        S: Future<Output = ()>,
    {
        let total = courses.len();
        let width = self.config.pool_width.max(1);
        let permits = Arc::new(Semaphore::new(width));
        let stopping = Arc::new(AtomicBool::new(false));
        let (done_tx, mut done_rx) = mpsc::channel::<EntityReport>(width);
        let mut tasks = JoinSet::new();

        for course in courses {
            let engine = self.clone();
            let permits = permits.clone();
            let stopping = stopping.clone();
            let done_tx = done_tx.clone();
            let span = info_span!("course_sync", course_id = course.id, code = course.code);
            tasks.spawn(
                async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) if !stopping.load(Ordering::SeqCst) => engine.sync_course(&course).await,
                        _ => EntityOutcome::Abandoned,
                    };
                    let report = EntityReport {
                        course_id: course.id,
                        code: course.code,
                        outcome,
                    };
                    // Receiver outlives every task.
                    let _ = done_tx.send(report).await;
                }
                .instrument(span),
            );
        }
        drop(done_tx);

        info!(courses = total, pool_width = width, "reconciliation started");
        let mut run = EngineRun {
            stats: RunStats::new(total),
            reports: Vec::with_capacity(total),
        };
        tokio::pin!(shutdown);
        let mut shutdown_seen = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown, if !shutdown_seen => {
                    shutdown_seen = true;
                    stopping.store(true, Ordering::SeqCst);
                    warn!("shutdown requested; finishing in-flight courses");
                }
                received = done_rx.recv() => {
                    let Some(report) = received else { break };
                    run.stats.record(&report.outcome);
                    run.reports.push(report);
                    let done = run.stats.processed + run.stats.abandoned;
                    if done % PROGRESS_EVERY == 0 {
                        run.log_progress(total);
                    }
                }
            }
        }

        // Every sender is gone, so every task has ended; panicked ones sent nothing.
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "course task failed");
                run.stats.record_task_failure();
            }
        }
        run.log_progress(total);
        run
    }
}

impl EngineRun {
    fn log_progress(&self, total: usize) {
        info!(
            done = self.stats.processed + self.stats.abandoned,
            total,
            succeeded = self.stats.succeeded,
            with_target_day = self.stats.with_target_day,
            errors = self.stats.errors(),
            "reconciliation progress"
        );
    }
}
