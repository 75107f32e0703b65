//! Per-entity outcomes, run statistics and the end-of-run summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sisu_core::CourseId;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal state of one course's reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Ok {
        source_year: i32,
        upserted: usize,
        write_failures: usize,
        has_target_day: bool,
    },
    NoData,
    NoYear,
    ApiError { http_status: u16 },
    TransportError { message: String },
    /// Not started because the run was shut down first.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReport {
    pub course_id: CourseId,
    pub code: i64,
    pub outcome: EntityOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub scheduled: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub upserted_rows: usize,
    pub with_target_day: usize,
    pub source_years: BTreeMap<i32, usize>,
    pub no_data: usize,
    pub no_year: usize,
    pub api_errors: usize,
    pub transport_errors: usize,
    pub write_failures: usize,
    pub task_failures: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    /// Nothing was missing the target day.
    AllComplete,
    /// The store refused the detection reads, so nothing could be scheduled.
    DetectionFailed,
    /// At least one course gained the target day.
    Progress,
    /// Provider, network or store write failures.
    Outage,
    /// No successes and only no-data outcomes; the provider does not cover these courses yet.
    CoverageGap,
    /// Writes happened but no course reached the target day.
    NoNewTargetDay,
}

impl RunStats {
    pub fn new(scheduled: usize) -> Self {
        Self {
            scheduled,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &EntityOutcome) {
        if !matches!(outcome, EntityOutcome::Abandoned) {
            self.processed += 1;
        }
        match outcome {
            EntityOutcome::Ok {
                source_year,
                upserted,
                write_failures,
                has_target_day,
            } => {
                self.upserted_rows += upserted;
                self.write_failures += write_failures;
                if *upserted > 0 {
                    self.succeeded += 1;
                    *self.source_years.entry(*source_year).or_default() += 1;
                }
                if *has_target_day {
                    self.with_target_day += 1;
                }
            }
            EntityOutcome::NoData => self.no_data += 1,
            EntityOutcome::NoYear => self.no_year += 1,
            EntityOutcome::ApiError { .. } => self.api_errors += 1,
            EntityOutcome::TransportError { .. } => self.transport_errors += 1,
            EntityOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn record_task_failure(&mut self) {
        self.processed += 1;
        self.task_failures += 1;
    }

    pub fn errors(&self) -> usize {
        self.api_errors + self.transport_errors + self.write_failures + self.task_failures
    }

    /// `detection_partial` is set when a store page read failed during detection.
    pub fn verdict(&self, detection_partial: bool) -> RunVerdict {
        if self.scheduled == 0 && detection_partial {
            RunVerdict::DetectionFailed
        } else if self.scheduled == 0 {
            RunVerdict::AllComplete
        } else if self.with_target_day > 0 {
            RunVerdict::Progress
        } else if self.errors() > 0 {
            RunVerdict::Outage
        } else if self.succeeded == 0 && self.no_data + self.no_year > 0 {
            RunVerdict::CoverageGap
        } else {
            RunVerdict::NoNewTargetDay
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_year: i32,
    pub source_year_priority: Vec<i32>,
    pub courses_total: usize,
    pub already_complete: usize,
    pub detection_partial: bool,
    pub stats: RunStats,
    pub verdict: RunVerdict,
}

impl RunSummary {
    pub fn log(&self) {
        let s = &self.stats;
        let source_years = serde_json::to_string(&s.source_years).unwrap_or_default();
        info!(
            run_id = %self.run_id,
            target_year = self.target_year,
            courses_total = self.courses_total,
            already_complete = self.already_complete,
            scheduled = s.scheduled,
            processed = s.processed,
            upserted_rows = s.upserted_rows,
            with_target_day = s.with_target_day,
            source_years = %source_years,
            no_data = s.no_data,
            no_year = s.no_year,
            api_errors = s.api_errors,
            transport_errors = s.transport_errors,
            write_failures = s.write_failures,
            task_failures = s.task_failures,
            abandoned = s.abandoned,
            verdict = ?self.verdict,
            "sync run finished"
        );

        match self.verdict {
            RunVerdict::AllComplete => info!("every course already has day {}", sisu_core::TARGET_DAY),
            RunVerdict::DetectionFailed => warn!("store rejected the detection reads; check credentials and store health"),
            RunVerdict::Progress => info!(courses = s.with_target_day, "courses reached the target day"),
            RunVerdict::Outage => warn!(
                errors = s.errors(),
                write_failures = s.write_failures,
                "provider, network or store failures; retry on the next scheduled run"
            ),
            RunVerdict::CoverageGap => warn!(
                no_data = s.no_data + s.no_year,
                "provider has no data for the pending courses yet"
            ),
            RunVerdict::NoNewTargetDay => warn!(
                errors = s.errors(),
                no_data = s.no_data + s.no_year,
                "no course reached the target day this run"
            ),
        }
        if self.detection_partial {
            warn!("detection used partial store data");
        }
    }
}
