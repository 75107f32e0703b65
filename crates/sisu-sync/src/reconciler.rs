//! Year selection for provider records with unreliable year tagging.
//!
//! Some institutes (mostly federal technical institutes) publish the current
//! admission cycle under the previous cycle's year. Acceptable source years are
//! tried in priority order and the first one present wins; years are never
//! merged. Whatever year is selected, rows are written under the target year.

use sisu_core::{CourseId, CutScoreUpsert, RemoteRecord, YearSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearReconciler {
    priority: Vec<i32>,
    target_year: i32,
}

impl YearReconciler {
    pub fn new(priority: Vec<i32>, target_year: i32) -> Self {
        Self {
            priority,
            target_year,
        }
    }

    /// First snapshot, in priority order, that carries at least one modality.
    pub fn select<'a>(&self, record: &'a RemoteRecord) -> Option<&'a YearSnapshot> {
        self.priority.iter().find_map(|year| {
            record
                .years
                .iter()
                .find(|snapshot| snapshot.year == *year && !snapshot.modalities.is_empty())
        })
    }

    pub fn canonical_rows(&self, course_id: CourseId, snapshot: &YearSnapshot) -> Vec<CutScoreUpsert> {
        snapshot
            .modalities
            .iter()
            .map(|modality| CutScoreUpsert::canonical(course_id, self.target_year, modality))
            .collect()
    }
}
