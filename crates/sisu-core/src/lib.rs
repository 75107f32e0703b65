//! Core domain model for SISU cut-score reconciliation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "sisu-core";

/// Partial-score day whose presence marks a course as complete.
pub const TARGET_DAY: &str = "2";

pub type CourseId = i64;

/// Course offering as persisted in the store. Read-only for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub code: i64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Descriptive fields written when a course is registered from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCourse {
    pub code: i64,
    pub name: String,
}

/// One `{day, score}` point of the daily partial cut-score series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialScore {
    pub day: u32,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalitySnapshot {
    pub code: String,
    pub name: Option<String>,
    pub cut_score: Option<f64>,
    pub applicants: Option<u32>,
    pub vacancies: Option<u32>,
    #[serde(default)]
    pub partial_scores: Vec<PartialScore>,
}

impl ModalitySnapshot {
    pub fn has_day(&self, tag: &str) -> bool {
        self.partial_scores
            .iter()
            .any(|p| p.day.to_string() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearSnapshot {
    pub year: i32,
    pub modalities: Vec<ModalitySnapshot>,
}

/// Validated provider record for one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub code: i64,
    pub name: Option<String>,
    pub years: Vec<YearSnapshot>,
}

impl RemoteRecord {
    pub fn year(&self, year: i32) -> Option<&YearSnapshot> {
        self.years.iter().find(|y| y.year == year)
    }
}

/// Row written by the conflict-key upsert on `(course_id, year, modality_code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutScoreUpsert {
    pub course_id: CourseId,
    pub year: i32,
    pub modality_code: String,
    pub modality_name: Option<String>,
    pub cut_score: Option<f64>,
    pub applicants: Option<u32>,
    pub vacancies: Option<u32>,
    pub partial_scores: Vec<PartialScore>,
}

impl CutScoreUpsert {
    /// Builds the row under the canonical year, whatever year the snapshot was reported in.
    pub fn canonical(course_id: CourseId, target_year: i32, modality: &ModalitySnapshot) -> Self {
        Self {
            course_id,
            year: target_year,
            modality_code: modality.code.clone(),
            modality_name: modality.name.clone(),
            cut_score: modality.cut_score,
            applicants: modality.applicants,
            vacancies: modality.vacancies,
            partial_scores: modality.partial_scores.clone(),
        }
    }

    pub fn conflict_key(&self) -> (CourseId, i32, &str) {
        (self.course_id, self.year, self.modality_code.as_str())
    }
}

/// Day value as found in stored rows, where it may be a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DayTag {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for DayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayTag::Int(v) => write!(f, "{v}"),
            DayTag::Float(v) => write!(f, "{v:?}"),
            DayTag::Text(v) => f.write_str(v),
        }
    }
}

impl From<u32> for DayTag {
    fn from(value: u32) -> Self {
        DayTag::Int(i64::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPartialScore {
    pub day: DayTag,
    #[serde(default)]
    pub score: Option<f64>,
}

impl From<PartialScore> for StoredPartialScore {
    fn from(value: PartialScore) -> Self {
        Self {
            day: value.day.into(),
            score: Some(value.score),
        }
    }
}

/// Persisted cut-score row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutScoreRecord {
    pub course_id: CourseId,
    pub year: i32,
    pub modality_code: String,
    #[serde(default)]
    pub modality_name: Option<String>,
    #[serde(default)]
    pub cut_score: Option<f64>,
    #[serde(default)]
    pub applicants: Option<u32>,
    #[serde(default)]
    pub vacancies: Option<u32>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub partial_scores: Vec<StoredPartialScore>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// Narrow projection of a cut-score row used by completeness detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutScoreFacet {
    pub course_id: CourseId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub partial_scores: Vec<StoredPartialScore>,
}

impl CutScoreFacet {
    pub fn has_day(&self, tag: &str) -> bool {
        self.partial_scores.iter().any(|p| p.day.to_string() == tag)
    }
}

impl From<&CutScoreRecord> for CutScoreFacet {
    fn from(value: &CutScoreRecord) -> Self {
        Self {
            course_id: value.course_id,
            partial_scores: value.partial_scores.clone(),
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}
