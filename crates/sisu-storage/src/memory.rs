//! In-process store with the same key and pagination semantics as the REST store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use sisu_core::{Course, CourseId, CutScoreFacet, CutScoreRecord, CutScoreUpsert, NewCourse};
use tokio::sync::Mutex;

use crate::{CourseStore, StoreError, COURSES, CUT_SCORES};

/// One bulk page served, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRead {
    pub resource: &'static str,
    pub offset: usize,
    pub rows: usize,
}

type CutScoreKey = (CourseId, i32, String);

#[derive(Debug, Default)]
struct MemoryState {
    courses: Vec<Course>,
    cut_scores: BTreeMap<CutScoreKey, CutScoreRecord>,
    page_reads: Vec<PageRead>,
    upsert_calls: usize,
    course_read_failure: Option<(usize, u16)>,
    cut_score_read_failure: Option<(usize, u16)>,
    modality_write_failures: HashMap<String, u16>,
    unreachable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_courses(courses: impl IntoIterator<Item = Course>) -> Self {
        let mut courses: Vec<Course> = courses.into_iter().collect();
        courses.sort_by_key(|c| c.id);
        Self {
            state: Mutex::new(MemoryState {
                courses,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn seed_cut_score(&self, record: CutScoreRecord) {
        let key = (record.course_id, record.year, record.modality_code.clone());
        self.state.lock().await.cut_scores.insert(key, record);
    }

    /// Page reads of `courses` at or past `offset` answer with `status`.
    pub async fn fail_course_reads_from(&self, offset: usize, status: u16) {
        self.state.lock().await.course_read_failure = Some((offset, status));
    }

    pub async fn fail_cut_score_reads_from(&self, offset: usize, status: u16) {
        self.state.lock().await.cut_score_read_failure = Some((offset, status));
    }

    pub async fn fail_upserts_for_modality(&self, modality_code: &str, status: u16) {
        self.state
            .lock()
            .await
            .modality_write_failures
            .insert(modality_code.to_string(), status);
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    pub async fn cut_scores(&self) -> Vec<CutScoreRecord> {
        self.state.lock().await.cut_scores.values().cloned().collect()
    }

    pub async fn courses(&self) -> Vec<Course> {
        self.state.lock().await.courses.clone()
    }

    pub async fn page_reads(&self) -> Vec<PageRead> {
        self.state.lock().await.page_reads.clone()
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }
}

fn check_reachable(state: &MemoryState) -> Result<(), StoreError> {
    if state.unreachable {
        return Err(StoreError::Transport("connection refused".to_string()));
    }
    Ok(())
}

fn check_read_failure(failure: Option<(usize, u16)>, offset: usize) -> Result<(), StoreError> {
    match failure {
        Some((from, status)) if offset >= from => Err(StoreError::Status {
            status,
            body: "injected read failure".to_string(),
        }),
        _ => Ok(()),
    }
}

fn page<T: Clone>(rows: &[T], offset: usize, limit: usize) -> Vec<T> {
    rows.iter().skip(offset).take(limit).cloned().collect()
}

#[async_trait]
impl CourseStore for MemoryStore {
    async fn course_page(&self, offset: usize, limit: usize) -> Result<Vec<Course>, StoreError> {
        let mut state = self.state.lock().await;
        check_reachable(&state)?;
        check_read_failure(state.course_read_failure, offset)?;
        let rows = page(&state.courses, offset, limit);
        state.page_reads.push(PageRead {
            resource: COURSES,
            offset,
            rows: rows.len(),
        });
        Ok(rows)
    }

    async fn cut_score_facet_page(
        &self,
        year: i32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CutScoreFacet>, StoreError> {
        let mut state = self.state.lock().await;
        check_reachable(&state)?;
        check_read_failure(state.cut_score_read_failure, offset)?;
        let facets: Vec<CutScoreFacet> = state
            .cut_scores
            .values()
            .filter(|r| r.year == year)
            .map(CutScoreFacet::from)
            .collect();
        let rows = page(&facets, offset, limit);
        state.page_reads.push(PageRead {
            resource: CUT_SCORES,
            offset,
            rows: rows.len(),
        });
        Ok(rows)
    }

    async fn upsert_cut_score(&self, row: &CutScoreUpsert) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        check_reachable(&state)?;
        state.upsert_calls += 1;
        if let Some(status) = state.modality_write_failures.get(&row.modality_code) {
            return Err(StoreError::Status {
                status: *status,
                body: format!("injected write failure for modality {}", row.modality_code),
            });
        }
        let record = CutScoreRecord {
            course_id: row.course_id,
            year: row.year,
            modality_code: row.modality_code.clone(),
            modality_name: row.modality_name.clone(),
            cut_score: row.cut_score,
            applicants: row.applicants,
            vacancies: row.vacancies,
            partial_scores: row.partial_scores.iter().copied().map(Into::into).collect(),
            captured_at: Some(Utc::now()),
        };
        let (course_id, year, modality_code) = row.conflict_key();
        state
            .cut_scores
            .insert((course_id, year, modality_code.to_string()), record);
        Ok(())
    }

    async fn course_by_code(&self, code: i64) -> Result<Option<Course>, StoreError> {
        let state = self.state.lock().await;
        check_reachable(&state)?;
        Ok(state.courses.iter().find(|c| c.code == code).cloned())
    }

    async fn cut_scores_for_course(&self, course_id: CourseId) -> Result<Vec<CutScoreRecord>, StoreError> {
        let state = self.state.lock().await;
        check_reachable(&state)?;
        let mut rows: Vec<CutScoreRecord> = state
            .cut_scores
            .values()
            .filter(|r| r.course_id == course_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.year.cmp(&a.year).then_with(|| a.modality_code.cmp(&b.modality_code)));
        Ok(rows)
    }

    async fn save_course(&self, course: &NewCourse) -> Result<Course, StoreError> {
        let mut state = self.state.lock().await;
        check_reachable(&state)?;
        if let Some(existing) = state.courses.iter_mut().find(|c| c.code == course.code) {
            existing.name = Some(course.name.clone());
            return Ok(existing.clone());
        }
        let id = state.courses.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let created = Course {
            id,
            code: course.code,
            name: Some(course.name.clone()),
        };
        state.courses.push(created.clone());
        Ok(created)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        check_reachable(&*self.state.lock().await)
    }
}
