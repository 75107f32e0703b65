//! Completeness predicate and missing-course detection.

use std::collections::HashSet;
use std::future::Future;

use serde::Serialize;
use sisu_core::{Course, CourseId, CutScoreFacet, TARGET_DAY};
use sisu_storage::{CourseStore, StoreError};
use tracing::{info, warn};

/// True when any of the course's rows has a partial score tagged with the target day.
pub fn is_complete(course_id: CourseId, rows: &[CutScoreFacet]) -> bool {
    rows.iter()
        .any(|row| row.course_id == course_id && row.has_day(TARGET_DAY))
}

/// Course ids satisfying [`is_complete`], built incrementally from pages.
#[derive(Debug, Clone, Default)]
pub struct CompletenessIndex {
    complete: HashSet<CourseId>,
}

impl CompletenessIndex {
    pub fn extend(&mut self, rows: &[CutScoreFacet]) {
        self.complete.extend(
            rows.iter()
                .filter(|row| row.has_day(TARGET_DAY))
                .map(|row| row.course_id),
        );
    }

    pub fn is_complete(&self, course_id: CourseId) -> bool {
        self.complete.contains(&course_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub courses_total: usize,
    pub already_complete: usize,
    /// A page read was cut short by a store failure; counts reflect partial data.
    pub partial: bool,
    #[serde(skip)]
    pub incomplete: Vec<Course>,
}

struct PagedRead<T> {
    rows: Vec<T>,
    partial: bool,
}

/// Reads pages until an empty one. A non-success status, or any failure after
/// the first page, stops the loop and keeps what was read. Failing to reach
/// the store on the first page is fatal.
async fn read_all_pages<T, F, Fut>(
    resource: &'static str,
    page_size: usize,
    mut read_page: F,
) -> Result<PagedRead<T>, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, StoreError>>,
{
    let limit = page_size.max(1);
    let mut offset = 0;
    let mut rows = Vec::new();

    loop {
        match read_page(offset, limit).await {
            Ok(page) if page.is_empty() => return Ok(PagedRead { rows, partial: false }),
            Ok(page) => {
                rows.extend(page);
                offset += limit;
            }
            Err(err) if err.is_status() || offset > 0 => {
                warn!(resource, offset, %err, "page read failed; continuing with partial data");
                return Ok(PagedRead { rows, partial: true });
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn find_incomplete(
    store: &dyn CourseStore,
    target_year: i32,
    page_size: usize,
) -> Result<Detection, StoreError> {
    let courses = read_all_pages("courses", page_size, move |offset, limit| {
        store.course_page(offset, limit)
    })
    .await?;
    info!(courses = courses.rows.len(), "courses loaded");

    let facets = read_all_pages("cut_scores", page_size, move |offset, limit| {
        store.cut_score_facet_page(target_year, offset, limit)
    })
    .await?;

    let mut index = CompletenessIndex::default();
    index.extend(&facets.rows);

    let courses_total = courses.rows.len();
    let incomplete: Vec<Course> = courses
        .rows
        .into_iter()
        .filter(|course| !index.is_complete(course.id))
        .collect();
    info!(
        complete = courses_total - incomplete.len(),
        missing = incomplete.len(),
        target_day = TARGET_DAY,
        "completeness checked"
    );

    Ok(Detection {
        courses_total,
        already_complete: courses_total - incomplete.len(),
        partial: courses.partial || facets.partial,
        incomplete,
    })
}
