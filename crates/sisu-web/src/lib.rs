//! Read-only JSON API over the course store.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sisu_core::{Course, CutScoreRecord};
use sisu_storage::{CourseStore, StoreError};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "sisu-web";

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CourseStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn CourseStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CoursePage {
    limit: usize,
    offset: usize,
    courses: Vec<Course>,
}

#[derive(Debug, Serialize)]
struct YearGroup {
    year: i32,
    cut_scores: Vec<CutScoreRecord>,
}

#[derive(Debug, Serialize)]
struct CourseDetail {
    #[serde(flatten)]
    course: Course,
    years: Vec<YearGroup>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/courses", get(courses_handler))
        .route("/api/courses/{code}", get(course_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = sisu_sync::SyncConfig::from_env()?;
    let store = sisu_sync::store_from_config(&config)?;
    let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
    info!(addr = %config.bind_addr, "serving read api");
    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(sisu_sync::shutdown_signal())
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = match state.store.ping().await {
        Ok(()) => "connected",
        Err(err) => {
            warn!(%err, "store ping failed");
            "unreachable"
        }
    };
    Json(json!({ "status": "healthy", "database": database }))
}

async fn courses_handler(State(state): State<Arc<AppState>>, Query(query): Query<PageQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0);
    match state.store.course_page(offset, limit).await {
        Ok(courses) => Json(CoursePage {
            limit,
            offset,
            courses,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn course_detail_handler(State(state): State<Arc<AppState>>, AxumPath(code): AxumPath<String>) -> Response {
    let Ok(code) = code.parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid course code {code:?}"));
    };
    let course = match state.store.course_by_code(code).await {
        Ok(Some(course)) => course,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("course {code} not found")),
        Err(err) => return store_error(err),
    };
    match state.store.cut_scores_for_course(course.id).await {
        Ok(rows) => Json(CourseDetail {
            course,
            years: group_by_year(rows),
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

/// Newest year first; modalities keep store order within a year.
fn group_by_year(mut rows: Vec<CutScoreRecord>) -> Vec<YearGroup> {
    rows.sort_by(|a, b| b.year.cmp(&a.year));
    let mut groups: Vec<YearGroup> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(group) if group.year == row.year => group.cut_scores.push(row),
            _ => groups.push(YearGroup {
                year: row.year,
                cut_scores: vec![row],
            }),
        }
    }
    groups
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    warn!(%err, "store request failed");
    error_response(StatusCode::BAD_GATEWAY, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use sisu_core::{DayTag, StoredPartialScore};
    use sisu_storage::MemoryStore;
    use tower::ServiceExt;

    fn course(id: i64, code: i64) -> Course {
        Course {
            id,
            code,
            name: Some(format!("Course {code}")),
        }
    }

    fn score(course_id: i64, year: i32, modality: &str) -> CutScoreRecord {
        CutScoreRecord {
            course_id,
            year,
            modality_code: modality.to_string(),
            modality_name: None,
            cut_score: Some(700.0),
            applicants: Some(10),
            vacancies: Some(2),
            partial_scores: vec![StoredPartialScore {
                day: DayTag::Int(1),
                score: Some(690.0),
            }],
            captured_at: None,
        }
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::with_courses((1..=30).map(|id| course(id, 1000 + id))));
        store.seed_cut_score(score(1, 2025, "A")).await;
        store.seed_cut_score(score(1, 2026, "A")).await;
        store.seed_cut_score(score(1, 2026, "L1")).await;
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_store_reachability() {
        let store = seeded().await;
        let (status, body) = get_json(app(AppState::new(store.clone())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "connected");

        store.set_unreachable(true).await;
        let (status, body) = get_json(app(AppState::new(store)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "unreachable");
    }

    #[tokio::test]
    async fn course_list_is_paged_and_limit_is_clamped() {
        let router = app(AppState::new(seeded().await));

        let (status, body) = get_json(router.clone(), "/api/courses").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["courses"].as_array().unwrap().len(), 20);

        let (_, body) = get_json(router.clone(), "/api/courses?limit=500&offset=25").await;
        assert_eq!(body["limit"], 100);
        assert_eq!(body["courses"].as_array().unwrap().len(), 5);
        assert_eq!(body["courses"][0]["id"], 26);

        let (_, body) = get_json(router, "/api/courses?limit=0").await;
        assert_eq!(body["limit"], 1);
    }

    #[tokio::test]
    async fn course_detail_groups_scores_by_year() {
        let (status, body) = get_json(app(AppState::new(seeded().await)), "/api/courses/1001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 1001);
        assert_eq!(body["years"][0]["year"], 2026);
        assert_eq!(body["years"][0]["cut_scores"].as_array().unwrap().len(), 2);
        assert_eq!(body["years"][1]["year"], 2025);
    }

    #[tokio::test]
    async fn course_detail_rejects_bad_and_unknown_codes() {
        let router = app(AppState::new(seeded().await));
        let (status, _) = get_json(router.clone(), "/api/courses/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get_json(router, "/api/courses/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
