//! REST store adapter + the course store seam used by the sync engine.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sisu_core::{Course, CourseId, CutScoreFacet, CutScoreRecord, CutScoreUpsert, NewCourse};
use thiserror::Error;
use tracing::debug;

mod memory;

pub use memory::{MemoryStore, PageRead};

pub const CRATE_NAME: &str = "sisu-storage";

pub const COURSES: &str = "courses";
pub const CUT_SCORES: &str = "cut_scores";

/// Conflict key of the cut-score table.
pub const CUT_SCORE_CONFLICT_KEY: [&str; 3] = ["course_id", "year", "modality_code"];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        self.client_builder().build().context("building reqwest client")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Transport(String),
    #[error("store returned http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decoding store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// The store answered, but with a non-success status.
    pub fn is_status(&self) -> bool {
        matches!(self, StoreError::Status { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// One paginated bulk read in PostgREST query syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub resource: String,
    pub select: Option<String>,
    pub filters: Vec<(String, String)>,
    pub order: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl ListQuery {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            select: None,
            filters: Vec::new(),
            order: None,
            offset: 0,
            limit: 1000,
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters
            .push((column.into(), format!("eq.{}", value.to_string())));
        self
    }

    pub fn order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(select) = &self.select {
            pairs.push(("select".to_string(), select.clone()));
        }
        pairs.extend(self.filters.iter().cloned());
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        pairs.push(("offset".to_string(), self.offset.to_string()));
        pairs.push(("limit".to_string(), self.limit.to_string()));
        pairs
    }
}

/// Store operations the reconciliation engine and the read API depend on.
#[async_trait]
pub trait CourseStore: Send + Sync {
    /// Courses ordered by id.
    async fn course_page(&self, offset: usize, limit: usize) -> Result<Vec<Course>, StoreError>;

    async fn cut_score_facet_page(
        &self,
        year: i32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CutScoreFacet>, StoreError>;

    /// Insert, or replace every non-key field on `(course_id, year, modality_code)` conflict.
    async fn upsert_cut_score(&self, row: &CutScoreUpsert) -> Result<(), StoreError>;

    async fn course_by_code(&self, code: i64) -> Result<Option<Course>, StoreError>;

    async fn cut_scores_for_course(&self, course_id: CourseId) -> Result<Vec<CutScoreRecord>, StoreError>;

    /// Creates the course, or patches the descriptive fields of the one with the same code.
    async fn save_course(&self, course: &NewCourse) -> Result<Course, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub http: HttpClientConfig,
}

/// PostgREST-style store client.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_key).context("service key is not a valid header value")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let client = config
            .http
            .client_builder()
            .default_headers(headers)
            .build()
            .context("building store client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, resource: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, resource)
    }

    pub async fn list<T: DeserializeOwned>(&self, query: &ListQuery) -> Result<Vec<T>, StoreError> {
        debug!(resource = %query.resource, offset = query.offset, limit = query.limit, "store page read");
        let resp = self
            .client
            .get(self.endpoint(&query.resource))
            .query(&query.to_query_pairs())
            .send()
            .await?;
        let resp = check_response(resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn get_by_unique_key<T: DeserializeOwned>(
        &self,
        resource: &str,
        key: &[(&str, String)],
    ) -> Result<Option<T>, StoreError> {
        let mut query = ListQuery::new(resource).page(0, 1);
        for (column, value) in key {
            query = query.eq(*column, value);
        }
        let mut rows: Vec<T> = self.list(&query).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }

    /// Single-round-trip merge-on-conflict write.
    pub async fn upsert<R, T>(
        &self,
        resource: &str,
        row: &R,
        conflict_key: &[&str],
    ) -> Result<Option<T>, StoreError>
    where
        R: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.endpoint(resource))
            .query(&[("on_conflict", conflict_key.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(row)
            .send()
            .await?;
        first_row(check_response(resp).await?).await
    }

    pub async fn insert<R, T>(&self, resource: &str, row: &R) -> Result<Option<T>, StoreError>
    where
        R: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.endpoint(resource))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        first_row(check_response(resp).await?).await
    }

    pub async fn patch<F, T>(
        &self,
        resource: &str,
        key: &[(&str, String)],
        fields: &F,
    ) -> Result<Option<T>, StoreError>
    where
        F: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let filters: Vec<(String, String)> = key
            .iter()
            .map(|(column, value)| (column.to_string(), format!("eq.{value}")))
            .collect();
        let resp = self
            .client
            .patch(self.endpoint(resource))
            .query(&filters)
            .header("Prefer", "return=representation")
            .json(fields)
            .send()
            .await?;
        first_row(check_response(resp).await?).await
    }
}

#[async_trait]
impl CourseStore for RestStore {
    async fn course_page(&self, offset: usize, limit: usize) -> Result<Vec<Course>, StoreError> {
        let query = ListQuery::new(COURSES)
            .select("id,code,name")
            .order("id")
            .page(offset, limit);
        self.list(&query).await
    }

    async fn cut_score_facet_page(
        &self,
        year: i32,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CutScoreFacet>, StoreError> {
        let query = ListQuery::new(CUT_SCORES)
            .select("course_id,partial_scores")
            .eq("year", year)
            .order("course_id,modality_code")
            .page(offset, limit);
        self.list(&query).await
    }

    async fn upsert_cut_score(&self, row: &CutScoreUpsert) -> Result<(), StoreError> {
        self.upsert::<_, JsonValue>(CUT_SCORES, row, &CUT_SCORE_CONFLICT_KEY)
            .await
            .map(|_| ())
    }

    async fn course_by_code(&self, code: i64) -> Result<Option<Course>, StoreError> {
        self.get_by_unique_key(COURSES, &[("code", code.to_string())])
            .await
    }

    async fn cut_scores_for_course(&self, course_id: CourseId) -> Result<Vec<CutScoreRecord>, StoreError> {
        let query = ListQuery::new(CUT_SCORES)
            .eq("course_id", course_id)
            .order("year.desc,modality_code,captured_at.desc")
            .page(0, 1000);
        self.list(&query).await
    }

    async fn save_course(&self, course: &NewCourse) -> Result<Course, StoreError> {
        let key = [("code", course.code.to_string())];
        let existing: Option<Course> = self.get_by_unique_key(COURSES, &key).await?;
        let saved: Option<Course> = match existing {
            Some(existing) => {
                let patched = self
                    .patch(COURSES, &key, &serde_json::json!({ "name": course.name }))
                    .await?;
                Some(patched.unwrap_or(existing))
            }
            None => self.insert(COURSES, course).await?,
        };
        saved.ok_or_else(|| StoreError::Decode(format!("store returned no row for course {}", course.code)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let query = ListQuery::new(COURSES).select("id").page(0, 1);
        self.list::<JsonValue>(&query).await.map(|_| ())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn first_row<T: DeserializeOwned>(resp: reqwest::Response) -> Result<Option<T>, StoreError> {
    let bytes = resp.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: JsonValue = serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
    let row = match value {
        JsonValue::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        JsonValue::Array(_) => return Ok(None),
        other => other,
    };
    serde_json::from_value(row)
        .map(Some)
        .map_err(|e| StoreError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Query, State},
        http::{HeaderMap as AxumHeaders, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use sisu_core::PartialScore;

    use super::*;

    #[derive(Default)]
    struct Captured {
        query: HashMap<String, String>,
        prefer: Option<String>,
        apikey: Option<String>,
        body: Option<JsonValue>,
    }

    type Shared = Arc<Mutex<Captured>>;

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn store(base_url: String) -> RestStore {
        RestStore::new(RestStoreConfig {
            base_url,
            service_key: "service-key".into(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: Some("sisu-test".into()),
            },
        })
        .unwrap()
    }

    fn upsert_row() -> CutScoreUpsert {
        CutScoreUpsert {
            course_id: 7,
            year: 2026,
            modality_code: "A".into(),
            modality_name: Some("Ampla concorrência".into()),
            cut_score: Some(710.5),
            applicants: Some(120),
            vacancies: Some(40),
            partial_scores: vec![PartialScore { day: 1, score: 705.0 }],
        }
    }

    #[test]
    fn list_query_renders_postgrest_pairs() {
        let query = ListQuery::new(CUT_SCORES)
            .select("course_id,partial_scores")
            .eq("year", 2026)
            .order("course_id")
            .page(2000, 1000);
        assert_eq!(
            query.to_query_pairs(),
            vec![
                ("select".to_string(), "course_id,partial_scores".to_string()),
                ("year".to_string(), "eq.2026".to_string()),
                ("order".to_string(), "course_id".to_string()),
                ("offset".to_string(), "2000".to_string()),
                ("limit".to_string(), "1000".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn upsert_is_one_post_with_conflict_key_and_merge_preference() {
        async fn handler(
            State(shared): State<Shared>,
            Query(query): Query<HashMap<String, String>>,
            headers: AxumHeaders,
            Json(body): Json<JsonValue>,
        ) -> (StatusCode, Json<JsonValue>) {
            let mut captured = shared.lock().unwrap();
            captured.query = query;
            captured.prefer = headers
                .get("prefer")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            captured.apikey = headers
                .get("apikey")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            captured.body = Some(body.clone());
            (StatusCode::CREATED, Json(serde_json::json!([body])))
        }

        let shared: Shared = Arc::default();
        let router = Router::new()
            .route("/rest/v1/cut_scores", post(handler))
            .with_state(shared.clone());
        let store = store(spawn_stub(router).await);

        store.upsert_cut_score(&upsert_row()).await.unwrap();

        let captured = shared.lock().unwrap();
        assert_eq!(
            captured.query.get("on_conflict").map(String::as_str),
            Some("course_id,year,modality_code")
        );
        assert!(captured
            .prefer
            .as_deref()
            .unwrap()
            .contains("resolution=merge-duplicates"));
        assert_eq!(captured.apikey.as_deref(), Some("service-key"));
        let body = captured.body.as_ref().unwrap();
        assert_eq!(body["year"], 2026);
        assert_eq!(body["partial_scores"][0]["day"], 1);
    }

    #[tokio::test]
    async fn non_success_upsert_carries_status_and_body() {
        let router = Router::new().route(
            "/rest/v1/cut_scores",
            post(|| async { (StatusCode::CONFLICT, "duplicate key value") }),
        );
        let store = store(spawn_stub(router).await);

        let err = store.upsert_cut_score(&upsert_row()).await.unwrap_err();
        match err {
            StoreError::Status { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "duplicate key value");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn facet_pages_decode_mixed_day_types() {
        let router = Router::new().route(
            "/rest/v1/cut_scores",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                assert_eq!(query.get("year").map(String::as_str), Some("eq.2026"));
                Json(serde_json::json!([
                    {"course_id": 1, "partial_scores": [{"day": "2", "score": 700.0}]},
                    {"course_id": 2, "partial_scores": null},
                ]))
            }),
        );
        let store = store(spawn_stub(router).await);

        let page = store.cut_score_facet_page(2026, 0, 1000).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].has_day("2"));
        assert!(!page[1].has_day("2"));
    }

    #[tokio::test]
    async fn unreachable_store_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let store = store(format!("http://{addr}"));

        let err = store.course_page(0, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
        assert!(!err.is_status());
    }
}
