//! Remote source contracts, provider payload decoding and source implementations.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use sisu_core::{ModalitySnapshot, PartialScore, RemoteRecord, YearSnapshot};
use sisu_storage::HttpClientConfig;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "sisu-adapters";

pub const DEFAULT_PROVIDER_URL: &str = "https://meusisu.com/api";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("provider returned http status {status}")]
    Api { status: u16 },
    #[error("provider returned no usable data")]
    NoData,
    #[error("provider request failed: {0}")]
    Transport(String),
}

/// Per-course access to the remote provider. Implementations never retry.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, code: i64) -> Result<RemoteRecord, SourceError>;
}

/// Number as the provider sends it: sometimes a number, sometimes a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawNumber {
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            RawNumber::Int(v) => *v as f64,
            RawNumber::Float(v) => *v,
            RawNumber::Text(v) => v.trim().parse().ok()?,
        };
        value.is_finite().then_some(value)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawNumber::Int(v) => Some(*v),
            RawNumber::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            RawNumber::Float(_) => None,
            RawNumber::Text(v) => v.trim().parse().ok(),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    fn as_code(&self) -> Option<String> {
        let code = match self {
            RawNumber::Int(v) => v.to_string(),
            RawNumber::Float(v) => v.to_string(),
            RawNumber::Text(v) => v.trim().to_string(),
        };
        (!code.is_empty()).then_some(code)
    }
}

/// Provider payload before validation. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPayload {
    #[serde(default, alias = "courseName")]
    pub course_name: Option<String>,
    #[serde(default)]
    pub years: Option<Vec<RawYear>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawYear {
    #[serde(default)]
    pub year: Option<RawNumber>,
    #[serde(default)]
    pub modalities: Option<Vec<RawModality>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawModality {
    #[serde(default)]
    pub code: Option<RawNumber>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "cutScore")]
    pub cut_score: Option<RawNumber>,
    #[serde(default)]
    pub applicants: Option<RawNumber>,
    #[serde(default)]
    pub vacancies: Option<RawNumber>,
    #[serde(default, alias = "partialScores")]
    pub partial_scores: Option<Vec<RawPartialScore>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPartialScore {
    #[serde(default)]
    pub day: Option<RawNumber>,
    #[serde(default)]
    pub score: Option<RawNumber>,
}

impl RawPartialScore {
    fn validate(&self) -> Option<PartialScore> {
        let day = self.day.as_ref()?.as_u32().filter(|d| *d > 0)?;
        let score = self.score.as_ref()?.as_f64()?;
        Some(PartialScore { day, score })
    }
}

impl RawModality {
    fn validate(&self) -> Option<ModalitySnapshot> {
        let code = self.code.as_ref()?.as_code()?;
        Some(ModalitySnapshot {
            code,
            name: self.name.clone(),
            cut_score: self.cut_score.as_ref().and_then(RawNumber::as_f64),
            applicants: self.applicants.as_ref().and_then(RawNumber::as_u32),
            vacancies: self.vacancies.as_ref().and_then(RawNumber::as_u32),
            partial_scores: self
                .partial_scores
                .iter()
                .flatten()
                .filter_map(RawPartialScore::validate)
                .collect(),
        })
    }
}

impl RawYear {
    fn validate(&self) -> Option<YearSnapshot> {
        let year = self.year.as_ref()?.as_i64()?;
        let year = i32::try_from(year).ok()?;
        Some(YearSnapshot {
            year,
            modalities: self
                .modalities
                .iter()
                .flatten()
                .filter_map(RawModality::validate)
                .collect(),
        })
    }
}

impl ProviderPayload {
    pub fn into_record(self, code: i64) -> Result<RemoteRecord, SourceError> {
        let years: Vec<YearSnapshot> = self
            .years
            .iter()
            .flatten()
            .filter_map(RawYear::validate)
            .collect();
        if years.is_empty() {
            return Err(SourceError::NoData);
        }
        Ok(RemoteRecord {
            code,
            name: self.course_name.filter(|n| !n.trim().is_empty()),
            years,
        })
    }
}

/// Decodes a raw provider body. Empty or unparseable bodies are `NoData`.
pub fn decode_payload(code: i64, body: &[u8]) -> Result<RemoteRecord, SourceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SourceError::NoData);
    }
    let payload: ProviderPayload = serde_json::from_slice(body).map_err(|err| {
        debug!(code, %err, "provider payload did not parse");
        SourceError::NoData
    })?;
    payload.into_record(code)
}

/// Live provider over HTTP, one bounded request per course.
///
/// Only JSON bodies are decoded. The live endpoint may answer with a binary
/// course payload instead; such bodies fail to parse and surface as
/// [`SourceError::NoData`], so point `SISU_PROVIDER_URL` at a JSON-speaking
/// endpoint or use [`FixtureSource`].
#[derive(Debug, Clone)]
pub struct ProviderSource {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderSource {
    pub fn new(base_url: impl Into<String>, http: &HttpClientConfig) -> Result<Self> {
        let base_url: String = base_url.into();
        Ok(Self {
            client: http.build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn course_url(&self, code: i64) -> String {
        format!("{}/getCourseData?courseCode={code}", self.base_url)
    }
}

#[async_trait]
impl RemoteSource for ProviderSource {
    fn source_id(&self) -> &'static str {
        "meusisu"
    }

    async fn fetch(&self, code: i64) -> Result<RemoteRecord, SourceError> {
        let span = info_span!("provider_fetch", code);
        async {
            let resp = self
                .client
                .get(self.course_url(code))
                .send()
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::Api {
                    status: status.as_u16(),
                });
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;
            decode_payload(code, &body)
        }
        .instrument(span)
        .await
    }
}

/// Serves provider payloads from `<dir>/<code>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, code: i64) -> Result<RemoteRecord, SourceError> {
        let path = self.dir.join(format!("{code}.json"));
        match tokio::fs::read(&path).await {
            Ok(body) => decode_payload(code, &body),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NoData),
            Err(err) => Err(SourceError::Transport(format!("reading {}: {err}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use axum::{extract::Query, http::StatusCode, routing::get, Router};
    use sisu_core::TARGET_DAY;

    use super::*;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/provider")
    }

    fn fixture_bytes(code: i64) -> Vec<u8> {
        std::fs::read(fixtures_dir().join(format!("{code}.json"))).unwrap()
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http(timeout: Duration) -> HttpClientConfig {
        HttpClientConfig {
            timeout,
            user_agent: Some("sisu-test".into()),
        }
    }

    #[test]
    fn decodes_loose_payload_into_validated_record() {
        let record = decode_payload(20001, &fixture_bytes(20001)).unwrap();
        assert_eq!(record.name.as_deref(), Some("Medicina"));
        assert_eq!(
            record.years.iter().map(|y| y.year).collect::<Vec<_>>(),
            vec![2024, 2026]
        );

        let current = record.year(2026).unwrap();
        assert_eq!(current.modalities.len(), 2);
        let ampla = &current.modalities[0];
        assert_eq!(ampla.code, "A");
        assert_eq!(ampla.cut_score, Some(812.4));
        assert!(ampla.has_day(TARGET_DAY));

        let public_school = &current.modalities[1];
        assert_eq!(public_school.code, "1");
        assert_eq!(public_school.cut_score, None);
        assert_eq!(public_school.applicants, Some(804));
        assert_eq!(
            public_school.partial_scores,
            vec![PartialScore { day: 1, score: 780.0 }]
        );
    }

    #[test]
    fn empty_or_yearless_payloads_are_no_data() {
        assert!(matches!(decode_payload(1, b""), Err(SourceError::NoData)));
        assert!(matches!(decode_payload(1, b"<html>"), Err(SourceError::NoData)));
        // Binary course payloads are not decoded.
        assert!(matches!(
            decode_payload(1, &[0x08, 0xb9, 0x60, 0x12, 0x04, 0x0a, 0x02]),
            Err(SourceError::NoData)
        ));
        assert!(matches!(
            decode_payload(40001, &fixture_bytes(40001)),
            Err(SourceError::NoData)
        ));
        assert!(matches!(
            decode_payload(1, br#"{"years": [{"modalities": []}]}"#),
            Err(SourceError::NoData)
        ));
    }

    #[tokio::test]
    async fn provider_source_decodes_success_and_classifies_failures() {
        let router = Router::new().route(
            "/getCourseData",
            get(|Query(q): Query<std::collections::HashMap<String, String>>| async move {
                match q.get("courseCode").map(String::as_str) {
                    Some("12345") => (
                        StatusCode::OK,
                        String::from_utf8(fixture_bytes(12345)).unwrap(),
                    ),
                    Some("500") => (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()),
                    _ =>(StatusCode::OK, String::new()),
                }
            }),
        );
        let base = spawn_stub(router).await;
        let source = ProviderSource::new(&base, &http(Duration::from_secs(5))).unwrap();

        let record = source.fetch(12345).await.unwrap();
        assert_eq!(record.code, 12345);
        assert_eq!(record.years.len(), 2);

        assert!(matches!(
            source.fetch(500).await,
            Err(SourceError::Api { status: 500 })
        ));
        assert!(matches!(source.fetch(777).await, Err(SourceError::NoData)));
    }

    #[tokio::test]
    async fn provider_timeout_is_a_transport_error() {
        let router = Router::new().route(
            "/getCourseData",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "{}"
            }),
        );
        let base = spawn_stub(router).await;
        let source = ProviderSource::new(&base, &http(Duration::from_millis(200))).unwrap();

        assert!(matches!(source.fetch(1).await, Err(SourceError::Transport(_))));
    }

    #[tokio::test]
    async fn fixture_source_reads_payload_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("12345.json"), fixture_bytes(12345)).unwrap();
        let source = FixtureSource::new(dir.path());

        let record = source.fetch(12345).await.unwrap();
        assert_eq!(record.year(2025).unwrap().modalities[0].cut_score, Some(710.5));
        assert!(matches!(source.fetch(404).await, Err(SourceError::NoData)));
    }
}
