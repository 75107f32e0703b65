use std::str::FromStr;
use std::time::Duration;

use sisu_adapters::DEFAULT_PROVIDER_URL;
use sisu_storage::{HttpClientConfig, RestStoreConfig};
use thiserror::Error;

use crate::orchestrator::EngineConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_base_url: String,
    pub store_service_key: String,
    pub provider_url: String,
    pub target_year: i32,
    pub source_years: Vec<i32>,
    pub pool_width: usize,
    pub page_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub sync_interval_minutes: u64,
    pub bind_addr: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        Ok(Self {
            store_base_url: required("SISU_STORE_URL")?,
            store_service_key: required("SISU_STORE_SERVICE_KEY")?,
            provider_url: get("SISU_PROVIDER_URL").unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            target_year: parse_or("SISU_TARGET_YEAR", get("SISU_TARGET_YEAR"), 2026)?,
            source_years: match get("SISU_SOURCE_YEARS") {
                Some(raw) => parse_years(&raw)?,
                None => vec![2026, 2025],
            },
            pool_width: parse_or("SISU_POOL_WIDTH", get("SISU_POOL_WIDTH"), 10usize)?.max(1),
            page_size: parse_or("SISU_PAGE_SIZE", get("SISU_PAGE_SIZE"), 1000usize)?.max(1),
            http_timeout_secs: parse_or("SISU_HTTP_TIMEOUT_SECS", get("SISU_HTTP_TIMEOUT_SECS"), 30u64)?,
            user_agent: get("SISU_USER_AGENT").unwrap_or_else(|| "sisu-sync/0.1".to_string()),
            sync_interval_minutes: parse_or(
                "SISU_SYNC_INTERVAL_MINUTES",
                get("SISU_SYNC_INTERVAL_MINUTES"),
                60u64,
            )?,
            bind_addr: get("SISU_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8000".to_string()),
        })
    }

    pub fn http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn store(&self) -> RestStoreConfig {
        RestStoreConfig {
            base_url: self.store_base_url.clone(),
            service_key: self.store_service_key.clone(),
            http: self.http(),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            target_year: self.target_year,
            source_years: self.source_years.clone(),
            pool_width: self.pool_width,
            page_size: self.page_size,
            call_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_years(raw: &str) -> Result<Vec<i32>, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: "SISU_SOURCE_YEARS",
        value: raw.to_string(),
    };
    let years = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<i32>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if years.is_empty() {
        return Err(invalid());
    }
    Ok(years)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const CREDS: [(&str, &str); 2] = [
        ("SISU_STORE_URL", "https://store.example"),
        ("SISU_STORE_SERVICE_KEY", "secret"),
    ];

    #[test]
    fn defaults_follow_the_current_cycle() {
        let cfg = config(&CREDS).unwrap();
        assert_eq!(cfg.target_year, 2026);
        assert_eq!(cfg.source_years, vec![2026, 2025]);
        assert_eq!(cfg.pool_width, 10);
        assert_eq!(cfg.page_size, 1000);
        assert_eq!(cfg.engine().call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.provider_url, DEFAULT_PROVIDER_URL);
    }

    #[test]
    fn missing_credentials_are_fatal() {
        assert_eq!(
            config(&[("SISU_STORE_URL", "https://store.example")]).unwrap_err(),
            ConfigError::Missing("SISU_STORE_SERVICE_KEY")
        );
        assert_eq!(
            config(&[("SISU_STORE_URL", "x"), ("SISU_STORE_SERVICE_KEY", "  ")]).unwrap_err(),
            ConfigError::Missing("SISU_STORE_SERVICE_KEY")
        );
    }

    #[test]
    fn overrides_are_parsed_and_validated() {
        let mut vars = CREDS.to_vec();
        vars.extend([
            ("SISU_SOURCE_YEARS", "2027, 2026 ,2025"),
            ("SISU_TARGET_YEAR", "2027"),
            ("SISU_POOL_WIDTH", "0"),
        ]);
        let cfg = config(&vars).unwrap();
        assert_eq!(cfg.source_years, vec![2027, 2026, 2025]);
        assert_eq!(cfg.target_year, 2027);
        assert_eq!(cfg.pool_width, 1);

        let mut bad = CREDS.to_vec();
        bad.push(("SISU_SOURCE_YEARS", "2026,next"));
        assert!(matches!(
            config(&bad),
            Err(ConfigError::Invalid { key: "SISU_SOURCE_YEARS", .. })
        ));

        let mut bad = CREDS.to_vec();
        bad.push(("SISU_POOL_WIDTH", "many"));
        assert!(matches!(
            config(&bad),
            Err(ConfigError::Invalid { key: "SISU_POOL_WIDTH", .. })
        ));
    }
}
