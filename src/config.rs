use std::{env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value for {key}: `{value}`")]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Live,
    Scripted,
}

/// Retry and polling knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub max_pauses_per_item: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            max_pauses_per_item: 20,
        }
    }
}

/// Settings of the live browser session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub step_timeout: Duration,
    pub settle_delay: Duration,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://partner.market.yandex.ru".to_string(),
            headless: false,
            chrome_path: None,
            step_timeout: Duration::from_secs(20),
            settle_delay: Duration::from_millis(2000),
            http_timeout: Duration::from_secs(60),
            http_connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub credentials_path: PathBuf,
    pub driver: DriverKind,
    pub operator_keys: String,
    pub request_max_bytes: usize,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let retry_defaults = RetryPolicy::default();
        let session_defaults = SessionConfig::default();

        let driver = match get("REUPLOAD_DRIVER").as_deref() {
            None | Some("live") => DriverKind::Live,
            Some("scripted") => DriverKind::Scripted,
            Some(other) => {
                return Err(ConfigError {
                    key: "REUPLOAD_DRIVER",
                    value: other.to_string(),
                });
            }
        };

        let max_attempts: u32 = parse_or("REUPLOAD_MAX_ATTEMPTS", get("REUPLOAD_MAX_ATTEMPTS"), 3)?;
        if max_attempts == 0 {
            return Err(ConfigError {
                key: "REUPLOAD_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }

        let retry = RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_secs(parse_or(
                "REUPLOAD_RETRY_DELAY_SECS",
                get("REUPLOAD_RETRY_DELAY_SECS"),
                retry_defaults.retry_delay.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_or(
                "REUPLOAD_POLL_INTERVAL_MS",
                get("REUPLOAD_POLL_INTERVAL_MS"),
                retry_defaults.poll_interval.as_millis() as u64,
            )?),
            max_pauses_per_item: parse_or(
                "REUPLOAD_MAX_PAUSES_PER_ITEM",
                get("REUPLOAD_MAX_PAUSES_PER_ITEM"),
                retry_defaults.max_pauses_per_item,
            )?,
        };

        let session = SessionConfig {
            base_url: get("REUPLOAD_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(session_defaults.base_url),
            headless: parse_bool(get("REUPLOAD_HEADLESS")),
            chrome_path: get("CHROME").map(PathBuf::from),
            step_timeout: Duration::from_secs(parse_or(
                "REUPLOAD_STEP_TIMEOUT_SECS",
                get("REUPLOAD_STEP_TIMEOUT_SECS"),
                session_defaults.step_timeout.as_secs(),
            )?),
            settle_delay: Duration::from_millis(parse_or(
                "REUPLOAD_SETTLE_MS",
                get("REUPLOAD_SETTLE_MS"),
                session_defaults.settle_delay.as_millis() as u64,
            )?),
            http_timeout: Duration::from_secs(parse_or(
                "HTTP_TIMEOUT_SECS",
                get("HTTP_TIMEOUT_SECS"),
                session_defaults.http_timeout.as_secs(),
            )?),
            http_connect_timeout: Duration::from_secs(parse_or(
                "HTTP_CONNECT_TIMEOUT_SECS",
                get("HTTP_CONNECT_TIMEOUT_SECS"),
                session_defaults.http_connect_timeout.as_secs(),
            )?),
        };

        Ok(Self {
            port: parse_or("PORT", get("PORT"), 8000)?,
            db_path: get("REUPLOAD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("processed_items.sqlite3")),
            credentials_path: get("REUPLOAD_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cookies.json")),
            driver,
            operator_keys: get("OPERATOR_API_KEYS")
                .unwrap_or_else(|| "operator:operator-key".to_string()),
            request_max_bytes: parse_or("REQUEST_MAX_BYTES", get("REQUEST_MAX_BYTES"), 1024 * 1024)?,
            retry,
            session,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|_| ConfigError { key, value }),
    }
}

fn parse_bool(raw: Option<String>) -> bool {
    raw.map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
