//! Session credential persistence.
//!
//! The blob is a JSON array of cookies. It is written only on an explicit
//! operator action and read once when a live session starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub expires: Option<f64>,
}

fn default_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Domain match as a browser would apply it: exact host, or a suffix
    /// match for dotted/parent domains.
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        if domain.is_empty() {
            return true;
        }
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    }
}

/// `Cookie` header value for a request to `host`, or `None` when no cookie applies.
pub fn cookie_header_for(host: &str, cookies: &[StoredCookie]) -> Option<String> {
    let pairs: Vec<String> = cookies
        .iter()
        .filter(|cookie| cookie.matches_host(host))
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file {path} not found")]
    Missing { path: PathBuf },
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, cookies: &[StoredCookie]) -> Result<(), CredentialError> {
        let json = serde_json::to_vec_pretty(cookies).map_err(|source| CredentialError::Decode {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(|source| CredentialError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load(&self) -> Result<Vec<StoredCookie>, CredentialError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| CredentialError::Decode {
            path: self.path.clone(),
            source,
        })
    }
}
