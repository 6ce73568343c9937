//! Connection URLs and database configuration.
//!
//! # Responsibility
//! - Parse connection URLs into a backend selection.
//! - Load the JSON configuration consumed by `Database::from_config`.
//!
//! # Invariants
//! - Parsing never touches the filesystem; opening does.

use crate::error::{CoreError, CoreResult};
use crate::logging::{default_log_level, init_logging};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_DOCUMENT_STORE: &str = "default";

/// Backend selected by a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    /// `sqlite:///:memory:`: private in-memory SQLite database.
    SqliteMemory,
    /// `sqlite:///relative/path` or `sqlite:////absolute/path`.
    SqliteFile(PathBuf),
    /// `document://<name>` (or `mongomock://<name>`, `memory://<name>`):
    /// in-process document store shared by name.
    Document(String),
}

impl FromStr for StoreUrl {
    type Err = CoreError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let url = url.trim();
        if url.is_empty() {
            return Err(CoreError::InvalidUrl(
                "A database connection URL must be provided.".to_string(),
            ));
        }

        if let Some(rest) = url.strip_prefix("sqlite://") {
            return match rest.strip_prefix('/') {
                Some("") | Some(":memory:") => Ok(Self::SqliteMemory),
                Some(path) => Ok(Self::SqliteFile(PathBuf::from(path))),
                None if rest.is_empty() => Ok(Self::SqliteMemory),
                None => Err(CoreError::InvalidUrl(format!(
                    "sqlite url `{url}` must use `sqlite:///<path>`"
                ))),
            };
        }

        if url == "mongomock" {
            return Ok(Self::Document(DEFAULT_DOCUMENT_STORE.to_string()));
        }
        for scheme in ["document://", "mongomock://", "memory://"] {
            if let Some(name) = url.strip_prefix(scheme) {
                let name = name.trim_matches('/');
                let name = if name.is_empty() {
                    DEFAULT_DOCUMENT_STORE
                } else {
                    name
                };
                return Ok(Self::Document(name.to_string()));
            }
        }

        Err(CoreError::InvalidUrl(format!("unsupported database url `{url}`")))
    }
}

impl Display for StoreUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SqliteMemory => write!(f, "sqlite:///:memory:"),
            Self::SqliteFile(path) => write!(f, "sqlite:///{}", path.display()),
            Self::Document(name) => write!(f, "document://{name}"),
        }
    }
}

/// Database configuration, typically loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Absolute directory for rolling log files; logging stays off when
    /// unset.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Identity written to `audit_user` unless a collection overrides it.
    #[serde(default)]
    pub actor: Option<String>,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            log_level: None,
            log_dir: None,
            actor: None,
        }
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn store_url(&self) -> CoreResult<StoreUrl> {
        self.url.parse()
    }

    /// Starts file logging when `log_dir` is configured.
    ///
    /// Returns whether logging was configured.
    pub fn init_logging(&self) -> CoreResult<bool> {
        let Some(log_dir) = &self.log_dir else {
            return Ok(false);
        };
        let level = self.log_level.as_deref().unwrap_or(default_log_level());
        init_logging(level, log_dir).map_err(CoreError::Logging)?;
        Ok(true)
    }
}
