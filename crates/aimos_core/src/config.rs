//! Process-level store configuration.
//!
//! # Responsibility
//! - Resolve the atom store backend and paths from the environment.
//! - Fail early on unknown backend names instead of guessing.
//!
//! # Invariants
//! - `CMC_BACKEND` accepts `sqlite` (default) or `jsonl`, case-insensitively.
//! - `CMC_DB_PATH` overrides the SQLite file; otherwise `<root>/cmc.db`.

use crate::error::ErrorKind;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const BACKEND_ENV: &str = "CMC_BACKEND";
pub const DB_PATH_ENV: &str = "CMC_DB_PATH";
pub const DEFAULT_DB_FILE: &str = "cmc.db";

/// Persistence backend for atoms and snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[default]
    Sqlite,
    Jsonl,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Jsonl => "jsonl",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "jsonl" => Ok(Self::Jsonl),
            _ => Err(ConfigError::UnknownBackend(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownBackend(String),
    EmptyPath(&'static str),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownBackend(value) => write!(
                f,
                "unknown {BACKEND_ENV} value `{value}`; expected `sqlite` or `jsonl`"
            ),
            Self::EmptyPath(name) => write!(f, "{name} must not be empty"),
        }
    }
}

impl Error for ConfigError {}

/// Resolved store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: BackendKind,
    /// Root for payloads, journals, tag index, quarantine and KPI files.
    pub data_root: PathBuf,
    /// Explicit SQLite path; `None` means `<data_root>/cmc.db`.
    pub db_path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(backend: BackendKind, data_root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            data_root: data_root.into(),
            db_path: None,
        }
    }

    /// Reads `CMC_BACKEND` / `CMC_DB_PATH` from the process environment.
    pub fn from_env(data_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_lookup(data_root, |name| std::env::var(name).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(
        data_root: impl Into<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let backend = match lookup(BACKEND_ENV) {
            Some(value) if !value.trim().is_empty() => BackendKind::parse(&value)?,
            _ => BackendKind::default(),
        };
        let db_path = match lookup(DB_PATH_ENV) {
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::EmptyPath(DB_PATH_ENV))
            }
            Some(value) => Some(PathBuf::from(value)),
            None => None,
        };
        Ok(Self {
            backend,
            data_root: data_root.into(),
            db_path,
        })
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join(DEFAULT_DB_FILE))
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}
