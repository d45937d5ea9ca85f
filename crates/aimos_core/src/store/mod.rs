//! Atom store contracts and backend selection (C2 + C3).
//!
//! # Responsibility
//! - Define the storage-agnostic `AtomStore` contract used by every consumer.
//! - Share the creation pipeline (validate, hash, offload) between backends.
//! - Select the backend once at process start from `StoreConfig`.
//!
//! # Invariants
//! - Validation errors are returned unchanged and never count as write errors.
//! - Storage failures during `create_atom` increment `write_errors_total` and
//!   surface as `StoreError::Write`.
//! - Atoms are listed in insertion order unless scoped to a snapshot, in which
//!   case snapshot order wins.

use crate::config::{BackendKind, StoreConfig};
use crate::db::DbError;
use crate::error::ErrorKind;
use crate::journal::JournalError;
use crate::metrics::StoreMetrics;
use crate::model::atom::{Atom, AtomId, AtomValidationError, NewAtom, MAX_PAYLOAD_BYTES};
use crate::model::snapshot::Snapshot;
use chrono::Utc;
use log::{error, info};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod batch;
mod cache;
pub mod jsonl;
pub mod payload;
pub mod snapshot;
pub mod sqlite;

pub use batch::{BatchIngestor, BatchProgress, BatchReport};
pub use jsonl::{JsonlAtomStore, JsonlOptions};
pub use snapshot::{replay_snapshot, SnapshotReplay};
pub use sqlite::SqliteAtomStore;

pub const PAYLOADS_DIR: &str = "payloads";
pub const QUARANTINE_DIR: &str = "quarantine";
pub const TAG_INDEX_DIR: &str = "index/tags";

pub type StoreResult<T> = Result<T, StoreError>;

/// Atom store failures.
#[derive(Debug)]
pub enum StoreError {
    Validation(AtomValidationError),
    /// Storage failure while persisting; already counted in metrics.
    Write {
        operation: &'static str,
        message: String,
    },
    Db(DbError),
    Journal(JournalError),
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Serialization(serde_json::Error),
    NotFound(AtomId),
    SnapshotMissing(String),
    SnapshotReplay {
        snapshot_id: String,
        atom_id: AtomId,
    },
    InvalidData(String),
    Cancelled,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Write { .. } => ErrorKind::Write,
            Self::Db(_) | Self::Io { .. } | Self::Serialization(_) | Self::InvalidData(_) => {
                ErrorKind::Storage
            }
            Self::Journal(err) => err.kind(),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SnapshotMissing(_) => ErrorKind::SnapshotMissing,
            Self::SnapshotReplay { .. } => ErrorKind::SnapshotReplay,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Write { operation, message } => {
                write!(f, "storage write failed during {operation}: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
            Self::Journal(err) => write!(f, "{err}"),
            Self::Io { path, source } => write!(f, "io error at `{}`: {source}", path.display()),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::NotFound(id) => write!(f, "atom not found: {id}"),
            Self::SnapshotMissing(id) => write!(f, "snapshot not found: {id}"),
            Self::SnapshotReplay {
                snapshot_id,
                atom_id,
            } => write!(
                f,
                "snapshot {snapshot_id} references missing atom {atom_id}"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Journal(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AtomValidationError> for StoreError {
    fn from(value: AtomValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<JournalError> for StoreError {
    fn from(value: JournalError) -> Self {
        Self::Journal(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Query options for listing atoms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomListQuery {
    /// Only atoms carrying this tag key.
    pub tag: Option<String>,
    pub modality: Option<String>,
    /// Only atoms that are members of this snapshot, in snapshot order.
    pub as_of_snapshot: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl AtomListQuery {
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn in_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.as_of_snapshot = Some(snapshot_id.into());
        self
    }
}

/// Storage-agnostic atom and snapshot persistence.
pub trait AtomStore: Send + Sync {
    fn backend(&self) -> BackendKind;
    /// Directory holding payloads, tag index and quarantine files.
    fn data_root(&self) -> &Path;
    fn metrics(&self) -> &Arc<StoreMetrics>;

    /// Validates, hashes, offloads and persists one atom.
    fn create_atom(&self, payload: NewAtom) -> StoreResult<Atom>;
    fn get_atom(&self, id: AtomId) -> StoreResult<Option<Atom>>;
    fn list_atoms(&self, query: &AtomListQuery) -> StoreResult<Vec<Atom>>;
    fn count_atoms(&self) -> StoreResult<u64>;
    /// Tag weights of one atom; `NotFound` for unknown ids.
    fn fetch_atom_tags(&self, id: AtomId) -> StoreResult<BTreeMap<String, f64>>;
    /// Every atom id in insertion order.
    fn atom_ids(&self) -> StoreResult<Vec<AtomId>>;

    /// Creates (or returns the identical existing) snapshot; see [`snapshot`].
    fn create_snapshot(
        &self,
        atom_ids: Option<Vec<AtomId>>,
        note: Option<String>,
    ) -> StoreResult<Snapshot>;
    fn get_snapshot(&self, id: &str) -> StoreResult<Option<Snapshot>>;
    fn latest_snapshot(&self) -> StoreResult<Option<Snapshot>>;
    /// Every snapshot in chain (creation) order.
    fn list_snapshots(&self) -> StoreResult<Vec<Snapshot>>;
}

/// Opens the backend selected by `config`.
pub fn open_store(config: &StoreConfig) -> StoreResult<Box<dyn AtomStore>> {
    open_store_with_metrics(config, Arc::new(StoreMetrics::new()))
}

/// Opens the backend selected by `config`, reporting into `metrics`.
pub fn open_store_with_metrics(
    config: &StoreConfig,
    metrics: Arc<StoreMetrics>,
) -> StoreResult<Box<dyn AtomStore>> {
    info!(
        "event=store_open module=store status=start backend={} root={}",
        config.backend.as_str(),
        config.data_root.display()
    );
    let store: Box<dyn AtomStore> = match config.backend {
        BackendKind::Sqlite => Box::new(SqliteAtomStore::open_with_metrics(
            config.resolved_db_path(),
            &config.data_root,
            metrics,
        )?),
        BackendKind::Jsonl => Box::new(JsonlAtomStore::open_with(
            &config.data_root,
            JsonlOptions {
                metrics,
                ..JsonlOptions::default()
            },
        )?),
    };
    Ok(store)
}

/// Validated atom ready for persistence plus the payload file it needs, if any.
pub(crate) struct PreparedAtom {
    pub atom: Atom,
    pub offloaded: Option<payload::OffloadedPayload>,
}

/// Shared creation pipeline: validate, normalize, hash, decide on offload.
pub(crate) fn prepare_atom(payload: NewAtom, data_root: &Path) -> StoreResult<PreparedAtom> {
    payload.validate()?;
    let normalized = payload.normalized();
    let encoded_len = normalized.encoded_len()?;
    if encoded_len > MAX_PAYLOAD_BYTES {
        return Err(AtomValidationError::PayloadTooLarge { bytes: encoded_len }.into());
    }
    let hash = normalized.content_hash()?;
    let id = Atom::new_id();
    let offloaded = payload::plan_offload(&data_root.join(PAYLOADS_DIR), id, &normalized.content);
    let content = match &offloaded {
        Some(plan) => plan.content.clone(),
        None => normalized.content.clone(),
    };
    let atom = Atom::from_normalized(id, normalized, content, hash, Utc::now(), payload.witness);
    Ok(PreparedAtom { atom, offloaded })
}

/// Converts a storage failure into `Write`, counting and logging it.
pub(crate) fn record_write_failure(
    metrics: &StoreMetrics,
    operation: &'static str,
    err: StoreError,
) -> StoreError {
    if matches!(err, StoreError::Validation(_)) {
        return err;
    }
    metrics.record_write_error(operation);
    error!(
        "event={} module=store status=error error_code=write_failed error_kind={} error={}",
        operation,
        err.kind(),
        err
    );
    StoreError::Write {
        operation,
        message: err.to_string(),
    }
}

pub(crate) fn ensure_layout(data_root: &Path) -> StoreResult<()> {
    for dir in [PAYLOADS_DIR, QUARANTINE_DIR, TAG_INDEX_DIR] {
        let path = data_root.join(dir);
        std::fs::create_dir_all(&path).map_err(|source| StoreError::io(path, source))?;
    }
    Ok(())
}
