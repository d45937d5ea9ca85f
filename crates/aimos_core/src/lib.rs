//! Context memory core for AIM-OS.
//!
//! Durable, content-addressed memory atoms with hash-chained snapshots, a
//! bitemporal traceability graph with policy inheritance, and a hierarchical
//! retrieval stack that packs relevant context into a token budget.

pub mod btsm;
pub mod cancel;
pub mod canonical;
pub mod config;
pub mod db;
pub mod error;
pub mod hhni;
pub mod journal;
pub mod kpi;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod store;
pub mod temporal;

pub use btsm::{BtsmError, BtsmRepository, BtsmService, SqliteBtsmRepository};
pub use cancel::{CancellationToken, Deadline};
pub use config::{BackendKind, ConfigError, StoreConfig};
pub use error::ErrorKind;
pub use hhni::{
    HhniError, HierarchicalIndex, RetrievalConfig, RetrievalPipeline, SemanticSearch,
};
pub use journal::{Journal, JournalError};
pub use logging::{default_log_level, init_logging, init_logging_for_store, logging_status};
pub use metrics::StoreMetrics;
pub use model::atom::{Atom, AtomContent, AtomId, AtomValidationError, NewAtom};
pub use model::mpd::{Bitemporal, EdgeRelation, Lifecycle, MpdEdge, MpdNode, TimeDimension};
pub use model::snapshot::Snapshot;
pub use store::{open_store, AtomListQuery, AtomStore, StoreError, StoreResult};
pub use temporal::{TemporalError, TemporalQueryEngine};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
