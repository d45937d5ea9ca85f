//! Hierarchical index and retrieval stack (C6-C10).
//!
//! # Responsibility
//! - Index documents into a five-level tree (`index`).
//! - Rank tree nodes by embedding similarity (`search`).
//! - Refine candidate layout with a deterministic force simulation (`dvns`).
//! - Pack candidates into a token budget after dedup, conflict resolution and
//!   age-based compression (`pipeline`, `budget`).
//!
//! # Invariants
//! - Safety limits are hard errors (`ResourceLimit`), never truncation.
//! - Indexing runs under a 30 s deadline, retrieval under 5 s.
//! - Given the same inputs and seed, every stage is deterministic.

use crate::error::ErrorKind;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod budget;
pub mod compression;
pub mod conflict;
pub mod dedup;
pub mod dvns;
pub mod embedding;
pub mod index;
pub mod limits;
pub mod pipeline;
pub mod scoring;
pub mod search;
pub mod tokens;

pub use budget::{
    optimize_for_budget, BudgetError, BudgetItem, BudgetResult, BudgetStrategy, ExclusionReason,
};
pub use dvns::{DvnsConfig, DvnsEngine, Particle, SimulationMetrics};
pub use embedding::{cosine_similarity, Embedder, EmbeddingProvider, FallbackEmbedder};
pub use index::{HierarchicalIndex, HierarchicalNode, HierarchyLevel};
pub use limits::SafetyLimits;
pub use pipeline::{RetrievalConfig, RetrievalPipeline, RetrievalResult};
pub use search::{SearchResult, SemanticSearch};
pub use tokens::{TokenCounter, Tokenizer};

pub type HhniResult<T> = Result<T, HhniError>;

#[derive(Debug)]
pub enum HhniError {
    Validation(String),
    /// A safety cap was exceeded.
    ResourceLimit {
        limit: &'static str,
        actual: usize,
        max: usize,
    },
    Timeout {
        operation: &'static str,
        elapsed_ms: u128,
    },
    Cancelled,
    NodeNotFound(String),
    Embedding(String),
    Serialization(serde_json::Error),
    Budget(BudgetError),
}

impl HhniError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorKind::Validation,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::Embedding(_) => ErrorKind::Storage,
            Self::Budget(err) => err.kind(),
        }
    }
}

impl Display for HhniError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "{message}"),
            Self::ResourceLimit { limit, actual, max } => {
                write!(f, "safety limit `{limit}` exceeded: {actual} > {max}")
            }
            Self::Timeout {
                operation,
                elapsed_ms,
            } => write!(f, "{operation} exceeded its deadline after {elapsed_ms} ms"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::NodeNotFound(id) => write!(f, "index node not found: {id}"),
            Self::Embedding(message) => write!(f, "embedding provider failed: {message}"),
            Self::Serialization(err) => write!(f, "index serialization error: {err}"),
            Self::Budget(err) => write!(f, "{err}"),
        }
    }
}

impl Error for HhniError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialization(err) => Some(err),
            Self::Budget(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HhniError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

impl From<BudgetError> for HhniError {
    fn from(value: BudgetError) -> Self {
        Self::Budget(value)
    }
}
