//! Bitemporal traceability graph (C4).
//!
//! # Responsibility
//! - Persist governed nodes (MPDs) and their relations with bitemporal
//!   intervals.
//! - Enforce policy inheritance and dependency-degree caps on `depends_on`.
//! - Answer blast-radius reachability with policy coverage checks.
//!
//! # Invariants
//! - Every mutation runs in one immediate transaction.
//! - Stored `depends_on` edges carry a superset of their source's policies.
//! - Open `depends_on` edges per source never exceed a non-zero
//!   `max_dependency_degree`.
//!
//! # See also
//! - `temporal` for as-of / range / history reads over the same tables.

use crate::db::DbError;
use crate::error::ErrorKind;
use crate::kpi::KpiError;
use crate::model::mpd::{EdgeRelation, Lifecycle, MpdEdge, MpdNode};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod blast_radius;
pub mod repo;
pub mod service;

pub use blast_radius::{
    calculate_blast_radius, BlastRadiusReport, BlastRadiusRequest, Violation, ViolationKind,
};
pub use repo::{BtsmRepository, SqliteBtsmRepository};
pub use service::BtsmService;

pub type BtsmResult<T> = Result<T, BtsmError>;

#[derive(Debug)]
pub enum BtsmError {
    Db(DbError),
    Validation(String),
    PolicyViolation {
        source_id: String,
        target_id: String,
    },
    DegreeExceeded {
        source_id: String,
        limit: u32,
        open_edges: u32,
    },
    LifecycleRegression {
        mpd_id: String,
        from: Lifecycle,
        to: Lifecycle,
    },
    NodeNotFound(String),
    InvalidData(String),
    Serialization(serde_json::Error),
    Kpi(KpiError),
}

impl BtsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::LifecycleRegression { .. } => ErrorKind::Validation,
            Self::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Self::DegreeExceeded { .. } => ErrorKind::DegreeExceeded,
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::Kpi(err) => err.kind(),
            Self::Db(_) | Self::InvalidData(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

impl Display for BtsmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation(message) => write!(f, "{message}"),
            Self::PolicyViolation {
                source_id,
                target_id,
            } => write!(
                f,
                "depends_on edge missing policy inheritance ({source_id} -> {target_id})"
            ),
            Self::DegreeExceeded {
                source_id,
                limit,
                open_edges,
            } => write!(
                f,
                "node {source_id} already has {open_edges} open depends_on edges (max_dependency_degree={limit})"
            ),
            Self::LifecycleRegression { mpd_id, from, to } => {
                write!(f, "node {mpd_id} cannot move from {from} back to {to}")
            }
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted graph data: {message}"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::Kpi(err) => write!(f, "{err}"),
        }
    }
}

impl Error for BtsmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::Kpi(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for BtsmError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for BtsmError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for BtsmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

impl From<KpiError> for BtsmError {
    fn from(value: KpiError) -> Self {
        Self::Kpi(value)
    }
}

/// How a requested policy set is matched against a record's policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMatch {
    /// Record covers every requested policy.
    #[default]
    All,
    /// Record shares at least one requested policy.
    Any,
}

impl PolicyMatch {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    /// An empty request matches everything.
    pub fn matches(self, record: &[String], requested: &[String]) -> bool {
        if requested.is_empty() {
            return true;
        }
        match self {
            Self::All => covers(record, requested),
            Self::Any => requested.iter().any(|policy| record.contains(policy)),
        }
    }
}

/// `record ⊇ required`.
pub fn covers(record: &[String], required: &[String]) -> bool {
    required.iter().all(|policy| record.contains(policy))
}

/// Required policies missing from `record`, in `required` order.
pub fn missing_policies(record: &[String], required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|policy| !record.contains(policy))
        .cloned()
        .collect()
}

/// Union preserving first-seen order.
pub fn merge_policies<'a>(sets: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for set in sets {
        for policy in set {
            let policy = policy.trim();
            if !policy.is_empty() && !merged.iter().any(|seen| seen == policy) {
                merged.push(policy.to_string());
            }
        }
    }
    merged
}

/// Filters for current node versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Empty means any lifecycle.
    #[serde(default)]
    pub lifecycles: Vec<Lifecycle>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    #[serde(default)]
    pub policy_match: PolicyMatch,
}

impl NodeFilter {
    pub fn accepts(&self, node: &MpdNode) -> bool {
        (self.lifecycles.is_empty() || self.lifecycles.contains(&node.lifecycle))
            && self
                .policy_match
                .matches(&node.policy_pack_ids, &self.policy_pack_ids)
    }
}

/// Filters for current edge rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeFilter {
    #[serde(default)]
    pub relation: Option<EdgeRelation>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    #[serde(default)]
    pub policy_match: PolicyMatch,
}

impl EdgeFilter {
    pub fn accepts(&self, edge: &MpdEdge) -> bool {
        self.relation
            .as_ref()
            .map_or(true, |relation| &edge.relation == relation)
            && self
                .source_id
                .as_deref()
                .map_or(true, |source| edge.source_id == source)
            && self
                .target_id
                .as_deref()
                .map_or(true, |target| edge.target_id == target)
            && self
                .policy_match
                .matches(&edge.policy_pack_ids, &self.policy_pack_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_policies, missing_policies, PolicyMatch};

    fn set(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn all_requires_subset_any_requires_intersection() {
        let record = set(&["policy.a", "policy.b"]);
        assert!(PolicyMatch::All.matches(&record, &set(&["policy.a"])));
        assert!(!PolicyMatch::All.matches(&record, &set(&["policy.a", "policy.c"])));
        assert!(PolicyMatch::Any.matches(&record, &set(&["policy.a", "policy.c"])));
        assert!(!PolicyMatch::Any.matches(&record, &set(&["policy.c"])));
        assert!(PolicyMatch::Any.matches(&record, &[]));
    }

    #[test]
    fn merge_keeps_first_seen_order() {
        let source = set(&["policy.alpha", "policy.shared"]);
        let provided = set(&["policy.custom", "policy.alpha"]);
        assert_eq!(
            merge_policies([source.as_slice(), provided.as_slice()]),
            set(&["policy.alpha", "policy.shared", "policy.custom"])
        );
    }

    #[test]
    fn missing_policies_lists_uncovered_requirements() {
        let record = set(&["policy.beta"]);
        assert_eq!(
            missing_policies(&record, &set(&["policy.alpha", "policy.beta"])),
            set(&["policy.alpha"])
        );
    }
}
