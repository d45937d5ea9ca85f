//! Temporal queries over the BTSM graph and the atom store (C5).
//!
//! # Responsibility
//! - Answer as-of, range, history, change-set and audit questions on either
//!   time axis.
//! - Rebuild a full graph view for any instant.
//!
//! # Invariants
//! - Intervals are half-open `[start, end)`; an open end never closes.
//! - Ranges are half-open `[t1, t2)` and `t1 > t2` is a validation error.
//! - Queries are read-only and tolerate dangling edge endpoints.

use crate::btsm::{BtsmError, BtsmRepository, EdgeFilter};
use crate::error::ErrorKind;
use crate::model::atom::Atom;
use crate::model::mpd::{MpdEdge, MpdNode, TimeDimension};
use crate::model::time;
use crate::store::{AtomListQuery, AtomStore, StoreError};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum TemporalError {
    InvalidTimestamp(String),
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    NodeNotFound(String),
    Btsm(BtsmError),
    Store(StoreError),
}

impl TemporalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTimestamp(_) | Self::InvalidRange { .. } => ErrorKind::Validation,
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::Btsm(err) => err.kind(),
            Self::Store(err) => err.kind(),
        }
    }
}

impl Display for TemporalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTimestamp(message) => write!(f, "{message}"),
            Self::InvalidRange { start, end } => {
                write!(f, "range start {start} is after range end {end}")
            }
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::Btsm(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TemporalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Btsm(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BtsmError> for TemporalError {
    fn from(value: BtsmError) -> Self {
        Self::Btsm(value)
    }
}

impl From<StoreError> for TemporalError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

pub type TemporalResult<T> = Result<T, TemporalError>;

/// Parses an ISO-8601 timestamp supplied by a caller.
pub fn parse_timestamp(value: &str) -> TemporalResult<DateTime<Utc>> {
    time::parse(value).map_err(TemporalError::InvalidTimestamp)
}

/// Node and edge rows whose interval started or ended inside a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub nodes_added: Vec<MpdNode>,
    pub nodes_modified: Vec<MpdNode>,
    pub edges_added: Vec<MpdEdge>,
    pub edges_modified: Vec<MpdEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub mpd_id: String,
    /// Every version, oldest first.
    pub versions: Vec<MpdNode>,
    pub outgoing_edges: Vec<MpdEdge>,
    pub incoming_edges: Vec<MpdEdge>,
    pub first_seen: DateTime<Utc>,
    /// Version that is neither superseded nor expired, if any.
    pub current_version: Option<MpdNode>,
}

/// The whole graph as visible at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub as_of: DateTime<Utc>,
    pub dimension: TimeDimension,
    pub nodes: Vec<MpdNode>,
    pub edges: Vec<MpdEdge>,
}

/// Read-only temporal view over a BTSM repository.
pub struct TemporalQueryEngine<'r, R: BtsmRepository + ?Sized> {
    repo: &'r R,
}

impl<'r, R: BtsmRepository + ?Sized> TemporalQueryEngine<'r, R> {
    pub fn new(repo: &'r R) -> Self {
        Self { repo }
    }

    /// Node versions with `start(dim) <= at < end(dim)`.
    pub fn query_nodes_as_of(
        &self,
        at: DateTime<Utc>,
        dimension: TimeDimension,
    ) -> TemporalResult<Vec<MpdNode>> {
        let nodes: Vec<MpdNode> = self
            .repo
            .all_node_versions()?
            .into_iter()
            .filter(|node| node.interval.contains(dimension, at))
            .collect();
        debug!(
            "event=query_nodes_as_of module=temporal status=ok dimension={} count={}",
            dimension.as_str(),
            nodes.len()
        );
        Ok(nodes)
    }

    /// Node versions overlapping `[start, end)`.
    pub fn query_nodes_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimension: TimeDimension,
    ) -> TemporalResult<Vec<MpdNode>> {
        ensure_range(start, end)?;
        Ok(self
            .repo
            .all_node_versions()?
            .into_iter()
            .filter(|node| node.interval.overlaps(dimension, start, end))
            .collect())
    }

    pub fn query_edges_as_of(
        &self,
        at: DateTime<Utc>,
        dimension: TimeDimension,
        filter: &EdgeFilter,
    ) -> TemporalResult<Vec<MpdEdge>> {
        Ok(self
            .repo
            .all_edges()?
            .into_iter()
            .filter(|edge| filter.accepts(edge) && edge.interval.contains(dimension, at))
            .collect())
    }

    pub fn query_edges_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimension: TimeDimension,
        filter: &EdgeFilter,
    ) -> TemporalResult<Vec<MpdEdge>> {
        ensure_range(start, end)?;
        Ok(self
            .repo
            .all_edges()?
            .into_iter()
            .filter(|edge| filter.accepts(edge) && edge.interval.overlaps(dimension, start, end))
            .collect())
    }

    /// Every version of `mpd_id` ordered by `tt_start`; empty when unknown.
    pub fn get_node_history(&self, mpd_id: &str) -> TemporalResult<Vec<MpdNode>> {
        let mut versions: Vec<MpdNode> = self
            .repo
            .all_node_versions()?
            .into_iter()
            .filter(|node| node.mpd_id == mpd_id)
            .collect();
        versions.sort_by(|left, right| left.interval.tt_start.cmp(&right.interval.tt_start));
        Ok(versions)
    }

    /// Rows whose start (added) or end (modified) falls in `[start, end)`.
    pub fn query_changes_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dimension: TimeDimension,
    ) -> TemporalResult<ChangeSet> {
        ensure_range(start, end)?;
        let in_window = |at: DateTime<Utc>| start <= at && at < end;
        let mut changes = ChangeSet::default();

        for node in self.repo.all_node_versions()? {
            if in_window(node.interval.start(dimension)) {
                changes.nodes_added.push(node.clone());
            }
            if node.interval.end(dimension).is_some_and(in_window) {
                changes.nodes_modified.push(node);
            }
        }
        for edge in self.repo.all_edges()? {
            if in_window(edge.interval.start(dimension)) {
                changes.edges_added.push(edge.clone());
            }
            if edge.interval.end(dimension).is_some_and(in_window) {
                changes.edges_modified.push(edge);
            }
        }
        Ok(changes)
    }

    pub fn audit_trail(&self, mpd_id: &str) -> TemporalResult<AuditTrail> {
        let versions = self.get_node_history(mpd_id)?;
        let Some(first) = versions.first() else {
            return Err(TemporalError::NodeNotFound(mpd_id.to_string()));
        };
        let first_seen = first.interval.tt_start;
        let now = Utc::now();
        let current_version = versions
            .iter()
            .rev()
            .find(|node| {
                node.interval.tt_end.is_none()
                    && node.interval.vt_end.map_or(true, |vt_end| now < vt_end)
            })
            .cloned();

        let mut outgoing_edges = Vec::new();
        let mut incoming_edges = Vec::new();
        for edge in self.repo.all_edges()? {
            if edge.source_id == mpd_id {
                outgoing_edges.push(edge);
            } else if edge.target_id == mpd_id {
                incoming_edges.push(edge);
            }
        }

        Ok(AuditTrail {
            mpd_id: mpd_id.to_string(),
            versions,
            outgoing_edges,
            incoming_edges,
            first_seen,
            current_version,
        })
    }

    pub fn time_travel(
        &self,
        at: DateTime<Utc>,
        dimension: TimeDimension,
    ) -> TemporalResult<GraphSnapshot> {
        Ok(GraphSnapshot {
            as_of: at,
            dimension,
            nodes: self.query_nodes_as_of(at, dimension)?,
            edges: self.query_edges_as_of(at, dimension, &EdgeFilter::default())?,
        })
    }
}

/// Atoms recorded at or before `at` (transaction time), insertion order.
pub fn query_atoms_as_of(store: &dyn AtomStore, at: DateTime<Utc>) -> TemporalResult<Vec<Atom>> {
    Ok(store
        .list_atoms(&AtomListQuery::default())?
        .into_iter()
        .filter(|atom| atom.created_at <= at)
        .collect())
}

/// Atoms recorded inside `[start, end)`, insertion order.
pub fn query_atoms_in_range(
    store: &dyn AtomStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> TemporalResult<Vec<Atom>> {
    ensure_range(start, end)?;
    Ok(store
        .list_atoms(&AtomListQuery::default())?
        .into_iter()
        .filter(|atom| start <= atom.created_at && atom.created_at < end)
        .collect())
}

fn ensure_range(start: DateTime<Utc>, end: DateTime<Utc>) -> TemporalResult<()> {
    if start > end {
        return Err(TemporalError::InvalidRange { start, end });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_timestamp, TemporalError};
    use crate::error::ErrorKind;

    #[test]
    fn malformed_timestamps_are_validation_errors() {
        let err = parse_timestamp("not-a-date").unwrap_err();
        assert!(matches!(err, TemporalError::InvalidTimestamp(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(parse_timestamp("2024-05-01T00:00:00Z").is_ok());
    }
}
