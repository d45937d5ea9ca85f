//! Transport-neutral BTSM use cases.
//!
//! # Responsibility
//! - Expose the graph operations an HTTP (or any other) surface needs, with
//!   typed requests and responses.
//! - Reject empty write batches before touching storage.
//!
//! # Invariants
//! - The service never bypasses repository validation.
//! - KPI reads surface a missing metrics file as `NotFound`.

use super::blast_radius::{calculate_blast_radius, BlastRadiusReport, BlastRadiusRequest};
use super::repo::BtsmRepository;
use super::{BtsmError, BtsmResult, EdgeFilter, NodeFilter};
use crate::cancel::CancellationToken;
use crate::kpi::{KpiLog, KpiSample};
use crate::model::mpd::{EdgeRelation, Lifecycle, MpdEdge, MpdNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TRUNK_NODE_ID: &str = "aimos.trunk";
pub const TRUNK_NODE_TYPE: &str = "trunk";

/// Parameters for seeding the root (trunk) node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedTrunkRequest {
    pub vision_summary: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
}

/// Convenience body for adding `depends_on` edges from one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOnRequest {
    pub source_id: String,
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiHistoryQuery {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub node_count: usize,
    pub open_edge_count: usize,
}

/// Use-case service wrapper over a BTSM repository.
pub struct BtsmService<R: BtsmRepository> {
    repo: R,
    kpis: Option<KpiLog>,
}

impl<R: BtsmRepository> BtsmService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo, kpis: None }
    }

    /// Attaches the KPI log served by `kpis` / `kpi_history`.
    pub fn with_kpi_log(mut self, kpis: KpiLog) -> Self {
        self.kpis = Some(kpis);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn list_nodes(&self, filter: &NodeFilter) -> BtsmResult<Vec<MpdNode>> {
        self.repo.fetch_nodes(filter)
    }

    pub fn post_nodes(&self, nodes: &[MpdNode]) -> BtsmResult<usize> {
        if nodes.is_empty() {
            return Err(BtsmError::Validation(
                "node batch must not be empty".to_string(),
            ));
        }
        self.repo.upsert_nodes(nodes)
    }

    /// Creates (or refreshes) the active trunk node.
    pub fn seed_trunk(&self, request: &SeedTrunkRequest) -> BtsmResult<MpdNode> {
        if request.vision_summary.trim().is_empty() {
            return Err(BtsmError::Validation(
                "vision_summary must not be blank".to_string(),
            ));
        }
        let mut node = MpdNode::new(TRUNK_NODE_ID, TRUNK_NODE_TYPE)
            .with_policies(request.policy_pack_ids.iter().cloned())
            .with_lifecycle(Lifecycle::Active);
        node.purpose = request.vision_summary.trim().to_string();
        node.owners = request.owners.clone();
        node.witness = request
            .correlation_id
            .as_deref()
            .map(|id| format!("urn:aimos:correlation:{id}"));
        self.repo.upsert_nodes(std::slice::from_ref(&node))?;
        self.repo
            .get_node(TRUNK_NODE_ID)?
            .ok_or_else(|| BtsmError::NodeNotFound(TRUNK_NODE_ID.to_string()))
    }

    pub fn list_edges(&self, filter: &EdgeFilter) -> BtsmResult<Vec<MpdEdge>> {
        self.repo.fetch_edges(filter)
    }

    pub fn post_edges(&self, edges: &[MpdEdge]) -> BtsmResult<Vec<MpdEdge>> {
        if edges.is_empty() {
            return Err(BtsmError::Validation(
                "edge batch must not be empty".to_string(),
            ));
        }
        self.repo.upsert_edges(edges)
    }

    pub fn post_depends_on(&self, request: &DependsOnRequest) -> BtsmResult<Vec<MpdEdge>> {
        let edges: Vec<MpdEdge> = request
            .target_ids
            .iter()
            .map(|target| {
                MpdEdge::new(
                    request.source_id.clone(),
                    target.clone(),
                    EdgeRelation::DependsOn,
                )
                .with_policies(request.policy_pack_ids.iter().cloned())
            })
            .collect();
        self.post_edges(&edges)
    }

    pub fn blast_radius(
        &self,
        request: &BlastRadiusRequest,
        cancel: &CancellationToken,
    ) -> BtsmResult<BlastRadiusReport> {
        calculate_blast_radius(&self.repo, request, cancel)
    }

    pub fn health(&self) -> BtsmResult<HealthReport> {
        let node_count = self.repo.fetch_nodes(&NodeFilter::default())?.len();
        let open_edge_count = self
            .repo
            .fetch_edges(&EdgeFilter::default())?
            .iter()
            .filter(|edge| edge.interval.is_open())
            .count();
        Ok(HealthReport {
            status: "ok".to_string(),
            node_count,
            open_edge_count,
        })
    }

    /// Latest sample per KPI metric.
    pub fn kpis(&self) -> BtsmResult<BTreeMap<String, KpiSample>> {
        Ok(self.kpi_log()?.latest()?)
    }

    pub fn kpi_history(&self, query: &KpiHistoryQuery) -> BtsmResult<Vec<KpiSample>> {
        Ok(self
            .kpi_log()?
            .history(&query.metrics, query.start_time, query.end_time)?)
    }

    fn kpi_log(&self) -> BtsmResult<&KpiLog> {
        self.kpis
            .as_ref()
            .ok_or_else(|| BtsmError::Validation("kpi log is not configured".to_string()))
    }
}
