//! Blast-radius reachability with policy coverage checks.

use super::repo::BtsmRepository;
use super::{covers, merge_policies, missing_policies, BtsmError, BtsmResult, EdgeFilter, NodeFilter};
use crate::cancel::CancellationToken;
use crate::model::mpd::{EdgeRelation, MpdEdge, MpdNode};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Request body for a blast-radius run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlastRadiusRequest {
    pub root_ids: Vec<String>,
    /// Empty means every relation is traversed.
    #[serde(default)]
    pub relation_types: Vec<EdgeRelation>,
    /// Empty means the union of the roots' policies.
    #[serde(default)]
    pub required_policy_pack_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NodePolicy,
    EdgePolicy,
    MissingNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Offending node, or the edge target for edge violations.
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<EdgeRelation>,
    #[serde(default)]
    pub missing_policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadiusReport {
    pub root_ids: Vec<String>,
    pub required_policy_pack_ids: Vec<String>,
    /// Sorted ids of existing roots and every reached node.
    pub impacted_nodes: Vec<String>,
    /// Edges in traversal order.
    pub traversed_edges: Vec<MpdEdge>,
    pub violations: Vec<Violation>,
    pub compliant: bool,
    /// Traversal stopped early on cancellation; results are partial.
    #[serde(default)]
    pub cancelled: bool,
}

/// Breadth-first traversal over open edges starting at the request roots.
pub fn calculate_blast_radius<R: BtsmRepository + ?Sized>(
    repo: &R,
    request: &BlastRadiusRequest,
    cancel: &CancellationToken,
) -> BtsmResult<BlastRadiusReport> {
    if request.root_ids.is_empty() {
        return Err(BtsmError::Validation(
            "blast radius requires at least one root id".to_string(),
        ));
    }

    let nodes: HashMap<String, MpdNode> = repo
        .fetch_nodes(&NodeFilter::default())?
        .into_iter()
        .map(|node| (node.mpd_id.clone(), node))
        .collect();

    let mut adjacency: HashMap<&str, Vec<MpdEdge>> = HashMap::new();
    let edges = repo.fetch_edges(&EdgeFilter::default())?;
    for edge in edges.iter().filter(|edge| edge.interval.is_open()) {
        if !request.relation_types.is_empty() && !request.relation_types.contains(&edge.relation)
        {
            continue;
        }
        adjacency
            .entry(edge.source_id.as_str())
            .or_default()
            .push(edge.clone());
    }

    let required = if request.required_policy_pack_ids.is_empty() {
        merge_policies(
            request
                .root_ids
                .iter()
                .filter_map(|id| nodes.get(id))
                .map(|node| node.policy_pack_ids.as_slice()),
        )
    } else {
        request.required_policy_pack_ids.clone()
    };

    let mut violations = Vec::new();
    let mut impacted: BTreeSet<String> = BTreeSet::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for root in &request.root_ids {
        if !visited.insert(root.clone()) {
            continue;
        }
        if nodes.contains_key(root) {
            impacted.insert(root.clone());
            queue.push_back(root.clone());
        } else {
            violations.push(Violation {
                kind: ViolationKind::MissingNode,
                node_id: root.clone(),
                source_id: None,
                relation: None,
                missing_policies: Vec::new(),
            });
        }
    }

    let mut traversed_edges = Vec::new();
    let mut cancelled = false;
    while let Some(current) = queue.pop_front() {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let Some(outgoing) = adjacency.get(current.as_str()) else {
            continue;
        };
        for edge in outgoing {
            traversed_edges.push(edge.clone());
            if !covers(&edge.policy_pack_ids, &required) {
                violations.push(Violation {
                    kind: ViolationKind::EdgePolicy,
                    node_id: edge.target_id.clone(),
                    source_id: Some(edge.source_id.clone()),
                    relation: Some(edge.relation.clone()),
                    missing_policies: missing_policies(&edge.policy_pack_ids, &required),
                });
            }
            if !visited.insert(edge.target_id.clone()) {
                continue;
            }
            match nodes.get(&edge.target_id) {
                Some(target) => {
                    impacted.insert(target.mpd_id.clone());
                    if !covers(&target.policy_pack_ids, &required) {
                        violations.push(Violation {
                            kind: ViolationKind::NodePolicy,
                            node_id: target.mpd_id.clone(),
                            source_id: Some(edge.source_id.clone()),
                            relation: Some(edge.relation.clone()),
                            missing_policies: missing_policies(&target.policy_pack_ids, &required),
                        });
                    }
                    queue.push_back(target.mpd_id.clone());
                }
                None => violations.push(Violation {
                    kind: ViolationKind::MissingNode,
                    node_id: edge.target_id.clone(),
                    source_id: Some(edge.source_id.clone()),
                    relation: Some(edge.relation.clone()),
                    missing_policies: Vec::new(),
                }),
            }
        }
    }

    if cancelled {
        warn!(
            "event=blast_radius module=btsm status=warn error_code=cancelled impacted={} traversed={}",
            impacted.len(),
            traversed_edges.len()
        );
    } else {
        info!(
            "event=blast_radius module=btsm status=ok roots={} impacted={} traversed={} violations={}",
            request.root_ids.len(),
            impacted.len(),
            traversed_edges.len(),
            violations.len()
        );
    }

    Ok(BlastRadiusReport {
        root_ids: request.root_ids.clone(),
        required_policy_pack_ids: required,
        impacted_nodes: impacted.into_iter().collect(),
        traversed_edges,
        compliant: violations.is_empty(),
        violations,
        cancelled,
    })
}
