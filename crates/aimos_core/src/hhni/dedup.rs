//! Near-duplicate collapsing for retrieval candidates.

use super::budget::BudgetItem;
use super::embedding::cosine_similarity;
use super::scoring::ScoringConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub representative_id: String,
    pub removed_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub items: Vec<BudgetItem>,
    pub records: Vec<DedupRecord>,
}

/// Clusters items whose embeddings reach the threshold or whose normalized
/// text matches, keeping the best composite score per cluster. Ties keep the
/// earliest item.
pub fn deduplicate(
    items: Vec<BudgetItem>,
    config: &DedupConfig,
    scoring: &ScoringConfig,
    reference_time: DateTime<Utc>,
) -> DedupOutcome {
    if !config.enabled || items.len() < 2 {
        return DedupOutcome {
            items,
            records: Vec::new(),
        };
    }

    let embeddings: Vec<Option<Vec<f32>>> = items
        .iter()
        .map(|item| item_embedding(&item.metadata))
        .collect();
    let texts: Vec<String> = items.iter().map(|item| normalize_text(&item.content)).collect();
    let is_duplicate = |a: usize, b: usize| {
        if texts[a] == texts[b] {
            return true;
        }
        match (&embeddings[a], &embeddings[b]) {
            (Some(left), Some(right)) => {
                cosine_similarity(left, right) >= config.similarity_threshold
            }
            _ => false,
        }
    };

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for index in 0..items.len() {
        match clusters
            .iter_mut()
            .find(|cluster| is_duplicate(cluster[0], index))
        {
            Some(cluster) => cluster.push(index),
            None => clusters.push(vec![index]),
        }
    }

    let scores: Vec<f64> = items
        .iter()
        .map(|item| scoring.composite(item, reference_time))
        .collect();
    let mut keep = vec![false; items.len()];
    let mut records = Vec::new();
    for cluster in &clusters {
        let mut best = cluster[0];
        for &candidate in &cluster[1..] {
            if scores[candidate] > scores[best] {
                best = candidate;
            }
        }
        keep[best] = true;
        if cluster.len() > 1 {
            records.push(DedupRecord {
                representative_id: items[best].source_id.clone(),
                removed_ids: cluster
                    .iter()
                    .filter(|&&member| member != best)
                    .map(|&member| items[member].source_id.clone())
                    .collect(),
            });
        }
    }

    let items = items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, kept)| kept.then_some(item))
        .collect();
    DedupOutcome { items, records }
}

/// `metadata["embedding"]` as a float vector.
pub fn item_embedding(metadata: &Map<String, Value>) -> Option<Vec<f32>> {
    let values = metadata.get("embedding")?.as_array()?;
    values
        .iter()
        .map(|value| value.as_f64().map(|number| number as f32))
        .collect()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
