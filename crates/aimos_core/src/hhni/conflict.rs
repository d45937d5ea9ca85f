//! Topic/stance conflict resolution for retrieval candidates.

use super::budget::BudgetItem;
use super::scoring::ScoringConfig;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata keys tried, in order, to find an item's topic.
pub const TOPIC_KEYS: [&str; 4] = ["topic", "claim_id", "entity", "subject"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub enabled: bool,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Positive,
    Negative,
    Neutral,
}

impl Stance {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" | "pro" | "support" | "supports" | "for" | "agree" | "approve" | "yes"
            | "true" => Some(Self::Positive),
            "negative" | "con" | "oppose" | "opposes" | "against" | "disagree" | "reject"
            | "no" | "false" => Some(Self::Negative),
            "neutral" | "mixed" | "undecided" => Some(Self::Neutral),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub topic: String,
    pub winner_id: String,
    pub winning_stance: Stance,
    pub suppressed_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    pub items: Vec<BudgetItem>,
    pub records: Vec<ConflictRecord>,
}

/// For each topic with at least two distinct stances keeps only the item
/// with the best composite score and suppresses the rest of the cluster.
pub fn resolve_conflicts(
    items: Vec<BudgetItem>,
    config: &ConflictConfig,
    scoring: &ScoringConfig,
    reference_time: DateTime<Utc>,
) -> ConflictOutcome {
    if !config.enabled {
        return ConflictOutcome {
            items,
            records: Vec::new(),
        };
    }

    let mut clusters: BTreeMap<String, Vec<(usize, Stance)>> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        let Some(topic) = item_topic(&item.metadata) else {
            continue;
        };
        let Some(raw) = item.metadata.get("stance").and_then(Value::as_str) else {
            continue;
        };
        match Stance::parse(raw) {
            Some(stance) => clusters.entry(topic).or_default().push((index, stance)),
            None => warn!(
                "event=conflict_resolve module=hhni status=skipped reason=unknown_stance source_id={}",
                item.source_id
            ),
        }
    }

    let mut suppressed = vec![false; items.len()];
    let mut records = Vec::new();
    for (topic, members) in clusters {
        let first_stance = members[0].1;
        if members.iter().all(|(_, stance)| *stance == first_stance) {
            continue;
        }
        let mut winner = members[0];
        let mut best_score = scoring.composite(&items[winner.0], reference_time);
        for &member in &members[1..] {
            let score = scoring.composite(&items[member.0], reference_time);
            if score > best_score {
                winner = member;
                best_score = score;
            }
        }
        let mut suppressed_ids = Vec::new();
        for &(index, _) in &members {
            if index != winner.0 {
                suppressed[index] = true;
                suppressed_ids.push(items[index].source_id.clone());
            }
        }
        records.push(ConflictRecord {
            topic,
            winner_id: items[winner.0].source_id.clone(),
            winning_stance: winner.1,
            suppressed_ids,
        });
    }

    let items = items
        .into_iter()
        .zip(suppressed)
        .filter_map(|(item, dropped)| (!dropped).then_some(item))
        .collect();
    ConflictOutcome { items, records }
}

fn item_topic(metadata: &Map<String, Value>) -> Option<String> {
    TOPIC_KEYS.iter().find_map(|key| match metadata.get(*key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    })
}
