//! Composite ranking shared by dedup and conflict resolution.

use super::budget::BudgetItem;
use crate::model::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Score used when recency or authority is unknown.
pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub recency_bias: f64,
    pub authority_bias: f64,
    pub half_life_days: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            recency_bias: 0.2,
            authority_bias: 0.2,
            half_life_days: 30.0,
        }
    }
}

impl ScoringConfig {
    /// `(1 - r - a) * relevance + r * recency + a * authority`.
    pub fn composite(&self, item: &BudgetItem, reference_time: DateTime<Utc>) -> f64 {
        let relevance_weight = (1.0 - self.recency_bias - self.authority_bias).max(0.0);
        relevance_weight * item.relevance_score
            + self.recency_bias * self.recency(&item.metadata, reference_time)
            + self.authority_bias * authority(&item.metadata)
    }

    /// Exponential decay with `half_life_days`.
    pub fn recency(&self, metadata: &Map<String, Value>, reference_time: DateTime<Utc>) -> f64 {
        let Some(timestamp) = item_timestamp(metadata) else {
            return NEUTRAL_SCORE;
        };
        let age_days = age_in_days(timestamp, reference_time).max(0.0);
        0.5_f64.powf(age_days / self.half_life_days.max(f64::EPSILON))
    }
}

/// `authority`, else `confidence`, clamped to `[0, 1]`.
pub fn authority(metadata: &Map<String, Value>) -> f64 {
    metadata_number(metadata, "authority")
        .or_else(|| metadata_number(metadata, "confidence"))
        .map_or(NEUTRAL_SCORE, |value| value.clamp(0.0, 1.0))
}

pub fn metadata_number(metadata: &Map<String, Value>, key: &str) -> Option<f64> {
    metadata
        .get(key)
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
}

/// `timestamp`, else `created_at`; unparseable values count as missing.
pub fn item_timestamp(metadata: &Map<String, Value>) -> Option<DateTime<Utc>> {
    ["timestamp", "created_at"]
        .iter()
        .filter_map(|key| metadata.get(*key).and_then(Value::as_str))
        .find_map(|value| time::parse(value).ok())
}

pub fn age_in_days(timestamp: DateTime<Utc>, reference_time: DateTime<Utc>) -> f64 {
    (reference_time - timestamp).num_seconds() as f64 / 86_400.0
}
