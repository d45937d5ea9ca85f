//! Age-based compression of retrieval candidates.
//!
//! Older material is shortened sentence-wise: `Full` keeps everything,
//! `Detailed` keeps roughly 70%, `Brief` keeps the first and last sentence
//! and `Reference` keeps the first sentence with a pointer back to the
//! source. High-priority items age three, two and a half and two times
//! slower through the respective thresholds.

use super::budget::BudgetItem;
use super::index::split_sentences;
use super::scoring::{age_in_days, item_timestamp, metadata_number};
use super::tokens::TokenCounter;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

const ELISION: &str = " [...] ";
const DETAILED_RATIO: f64 = 0.7;
const AUTHORITY_BOOST: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Full,
    Detailed,
    Brief,
    Reference,
}

impl CompressionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Detailed => "detailed",
            Self::Brief => "brief",
            Self::Reference => "reference",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Items at or below this many tokens are never compressed.
    pub min_compressed_tokens: usize,
    pub high_priority_threshold: f64,
    pub full_days: f64,
    pub detailed_days: f64,
    pub brief_days: f64,
    /// Age reference; `None` means now.
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_compressed_tokens: 50,
            high_priority_threshold: 0.8,
            full_days: 7.0,
            detailed_days: 30.0,
            brief_days: 90.0,
            reference_time: None,
        }
    }
}

impl CompressionConfig {
    pub fn level_for(&self, age_days: f64, high_priority: bool) -> CompressionLevel {
        let (full, detailed, brief) = if high_priority {
            (3.0, 2.5, 2.0)
        } else {
            (1.0, 1.0, 1.0)
        };
        if age_days < self.full_days * full {
            CompressionLevel::Full
        } else if age_days < self.detailed_days * detailed {
            CompressionLevel::Detailed
        } else if age_days < self.brief_days * brief {
            CompressionLevel::Brief
        } else {
            CompressionLevel::Reference
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub items_considered: usize,
    pub items_compressed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub by_level: BTreeMap<String, usize>,
}

/// `max(relevance, priority)` plus up to 0.15 from authority or confidence.
pub fn effective_priority(item: &BudgetItem) -> f64 {
    let base = metadata_number(&item.metadata, "priority")
        .map_or(item.relevance_score, |priority| priority.max(item.relevance_score));
    let standing = [
        metadata_number(&item.metadata, "authority"),
        metadata_number(&item.metadata, "confidence"),
    ]
    .into_iter()
    .flatten()
    .fold(None, |best: Option<f64>, value| {
        Some(best.map_or(value, |current| current.max(value)))
    });
    base + standing.map_or(0.0, |value| AUTHORITY_BOOST * value.clamp(0.0, 1.0))
}

pub fn compress_items(
    items: Vec<BudgetItem>,
    config: &CompressionConfig,
    counter: &TokenCounter,
) -> (Vec<BudgetItem>, CompressionStats) {
    let mut stats = CompressionStats::default();
    if !config.enabled {
        return (items, stats);
    }
    let reference_time = config.reference_time.unwrap_or_else(Utc::now);

    let items = items
        .into_iter()
        .map(|mut item| {
            stats.items_considered += 1;
            stats.tokens_before += item.token_count;
            let level = match item_timestamp(&item.metadata) {
                Some(timestamp) if item.token_count > config.min_compressed_tokens => {
                    let high_priority = effective_priority(&item) >= config.high_priority_threshold;
                    config.level_for(age_in_days(timestamp, reference_time), high_priority)
                }
                _ => CompressionLevel::Full,
            };
            *stats.by_level.entry(level.as_str().to_string()).or_default() += 1;

            if let Some(text) = compress_text(&item.content, &item.source_id, level, counter) {
                let tokens = counter.count(&text).max(1);
                if tokens < item.token_count {
                    debug!(
                        "event=compress_item module=hhni status=ok source_id={} level={} tokens_before={} tokens_after={tokens}",
                        item.source_id,
                        level.as_str(),
                        item.token_count
                    );
                    item.metadata
                        .insert("compression_level".to_string(), json!(level.as_str()));
                    item.metadata
                        .insert("original_tokens".to_string(), json!(item.token_count));
                    item.content = text;
                    item.token_count = tokens;
                    stats.items_compressed += 1;
                }
            }
            stats.tokens_after += item.token_count;
            item
        })
        .collect();
    (items, stats)
}

/// Shortened text for `level`; `None` when the level keeps everything.
fn compress_text(
    content: &str,
    source_id: &str,
    level: CompressionLevel,
    counter: &TokenCounter,
) -> Option<String> {
    let sentences = split_sentences(content);
    let first = sentences.first()?;
    match level {
        CompressionLevel::Full => None,
        CompressionLevel::Reference => Some(format!("{first} [reference: {source_id}]")),
        CompressionLevel::Brief => {
            let last = sentences.last().filter(|_| sentences.len() > 1)?;
            Some(format!("{first}{ELISION}{last}"))
        }
        CompressionLevel::Detailed => {
            if sentences.len() <= 2 {
                return None;
            }
            let counts: Vec<usize> = sentences.iter().map(|s| counter.count(s)).collect();
            let total: usize = counts.iter().sum();
            let target = (total as f64 * DETAILED_RATIO).ceil() as usize;
            let last_index = sentences.len() - 1;
            let mut used = counts[0] + counts[last_index];
            let mut kept = vec![0];
            for index in (1..last_index).step_by(2) {
                if used + counts[index] <= target {
                    used += counts[index];
                    kept.push(index);
                }
            }
            kept.push(last_index);
            Some(
                kept.into_iter()
                    .map(|index| sentences[index].as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{compress_items, effective_priority, CompressionConfig, CompressionLevel};
    use crate::hhni::{BudgetItem, HierarchyLevel, TokenCounter};
    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    fn aged(content: &str, relevance: f64, days: i64) -> BudgetItem {
        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert(
            "timestamp".to_string(),
            json!((now - Duration::days(days)).to_rfc3339()),
        );
        BudgetItem {
            content: content.to_string(),
            relevance_score: relevance,
            token_count: TokenCounter::new().count(content),
            source_id: "src".to_string(),
            level: HierarchyLevel::Paragraph,
            metadata,
        }
    }

    fn sentence(word: &str, words: usize) -> String {
        let mut text = word.to_string();
        for _ in 1..words {
            text.push_str(" w");
        }
        text.push('.');
        text
    }

    #[test]
    fn thresholds_stretch_for_high_priority_items() {
        let config = CompressionConfig::default();
        assert_eq!(config.level_for(10.0, false), CompressionLevel::Detailed);
        assert_eq!(config.level_for(10.0, true), CompressionLevel::Full);
        assert_eq!(config.level_for(100.0, false), CompressionLevel::Reference);
        assert_eq!(config.level_for(100.0, true), CompressionLevel::Brief);
    }

    #[test]
    fn brief_keeps_first_and_last_sentence() {
        let text = [
            sentence("One", 20),
            sentence("Two", 20),
            sentence("Three", 20),
        ]
        .join(" ");
        let (items, stats) = compress_items(
            vec![aged(&text, 0.5, 60)],
            &CompressionConfig::default(),
            &TokenCounter::new(),
        );
        assert!(items[0].content.starts_with("One"));
        assert!(items[0].content.contains(" [...] Three"));
        assert!(!items[0].content.contains("Two"));
        assert_eq!(items[0].metadata["compression_level"], json!("brief"));
        assert_eq!(stats.items_compressed, 1);
        assert!(stats.tokens_after < stats.tokens_before);
    }

    #[test]
    fn recent_items_stay_full() {
        let text = ["One", "Two", "Three", "Four", "Five"]
            .map(|word| sentence(word, 20))
            .join(" ");
        let fresh = aged(&text, 0.5, 1);
        assert!(fresh.token_count >= 100);
        let (items, stats) = compress_items(
            vec![fresh.clone()],
            &CompressionConfig::default(),
            &TokenCounter::new(),
        );
        assert_eq!(items, vec![fresh]);
        assert!(!items[0].metadata.contains_key("compression_level"));
        assert_eq!(stats.by_level["full"], 1);
        assert_eq!(stats.tokens_after, stats.tokens_before);
    }

    #[test]
    fn detailed_keeps_the_ends_and_drops_some_middle() {
        let text = ["One", "Two", "Three", "Four", "Five", "Six"]
            .map(|word| sentence(word, 20))
            .join(" ");
        let item = aged(&text, 0.5, 10);
        let original_tokens = item.token_count;
        let (items, stats) = compress_items(
            vec![item],
            &CompressionConfig::default(),
            &TokenCounter::new(),
        );
        let compressed = &items[0];
        assert_eq!(compressed.metadata["compression_level"], json!("detailed"));
        assert_eq!(compressed.metadata["original_tokens"], json!(original_tokens));
        assert!(compressed.token_count <= original_tokens);
        assert!(compressed.content.starts_with("One"));
        assert!(compressed.content.ends_with(&sentence("Six", 20)));
        assert!(!compressed.content.contains("Three"));
        assert_eq!(stats.items_compressed, 1);
    }

    #[test]
    fn short_or_undated_items_are_untouched() {
        let short = aged("Tiny note. Another one.", 0.5, 400);
        let mut undated = aged(&sentence("Long", 80), 0.5, 400);
        undated.metadata.clear();
        let (items, stats) = compress_items(
            vec![short.clone(), undated.clone()],
            &CompressionConfig::default(),
            &TokenCounter::new(),
        );
        assert_eq!(items, vec![short, undated]);
        assert_eq!(stats.items_compressed, 0);
    }

    #[test]
    fn authority_boosts_priority() {
        let mut item = aged("x", 0.7, 1);
        assert!((effective_priority(&item) - 0.7).abs() < 1e-9);
        item.metadata.insert("confidence".to_string(), json!(1.0));
        assert!((effective_priority(&item) - 0.85).abs() < 1e-9);
    }
}
