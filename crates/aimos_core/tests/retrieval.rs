use aimos_core::cancel::{CancellationToken, Deadline};
use aimos_core::error::ErrorKind;
use aimos_core::hhni::compression::CompressionConfig;
use aimos_core::hhni::{
    BudgetStrategy, DvnsConfig, Embedder, ExclusionReason, HhniError, HhniResult,
    HierarchicalIndex, RetrievalConfig, RetrievalPipeline,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Embeds by keyword so similarities to the query `test` are fixed:
/// alpha 0.9, beta 0.6, gamma 0.4.
struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn encode(&self, text: &str) -> HhniResult<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(if lower.contains("alpha") {
            vec![0.9, 0.436, 0.0]
        } else if lower.contains("beta") {
            vec![0.6, 0.0, 0.8]
        } else if lower.contains("gamma") {
            vec![0.4, -0.9165, 0.0]
        } else if lower.trim() == "test" {
            vec![1.0, 0.0, 0.0]
        } else {
            vec![0.0, 0.0, 1.0]
        })
    }

    fn dimension(&self) -> usize {
        3
    }
}

/// `lead x x ... x.` counting exactly `tokens` tokens.
fn sentence(lead: &str, tokens: usize) -> String {
    format!("{lead} {}.", vec!["x"; tokens - 2].join(" "))
}

fn keyword_index() -> HierarchicalIndex {
    HierarchicalIndex::new().with_embedder(Arc::new(KeywordEmbedder))
}

fn timestamped(now: DateTime<Utc>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("timestamp".to_string(), json!(now.to_rfc3339()));
    metadata
}

/// Three paragraphs: 280 tokens (alpha), 120 (beta) and 40 (gamma).
fn aged_document(now: DateTime<Utc>) -> HierarchicalIndex {
    let first = [
        sentence("Alpha", 95),
        sentence("Second", 45),
        sentence("Third", 45),
        sentence("Fourth", 95),
    ]
    .join(" ");
    let content = format!(
        "{first}\n\n{}\n\n{}",
        sentence("Beta", 120),
        sentence("Gamma", 40)
    );
    let mut index = keyword_index();
    index.index_document("doc", &content, timestamped(now)).unwrap();
    index
}

fn aged_config(now: DateTime<Utc>) -> RetrievalConfig {
    RetrievalConfig {
        coarse_k: 10,
        min_relevance: 0.3,
        dvns: DvnsConfig {
            max_iterations: 20,
            ..DvnsConfig::default()
        },
        compression: CompressionConfig {
            reference_time: Some(now + Duration::days(100)),
            ..CompressionConfig::default()
        },
        ..RetrievalConfig::default()
    }
}

fn ids(items: &[aimos_core::hhni::BudgetItem]) -> Vec<&str> {
    items.iter().map(|item| item.source_id.as_str()).collect()
}

#[test]
fn aged_candidates_are_compressed_and_packed_into_the_budget() {
    let now = Utc::now();
    let index = aged_document(now);
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 300, &aged_config(now))
        .unwrap();

    assert_eq!(result.metrics.candidates_considered, 3);
    assert_eq!(result.metrics.candidates_after_filter, 3);
    assert_eq!(ids(&result.items), vec!["doc/s0/p0", "doc/s0/p2"]);
    assert_eq!(result.metrics.total_tokens, 235);
    assert!(result.metrics.total_tokens <= 300);
    assert!(result.metrics.dvns_converged);
    assert_eq!(result.metrics.high_relevance_excluded, 0);

    let brief = &result.items[0];
    assert_eq!(brief.token_count, 195);
    assert_eq!(brief.metadata["compression_level"], "brief");
    assert_eq!(brief.metadata["original_tokens"], 280);
    assert!(brief.content.starts_with("Alpha "));
    assert!(brief.content.contains(" [...] Fourth "));

    let untouched = &result.items[1];
    assert_eq!(untouched.token_count, 40);
    assert!(untouched.metadata.get("compression_level").is_none());

    assert_eq!(result.excluded.len(), 1);
    let dropped = &result.excluded[0];
    assert_eq!(dropped.item.source_id, "doc/s0/p1");
    assert_eq!(dropped.item.token_count, 120);
    assert_eq!(dropped.reason, ExclusionReason::Budget);
    assert_eq!(dropped.reason.as_str(), "budget");

    assert_eq!(result.compression.items_compressed, 1);
    assert_eq!(result.compression.by_level["brief"], 1);
    assert_eq!(result.compression.by_level["reference"], 1);
    assert_eq!(result.compression.by_level["full"], 1);

    let stages: Vec<&str> = result
        .audit_trail
        .iter()
        .map(|entry| entry.stage.as_str())
        .collect();
    assert!(stages.contains(&"search"));
    assert!(stages.contains(&"dvns"));
    assert!(stages.contains(&"compression"));
}

#[test]
fn candidates_below_min_relevance_are_reported_first() {
    let now = Utc::now();
    let index = aged_document(now);
    let config = RetrievalConfig {
        min_relevance: 0.5,
        ..aged_config(now)
    };
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 1_000, &config)
        .unwrap();

    assert_eq!(ids(&result.items), vec!["doc/s0/p0", "doc/s0/p1"]);
    assert_eq!(result.metrics.candidates_after_filter, 2);
    assert_eq!(result.excluded[0].item.source_id, "doc/s0/p2");
    assert_eq!(result.excluded[0].reason, ExclusionReason::BelowMinRelevance);
}

#[test]
fn embeddings_are_stripped_and_physics_metadata_attached() {
    let now = Utc::now();
    let index = aged_document(now);
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 300, &aged_config(now))
        .unwrap();

    for item in result
        .items
        .iter()
        .chain(result.excluded.iter().map(|excluded| &excluded.item))
    {
        assert!(item.metadata.get("embedding").is_none());
    }
    assert!(result.items[0].metadata.contains_key("dvns_mass"));
    assert!(result.items[0].metadata.contains_key("dvns_position"));
}

#[test]
fn repeated_runs_are_deterministic() {
    let now = Utc::now();
    let index = aged_document(now);
    let pipeline = RetrievalPipeline::new(&index);
    let config = aged_config(now);

    let first = pipeline.retrieve("test", 300, &config).unwrap();
    let second = pipeline.retrieve("test", 300, &config).unwrap();
    assert_eq!(first.items, second.items);
    assert_eq!(first.excluded, second.excluded);
    assert_eq!(first.metrics.dvns, second.metrics.dvns);
}

#[test]
fn duplicate_paragraphs_collapse_to_the_first_seen() {
    let mut index = keyword_index();
    index
        .index_document(
            "doc",
            "Alpha repeated note.\n\nAlpha   REPEATED note.\n\nGamma other note.",
            Map::new(),
        )
        .unwrap();
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 100, &RetrievalConfig::default())
        .unwrap();

    assert_eq!(ids(&result.items), vec!["doc/s0/p0", "doc/s0/p2"]);
    assert_eq!(result.metrics.duplicates_removed, 1);
    assert_eq!(result.dedup_records[0].representative_id, "doc/s0/p0");
    assert_eq!(result.dedup_records[0].removed_ids, vec!["doc/s0/p1"]);
}

#[test]
fn opposing_stances_on_a_topic_keep_the_strongest() {
    let mut index = keyword_index();
    for (doc_id, content, stance) in [
        ("a", "Alpha keeps the cache on.", "supports"),
        ("b", "Beta turns the cache off.", "against"),
    ] {
        let mut metadata = Map::new();
        metadata.insert("topic".to_string(), json!("cache"));
        metadata.insert("stance".to_string(), json!(stance));
        index.index_document(doc_id, content, metadata).unwrap();
    }
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 100, &RetrievalConfig::default())
        .unwrap();

    assert_eq!(ids(&result.items), vec!["a/s0/p0"]);
    assert_eq!(result.metrics.conflicts_suppressed, 1);
    let record = &result.conflict_records[0];
    assert_eq!(record.topic, "cache");
    assert_eq!(record.winner_id, "a/s0/p0");
    assert_eq!(record.suppressed_ids, vec!["b/s0/p0"]);
}

#[test]
fn baseline_comparison_reports_relevance_lift() {
    let now = Utc::now();
    let index = aged_document(now);
    let comparison = RetrievalPipeline::new(&index)
        .retrieve_with_baseline_comparison("test", 300, &aged_config(now))
        .unwrap();

    assert!(comparison.with_dvns.metrics.dvns.is_some());
    assert!(comparison.baseline.metrics.dvns.is_none());
    assert_eq!(
        ids(&comparison.with_dvns.items),
        ids(&comparison.baseline.items)
    );
    assert_eq!(comparison.rs_lift, 0.0);
}

#[test]
fn reserved_strategies_fall_back_to_greedy_with_an_audit_entry() {
    let now = Utc::now();
    let index = aged_document(now);
    let config = RetrievalConfig {
        strategy: BudgetStrategy::Balanced,
        ..aged_config(now)
    };
    let result = RetrievalPipeline::new(&index)
        .retrieve("test", 300, &config)
        .unwrap();

    assert_eq!(result.budget.strategy_used, BudgetStrategy::Greedy);
    assert!(result
        .audit_trail
        .iter()
        .any(|entry| entry.stage == "budget" && entry.message.contains("balanced")));
    assert_eq!(ids(&result.items), vec!["doc/s0/p0", "doc/s0/p2"]);
}

#[test]
fn invalid_budget_cancellation_and_deadline_are_errors() {
    let index = aged_document(Utc::now());
    let pipeline = RetrievalPipeline::new(&index);
    let config = RetrievalConfig::default();

    let err = pipeline.retrieve("test", 0, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pipeline
        .retrieve_with("test", 100, &config, &cancel, &Deadline::query())
        .unwrap_err();
    assert!(matches!(err, HhniError::Cancelled));

    let err = pipeline
        .retrieve_with(
            "test",
            100,
            &config,
            &CancellationToken::new(),
            &Deadline::after(std::time::Duration::ZERO),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}
