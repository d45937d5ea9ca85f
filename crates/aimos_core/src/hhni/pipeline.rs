//! Two-stage retrieval: coarse semantic search, then refinement into a
//! token budget (C9).
//!
//! # Responsibility
//! - Run search, relevance filter, physics layout, dedup, conflict
//!   resolution, compression and budget packing in that order.
//! - Report per-stage metrics and an audit trail.
//!
//! # Invariants
//! - Selected items come back in their coarse ranking order.
//! - The whole pipeline runs under the 5 s query deadline.

use super::budget::{
    optimize_for_budget, AuditEntry, BudgetError, BudgetItem, BudgetResult, BudgetStrategy,
    ExcludedItem, ExclusionReason,
};
use super::compression::{compress_items, CompressionConfig, CompressionStats};
use super::conflict::{resolve_conflicts, ConflictConfig, ConflictRecord};
use super::dedup::{deduplicate, DedupConfig, DedupRecord};
use super::dvns::{DvnsConfig, DvnsEngine, DvnsOutcome, Particle, SimulationMetrics};
use super::embedding::EmbeddingProvider;
use super::index::{HierarchicalIndex, HierarchyLevel};
use super::scoring::ScoringConfig;
use super::search::{SearchResult, SemanticSearch};
use super::tokens::TokenCounter;
use super::{HhniError, HhniResult};
use crate::cancel::{CancellationToken, Deadline};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

const EMBEDDING_KEY: &str = "embedding";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates pulled by the coarse search.
    pub coarse_k: usize,
    pub level: HierarchyLevel,
    pub min_relevance: f64,
    pub strategy: BudgetStrategy,
    pub enable_dvns: bool,
    pub provider: EmbeddingProvider,
    pub dvns: DvnsConfig,
    pub scoring: ScoringConfig,
    pub dedup: DedupConfig,
    pub conflict: ConflictConfig,
    pub compression: CompressionConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            coarse_k: 20,
            level: HierarchyLevel::Paragraph,
            min_relevance: 0.3,
            strategy: BudgetStrategy::Greedy,
            enable_dvns: true,
            provider: EmbeddingProvider::Local,
            dvns: DvnsConfig::default(),
            scoring: ScoringConfig::default(),
            dedup: DedupConfig::default(),
            conflict: ConflictConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub candidates_considered: usize,
    pub candidates_after_filter: usize,
    pub duplicates_removed: usize,
    pub conflicts_suppressed: usize,
    pub total_tokens: usize,
    pub average_relevance: f64,
    pub dvns: Option<SimulationMetrics>,
    pub dvns_converged: bool,
    pub high_relevance_excluded: usize,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    /// Selected items in coarse ranking order.
    pub items: Vec<BudgetItem>,
    pub excluded: Vec<ExcludedItem>,
    pub budget: BudgetResult,
    pub metrics: RetrievalMetrics,
    pub dedup_records: Vec<DedupRecord>,
    pub conflict_records: Vec<ConflictRecord>,
    pub compression: CompressionStats,
    pub audit_trail: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub with_dvns: RetrievalResult,
    pub baseline: RetrievalResult,
    /// Relative change in average selected relevance; 0 when the baseline is 0.
    pub rs_lift: f64,
}

pub struct RetrievalPipeline<'i> {
    index: &'i HierarchicalIndex,
    counter: TokenCounter,
}

impl<'i> RetrievalPipeline<'i> {
    pub fn new(index: &'i HierarchicalIndex) -> Self {
        Self {
            index,
            counter: TokenCounter::new(),
        }
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn retrieve(
        &self,
        query: &str,
        token_budget: usize,
        config: &RetrievalConfig,
    ) -> HhniResult<RetrievalResult> {
        self.retrieve_with(
            query,
            token_budget,
            config,
            &CancellationToken::new(),
            &Deadline::query(),
        )
    }

    pub fn retrieve_with(
        &self,
        query: &str,
        token_budget: usize,
        config: &RetrievalConfig,
        cancel: &CancellationToken,
        deadline: &Deadline,
    ) -> HhniResult<RetrievalResult> {
        if token_budget == 0 {
            return Err(BudgetError::InvalidBudget(token_budget).into());
        }
        if cancel.is_cancelled() {
            return Err(HhniError::Cancelled);
        }
        let mut audit_trail = Vec::new();
        let mut metrics = RetrievalMetrics::default();
        let search = SemanticSearch::new(self.index).with_provider(config.provider);

        let candidates = search.search(query, Some(config.level), config.coarse_k)?;
        metrics.candidates_considered = candidates.len();
        audit_trail.push(AuditEntry::new(
            "search",
            format!("{} candidates at level {}", candidates.len(), config.level.as_str()),
        ));
        ensure_time(deadline)?;

        let rank: HashMap<String, usize> = candidates
            .iter()
            .enumerate()
            .map(|(position, hit)| (hit.node_id.clone(), position))
            .collect();
        let (survivors, below): (Vec<SearchResult>, Vec<SearchResult>) = candidates
            .into_iter()
            .partition(|hit| hit.similarity >= config.min_relevance);
        metrics.candidates_after_filter = survivors.len();
        if !below.is_empty() {
            audit_trail.push(AuditEntry::new(
                "filter",
                format!(
                    "{} candidates below min relevance {:.2}",
                    below.len(),
                    config.min_relevance
                ),
            ));
        }

        let mut items: Vec<BudgetItem> = survivors.iter().map(|hit| self.to_item(hit)).collect();
        if config.enable_dvns && !survivors.is_empty() {
            let query_embedding = search.embed_query(query)?;
            let layout = self.run_dvns(&survivors, &query_embedding, config, cancel);
            for item in &mut items {
                if let Some(particle) = layout.particles.iter().find(|p| p.id == item.source_id) {
                    item.metadata.insert("dvns_mass".to_string(), json!(particle.mass));
                    item.metadata
                        .insert("dvns_position".to_string(), json!(particle.position));
                }
            }
            audit_trail.push(AuditEntry::new(
                "dvns",
                format!(
                    "{} particles, {} iterations, converged={}",
                    layout.particles.len(),
                    layout.metrics.iterations,
                    layout.metrics.converged
                ),
            ));
            metrics.dvns_converged = layout.metrics.converged;
            metrics.dvns = Some(layout.metrics);
            ensure_time(deadline)?;
        }

        let reference_time = config.compression.reference_time.unwrap_or_else(Utc::now);
        let deduped = deduplicate(items, &config.dedup, &config.scoring, reference_time);
        metrics.duplicates_removed = deduped
            .records
            .iter()
            .map(|record| record.removed_ids.len())
            .sum();
        for record in &deduped.records {
            audit_trail.push(AuditEntry::new(
                "dedup",
                format!(
                    "kept {} over {}",
                    record.representative_id,
                    record.removed_ids.join(", ")
                ),
            ));
        }

        let resolved = resolve_conflicts(
            deduped.items,
            &config.conflict,
            &config.scoring,
            reference_time,
        );
        metrics.conflicts_suppressed = resolved
            .records
            .iter()
            .map(|record| record.suppressed_ids.len())
            .sum();
        for record in &resolved.records {
            audit_trail.push(AuditEntry::new(
                "conflict",
                format!(
                    "topic {}: kept {} ({}), suppressed {}",
                    record.topic,
                    record.winner_id,
                    record.winning_stance.as_str(),
                    record.suppressed_ids.join(", ")
                ),
            ));
        }

        let mut compression_config = config.compression;
        compression_config.reference_time = Some(reference_time);
        let (compressed, compression) =
            compress_items(resolved.items, &compression_config, &self.counter);
        if compression.items_compressed > 0 {
            audit_trail.push(AuditEntry::new(
                "compression",
                format!(
                    "{} items compressed, {} -> {} tokens",
                    compression.items_compressed,
                    compression.tokens_before,
                    compression.tokens_after
                ),
            ));
        }
        ensure_time(deadline)?;

        let mut budget = optimize_for_budget(
            compressed,
            token_budget,
            config.strategy,
            config.min_relevance,
        )?;
        audit_trail.extend(budget.audit_trail.iter().cloned());
        for item in &mut budget.included {
            item.metadata.remove(EMBEDDING_KEY);
        }
        budget
            .included
            .sort_by_key(|item| rank.get(&item.source_id).copied().unwrap_or(usize::MAX));

        let mut excluded: Vec<ExcludedItem> = below
            .iter()
            .map(|hit| ExcludedItem {
                item: self.to_item(hit),
                reason: ExclusionReason::BelowMinRelevance,
            })
            .collect();
        excluded.extend(budget.excluded.iter().cloned());
        for excluded_item in &mut excluded {
            excluded_item.item.metadata.remove(EMBEDDING_KEY);
        }

        metrics.total_tokens = budget.total_tokens_used;
        metrics.average_relevance = average_relevance(&budget.included);
        metrics.high_relevance_excluded = budget.high_relevance_excluded();
        metrics.duration_ms = deadline.elapsed().as_millis();
        info!(
            "event=retrieve module=hhni status=ok candidates={} selected={} tokens={} budget={} duration_ms={}",
            metrics.candidates_considered,
            budget.included.len(),
            metrics.total_tokens,
            token_budget,
            metrics.duration_ms
        );

        Ok(RetrievalResult {
            query: query.to_string(),
            items: budget.included.clone(),
            excluded,
            budget,
            metrics,
            dedup_records: deduped.records,
            conflict_records: resolved.records,
            compression,
            audit_trail,
        })
    }

    /// Runs the pipeline with and without physics and reports the lift.
    pub fn retrieve_with_baseline_comparison(
        &self,
        query: &str,
        token_budget: usize,
        config: &RetrievalConfig,
    ) -> HhniResult<BaselineComparison> {
        let with_dvns = self.retrieve(
            query,
            token_budget,
            &RetrievalConfig {
                enable_dvns: true,
                ..*config
            },
        )?;
        let baseline = self.retrieve(
            query,
            token_budget,
            &RetrievalConfig {
                enable_dvns: false,
                ..*config
            },
        )?;
        let base = baseline.metrics.average_relevance;
        let rs_lift = if base == 0.0 {
            0.0
        } else {
            (with_dvns.metrics.average_relevance - base) / base
        };
        Ok(BaselineComparison {
            with_dvns,
            baseline,
            rs_lift,
        })
    }

    fn to_item(&self, hit: &SearchResult) -> BudgetItem {
        let mut metadata = hit.metadata.clone();
        if let Some(embedding) = &hit.embedding {
            metadata.insert(EMBEDDING_KEY.to_string(), json!(embedding));
        }
        BudgetItem {
            content: hit.content.clone(),
            relevance_score: hit.similarity,
            token_count: self.counter.count(&hit.content).max(1),
            source_id: hit.node_id.clone(),
            level: hit.level,
            metadata,
        }
    }

    fn run_dvns(
        &self,
        survivors: &[SearchResult],
        query_embedding: &[f32],
        config: &RetrievalConfig,
        cancel: &CancellationToken,
    ) -> DvnsOutcome {
        let particles: Vec<Particle> = survivors
            .iter()
            .filter_map(|hit| {
                let embedding = match (&hit.embedding, hit.summary.trim().is_empty()) {
                    (Some(embedding), _) => embedding.clone(),
                    (None, false) => self.index.fallback().embed(&hit.summary),
                    (None, true) => return None,
                };
                Some(
                    Particle::new(hit.node_id.clone(), embedding, hit.similarity)
                        .with_metadata(hit.metadata.clone()),
                )
            })
            .collect();
        DvnsEngine::new(config.dvns).optimize_layout(particles, query_embedding, cancel)
    }
}

fn average_relevance(items: &[BudgetItem]) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    items.iter().map(|item| item.relevance_score).sum::<f64>() / items.len() as f64
}

fn ensure_time(deadline: &Deadline) -> HhniResult<()> {
    if deadline.is_expired() {
        return Err(HhniError::Timeout {
            operation: "retrieve",
            elapsed_ms: deadline.elapsed().as_millis(),
        });
    }
    Ok(())
}
