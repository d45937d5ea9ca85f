//! Embedding similarity search over the hierarchical index (C7).

use super::embedding::{cosine_similarity, ensure_finite, EmbeddingProvider};
use super::index::{HierarchicalIndex, HierarchicalNode, HierarchyLevel};
use super::{HhniError, HhniResult};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub node_id: String,
    pub level: HierarchyLevel,
    pub content: String,
    pub summary: String,
    /// Raw cosine similarity to the query.
    pub similarity: f64,
    /// Min-max normalized similarity within this result set.
    pub confidence: f64,
    pub metadata: Map<String, Value>,
    pub embedding: Option<Vec<f32>>,
}

pub struct SemanticSearch<'i> {
    index: &'i HierarchicalIndex,
    provider: EmbeddingProvider,
}

impl<'i> SemanticSearch<'i> {
    pub fn new(index: &'i HierarchicalIndex) -> Self {
        Self {
            index,
            provider: EmbeddingProvider::default(),
        }
    }

    pub fn with_provider(mut self, provider: EmbeddingProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn search(
        &self,
        query: &str,
        level: Option<HierarchyLevel>,
        k: usize,
    ) -> HhniResult<Vec<SearchResult>> {
        self.search_filtered(query, level, k, |_| true)
    }

    /// Top-`k` nodes with positive similarity that pass `filter`.
    pub fn search_filtered<F>(
        &self,
        query: &str,
        level: Option<HierarchyLevel>,
        k: usize,
        filter: F,
    ) -> HhniResult<Vec<SearchResult>>
    where
        F: Fn(&HierarchicalNode) -> bool,
    {
        if query.trim().is_empty() {
            return Err(HhniError::Validation("query must not be empty".to_string()));
        }
        self.index.limits().check_results(k)?;
        let query_vector = self.embed_query(query)?;

        let mut scored: Vec<(&HierarchicalNode, f64)> = self
            .index
            .ordered_nodes()
            .filter(|node| level.map_or(true, |wanted| node.level == wanted))
            .filter(|node| filter(node))
            .filter_map(|node| {
                let similarity = cosine_similarity(&query_vector, &self.node_vector(node));
                (similarity > 0.0).then_some((node, similarity))
            })
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(k);

        let max = scored.first().map_or(0.0, |(_, score)| *score);
        let min = scored.last().map_or(0.0, |(_, score)| *score);
        let spread = max - min;
        let results: Vec<SearchResult> = scored
            .into_iter()
            .map(|(node, similarity)| SearchResult {
                node_id: node.id.clone(),
                level: node.level,
                content: node.content.clone(),
                summary: node.summary.clone(),
                similarity,
                confidence: if spread > f64::EPSILON {
                    (similarity - min) / spread
                } else {
                    1.0
                },
                metadata: node.metadata.clone(),
                embedding: node.embedding.clone(),
            })
            .collect();
        debug!(
            "event=semantic_search module=hhni status=ok level={} results={}",
            level.map_or("any", HierarchyLevel::as_str),
            results.len()
        );
        Ok(results)
    }

    pub fn embed_query(&self, query: &str) -> HhniResult<Vec<f32>> {
        let vector = match (self.provider, self.index.embedder()) {
            (EmbeddingProvider::Local, Some(embedder)) => embedder.encode(query)?,
            (EmbeddingProvider::Local, None) => {
                warn!("event=semantic_search module=hhni status=fallback reason=no_embedder");
                self.index.fallback().embed(query)
            }
            (EmbeddingProvider::Fallback, _) => self.index.fallback().embed(query),
        };
        ensure_finite(&vector)?;
        Ok(vector)
    }

    fn node_vector<'n>(&self, node: &'n HierarchicalNode) -> Cow<'n, [f32]> {
        match (self.provider, node.embedding.as_deref()) {
            (EmbeddingProvider::Local, Some(embedding)) => Cow::Borrowed(embedding),
            _ => Cow::Owned(self.index.fallback().embed(&node.content)),
        }
    }
}
