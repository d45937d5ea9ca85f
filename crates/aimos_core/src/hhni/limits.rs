//! Hard safety caps for indexing and retrieval.

use super::{HhniError, HhniResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_paragraph_chars: usize,
    pub max_sentence_chars: usize,
    pub max_document_bytes: usize,
    pub max_nodes_per_document: usize,
    pub max_embedding_batch: usize,
    pub max_depth: usize,
    pub max_results: usize,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_paragraph_chars: 5_000,
            max_sentence_chars: 500,
            max_document_bytes: 100 * 1024,
            max_nodes_per_document: 1_000,
            max_embedding_batch: 100,
            max_depth: 5,
            max_results: 1_000,
        }
    }
}

impl SafetyLimits {
    pub fn check_document(&self, bytes: usize) -> HhniResult<()> {
        check("document_bytes", bytes, self.max_document_bytes)
    }

    pub fn check_paragraph(&self, chars: usize) -> HhniResult<()> {
        check("paragraph_chars", chars, self.max_paragraph_chars)
    }

    pub fn check_sentence(&self, chars: usize) -> HhniResult<()> {
        check("sentence_chars", chars, self.max_sentence_chars)
    }

    pub fn check_node_count(&self, nodes: usize) -> HhniResult<()> {
        check("nodes_per_document", nodes, self.max_nodes_per_document)
    }

    pub fn check_embedding_batch(&self, size: usize) -> HhniResult<()> {
        check("embedding_batch", size, self.max_embedding_batch)
    }

    pub fn check_depth(&self, depth: usize) -> HhniResult<()> {
        check("depth", depth, self.max_depth)
    }

    pub fn check_results(&self, k: usize) -> HhniResult<()> {
        check("results", k, self.max_results)
    }
}

fn check(limit: &'static str, actual: usize, max: usize) -> HhniResult<()> {
    if actual > max {
        return Err(HhniError::ResourceLimit { limit, actual, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::SafetyLimits;
    use crate::hhni::HhniError;

    #[test]
    fn caps_are_inclusive() {
        let limits = SafetyLimits::default();
        assert!(limits.check_sentence(500).is_ok());
        assert!(matches!(
            limits.check_sentence(501),
            Err(HhniError::ResourceLimit {
                limit: "sentence_chars",
                ..
            })
        ));
        assert!(limits.check_results(1_000).is_ok());
        assert!(limits.check_results(1_001).is_err());
    }
}
