//! Hierarchical document index (C6).
//!
//! # Responsibility
//! - Split documents into system, section, paragraph, sentence and subword
//!   nodes with embeddings and inherited metadata.
//! - Navigate the tree (zoom, context) and run lexical queries over it.
//! - Serialize the whole index and restore it with structural validation.
//!
//! # Invariants
//! - Node ids are path-like and unique: `doc`, `doc/s0`, `doc/s0/p1`,
//!   `doc/s0/p1/t2`, `doc/s0/p1/t2/w3`.
//! - A child is exactly one level below its parent; roots are `System`.
//! - Reindexing a document replaces its subtree only after the new subtree
//!   was fully built.

use super::embedding::{ensure_finite, Embedder, FallbackEmbedder};
use super::limits::SafetyLimits;
use super::tokens::split_tokens;
use super::{HhniError, HhniResult};
use crate::cancel::Deadline;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const INDEX_FORMAT_VERSION: u32 = 1;
const SYSTEM_SUMMARY_CHARS: usize = 200;
const SENTENCE_SUMMARY_CHARS: usize = 100;
const UPPERCASE_HEADING_MAX_CHARS: usize = 60;
const COLON_HEADING_MAX_CHARS: usize = 80;

static PARAGRAPH_BREAK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\n[ \t\r]*\n").unwrap_or_else(|_| unreachable!("static paragraph regex is valid"))
});
static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+").unwrap_or_else(|_| unreachable!("static word regex is valid")));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    System,
    Section,
    Paragraph,
    Sentence,
    Subword,
}

impl HierarchyLevel {
    pub const ALL: [Self; 5] = [
        Self::System,
        Self::Section,
        Self::Paragraph,
        Self::Sentence,
        Self::Subword,
    ];

    /// 1 for `System` through 5 for `Subword`.
    pub fn depth(self) -> usize {
        match self {
            Self::System => 1,
            Self::Section => 2,
            Self::Paragraph => 3,
            Self::Sentence => 4,
            Self::Subword => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Sentence => "sentence",
            Self::Subword => "subword",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalNode {
    pub id: String,
    pub level: HierarchyLevel,
    pub content: String,
    pub summary: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One lexical query match.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub node_id: String,
    pub level: HierarchyLevel,
    pub score: f64,
}

/// A node with its neighbourhood.
#[derive(Debug, Clone)]
pub struct NodeContext<'a> {
    pub node: &'a HierarchicalNode,
    pub parent: Option<&'a HierarchicalNode>,
    pub siblings: Vec<&'a HierarchicalNode>,
    pub children: Vec<&'a HierarchicalNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDump {
    version: u32,
    #[serde(default)]
    limits: Option<SafetyLimits>,
    documents: Vec<String>,
    nodes: Vec<HierarchicalNode>,
}

/// In-memory document tree with embeddings.
pub struct HierarchicalIndex {
    nodes: HashMap<String, HierarchicalNode>,
    /// Node ids in insertion (document) order.
    order: Vec<String>,
    documents: Vec<String>,
    embedder: Option<Arc<dyn Embedder>>,
    fallback: FallbackEmbedder,
    limits: SafetyLimits,
}

impl Default for HierarchicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HierarchicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalIndex")
            .field("documents", &self.documents)
            .field("nodes", &self.order.len())
            .field("external_embedder", &self.embedder.is_some())
            .finish()
    }
}

impl HierarchicalIndex {
    /// Index using the fallback embedder.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            documents: Vec::new(),
            embedder: None,
            fallback: FallbackEmbedder,
            limits: SafetyLimits::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn fallback(&self) -> &FallbackEmbedder {
        &self.fallback
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn get_node(&self, id: &str) -> Option<&HierarchicalNode> {
        self.nodes.get(id)
    }

    /// Nodes of one level, in document order.
    pub fn nodes_at_level(&self, level: HierarchyLevel) -> Vec<&HierarchicalNode> {
        self.ordered_nodes()
            .filter(|node| node.level == level)
            .collect()
    }

    /// Indexes `content` as `doc_id` under the 30 s indexing deadline.
    pub fn index_document(
        &mut self,
        doc_id: &str,
        content: &str,
        metadata: Map<String, Value>,
    ) -> HhniResult<String> {
        self.index_document_with_deadline(doc_id, content, metadata, &Deadline::indexing())
    }

    pub fn index_document_with_deadline(
        &mut self,
        doc_id: &str,
        content: &str,
        metadata: Map<String, Value>,
        deadline: &Deadline,
    ) -> HhniResult<String> {
        let doc_id = doc_id.trim();
        if doc_id.is_empty() || doc_id.contains('/') {
            return Err(HhniError::Validation(
                "document id must be non-empty and must not contain '/'".to_string(),
            ));
        }
        self.limits.check_document(content.len())?;
        if content.trim().is_empty() {
            return Err(HhniError::Validation(
                "document content must not be empty".to_string(),
            ));
        }

        let mut built = self.build_document(doc_id, content, &metadata, deadline)?;
        self.embed_nodes(&mut built, deadline)?;

        if self.documents.iter().any(|existing| existing == doc_id) {
            self.remove_document(doc_id);
            debug!("event=hhni_reindex module=hhni status=replaced doc_id={doc_id}");
        }
        let node_count = built.len();
        for node in built {
            self.order.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        self.documents.push(doc_id.to_string());
        info!(
            "event=hhni_index module=hhni status=ok doc_id={doc_id} nodes={node_count} duration_ms={}",
            deadline.elapsed().as_millis()
        );
        Ok(doc_id.to_string())
    }

    /// Drops a document and its subtree; `false` when it was not indexed.
    pub fn remove_document(&mut self, doc_id: &str) -> bool {
        let Some(position) = self.documents.iter().position(|id| id == doc_id) else {
            return false;
        };
        self.documents.remove(position);
        let prefix = format!("{doc_id}/");
        self.order
            .retain(|id| id != doc_id && !id.starts_with(prefix.as_str()));
        self.nodes
            .retain(|id, _| id != doc_id && !id.starts_with(prefix.as_str()));
        true
    }

    /// Lexical match: `|query terms ∩ node terms| / sqrt(|query terms|)`.
    pub fn query(
        &self,
        query: &str,
        level: Option<HierarchyLevel>,
        k: usize,
    ) -> HhniResult<Vec<QueryHit>> {
        self.limits.check_results(k)?;
        let terms = word_set(query);
        if terms.is_empty() {
            return Err(HhniError::Validation(
                "query must contain at least one word".to_string(),
            ));
        }
        let norm = (terms.len() as f64).sqrt();
        let mut hits: Vec<QueryHit> = self
            .ordered_nodes()
            .filter(|node| level.map_or(true, |wanted| node.level == wanted))
            .filter_map(|node| {
                let overlap = word_set(&node.content).intersection(&terms).count();
                (overlap > 0).then(|| QueryHit {
                    node_id: node.id.clone(),
                    level: node.level,
                    score: overlap as f64 / norm,
                })
            })
            .collect();
        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn zoom_in(&self, id: &str) -> HhniResult<Vec<&HierarchicalNode>> {
        let node = self.require(id)?;
        Ok(self.resolve_all(&node.children_ids))
    }

    /// Parent of `id`; `None` at a root.
    pub fn zoom_out(&self, id: &str) -> HhniResult<Option<&HierarchicalNode>> {
        let node = self.require(id)?;
        Ok(node
            .parent_id
            .as_deref()
            .and_then(|parent| self.nodes.get(parent)))
    }

    pub fn get_context(
        &self,
        id: &str,
        include_parent: bool,
        include_siblings: bool,
    ) -> HhniResult<NodeContext<'_>> {
        let node = self.require(id)?;
        let parent = node
            .parent_id
            .as_deref()
            .and_then(|parent| self.nodes.get(parent));
        let siblings = match (include_siblings, parent) {
            (true, Some(parent)) => self
                .resolve_all(&parent.children_ids)
                .into_iter()
                .filter(|sibling| sibling.id != node.id)
                .collect(),
            _ => Vec::new(),
        };
        Ok(NodeContext {
            node,
            parent: parent.filter(|_| include_parent),
            siblings,
            children: self.resolve_all(&node.children_ids),
        })
    }

    pub fn to_dict(&self) -> HhniResult<Value> {
        let nodes: Vec<&HierarchicalNode> = self.ordered_nodes().collect();
        Ok(json!({
            "version": INDEX_FORMAT_VERSION,
            "limits": serde_json::to_value(self.limits)?,
            "documents": self.documents,
            "nodes": serde_json::to_value(nodes)?,
        }))
    }

    /// Restores an index written by [`Self::to_dict`], checking tree shape.
    pub fn from_dict(value: &Value) -> HhniResult<Self> {
        let dump: IndexDump = serde_json::from_value(value.clone())?;
        if dump.version != INDEX_FORMAT_VERSION {
            return Err(HhniError::Validation(format!(
                "unsupported index format version {}",
                dump.version
            )));
        }
        let limits = dump.limits.unwrap_or_default();

        let mut index = Self::new().with_limits(limits);
        for node in dump.nodes {
            if index.nodes.contains_key(&node.id) {
                return Err(HhniError::Validation(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            index.order.push(node.id.clone());
            index.nodes.insert(node.id.clone(), node);
        }
        index.documents = dump.documents;
        index.validate_structure()?;
        Ok(index)
    }

    fn validate_structure(&self) -> HhniResult<()> {
        let invalid = |message: String| Err(HhniError::Validation(message));
        for doc_id in &self.documents {
            match self.nodes.get(doc_id) {
                Some(root) if root.level == HierarchyLevel::System && root.parent_id.is_none() => {}
                _ => return invalid(format!("document {doc_id} has no system root")),
            }
        }
        for node in self.nodes.values() {
            self.limits.check_depth(node.level.depth())?;
            match node.parent_id.as_deref() {
                None if node.level != HierarchyLevel::System => {
                    return invalid(format!("node {} has no parent", node.id));
                }
                None => {}
                Some(parent_id) => {
                    let Some(parent) = self.nodes.get(parent_id) else {
                        return invalid(format!("node {} has unknown parent", node.id));
                    };
                    if parent.level.depth() + 1 != node.level.depth() {
                        return invalid(format!("node {} skips a hierarchy level", node.id));
                    }
                    if !parent.children_ids.contains(&node.id) {
                        return invalid(format!("parent of {} does not list it", node.id));
                    }
                }
            }
            if let Some(missing) = node
                .children_ids
                .iter()
                .find(|child| !self.nodes.contains_key(child.as_str()))
            {
                return invalid(format!("node {} lists unknown child {missing}", node.id));
            }
        }
        Ok(())
    }

    fn build_document(
        &self,
        doc_id: &str,
        content: &str,
        metadata: &Map<String, Value>,
        deadline: &Deadline,
    ) -> HhniResult<Vec<HierarchicalNode>> {
        let mut builder = TreeBuilder {
            doc_id,
            base: metadata,
            limits: &self.limits,
            nodes: Vec::new(),
        };
        let trimmed = content.trim();
        let root = builder.push(
            doc_id.to_string(),
            HierarchyLevel::System,
            trimmed.to_string(),
            String::new(),
            None,
            0,
            &[],
        )?;

        let sections = split_sections(trimmed);
        for (section_pos, section) in sections.iter().enumerate() {
            if deadline.is_expired() {
                return Err(timeout("index_document", deadline));
            }
            let section_id = format!("{doc_id}/s{section_pos}");
            let section_summary = section
                .title
                .clone()
                .or_else(|| first_sentence(&section.body))
                .unwrap_or_default();
            let section_idx = builder.push(
                section_id.clone(),
                HierarchyLevel::Section,
                section.text(),
                section_summary,
                Some(root),
                section_pos,
                &[("section_id", &section_id)],
            )?;

            for (paragraph_pos, paragraph) in split_paragraphs(&section.body).iter().enumerate() {
                builder.limits.check_paragraph(paragraph.chars().count())?;
                let paragraph_id = format!("{section_id}/p{paragraph_pos}");
                let paragraph_idx = builder.push(
                    paragraph_id.clone(),
                    HierarchyLevel::Paragraph,
                    paragraph.clone(),
                    first_sentence(paragraph).unwrap_or_default(),
                    Some(section_idx),
                    paragraph_pos,
                    &[("section_id", &section_id), ("paragraph_id", &paragraph_id)],
                )?;

                for (sentence_pos, sentence) in split_sentences(paragraph).iter().enumerate() {
                    builder.limits.check_sentence(sentence.chars().count())?;
                    let sentence_id = format!("{paragraph_id}/t{sentence_pos}");
                    let sentence_idx = builder.push(
                        sentence_id.clone(),
                        HierarchyLevel::Sentence,
                        sentence.clone(),
                        truncate_chars(sentence, SENTENCE_SUMMARY_CHARS),
                        Some(paragraph_idx),
                        sentence_pos,
                        &[("section_id", &section_id), ("paragraph_id", &paragraph_id)],
                    )?;

                    for (token_pos, token) in split_tokens(sentence).into_iter().enumerate() {
                        builder.push(
                            format!("{sentence_id}/w{token_pos}"),
                            HierarchyLevel::Subword,
                            token.to_string(),
                            token.to_string(),
                            Some(sentence_idx),
                            token_pos,
                            &[("section_id", &section_id), ("paragraph_id", &paragraph_id)],
                        )?;
                    }
                }
            }
        }

        let summary = builder
            .nodes
            .iter()
            .find(|node| node.level == HierarchyLevel::Sentence)
            .map(|node| node.content.clone())
            .unwrap_or_else(|| trimmed.to_string());
        builder.nodes[root].summary = truncate_chars(&summary, SYSTEM_SUMMARY_CHARS);
        Ok(builder.nodes)
    }

    fn embed_nodes(&self, nodes: &mut [HierarchicalNode], deadline: &Deadline) -> HhniResult<()> {
        let batch_size = self.limits.max_embedding_batch.max(1);
        for chunk in nodes.chunks_mut(batch_size) {
            if deadline.is_expired() {
                return Err(timeout("index_document", deadline));
            }
            let texts: Vec<&str> = chunk
                .iter()
                .map(|node| match node.level {
                    HierarchyLevel::System => node.summary.as_str(),
                    _ => node.content.as_str(),
                })
                .collect();
            let vectors = self.encode_batch(&texts)?;
            if vectors.len() != chunk.len() {
                return Err(HhniError::Embedding(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    chunk.len()
                )));
            }
            for (node, vector) in chunk.iter_mut().zip(vectors) {
                ensure_finite(&vector)?;
                node.embedding = Some(vector);
            }
        }
        Ok(())
    }

    /// Encodes with the injected embedder, else the fallback.
    pub fn encode_batch(&self, texts: &[&str]) -> HhniResult<Vec<Vec<f32>>> {
        self.limits.check_embedding_batch(texts.len())?;
        match &self.embedder {
            Some(embedder) => embedder.encode_batch(texts),
            None => Ok(texts.iter().map(|text| self.fallback.embed(text)).collect()),
        }
    }

    fn require(&self, id: &str) -> HhniResult<&HierarchicalNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| HhniError::NodeNotFound(id.to_string()))
    }

    fn resolve_all(&self, ids: &[String]) -> Vec<&HierarchicalNode> {
        ids.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    pub(crate) fn ordered_nodes(&self) -> impl Iterator<Item = &HierarchicalNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }
}

struct TreeBuilder<'a> {
    doc_id: &'a str,
    base: &'a Map<String, Value>,
    limits: &'a SafetyLimits,
    nodes: Vec<HierarchicalNode>,
}

impl TreeBuilder<'_> {
    /// Appends a node, links it under `parent` and returns its position.
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        id: String,
        level: HierarchyLevel,
        content: String,
        summary: String,
        parent: Option<usize>,
        position: usize,
        scope: &[(&str, &str)],
    ) -> HhniResult<usize> {
        self.limits.check_node_count(self.nodes.len() + 1)?;
        let mut metadata = self.base.clone();
        metadata.insert("doc_id".to_string(), json!(self.doc_id));
        metadata.insert("source_doc".to_string(), json!(self.doc_id));
        metadata.insert("position".to_string(), json!(position));
        metadata.insert("level".to_string(), json!(level.as_str()));
        for (key, value) in scope {
            metadata.insert((*key).to_string(), json!(value));
        }

        let parent_id = parent.map(|index| self.nodes[index].id.clone());
        if let Some(index) = parent {
            self.nodes[index].children_ids.push(id.clone());
        }
        self.nodes.push(HierarchicalNode {
            id,
            level,
            content,
            summary,
            parent_id,
            children_ids: Vec::new(),
            embedding: None,
            metadata,
        });
        Ok(self.nodes.len() - 1)
    }
}

struct SectionDraft {
    title: Option<String>,
    body: String,
}

impl SectionDraft {
    fn text(&self) -> String {
        match &self.title {
            Some(title) if self.body.trim().is_empty() => title.clone(),
            Some(title) => format!("{title}\n{}", self.body.trim()),
            None => self.body.trim().to_string(),
        }
    }
}

/// Heading lines start with `#`, end with `:`, or are short and uppercase.
fn heading_text(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('#') {
        return Some(trimmed.trim_start_matches('#').trim().to_string());
    }
    let chars = trimmed.chars().count();
    if trimmed.ends_with(':') && chars <= COLON_HEADING_MAX_CHARS {
        return Some(trimmed.trim_end_matches(':').trim().to_string());
    }
    let mut letters = trimmed.chars().filter(|ch| ch.is_alphabetic()).peekable();
    if chars <= UPPERCASE_HEADING_MAX_CHARS
        && letters.peek().is_some()
        && letters.all(|ch| ch.is_uppercase())
    {
        return Some(trimmed.to_string());
    }
    None
}

fn split_sections(content: &str) -> Vec<SectionDraft> {
    let mut sections = Vec::new();
    let mut current = SectionDraft {
        title: None,
        body: String::new(),
    };
    for line in content.lines() {
        if let Some(title) = heading_text(line) {
            if current.title.is_some() || !current.body.trim().is_empty() {
                sections.push(current);
            }
            current = SectionDraft {
                title: Some(title),
                body: String::new(),
            };
        } else {
            current.body.push_str(line);
            current.body.push('\n');
        }
    }
    if current.title.is_some() || !current.body.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn split_paragraphs(body: &str) -> Vec<String> {
    PARAGRAPH_BREAK_RE
        .split(body)
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits after `.`, `!` or `?` runs followed by whitespace and an
/// uppercase letter or digit.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let is_terminal = |ch: char| matches!(ch, '.' | '!' | '?');
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if !is_terminal(chars[i].1) {
            i += 1;
            continue;
        }
        let mut last = i;
        while last + 1 < chars.len() && is_terminal(chars[last + 1].1) {
            last += 1;
        }
        let mut next = last + 1;
        while next < chars.len() && chars[next].1.is_whitespace() {
            next += 1;
        }
        let boundary = next > last + 1
            && next < chars.len()
            && (chars[next].1.is_uppercase() || chars[next].1.is_ascii_digit());
        if boundary {
            let end = chars[last].0 + chars[last].1.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = chars[next].0;
            i = next;
        } else {
            i = last + 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn first_sentence(text: &str) -> Option<String> {
    split_sentences(text).into_iter().next()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn word_set(text: &str) -> BTreeSet<String> {
    WORD_RE
        .find_iter(text)
        .map(|word| word.as_str().to_lowercase())
        .collect()
}

fn timeout(operation: &'static str, deadline: &Deadline) -> HhniError {
    HhniError::Timeout {
        operation,
        elapsed_ms: deadline.elapsed().as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::{heading_text, split_paragraphs, split_sections, split_sentences};
    use super::{HierarchicalIndex, HierarchyLevel};
    use serde_json::Map;
    use std::collections::HashSet;

    #[test]
    fn sentences_split_only_before_capitals_or_digits() {
        let sentences = split_sentences("First one. second stays. Third!? 4th item. e.g. ok");
        assert_eq!(
            sentences,
            vec!["First one. second stays.", "Third!?", "4th item. e.g. ok"]
        );
        assert_eq!(split_sentences("no terminal"), vec!["no terminal"]);
    }

    #[test]
    fn headings_are_detected_by_shape() {
        assert_eq!(heading_text("## Design"), Some("Design".to_string()));
        assert_eq!(heading_text("Open questions:"), Some("Open questions".to_string()));
        assert_eq!(heading_text("OVERVIEW"), Some("OVERVIEW".to_string()));
        assert_eq!(heading_text("A normal line of prose."), None);
        assert_eq!(heading_text("1234"), None);
    }

    #[test]
    fn sections_and_paragraphs_split_on_headings_and_blank_lines() {
        let sections = split_sections("intro text\n\n# One\nalpha\n\n\n  \nbeta\n# Two\ngamma");
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].title, None);
        assert_eq!(sections[1].title.as_deref(), Some("One"));
        assert_eq!(split_paragraphs(&sections[1].body), vec!["alpha", "beta"]);
    }

    #[test]
    fn index_builds_every_level_with_unique_path_ids() {
        let mut index = HierarchicalIndex::new();
        index
            .index_document("doc", "# Title\nHello world. Bye now.", Map::new())
            .unwrap();
        let mut seen = HashSet::new();
        assert!(index.ordered_nodes().all(|node| seen.insert(node.id.clone())));
        for level in HierarchyLevel::ALL {
            assert!(!index.nodes_at_level(level).is_empty(), "{level:?}");
        }
        assert!(index.get_node("doc/s0/p0/t1/w0").is_some());
    }
}
