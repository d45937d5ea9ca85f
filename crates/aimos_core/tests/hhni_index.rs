use aimos_core::cancel::Deadline;
use aimos_core::error::ErrorKind;
use aimos_core::hhni::{
    Embedder, HhniError, HhniResult, HierarchicalIndex, HierarchyLevel, SafetyLimits,
    SemanticSearch,
};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DOC: &str = "# Overview\nAlpha beta gamma. Second sentence here.\n\nAnother paragraph with words.\n\n# Details\nFinal paragraph.";

fn metadata() -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("project".to_string(), json!("apollo"));
    metadata
}

fn indexed() -> HierarchicalIndex {
    let mut index = HierarchicalIndex::new();
    index.index_document("doc", DOC, metadata()).unwrap();
    index
}

/// Records batch sizes and embeds by keyword.
#[derive(Default)]
struct RecordingEmbedder {
    batches: Mutex<Vec<usize>>,
}

impl Embedder for RecordingEmbedder {
    fn encode(&self, text: &str) -> HhniResult<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(if lower.contains("final") {
            vec![0.0, 1.0]
        } else {
            vec![1.0, 0.0]
        })
    }

    fn encode_batch(&self, texts: &[&str]) -> HhniResult<Vec<Vec<f32>>> {
        self.batches.lock().unwrap().push(texts.len());
        texts.iter().map(|text| self.encode(text)).collect()
    }

    fn dimension(&self) -> usize {
        2
    }
}

#[test]
fn documents_are_split_into_five_levels_with_path_ids() {
    let index = indexed();
    assert_eq!(index.documents(), ["doc".to_string()]);

    let sections = index.nodes_at_level(HierarchyLevel::Section);
    assert_eq!(
        sections.iter().map(|node| node.id.as_str()).collect::<Vec<_>>(),
        vec!["doc/s0", "doc/s1"]
    );
    assert_eq!(sections[0].summary, "Overview");

    let paragraphs = index.nodes_at_level(HierarchyLevel::Paragraph);
    assert_eq!(
        paragraphs.iter().map(|node| node.id.as_str()).collect::<Vec<_>>(),
        vec!["doc/s0/p0", "doc/s0/p1", "doc/s1/p0"]
    );
    assert_eq!(paragraphs[0].content, "Alpha beta gamma. Second sentence here.");
    assert_eq!(paragraphs[0].summary, "Alpha beta gamma.");

    let sentence = index.get_node("doc/s0/p0/t1").unwrap();
    assert_eq!(sentence.content, "Second sentence here.");
    assert_eq!(sentence.parent_id.as_deref(), Some("doc/s0/p0"));

    let words: Vec<&str> = index
        .zoom_in("doc/s0/p0/t0")
        .unwrap()
        .iter()
        .map(|node| node.content.as_str())
        .collect();
    assert_eq!(words, vec!["Alpha", "beta", "gamma", "."]);

    let root = index.get_node("doc").unwrap();
    assert_eq!(root.level, HierarchyLevel::System);
    assert_eq!(root.summary, "Alpha beta gamma.");
    assert!(index
        .nodes_at_level(HierarchyLevel::Subword)
        .iter()
        .all(|node| node.embedding.as_ref().map(Vec::len) == Some(3)));
}

#[test]
fn nodes_carry_inherited_and_structural_metadata() {
    let index = indexed();
    let paragraph = index.get_node("doc/s0/p1").unwrap();
    assert_eq!(paragraph.metadata["project"], "apollo");
    assert_eq!(paragraph.metadata["doc_id"], "doc");
    assert_eq!(paragraph.metadata["source_doc"], "doc");
    assert_eq!(paragraph.metadata["section_id"], "doc/s0");
    assert_eq!(paragraph.metadata["paragraph_id"], "doc/s0/p1");
    assert_eq!(paragraph.metadata["position"], 1);
    assert_eq!(paragraph.metadata["level"], "paragraph");
}

#[test]
fn navigation_returns_parents_siblings_and_children() {
    let index = indexed();

    let parent = index.zoom_out("doc/s0/p1").unwrap().unwrap();
    assert_eq!(parent.id, "doc/s0");
    assert!(index.zoom_out("doc").unwrap().is_none());

    let context = index.get_context("doc/s0/p0", true, true).unwrap();
    assert_eq!(context.node.id, "doc/s0/p0");
    assert_eq!(context.parent.unwrap().id, "doc/s0");
    assert_eq!(
        context.siblings.iter().map(|node| node.id.as_str()).collect::<Vec<_>>(),
        vec!["doc/s0/p1"]
    );
    assert_eq!(context.children.len(), 2);

    let bare = index.get_context("doc/s0/p0", false, false).unwrap();
    assert!(bare.parent.is_none());
    assert!(bare.siblings.is_empty());

    let err = index.zoom_in("doc/s9").unwrap_err();
    assert!(matches!(err, HhniError::NodeNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn lexical_query_ranks_by_term_overlap() {
    let index = indexed();
    let hits = index
        .query("GAMMA beta", Some(HierarchyLevel::Paragraph), 10)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].node_id, "doc/s0/p0");
    assert!((hits[0].score - 2.0 / 2f64.sqrt()).abs() < 1e-9);

    let any_level = index.query("paragraph", None, 2).unwrap();
    assert_eq!(any_level.len(), 2);

    assert_eq!(
        index.query("?!", None, 5).unwrap_err().kind(),
        ErrorKind::Validation
    );
    assert_eq!(
        index.query("alpha", None, 5_000).unwrap_err().kind(),
        ErrorKind::ResourceLimit
    );
}

#[test]
fn reindexing_replaces_the_document_subtree() {
    let mut index = indexed();
    let before = index.node_count();
    index
        .index_document("doc", "Only one line now.", Map::new())
        .unwrap();

    assert!(index.node_count() < before);
    assert_eq!(index.documents(), ["doc".to_string()]);
    assert!(index.get_node("doc/s1").is_none());
    assert_eq!(index.get_node("doc/s0/p0").unwrap().content, "Only one line now.");

    index.index_document("other", "Second doc.", Map::new()).unwrap();
    assert!(index.remove_document("doc"));
    assert!(!index.remove_document("doc"));
    assert!(index.get_node("doc").is_none());
    assert!(index.get_node("other/s0/p0").is_some());
}

#[test]
fn invalid_documents_are_rejected() {
    let mut index = HierarchicalIndex::new();
    for doc_id in ["", "a/b"] {
        assert_eq!(
            index.index_document(doc_id, "Text.", Map::new()).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }
    assert_eq!(
        index.index_document("doc", "  \n ", Map::new()).unwrap_err().kind(),
        ErrorKind::Validation
    );
    assert_eq!(index.node_count(), 0);
}

#[test]
fn safety_limits_fail_instead_of_truncating() {
    let mut tight = HierarchicalIndex::new().with_limits(SafetyLimits {
        max_sentence_chars: 10,
        ..SafetyLimits::default()
    });
    let err = tight
        .index_document("doc", "This sentence is far too long.", Map::new())
        .unwrap_err();
    match err {
        HhniError::ResourceLimit { limit, max, .. } => {
            assert_eq!(limit, "sentence_chars");
            assert_eq!(max, 10);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tight.node_count(), 0);

    let mut small_docs = HierarchicalIndex::new().with_limits(SafetyLimits {
        max_document_bytes: 8,
        ..SafetyLimits::default()
    });
    assert_eq!(
        small_docs
            .index_document("doc", "Nine byte", Map::new())
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceLimit
    );

    let mut few_nodes = HierarchicalIndex::new().with_limits(SafetyLimits {
        max_nodes_per_document: 5,
        ..SafetyLimits::default()
    });
    assert_eq!(
        few_nodes.index_document("doc", DOC, Map::new()).unwrap_err().kind(),
        ErrorKind::ResourceLimit
    );
}

#[test]
fn embeddings_are_requested_in_capped_batches() {
    let embedder = Arc::new(RecordingEmbedder::default());
    let mut index = HierarchicalIndex::new()
        .with_embedder(embedder.clone())
        .with_limits(SafetyLimits {
            max_embedding_batch: 4,
            ..SafetyLimits::default()
        });
    index.index_document("doc", DOC, Map::new()).unwrap();

    let batches = embedder.batches.lock().unwrap().clone();
    assert_eq!(batches.iter().sum::<usize>(), index.node_count());
    assert!(batches.iter().all(|size| *size <= 4));
    assert_eq!(index.get_node("doc/s1/p0").unwrap().embedding, Some(vec![0.0, 1.0]));

    assert_eq!(
        index
            .encode_batch(&["a", "b", "c", "d", "e"])
            .unwrap_err()
            .kind(),
        ErrorKind::ResourceLimit
    );
}

#[test]
fn expired_deadline_times_out_without_touching_the_index() {
    let mut index = indexed();
    let before = index.node_count();
    let err = index
        .index_document_with_deadline("late", DOC, Map::new(), &Deadline::after(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, HhniError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(index.node_count(), before);
    assert!(index.get_node("late").is_none());
}

#[test]
fn serialized_index_restores_and_validates_structure() {
    let index = indexed();
    let dump = index.to_dict().unwrap();
    assert_eq!(dump["version"], 1);

    let restored = HierarchicalIndex::from_dict(&dump).unwrap();
    assert_eq!(restored.node_count(), index.node_count());
    assert_eq!(restored.documents(), index.documents());
    let original = index.get_node("doc/s0/p0").unwrap();
    let copy = restored.get_node("doc/s0/p0").unwrap();
    assert_eq!(copy.content, original.content);
    assert_eq!(copy.children_ids, original.children_ids);
    assert_eq!(copy.metadata, original.metadata);
    let hits = SemanticSearch::new(&restored)
        .search("Alpha beta gamma.", Some(HierarchyLevel::Paragraph), 3)
        .unwrap();
    assert!(!hits.is_empty());

    let mut orphaned = dump.clone();
    orphaned["nodes"]
        .as_array_mut()
        .unwrap()
        .retain(|node| node["id"] != "doc/s1");
    let err = HierarchicalIndex::from_dict(&orphaned).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut future = dump;
    future["version"] = json!(99);
    assert!(HierarchicalIndex::from_dict(&future).is_err());
}
