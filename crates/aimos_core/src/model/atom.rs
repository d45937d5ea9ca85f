//! Atom domain model.
//!
//! # Responsibility
//! - Define the immutable, content-addressed memory record.
//! - Validate tag maps and payload sizes before anything reaches storage.
//! - Derive the content hash from the normalized payload.
//!
//! # Invariants
//! - `id` is a fresh UUID and never reused.
//! - `hash` is SHA-256 over canonical JSON of the normalized payload, so it is
//!   stable across re-serialization and restarts.
//! - Tag maps hold at most 20 entries, keys of 1..=50 chars, finite weights
//!   in `[0, 1]`.
//! - Inline text above 1 MB is offloaded; payloads above 100 MB are rejected.

use crate::canonical::canonical_digest;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier for every atom.
pub type AtomId = Uuid;

pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_KEY_CHARS: usize = 50;
/// Inline payloads above this size are moved to `payloads/<id>.json`.
pub const MAX_INLINE_BYTES: usize = 1024 * 1024;
/// Hard ceiling for the serialized payload.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Validation failures raised before persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomValidationError {
    EmptyModality,
    EmptyContent,
    EmptyMediaType,
    EmptyUri,
    TooManyTags { count: usize },
    EmptyTagKey,
    TagKeyTooLong { key: String },
    InvalidTagWeight { key: String, weight: f64 },
    PayloadTooLarge { bytes: usize },
    NonFiniteEmbedding { index: usize },
}

impl AtomValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Display for AtomValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyModality => write!(f, "atom modality must not be blank"),
            Self::EmptyContent => write!(f, "atom content must not be empty"),
            Self::EmptyMediaType => write!(f, "atom content media_type is mandatory"),
            Self::EmptyUri => write!(f, "external atom content requires a uri"),
            Self::TooManyTags { count } => {
                write!(f, "atom carries {count} tags; at most {MAX_TAGS} allowed")
            }
            Self::EmptyTagKey => write!(f, "tag key must not be empty"),
            Self::TagKeyTooLong { key } => write!(
                f,
                "tag key `{key}` exceeds {MAX_TAG_KEY_CHARS} characters"
            ),
            Self::InvalidTagWeight { key, weight } => write!(
                f,
                "tag `{key}` weight {weight} must be a finite number in [0, 1]"
            ),
            Self::PayloadTooLarge { bytes } => write!(
                f,
                "atom payload is {bytes} bytes; limit is {MAX_PAYLOAD_BYTES} bytes"
            ),
            Self::NonFiniteEmbedding { index } => {
                write!(f, "embedding value at index {index} is not finite")
            }
        }
    }
}

impl Error for AtomValidationError {}

/// Atom payload body: inline text or a pointer to externally stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AtomContent {
    Inline { inline: String, media_type: String },
    External { uri: String, media_type: String },
}

impl AtomContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Inline {
            inline: text.into(),
            media_type: "text/plain".to_string(),
        }
    }

    pub fn external(uri: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::External {
            uri: uri.into(),
            media_type: media_type.into(),
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Self::Inline { media_type, .. } | Self::External { media_type, .. } => media_type,
        }
    }

    /// Inline text when the payload is stored in the record itself.
    pub fn inline_text(&self) -> Option<&str> {
        match self {
            Self::Inline { inline, .. } => Some(inline),
            Self::External { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Inline { .. } => None,
            Self::External { uri, .. } => Some(uri),
        }
    }

    fn validate(&self) -> Result<(), AtomValidationError> {
        if self.media_type().trim().is_empty() {
            return Err(AtomValidationError::EmptyMediaType);
        }
        match self {
            Self::Inline { inline, .. } if inline.is_empty() => {
                Err(AtomValidationError::EmptyContent)
            }
            Self::External { uri, .. } if uri.trim().is_empty() => {
                Err(AtomValidationError::EmptyUri)
            }
            _ => Ok(()),
        }
    }
}

/// Validated tag-name to weight mapping with deterministic (sorted) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagMap(BTreeMap<String, f64>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from pairs, validating every entry and the total count.
    pub fn try_from_pairs<I, K>(pairs: I) -> Result<Self, AtomValidationError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut tags = Self::new();
        for (key, weight) in pairs {
            tags.insert(key, weight)?;
        }
        Ok(tags)
    }

    /// Inserts or replaces one tag after validating key, weight and count.
    pub fn insert(&mut self, key: impl Into<String>, weight: f64) -> Result<(), AtomValidationError> {
        let key = key.into();
        validate_tag(&key, weight)?;
        if !self.0.contains_key(&key) && self.0.len() >= MAX_TAGS {
            return Err(AtomValidationError::TooManyTags {
                count: self.0.len() + 1,
            });
        }
        self.0.insert(key, weight);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(key, weight)| (key.as_str(), *weight))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    /// Re-validates a map that bypassed `insert` (e.g. deserialized input).
    pub fn validate(&self) -> Result<(), AtomValidationError> {
        if self.0.len() > MAX_TAGS {
            return Err(AtomValidationError::TooManyTags {
                count: self.0.len(),
            });
        }
        for (key, weight) in &self.0 {
            validate_tag(key, *weight)?;
        }
        Ok(())
    }
}

fn validate_tag(key: &str, weight: f64) -> Result<(), AtomValidationError> {
    if key.is_empty() {
        return Err(AtomValidationError::EmptyTagKey);
    }
    if key.chars().count() > MAX_TAG_KEY_CHARS {
        return Err(AtomValidationError::TagKeyTooLong {
            key: key.to_string(),
        });
    }
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err(AtomValidationError::InvalidTagWeight {
            key: key.to_string(),
            weight,
        });
    }
    Ok(())
}

/// Caller-supplied payload for `create_atom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAtom {
    pub modality: String,
    pub content: AtomContent,
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub policy_tags: Vec<String>,
    #[serde(default)]
    pub witness: Value,
}

impl NewAtom {
    /// Plain-text payload with `text` modality and no tags.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            modality: "text".to_string(),
            content: AtomContent::text(content),
            tags: TagMap::new(),
            metadata: Map::new(),
            embedding: None,
            policy_tags: Vec::new(),
            witness: Value::Null,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, weight: f64) -> Result<Self, AtomValidationError> {
        self.tags.insert(key, weight)?;
        Ok(self)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Trims the modality and dedups policy tags in first-seen order.
    pub fn normalized(&self) -> NormalizedPayload {
        let mut policy_tags: Vec<String> = Vec::with_capacity(self.policy_tags.len());
        for tag in &self.policy_tags {
            let tag = tag.trim();
            if !tag.is_empty() && !policy_tags.iter().any(|seen| seen == tag) {
                policy_tags.push(tag.to_string());
            }
        }
        NormalizedPayload {
            modality: self.modality.trim().to_string(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            embedding: self.embedding.clone(),
            policy_tags,
        }
    }

    /// Validates everything that can be checked without storage access.
    pub fn validate(&self) -> Result<(), AtomValidationError> {
        if self.modality.trim().is_empty() {
            return Err(AtomValidationError::EmptyModality);
        }
        self.content.validate()?;
        self.tags.validate()?;
        if let Some(embedding) = &self.embedding {
            if let Some(index) = embedding.iter().position(|value| !value.is_finite()) {
                return Err(AtomValidationError::NonFiniteEmbedding { index });
            }
        }
        Ok(())
    }
}

/// The hashed portion of an atom.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedPayload {
    pub modality: String,
    pub content: AtomContent,
    pub tags: TagMap,
    pub metadata: Map<String, Value>,
    pub embedding: Option<Vec<f32>>,
    pub policy_tags: Vec<String>,
}

impl NormalizedPayload {
    /// SHA-256 hex over the canonical JSON of this payload.
    pub fn content_hash(&self) -> serde_json::Result<String> {
        canonical_digest(self)
    }

    /// Serialized size used for the 100 MB ceiling.
    pub fn encoded_len(&self) -> serde_json::Result<usize> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }
}

/// Immutable, content-addressed memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: AtomId,
    pub modality: String,
    pub content: AtomContent,
    pub tags: TagMap,
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub policy_tags: Vec<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub witness: Value,
    /// Snapshots this atom participates in. Derived on read, never hashed.
    #[serde(default)]
    pub snapshot_ids: Vec<String>,
}

impl Atom {
    /// Builds the record for a validated payload.
    ///
    /// `content` may differ from `normalized.content` when the inline body was
    /// offloaded; the hash always covers the logical (pre-offload) payload.
    pub fn from_normalized(
        id: AtomId,
        normalized: NormalizedPayload,
        content: AtomContent,
        hash: String,
        created_at: DateTime<Utc>,
        witness: Value,
    ) -> Self {
        Self {
            id,
            modality: normalized.modality,
            content,
            tags: normalized.tags,
            metadata: normalized.metadata,
            embedding: normalized.embedding,
            policy_tags: normalized.policy_tags,
            hash,
            created_at,
            witness,
            snapshot_ids: Vec::new(),
        }
    }

    pub fn new_id() -> AtomId {
        Uuid::new_v4()
    }

    pub fn tag_weight(&self, key: &str) -> Option<f64> {
        self.tags.get(key)
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self.content, AtomContent::External { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomContent, AtomValidationError, NewAtom, TagMap, MAX_TAGS};

    #[test]
    fn tag_map_rejects_out_of_range_weights() {
        let mut tags = TagMap::new();
        assert!(matches!(
            tags.insert("decision", 1.5),
            Err(AtomValidationError::InvalidTagWeight { .. })
        ));
        assert!(matches!(
            tags.insert("decision", f64::NAN),
            Err(AtomValidationError::InvalidTagWeight { .. })
        ));
        tags.insert("decision", 1.0).unwrap();
        assert_eq!(tags.get("decision"), Some(1.0));
    }

    #[test]
    fn tag_map_caps_entry_count_but_allows_replacement() {
        let mut tags = TagMap::new();
        for index in 0..MAX_TAGS {
            tags.insert(format!("tag_{index}"), 0.5).unwrap();
        }
        assert!(matches!(
            tags.insert("one_more", 0.5),
            Err(AtomValidationError::TooManyTags { .. })
        ));
        tags.insert("tag_0", 0.9).unwrap();
        assert_eq!(tags.len(), MAX_TAGS);
    }

    #[test]
    fn tag_key_length_is_counted_in_chars() {
        let mut tags = TagMap::new();
        assert!(tags.insert("é".repeat(50), 0.1).is_ok());
        assert!(matches!(
            tags.insert("x".repeat(51), 0.1),
            Err(AtomValidationError::TagKeyTooLong { .. })
        ));
    }

    #[test]
    fn normalization_trims_modality_and_dedups_policy_tags() {
        let mut payload = NewAtom::text("hello");
        payload.modality = "  text ".to_string();
        payload.policy_tags = vec![
            "policy.a".to_string(),
            " policy.b".to_string(),
            "policy.a".to_string(),
        ];
        let normalized = payload.normalized();
        assert_eq!(normalized.modality, "text");
        assert_eq!(normalized.policy_tags, vec!["policy.a", "policy.b"]);
    }

    #[test]
    fn hash_depends_only_on_normalized_payload() {
        let left = NewAtom::text("same")
            .with_tag("b", 0.2)
            .unwrap()
            .with_tag("a", 0.1)
            .unwrap();
        let mut right = NewAtom::text("same")
            .with_tag("a", 0.1)
            .unwrap()
            .with_tag("b", 0.2)
            .unwrap();
        right.modality = " text".to_string();
        assert_eq!(
            left.normalized().content_hash().unwrap(),
            right.normalized().content_hash().unwrap()
        );

        let different = NewAtom::text("other");
        assert_ne!(
            left.normalized().content_hash().unwrap(),
            different.normalized().content_hash().unwrap()
        );
    }

    #[test]
    fn content_roundtrips_through_untagged_json() {
        let inline = AtomContent::text("body");
        let encoded = serde_json::to_value(&inline).unwrap();
        assert_eq!(encoded["inline"], "body");
        assert_eq!(encoded["media_type"], "text/plain");

        let external: AtomContent =
            serde_json::from_value(serde_json::json!({"uri": "file:///x", "media_type": "text/plain"}))
                .unwrap();
        assert_eq!(external.uri(), Some("file:///x"));
    }

    #[test]
    fn validation_rejects_empty_content_and_media_type() {
        let payload = NewAtom::text("");
        assert_eq!(payload.validate(), Err(AtomValidationError::EmptyContent));

        let mut payload = NewAtom::text("x");
        payload.content = AtomContent::Inline {
            inline: "x".to_string(),
            media_type: " ".to_string(),
        };
        assert_eq!(payload.validate(), Err(AtomValidationError::EmptyMediaType));
    }
}
