//! Large inline payload offload.
//!
//! Inline text above `MAX_INLINE_BYTES` is written to
//! `<root>/payloads/<atom_id>.json` and the atom keeps a `file://` pointer.

use super::{StoreError, StoreResult};
use crate::model::atom::{Atom, AtomContent, AtomId, MAX_INLINE_BYTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// On-disk body of an offloaded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PayloadFile {
    inline: String,
    media_type: String,
}

/// Offload decision for one atom: the external pointer and the file to write.
#[derive(Debug, Clone)]
pub struct OffloadedPayload {
    pub path: PathBuf,
    pub content: AtomContent,
    body: PayloadFile,
}

impl OffloadedPayload {
    /// Writes the payload file; call before the atom record is persisted.
    pub fn write(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| StoreError::io(parent.to_path_buf(), source))?;
        }
        let encoded = serde_json::to_vec(&self.body)?;
        std::fs::write(&self.path, encoded).map_err(|source| StoreError::io(&self.path, source))
    }

    /// Removes a payload file whose atom never got persisted.
    pub fn discard(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Returns the offload plan when `content` is inline and too large.
pub fn plan_offload(
    payloads_dir: &Path,
    id: AtomId,
    content: &AtomContent,
) -> Option<OffloadedPayload> {
    let AtomContent::Inline { inline, media_type } = content else {
        return None;
    };
    if inline.len() <= MAX_INLINE_BYTES {
        return None;
    }
    let path = payloads_dir.join(format!("{id}.json"));
    let uri = format!("{FILE_SCHEME}{}", path.display());
    Some(OffloadedPayload {
        content: AtomContent::external(uri, media_type.clone()),
        path,
        body: PayloadFile {
            inline: inline.clone(),
            media_type: media_type.clone(),
        },
    })
}

/// Resolves the text body of an atom, following offload pointers.
pub fn load_content_text(atom: &Atom) -> StoreResult<String> {
    match &atom.content {
        AtomContent::Inline { inline, .. } => Ok(inline.clone()),
        AtomContent::External { uri, .. } => {
            let path = uri.strip_prefix(FILE_SCHEME).ok_or_else(|| {
                StoreError::InvalidData(format!("unsupported payload uri `{uri}`"))
            })?;
            let bytes = std::fs::read(path).map_err(|source| StoreError::io(path, source))?;
            // Offloaded bodies are JSON; foreign files are returned as text.
            match serde_json::from_slice::<PayloadFile>(&bytes) {
                Ok(body) => Ok(body.inline),
                Err(_) => String::from_utf8(bytes).map_err(|_| {
                    StoreError::InvalidData(format!("payload at `{uri}` is not utf-8 text"))
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::plan_offload;
    use crate::model::atom::{AtomContent, MAX_INLINE_BYTES};
    use uuid::Uuid;

    #[test]
    fn small_inline_payloads_stay_inline() {
        let dir = tempfile::tempdir().unwrap();
        let content = AtomContent::text("short");
        assert!(plan_offload(dir.path(), Uuid::new_v4(), &content).is_none());
    }

    #[test]
    fn oversized_inline_payload_becomes_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let content = AtomContent::text("x".repeat(MAX_INLINE_BYTES + 1));
        let plan = plan_offload(dir.path(), id, &content).unwrap();
        let uri = plan.content.uri().unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with(&format!("{id}.json")));
        assert_eq!(plan.content.media_type(), "text/plain");
    }
}
