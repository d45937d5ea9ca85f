//! Length-prefixed, CRC-checked append log (C1).
//!
//! # Responsibility
//! - Append JSON records as framed, checksummed payloads.
//! - Replay every record in write order, failing loudly on damage.
//! - Hold an exclusive advisory lock for the lifetime of the handle.
//!
//! # Invariants
//! - Frame layout: `| len u32 BE | crc32(payload) u32 BE | payload |`.
//! - Only one `Journal` per file may be open at a time (per the OS lock).
//! - The lock is released on drop, on every exit path.
//!
//! # See also
//! - `store::jsonl` for the quarantine-then-fail policy on corruption.

use crate::error::ErrorKind;
use chrono::Utc;
use fs2::FileExt;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 8;
/// Bytes of the damaged tail copied into a quarantine file.
const MAX_QUARANTINE_BYTES: usize = 64 * 1024;

pub type JournalResult<T> = Result<T, JournalError>;

/// Why a frame failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    TruncatedHeader { available: usize },
    TruncatedPayload { expected: usize, available: usize },
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl Display for CorruptionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TruncatedHeader { available } => {
                write!(f, "truncated header ({available} of {HEADER_LEN} bytes)")
            }
            Self::TruncatedPayload {
                expected,
                available,
            } => write!(f, "truncated payload ({available} of {expected} bytes)"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "crc mismatch (expected {expected:#010x}, computed {actual:#010x})"
            ),
        }
    }
}

/// Journal-level failures.
#[derive(Debug)]
pub enum JournalError {
    Io { path: PathBuf, source: io::Error },
    /// Another handle (this or another process) holds the lock.
    Locked { path: PathBuf },
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: CorruptionReason,
    },
    /// Frame verified but payload is not the expected JSON shape.
    Decode {
        path: PathBuf,
        offset: u64,
        source: serde_json::Error,
    },
    Encode(serde_json::Error),
    RecordTooLarge { bytes: usize },
}

impl JournalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Corruption { .. } | Self::Decode { .. } => ErrorKind::JournalCorruption,
            Self::RecordTooLarge { .. } => ErrorKind::Validation,
            Self::Io { .. } | Self::Locked { .. } | Self::Encode(_) => ErrorKind::Write,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Decode { .. })
    }
}

impl Display for JournalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "journal io error at `{}`: {source}", path.display()),
            Self::Locked { path } => {
                write!(f, "journal `{}` is locked by another writer", path.display())
            }
            Self::Corruption {
                path,
                offset,
                reason,
            } => write!(
                f,
                "journal `{}` corrupted at byte {offset}: {reason}",
                path.display()
            ),
            Self::Decode {
                path,
                offset,
                source,
            } => write!(
                f,
                "journal `{}` record at byte {offset} is not valid: {source}",
                path.display()
            ),
            Self::Encode(err) => write!(f, "failed to encode journal record: {err}"),
            Self::RecordTooLarge { bytes } => {
                write!(f, "journal record of {bytes} bytes exceeds frame limit")
            }
        }
    }
}

impl Error for JournalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Decode { source, .. } => Some(source),
            Self::Encode(err) => Some(err),
            Self::Locked { .. } | Self::Corruption { .. } | Self::RecordTooLarge { .. } => None,
        }
    }
}

/// Single-writer append log bound to one file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Opens (creating if needed) and exclusively locks the journal file.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| JournalError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            warn!(
                "event=journal_open module=journal status=error error_code=journal_locked path={}",
                path.display()
            );
            return Err(JournalError::Locked { path });
        }

        info!(
            "event=journal_open module=journal status=ok path={}",
            path.display()
        );
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes `record` as JSON and appends it. Returns the frame offset.
    pub fn append<T: Serialize + ?Sized>(&mut self, record: &T) -> JournalResult<u64> {
        let payload = serde_json::to_vec(record).map_err(JournalError::Encode)?;
        self.append_bytes(&payload)
    }

    /// Appends one raw payload frame, flushes, and requests fsync.
    pub fn append_bytes(&mut self, payload: &[u8]) -> JournalResult<u64> {
        let len = u32::try_from(payload.len()).map_err(|_| JournalError::RecordTooLarge {
            bytes: payload.len(),
        })?;
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|source| self.io_error(source))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
        frame.extend_from_slice(payload);

        self.file
            .write_all(&frame)
            .map_err(|source| self.io_error(source))?;
        self.file.flush().map_err(|source| self.io_error(source))?;
        if let Err(err) = self.file.sync_data() {
            // fsync is best effort; the frame is already in the page cache.
            warn!(
                "event=journal_append module=journal status=warn error_code=fsync_failed path={} error={}",
                self.path.display(),
                err
            );
        }
        Ok(offset)
    }

    /// Reads every frame from the start of the file.
    ///
    /// Each item is `(frame_offset, payload)`. Iteration stops at the first
    /// damaged frame with a `Corruption` error.
    pub fn iter_records(&mut self) -> JournalResult<JournalIter<'_>> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| self.io_error(source))?;
        Ok(JournalIter {
            journal: self,
            offset: 0,
            done: false,
        })
    }

    /// Decodes every record as `T`, in write order.
    pub fn read_all<T: DeserializeOwned>(&mut self) -> JournalResult<Vec<(u64, T)>> {
        let path = self.path.clone();
        let mut records = Vec::new();
        for item in self.iter_records()? {
            let (offset, payload) = item?;
            let record = serde_json::from_slice(&payload).map_err(|source| JournalError::Decode {
                path: path.clone(),
                offset,
                source,
            })?;
            records.push((offset, record));
        }
        Ok(records)
    }

    /// Reads and decodes the single frame starting at `offset`.
    pub fn read_at<T: DeserializeOwned>(&mut self, offset: u64) -> JournalResult<T> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|source| self.io_error(source))?;
        let payload = match read_frame(&mut self.file, &self.path, offset)? {
            Some(payload) => payload,
            None => {
                return Err(JournalError::Corruption {
                    path: self.path.clone(),
                    offset,
                    reason: CorruptionReason::TruncatedHeader { available: 0 },
                })
            }
        };
        serde_json::from_slice(&payload).map_err(|source| JournalError::Decode {
            path: self.path.clone(),
            offset,
            source,
        })
    }

    fn io_error(&self, source: io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(
                "event=journal_close module=journal status=warn error_code=unlock_failed path={} error={}",
                self.path.display(),
                err
            );
        }
    }
}

/// Iterator over verified frames; see [`Journal::iter_records`].
pub struct JournalIter<'j> {
    journal: &'j mut Journal,
    offset: u64,
    done: bool,
}

impl Iterator for JournalIter<'_> {
    type Item = JournalResult<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = self.offset;
        match read_frame(&mut self.journal.file, &self.journal.path, offset) {
            Ok(Some(payload)) => {
                self.offset += (HEADER_LEN + payload.len()) as u64;
                Some(Ok((offset, payload)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Reads one frame at the current cursor. `Ok(None)` means clean EOF.
fn read_frame(file: &mut File, path: &Path, offset: u64) -> JournalResult<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let available = read_up_to(file, &mut header).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if available == 0 {
        return Ok(None);
    }
    if available < HEADER_LEN {
        return Err(JournalError::Corruption {
            path: path.to_path_buf(),
            offset,
            reason: CorruptionReason::TruncatedHeader { available },
        });
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; len];
    let available = read_up_to(file, &mut payload).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if available < len {
        return Err(JournalError::Corruption {
            path: path.to_path_buf(),
            offset,
            reason: CorruptionReason::TruncatedPayload {
                expected: len,
                available,
            },
        });
    }

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(JournalError::Corruption {
            path: path.to_path_buf(),
            offset,
            reason: CorruptionReason::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            },
        });
    }
    Ok(Some(payload))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Copies diagnostics for a corrupted journal into `quarantine/<stem>_corrupt.json`.
///
/// The record carries the error text, the failing offset and a hex dump of
/// the damaged tail so the bytes survive any later repair of the log.
pub fn quarantine_corruption(
    quarantine_dir: &Path,
    journal_path: &Path,
    err: &JournalError,
) -> io::Result<PathBuf> {
    std::fs::create_dir_all(quarantine_dir)?;
    let stem = journal_path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("journal");
    let target = quarantine_dir.join(format!("{stem}_corrupt.json"));

    let offset = match err {
        JournalError::Corruption { offset, .. } | JournalError::Decode { offset, .. } => *offset,
        _ => 0,
    };
    let tail = read_tail(journal_path, offset).unwrap_or_default();
    let record = serde_json::json!({
        "journal": journal_path.display().to_string(),
        "error": err.to_string(),
        "offset": offset,
        "detected_at": Utc::now().to_rfc3339(),
        "corrupted_bytes_hex": hex::encode(&tail),
        "corrupted_bytes_truncated": tail.len() >= MAX_QUARANTINE_BYTES,
    });
    let encoded = serde_json::to_vec_pretty(&record).map_err(io::Error::other)?;
    std::fs::write(&target, encoded)?;

    error!(
        "event=journal_quarantine module=journal status=error error_code=journal_corruption path={} quarantine={} offset={}",
        journal_path.display(),
        target.display(),
        offset
    );
    Ok(target)
}

fn read_tail(path: &Path, offset: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.take(MAX_QUARANTINE_BYTES as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
