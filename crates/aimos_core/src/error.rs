//! Boundary error taxonomy shared by every core layer.
//!
//! # Responsibility
//! - Classify layer-specific errors into one stable set of kinds.
//! - Map kinds to transport status codes for whichever surface wraps the core.
//!
//! # Invariants
//! - Each layer error keeps its own enum; `kind()` is the only shared view.
//! - Validation, policy, degree and resource-limit failures are caller errors.

use std::fmt::{Display, Formatter};

/// Stable error classification exposed at the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input: tag caps, empty content, malformed timestamp, invalid budget.
    Validation,
    /// `depends_on` edge without inherited policy packs.
    PolicyViolation,
    /// `max_dependency_degree` already reached for the source node.
    DegreeExceeded,
    /// Unknown snapshot id.
    SnapshotMissing,
    /// Snapshot references an atom that no longer resolves.
    SnapshotReplay,
    /// Journal frame failed length or checksum verification.
    JournalCorruption,
    /// Underlying storage write failed.
    Write,
    /// HHNI safety cap exceeded.
    ResourceLimit,
    /// Addressed record or file does not exist.
    NotFound,
    /// Wall-clock ceiling exceeded.
    Timeout,
    /// External cancellation observed.
    Cancelled,
    /// Any other storage/transport failure.
    Storage,
}

impl ErrorKind {
    /// Stable snake_case label used in logs and serialized error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PolicyViolation => "policy_violation",
            Self::DegreeExceeded => "degree_exceeded",
            Self::SnapshotMissing => "snapshot_missing",
            Self::SnapshotReplay => "snapshot_replay",
            Self::JournalCorruption => "journal_corruption",
            Self::Write => "write_error",
            Self::ResourceLimit => "resource_limit",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Storage => "storage",
        }
    }

    /// HTTP-style status code for transport wrappers.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation
            | Self::PolicyViolation
            | Self::DegreeExceeded
            | Self::ResourceLimit => 400,
            Self::SnapshotMissing | Self::NotFound => 404,
            Self::Timeout => 504,
            Self::Cancelled => 499,
            Self::SnapshotReplay | Self::JournalCorruption | Self::Write | Self::Storage => 500,
        }
    }

    /// Whether the failure was caused by the caller's input.
    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn policy_and_degree_failures_map_to_bad_request() {
        assert_eq!(ErrorKind::PolicyViolation.http_status(), 400);
        assert_eq!(ErrorKind::DegreeExceeded.http_status(), 400);
        assert_eq!(ErrorKind::Validation.http_status(), 400);
    }

    #[test]
    fn storage_failures_are_server_errors() {
        assert_eq!(ErrorKind::Write.http_status(), 500);
        assert_eq!(ErrorKind::JournalCorruption.http_status(), 500);
        assert!(!ErrorKind::Storage.is_client_error());
    }

    #[test]
    fn missing_resources_map_to_not_found() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::SnapshotMissing.http_status(), 404);
    }
}
