//! Cooperative cancellation and wall-clock ceilings for long-running work.
//!
//! # Responsibility
//! - Let callers stop physics iterations, BFS traversals and batch ingest.
//! - Bound HHNI indexing and query paths by a wall-clock deadline.
//!
//! # Invariants
//! - Cancellation is sticky: once set it never resets.
//! - Long-running loops check the token between units of work and return
//!   partial results instead of failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ceiling for HHNI indexing operations.
pub const INDEXING_TIMEOUT: Duration = Duration::from_secs(30);
/// Ceiling for query-side read paths.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation for every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Wall-clock deadline started at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started_at: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            limit,
        }
    }

    /// Deadline for indexing work.
    pub fn indexing() -> Self {
        Self::after(INDEXING_TIMEOUT)
    }

    /// Deadline for query-side work.
    pub fn query() -> Self {
        Self::after(QUERY_TIMEOUT)
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.started_at.elapsed() >= self.limit
    }
}
