//! Parallel atom ingestion.
//!
//! Payloads are validated and written on a dedicated rayon pool. Results are
//! reported in input order regardless of completion order.

use super::{AtomStore, StoreError};
use crate::cancel::CancellationToken;
use crate::model::atom::{Atom, NewAtom};
use log::{info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

pub const DEFAULT_BATCH_THREADS: usize = 4;

/// Progress notification emitted after every processed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
}

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Created atoms in input order.
    pub created: Vec<Atom>,
    /// `(input index, error)` for every rejected payload.
    pub failures: Vec<(usize, StoreError)>,
    /// Payloads never attempted because the batch was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

enum ItemOutcome {
    Created(Atom),
    Failed(StoreError),
    Skipped,
}

/// Bounded-parallelism ingestor over any [`AtomStore`].
#[derive(Debug, Clone)]
pub struct BatchIngestor {
    threads: usize,
}

impl Default for BatchIngestor {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_THREADS)
    }
}

impl BatchIngestor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn ingest(
        &self,
        store: &dyn AtomStore,
        payloads: Vec<NewAtom>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, StoreError> {
        self.ingest_with_progress(store, payloads, cancel, |_| {})
    }

    /// Ingests `payloads`, calling `on_progress` after each one.
    ///
    /// Cancellation stops new payloads from starting; in-flight writes finish.
    pub fn ingest_with_progress<P>(
        &self,
        store: &dyn AtomStore,
        payloads: Vec<NewAtom>,
        cancel: &CancellationToken,
        on_progress: P,
    ) -> Result<BatchReport, StoreError>
    where
        P: Fn(BatchProgress) + Sync,
    {
        let started_at = Instant::now();
        let total = payloads.len();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|index| format!("aimos-ingest-{index}"))
            .build()
            .map_err(|err| StoreError::InvalidData(format!("ingest pool unavailable: {err}")))?;

        let processed = AtomicUsize::new(0);
        let outcomes: Vec<ItemOutcome> = pool.install(|| {
            payloads
                .into_par_iter()
                .map(|payload| {
                    if cancel.is_cancelled() {
                        return ItemOutcome::Skipped;
                    }
                    let outcome = match store.create_atom(payload) {
                        Ok(atom) => ItemOutcome::Created(atom),
                        Err(err) => ItemOutcome::Failed(err),
                    };
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    on_progress(BatchProgress {
                        processed: done,
                        total,
                    });
                    outcome
                })
                .collect()
        });

        let mut report = BatchReport {
            cancelled: cancel.is_cancelled(),
            ..BatchReport::default()
        };
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                ItemOutcome::Created(atom) => report.created.push(atom),
                ItemOutcome::Failed(err) => report.failures.push((index, err)),
                ItemOutcome::Skipped => report.skipped += 1,
            }
        }

        if report.failures.is_empty() {
            info!(
                "event=batch_ingest module=store status=ok total={} created={} skipped={} duration_ms={}",
                total,
                report.created.len(),
                report.skipped,
                started_at.elapsed().as_millis()
            );
        } else {
            warn!(
                "event=batch_ingest module=store status=partial total={} created={} failed={} skipped={} duration_ms={}",
                total,
                report.created.len(),
                report.failures.len(),
                report.skipped,
                started_at.elapsed().as_millis()
            );
        }
        Ok(report)
    }
}
