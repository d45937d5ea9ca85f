//! Store counters and histograms.
//!
//! Counters are kept in-process so callers and tests can read them back, and
//! every record call is mirrored to the `metrics` facade for whichever
//! recorder the embedding process installs.

use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (milliseconds) of the snapshot duration buckets.
const DURATION_BUCKETS_MS: [f64; 8] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

/// Counters owned by one atom store (shared through `Arc`).
#[derive(Debug, Default)]
pub struct StoreMetrics {
    write_errors_total: AtomicU64,
    atoms_created_total: AtomicU64,
    snapshots_created_total: AtomicU64,
    atoms_by_modality: Mutex<BTreeMap<String, u64>>,
    snapshot_durations: Mutex<DurationHistogram>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write_error(&self, operation: &'static str) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
        counter!("cmc.write_errors_total", "operation" => operation).increment(1);
    }

    pub fn record_atom_created(&self, modality: &str) {
        self.atoms_created_total.fetch_add(1, Ordering::Relaxed);
        *self
            .atoms_by_modality
            .lock()
            .entry(modality.to_string())
            .or_insert(0) += 1;
        counter!("cmc.atoms_created_total", "modality" => modality.to_string()).increment(1);
    }

    pub fn record_snapshot_created(&self, elapsed: Duration) {
        self.snapshots_created_total.fetch_add(1, Ordering::Relaxed);
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.snapshot_durations.lock().observe(ms);
        histogram!("cmc.snapshot.duration_ms").record(ms);
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn atoms_created_total(&self) -> u64 {
        self.atoms_created_total.load(Ordering::Relaxed)
    }

    pub fn snapshots_created_total(&self) -> u64 {
        self.snapshots_created_total.load(Ordering::Relaxed)
    }

    pub fn atoms_for_modality(&self, modality: &str) -> u64 {
        self.atoms_by_modality
            .lock()
            .get(modality)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot_duration_histogram(&self) -> DurationHistogram {
        self.snapshot_durations.lock().clone()
    }
}

/// Fixed-bucket histogram of durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurationHistogram {
    pub count: u64,
    pub sum_ms: f64,
    pub max_ms: f64,
    /// Cumulative-free bucket counts aligned with `bucket_bounds_ms()`, plus
    /// one overflow bucket at the end.
    pub buckets: Vec<u64>,
}

impl DurationHistogram {
    pub fn bucket_bounds_ms() -> &'static [f64] {
        &DURATION_BUCKETS_MS
    }

    fn observe(&mut self, ms: f64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; DURATION_BUCKETS_MS.len() + 1];
        }
        self.count += 1;
        self.sum_ms += ms;
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        let slot = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[slot] += 1;
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StoreMetrics;
    use std::time::Duration;

    #[test]
    fn counters_accumulate_per_modality() {
        let metrics = StoreMetrics::new();
        metrics.record_atom_created("text");
        metrics.record_atom_created("text");
        metrics.record_atom_created("image");
        assert_eq!(metrics.atoms_created_total(), 3);
        assert_eq!(metrics.atoms_for_modality("text"), 2);
        assert_eq!(metrics.atoms_for_modality("audio"), 0);
    }

    #[test]
    fn histogram_places_observations_into_buckets() {
        let metrics = StoreMetrics::new();
        metrics.record_snapshot_created(Duration::from_millis(3));
        metrics.record_snapshot_created(Duration::from_secs(5));
        let histogram = metrics.snapshot_duration_histogram();
        assert_eq!(histogram.count, 2);
        assert_eq!(histogram.buckets[1], 1);
        assert_eq!(*histogram.buckets.last().unwrap(), 1);
        assert!(histogram.max_ms >= 5_000.0);
    }
}
