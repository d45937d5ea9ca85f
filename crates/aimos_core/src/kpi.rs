//! Append-only KPI sample log.
//!
//! Samples live in `<root>/kpis/metrics.jsonl`, one JSON object per line.
//! Reads tolerate malformed lines (logged and skipped); a missing file is a
//! `NotFound` condition for callers.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const KPI_DIR: &str = "kpis";
pub const KPI_FILE: &str = "metrics.jsonl";

#[derive(Debug)]
pub enum KpiError {
    MetricsFileMissing(PathBuf),
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    InvalidValue(String),
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Serialization(serde_json::Error),
}

impl KpiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MetricsFileMissing(_) => ErrorKind::NotFound,
            Self::InvalidRange { .. } | Self::InvalidValue(_) => ErrorKind::Validation,
            Self::Io { .. } | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

impl Display for KpiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetricsFileMissing(path) => {
                write!(f, "kpi metrics file not found: {}", path.display())
            }
            Self::InvalidRange { start, end } => {
                write!(f, "kpi history start {start} is after end {end}")
            }
            Self::InvalidValue(message) => write!(f, "{message}"),
            Self::Io { path, source } => {
                write!(f, "kpi io error at `{}`: {source}", path.display())
            }
            Self::Serialization(err) => write!(f, "kpi serialization error: {err}"),
        }
    }
}

impl Error for KpiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

/// One recorded KPI value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSample {
    pub metric: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Handle over the KPI log file under a data root.
#[derive(Debug, Clone)]
pub struct KpiLog {
    path: PathBuf,
}

impl KpiLog {
    pub fn new(data_root: impl AsRef<Path>) -> Self {
        Self {
            path: data_root.as_ref().join(KPI_DIR).join(KPI_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, metric: &str, value: f64) -> Result<KpiSample, KpiError> {
        self.record_at(metric, value, Utc::now())
    }

    pub fn record_at(
        &self,
        metric: &str,
        value: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<KpiSample, KpiError> {
        if metric.trim().is_empty() {
            return Err(KpiError::InvalidValue("kpi metric name must not be blank".to_string()));
        }
        if !value.is_finite() {
            return Err(KpiError::InvalidValue(format!(
                "kpi `{metric}` value must be finite"
            )));
        }
        let sample = KpiSample {
            metric: metric.trim().to_string(),
            value,
            recorded_at,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let mut line = serde_json::to_vec(&sample).map_err(KpiError::Serialization)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        file.write_all(&line).map_err(|source| self.io_error(source))?;
        Ok(sample)
    }

    /// Most recent sample per metric.
    pub fn latest(&self) -> Result<BTreeMap<String, KpiSample>, KpiError> {
        let mut latest: BTreeMap<String, KpiSample> = BTreeMap::new();
        for sample in self.read_samples()? {
            match latest.get(&sample.metric) {
                Some(existing) if existing.recorded_at > sample.recorded_at => {}
                _ => {
                    latest.insert(sample.metric.clone(), sample);
                }
            }
        }
        Ok(latest)
    }

    /// Samples for `metrics` (all when empty) within `[start, end]`, oldest first.
    pub fn history(
        &self,
        metrics: &[String],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<KpiSample>, KpiError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(KpiError::InvalidRange { start, end });
            }
        }
        let mut samples: Vec<KpiSample> = self
            .read_samples()?
            .into_iter()
            .filter(|sample| metrics.is_empty() || metrics.contains(&sample.metric))
            .filter(|sample| start.map_or(true, |start| sample.recorded_at >= start))
            .filter(|sample| end.map_or(true, |end| sample.recorded_at <= end))
            .collect();
        samples.sort_by(|left, right| left.recorded_at.cmp(&right.recorded_at));
        Ok(samples)
    }

    fn read_samples(&self) -> Result<Vec<KpiSample>, KpiError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(KpiError::MetricsFileMissing(self.path.clone()))
            }
            Err(source) => return Err(self.io_error(source)),
        };
        let mut samples = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| self.io_error(source))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KpiSample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(err) => warn!(
                    "event=kpi_read module=kpi status=warn error_code=malformed_line line={} error={}",
                    index + 1,
                    err
                ),
            }
        }
        Ok(samples)
    }

    fn io_error(&self, source: io::Error) -> KpiError {
        KpiError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KpiLog, KPI_DIR, KPI_FILE};
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    #[test]
    fn latest_keeps_newest_sample_and_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = KpiLog::new(dir.path());
        assert_eq!(log.latest().unwrap_err().kind(), ErrorKind::NotFound);

        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        log.record_at("rs_lift", 0.2, late).unwrap();
        log.record_at("rs_lift", 0.1, early).unwrap();
        log.record_at("recall", 0.9, early).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(KPI_DIR).join(KPI_FILE))
            .unwrap();
        writeln!(file, "{{not json").unwrap();

        let latest = log.latest().unwrap();
        assert_eq!(latest["rs_lift"].value, 0.2);
        assert_eq!(latest["recall"].value, 0.9);
    }

    #[test]
    fn history_filters_by_metric_and_inclusive_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = KpiLog::new(dir.path());
        for day in 1..=4 {
            let at = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
            log.record_at("rs_lift", f64::from(day), at).unwrap();
            log.record_at("recall", 0.5, at).unwrap();
        }

        let start = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
        let values: Vec<f64> = log
            .history(&["rs_lift".to_string()], Some(start), Some(end))
            .unwrap()
            .iter()
            .map(|sample| sample.value)
            .collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(log.history(&[], None, None).unwrap().len(), 8);
        assert_eq!(
            log.history(&[], Some(end), Some(start)).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn blank_names_and_non_finite_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = KpiLog::new(dir.path());
        assert_eq!(log.record(" ", 1.0).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(
            log.record("rs_lift", f64::NAN).unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(!log.path().exists());
    }
}
