//! Telemetry sink and persisted metric history.
//!
//! Two separate concerns live here:
//! - [`MetricsSink`]: process-local counters and histograms, fed by the
//!   orchestrator and by `record_metric`.
//! - [`MetricHistory`]: time-series samples persisted through a
//!   [`KeyValueStore`], one JSON array per metric under `metric:{name}`,
//!   with the set of known names under [`METRICS_INDEX_KEY`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use attest_core::{EngineError, EngineResult, KeyValueStore, StorageError};

/// Storage key holding the JSON list of recorded metric names.
pub const METRICS_INDEX_KEY: &str = "attest.metrics.index";

const METRIC_KEY_PREFIX: &str = "metric:";

/// Counter/histogram sink.
pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &str, value: f64);

    fn observe_histogram(&self, name: &str, value: f64);
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, f64>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> f64 {
        self.counters.lock().get(name).copied().unwrap_or(0.0)
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.histograms.lock().get(name).cloned().unwrap_or_default()
    }

    /// Snapshot of all counters, sorted by name.
    pub fn counters(&self) -> BTreeMap<String, f64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn inc_counter(&self, name: &str, value: f64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0.0) += value;
    }

    fn observe_histogram(&self, name: &str, value: f64) {
        self.histograms
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: f64) {}

    fn observe_histogram(&self, _name: &str, _value: f64) {}
}

/// One persisted observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Export format for [`MetricHistory::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(EngineError::malformed(format!(
                "unknown export format '{}', expected json or csv",
                other
            ))),
        }
    }
}

/// Metric time series stored in a key-value store.
///
/// Clones share one write lock; appends to a series and to the index are
/// read-modify-write and must not interleave.
#[derive(Clone)]
pub struct MetricHistory {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl MetricHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn key(name: &str) -> String {
        format!("{}{}", METRIC_KEY_PREFIX, name)
    }

    fn read_json<T: for<'de> Deserialize<'de> + Default>(&self, key: &str) -> EngineResult<T> {
        match self.store.get(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw).map_err(StorageError::from)?),
            None => Ok(T::default()),
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        let raw = serde_json::to_string(value).map_err(StorageError::from)?;
        self.store.set(key, raw)?;
        Ok(())
    }

    /// Append a sample and register the metric name in the index.
    pub fn record(&self, name: &str, value: f64, timestamp_ms: i64) -> EngineResult<()> {
        if name.trim().is_empty() {
            return Err(EngineError::malformed("metric name must not be empty"));
        }
        if !value.is_finite() {
            return Err(EngineError::malformed(format!(
                "metric '{}' value must be finite",
                name
            )));
        }

        let _guard = self.write_lock.lock();
        let key = Self::key(name);
        let mut samples: Vec<MetricSample> = self.read_json(&key)?;
        samples.push(MetricSample {
            name: name.to_string(),
            value,
            timestamp_ms,
        });
        self.write_json(&key, &samples)?;

        let mut index: Vec<String> = self.read_json(METRICS_INDEX_KEY)?;
        if !index.iter().any(|m| m == name) {
            index.push(name.to_string());
            self.write_json(METRICS_INDEX_KEY, &index)?;
        }
        Ok(())
    }

    /// Samples of one metric in recording order; empty when never recorded.
    pub fn history(&self, name: &str) -> EngineResult<Vec<MetricSample>> {
        self.read_json(&Self::key(name))
    }

    /// Metric names in first-recorded order.
    pub fn list(&self) -> EngineResult<Vec<String>> {
        self.read_json(METRICS_INDEX_KEY)
    }

    pub fn export(&self, format: ExportFormat) -> EngineResult<String> {
        let mut all = Vec::new();
        for name in self.list()? {
            all.extend(self.history(&name)?);
        }
        match format {
            ExportFormat::Json => Ok(serde_json::to_string(&all)?),
            ExportFormat::Csv => {
                let mut out = String::from("name,value,timestamp_ms\n");
                for sample in &all {
                    out.push_str(&format!(
                        "{},{},{}\n",
                        csv_field(&sample.name),
                        sample.value,
                        sample.timestamp_ms
                    ));
                }
                Ok(out)
            }
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::{ErrorCode, InMemoryStore};

    fn history() -> (Arc<InMemoryStore>, MetricHistory) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), MetricHistory::new(store))
    }

    #[test]
    fn test_in_memory_metrics_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.inc_counter("runs", 1.0);
        metrics.inc_counter("runs", 2.0);
        metrics.observe_histogram("latency_ms", 0.5);
        assert_eq!(metrics.counter_value("runs"), 3.0);
        assert_eq!(metrics.counter_value("missing"), 0.0);
        assert_eq!(metrics.histogram_values("latency_ms"), vec![0.5]);
    }

    #[test]
    fn test_record_appends_and_indexes_once() {
        let (store, history) = history();
        history.record("quality", 0.5, 1).unwrap();
        history.record("quality", 0.7, 2).unwrap();
        history.record("latency", 12.0, 3).unwrap();

        let samples = history.history("quality").unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].value, 0.7);
        assert_eq!(history.list().unwrap(), vec!["quality", "latency"]);
        assert_eq!(
            store.keys().unwrap(),
            vec!["attest.metrics.index", "metric:latency", "metric:quality"]
        );
    }

    #[test]
    fn test_unknown_metric_has_empty_history() {
        let (_, history) = history();
        assert!(history.history("nope").unwrap().is_empty());
        assert!(history.list().unwrap().is_empty());
    }

    #[test]
    fn test_export_formats() {
        let (_, history) = history();
        history.record("a", 1.5, 10).unwrap();
        history.record("b,c", 2.0, 20).unwrap();

        let csv = history.export(ExportFormat::Csv).unwrap();
        assert_eq!(csv, "name,value,timestamp_ms\na,1.5,10\n\"b,c\",2,20\n");

        let json: Vec<MetricSample> =
            serde_json::from_str(&history.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json.len(), 2);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
    }

    #[test]
    fn test_corrupt_history_is_persistence_error() {
        let (store, history) = history();
        store.set("metric:broken", "{not json".to_string()).unwrap();
        let err = history.history("broken").unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);
    }

    #[test]
    fn test_concurrent_records_are_all_kept() {
        let (_, history) = history();
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        history.record("lat", i as f64, w * 100 + i).unwrap();
                        history.record(&format!("worker-{}", w), 1.0, i).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(history.history("lat").unwrap().len(), 400);
        let names = history.list().unwrap();
        assert_eq!(names.len(), 9);
        assert!(names.contains(&"worker-7".to_string()));
    }

    #[test]
    fn test_rejects_bad_samples() {
        let (_, history) = history();
        assert!(history.record("", 1.0, 0).is_err());
        assert!(history.record("x", f64::NAN, 0).is_err());
    }
}
