//! Process-wide metrics collector
//!
//! Counters live in a prometheus registry and are labeled by pipeline id only,
//! never by pipeline instance. A hot swap hands the new instance the same
//! counters, so a series continues across reloads instead of restarting at 0.
//!
//! Snapshots are addressed by slash-separated paths:
//!
//! - `stats/events/{in,filtered,out}`: sums over every pipeline
//! - `stats/pipelines/<id>/events/{in,filtered,out}`
//! - `stats/pipelines/<id>/reloads/{successes,failures}`

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

const PIPELINE_LABEL: &str = "pipeline";

/// Metrics sink shared by the agent and every pipeline it runs
pub struct MetricsCollector {
    registry: Registry,
    events_in: IntCounterVec,
    events_filtered: IntCounterVec,
    events_out: IntCounterVec,
    reload_successes: IntCounterVec,
    reload_failures: IntCounterVec,
    pipelines: RwLock<BTreeSet<String>>,
}

impl MetricsCollector {
    /// Create a collector with its own prometheus registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registering its counters in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let events_in = counter_vec(&registry, "sluice_events_in_total", "Events received from inputs")?;
        let events_filtered = counter_vec(
            &registry,
            "sluice_events_filtered_total",
            "Events kept by the filter stage",
        )?;
        let events_out = counter_vec(&registry, "sluice_events_out_total", "Events written by outputs")?;
        let reload_successes = counter_vec(
            &registry,
            "sluice_reload_successes_total",
            "Successful pipeline reloads",
        )?;
        let reload_failures = counter_vec(
            &registry,
            "sluice_reload_failures_total",
            "Failed pipeline reloads",
        )?;

        Ok(Self {
            registry,
            events_in,
            events_filtered,
            events_out,
            reload_successes,
            reload_failures,
            pipelines: RwLock::new(BTreeSet::new()),
        })
    }

    /// Counter handles for one pipeline id
    pub fn pipeline(&self, id: &str) -> PipelineMetrics {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());

        PipelineMetrics {
            events_in: self.events_in.with_label_values(&[id]),
            events_filtered: self.events_filtered.with_label_values(&[id]),
            events_out: self.events_out.with_label_values(&[id]),
            reload_successes: self.reload_successes.with_label_values(&[id]),
            reload_failures: self.reload_failures.with_label_values(&[id]),
        }
    }

    /// Current value of every counter
    pub fn snapshot(&self) -> MetricSnapshot {
        let ids: Vec<String> = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let mut values = BTreeMap::new();
        let mut totals = [0u64; 3];

        for id in &ids {
            let handles = self.pipeline(id);
            let events = [
                ("in", handles.events_in.get()),
                ("filtered", handles.events_filtered.get()),
                ("out", handles.events_out.get()),
            ];
            for (slot, (name, value)) in events.iter().enumerate() {
                totals[slot] += value;
                values.insert(format!("stats/pipelines/{}/events/{}", id, name), *value);
            }
            values.insert(
                format!("stats/pipelines/{}/reloads/successes", id),
                handles.reload_successes.get(),
            );
            values.insert(
                format!("stats/pipelines/{}/reloads/failures", id),
                handles.reload_failures.get(),
            );
        }

        values.insert("stats/events/in".to_string(), totals[0]);
        values.insert("stats/events/filtered".to_string(), totals[1]);
        values.insert("stats/events/out".to_string(), totals[2]);

        MetricSnapshot {
            taken_at: Utc::now(),
            values,
        }
    }

    /// Render every metric in the prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// The underlying registry, for callers exposing their own metrics
    /// alongside the pipeline counters
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[PIPELINE_LABEL])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counters of a single pipeline id
#[derive(Clone)]
pub struct PipelineMetrics {
    events_in: IntCounter,
    events_filtered: IntCounter,
    events_out: IntCounter,
    reload_successes: IntCounter,
    reload_failures: IntCounter,
}

impl PipelineMetrics {
    pub fn record_in(&self, count: u64) {
        self.events_in.inc_by(count);
    }

    pub fn record_filtered(&self, count: u64) {
        self.events_filtered.inc_by(count);
    }

    pub fn record_out(&self, count: u64) {
        self.events_out.inc_by(count);
    }

    pub fn record_reload_success(&self) {
        self.reload_successes.inc();
    }

    pub fn record_reload_failure(&self) {
        self.reload_failures.inc();
    }
}

/// Point-in-time copy of the collector's counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub taken_at: DateTime<Utc>,
    pub values: BTreeMap<String, u64>,
}

impl MetricSnapshot {
    /// Value at a path such as `stats/pipelines/main/events/out`
    pub fn get(&self, path: &str) -> Option<u64> {
        self.values.get(path).copied()
    }

    /// Value at a path, 0 when the path is unknown
    pub fn value(&self, path: &str) -> u64 {
        self.get(path).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_has_totals() {
        let collector = MetricsCollector::new().unwrap();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get("stats/events/in"), Some(0));
        assert_eq!(snapshot.get("stats/events/out"), Some(0));
        assert_eq!(snapshot.get("stats/pipelines/main/events/in"), None);
    }

    #[test]
    fn test_counters_are_keyed_by_pipeline_id() {
        let collector = MetricsCollector::new().unwrap();
        let first = collector.pipeline("main");
        first.record_in(10);
        first.record_filtered(8);
        first.record_out(8);

        // A second handle for the same id continues the same series
        let second = collector.pipeline("main");
        second.record_in(5);
        second.record_reload_success();

        collector.pipeline("other").record_in(1);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.value("stats/pipelines/main/events/in"), 15);
        assert_eq!(snapshot.value("stats/pipelines/main/events/filtered"), 8);
        assert_eq!(snapshot.value("stats/pipelines/main/reloads/successes"), 1);
        assert_eq!(snapshot.value("stats/pipelines/main/reloads/failures"), 0);
        assert_eq!(snapshot.value("stats/pipelines/other/events/in"), 1);
        assert_eq!(snapshot.value("stats/events/in"), 16);
        assert_eq!(snapshot.value("stats/events/out"), 8);
    }

    #[test]
    fn test_encode_text() {
        let collector = MetricsCollector::new().unwrap();
        collector.pipeline("main").record_out(3);
        let text = collector.encode_text().unwrap();
        assert!(text.contains("sluice_events_out_total{pipeline=\"main\"} 3"));
    }

    #[test]
    fn test_shared_registry_rejects_duplicate_collectors() {
        let registry = Registry::new();
        assert!(MetricsCollector::with_registry(registry.clone()).is_ok());
        assert!(MetricsCollector::with_registry(registry).is_err());
    }

    #[test]
    fn test_extra_metrics_share_the_registry() {
        let collector = MetricsCollector::new().unwrap();
        let restarts = IntCounter::new("sluice_host_restarts_total", "Host restarts").unwrap();
        collector
            .registry()
            .register(Box::new(restarts.clone()))
            .unwrap();
        restarts.inc();

        assert!(collector
            .encode_text()
            .unwrap()
            .contains("sluice_host_restarts_total 1"));
    }
}
