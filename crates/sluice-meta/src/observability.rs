//! Metrics for the metadata layer
//!
//! Lightweight counters and histograms through the `metrics` facade. With the
//! `metrics` feature disabled every call compiles to nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sluice_meta::observability::{init_metrics, MetadataMetrics};
//!
//! init_metrics();
//! MetadataMetrics::record_cascade("update", EntityKind::Pipeline, Duration::from_millis(3), true);
//! MetadataMetrics::increment_version_conflicts(EntityKind::Pipeline);
//! ```
//!
//! The host process installs the recorder (e.g. a Prometheus exporter).

use crate::entity::EntityKind;
use std::sync::OnceLock;
use std::time::Duration;

/// Metadata layer metrics
pub struct MetadataMetrics;

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
impl MetadataMetrics {
    // ---- Cascade writes ----

    /// Record one cascade write and its outcome
    pub fn record_cascade(op: &'static str, kind: EntityKind, duration: Duration, ok: bool) {
        #[cfg(feature = "metrics")]
        {
            metrics::histogram!("sluice_meta_cascade_latency_seconds", "op" => op, "kind" => kind.as_str())
                .record(duration.as_secs_f64());
            let outcome = if ok { "ok" } else { "error" };
            metrics::counter!("sluice_meta_cascade_total", "op" => op, "kind" => kind.as_str(), "outcome" => outcome)
                .increment(1);
        }
    }

    /// A compare-and-swap update lost its race
    pub fn increment_version_conflicts(kind: EntityKind) {
        #[cfg(feature = "metrics")]
        metrics::counter!("sluice_meta_version_conflicts_total", "kind" => kind.as_str()).increment(1);
    }

    // ---- Reconciliation ----

    pub fn record_refresh_all(kind: EntityKind, deleted: usize, updated: usize, duration: Duration) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("sluice_meta_refresh_deleted_total", "kind" => kind.as_str())
                .increment(deleted as u64);
            metrics::counter!("sluice_meta_refresh_updated_total", "kind" => kind.as_str())
                .increment(updated as u64);
            metrics::histogram!("sluice_meta_refresh_all_seconds", "kind" => kind.as_str())
                .record(duration.as_secs_f64());
        }
    }

    pub fn increment_refresh_one(kind: EntityKind) {
        #[cfg(feature = "metrics")]
        metrics::counter!("sluice_meta_refresh_one_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn increment_refresh_failures(kind: EntityKind) {
        #[cfg(feature = "metrics")]
        metrics::counter!("sluice_meta_refresh_failures_total", "kind" => kind.as_str()).increment(1);
    }

    /// A record in the local store could not be decoded and was skipped
    pub fn increment_corrupt_records(kind: EntityKind) {
        #[cfg(feature = "metrics")]
        metrics::counter!("sluice_meta_corrupt_records_total", "kind" => kind.as_str()).increment(1);
    }

    // ---- Progress ----

    pub fn increment_position_saves() {
        #[cfg(feature = "metrics")]
        metrics::counter!("sluice_meta_position_saves_total").increment(1);
    }
}

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem
///
/// Safe to call multiple times.
pub fn init_metrics() {
    METRICS_INITIALIZED.get_or_init(|| {
        tracing::info!(
            enabled = cfg!(feature = "metrics"),
            "Metrics subsystem initialized"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_calls_without_recorder() {
        init_metrics();
        init_metrics();
        MetadataMetrics::record_cascade("insert", EntityKind::Source, Duration::from_millis(2), true);
        MetadataMetrics::increment_version_conflicts(EntityKind::Pipeline);
        MetadataMetrics::record_refresh_all(EntityKind::Endpoint, 1, 2, Duration::from_millis(5));
        MetadataMetrics::increment_corrupt_records(EntityKind::Pipeline);
        MetadataMetrics::increment_position_saves();
    }
}
