//! Metrics sink abstraction.
//!
//! A trait rather than direct calls into the `metrics` crate's global
//! recorder, so tests can assert on counts without standing up a Prometheus
//! exporter — the same collaborator-seam the design document calls for.

use std::sync::Arc;

/// Counters and histograms the ingestion/reducer path emits. Each method
/// corresponds to one named metric; implementations decide how (or whether)
/// to export it.
pub trait Metrics: Send + Sync {
    fn incr_tokens_issued(&self, site_id: &str);
    fn incr_tokens_revoked(&self, site_id: &str);
    fn incr_shuffle_admitted(&self, site_id: &str);
    fn incr_shuffle_rejected(&self, site_id: &str, reason: &str);
    fn incr_reports_collected(&self, site_id: &str, plan: &str);
    fn incr_reports_dropped(&self, site_id: &str, reason: &str);
    fn incr_buckets_skipped(&self, reason: &str);
    fn incr_buckets_published(&self, site_id: &str, plan: &str);
    fn observe_shuffle_hold_seconds(&self, seconds: f64);
    fn observe_reducer_run_seconds(&self, seconds: f64);
}

/// Wraps the global `metrics` crate recorder — install a
/// [`metrics_exporter_prometheus`] recorder at startup and this simply
/// forwards into it, matching the one-recorder-per-process convention that
/// crate expects.
pub struct PrometheusMetrics;

impl Metrics for PrometheusMetrics {
    fn incr_tokens_issued(&self, site_id: &str) {
        metrics::counter!("privhouse_tokens_issued_total", "site_id" => site_id.to_string())
            .increment(1);
    }

    fn incr_tokens_revoked(&self, site_id: &str) {
        metrics::counter!("privhouse_tokens_revoked_total", "site_id" => site_id.to_string())
            .increment(1);
    }

    fn incr_shuffle_admitted(&self, site_id: &str) {
        metrics::counter!("privhouse_shuffle_admitted_total", "site_id" => site_id.to_string())
            .increment(1);
    }

    fn incr_shuffle_rejected(&self, site_id: &str, reason: &str) {
        metrics::counter!(
            "privhouse_shuffle_rejected_total",
            "site_id" => site_id.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    fn incr_reports_collected(&self, site_id: &str, plan: &str) {
        metrics::counter!(
            "privhouse_reports_collected_total",
            "site_id" => site_id.to_string(),
            "plan" => plan.to_string()
        )
        .increment(1);
    }

    fn incr_reports_dropped(&self, site_id: &str, reason: &str) {
        metrics::counter!(
            "privhouse_reports_dropped_total",
            "site_id" => site_id.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    fn incr_buckets_skipped(&self, reason: &str) {
        metrics::counter!("privhouse_buckets_skipped_total", "reason" => reason.to_string())
            .increment(1);
    }

    fn incr_buckets_published(&self, site_id: &str, plan: &str) {
        metrics::counter!(
            "privhouse_buckets_published_total",
            "site_id" => site_id.to_string(),
            "plan" => plan.to_string()
        )
        .increment(1);
    }

    fn observe_shuffle_hold_seconds(&self, seconds: f64) {
        metrics::histogram!("privhouse_shuffle_hold_seconds").record(seconds);
    }

    fn observe_reducer_run_seconds(&self, seconds: f64) {
        metrics::histogram!("privhouse_reducer_run_seconds").record(seconds);
    }
}

/// Discards everything. Used by tests and by `reducer_once`/`issue_token`
/// CLI binaries that don't run an exporter.
#[derive(Default)]
pub struct NullMetrics;

impl Metrics for NullMetrics {
    fn incr_tokens_issued(&self, _site_id: &str) {}
    fn incr_tokens_revoked(&self, _site_id: &str) {}
    fn incr_shuffle_admitted(&self, _site_id: &str) {}
    fn incr_shuffle_rejected(&self, _site_id: &str, _reason: &str) {}
    fn incr_reports_collected(&self, _site_id: &str, _plan: &str) {}
    fn incr_reports_dropped(&self, _site_id: &str, _reason: &str) {}
    fn incr_buckets_skipped(&self, _reason: &str) {}
    fn incr_buckets_published(&self, _site_id: &str, _plan: &str) {}
    fn observe_shuffle_hold_seconds(&self, _seconds: f64) {}
    fn observe_reducer_run_seconds(&self, _seconds: f64) {}
}

/// Installs the Prometheus recorder and returns a handle that serves the
/// `/metrics` text exposition format, mirroring how `tinyzkp_api` wires its
/// own process-wide recorder at startup.
pub fn install_prometheus() -> anyhow::Result<Arc<dyn Metrics>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;
    Ok(Arc::new(PrometheusMetrics))
}
