//! Prometheus metrics for the node label controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `node_label_controller_reconcile_duration_seconds` (histogram): time spent per reconcile.
//! - `node_label_controller_reconcile_errors_total` (counter): reconcile errors labeled by kind.
//! - `node_label_controller_patches_total` (counter): node patches sent, labeled by kind.
//! - `node_label_controller_queue_depth` (gauge): keys waiting in the work queue.
//! - `node_label_controller_requeues_total` (counter): keys re-queued with backoff.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category, e.g. "kube", "serialization"
    pub kind: String,
}

/// Labels for patch metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PatchLabels {
    /// "labels" or "taints"
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 1ms .. ~32s across 16 buckets.
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking patches sent to the API server
pub static PATCHES_TOTAL: Lazy<Family<PatchLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of queued keys
pub static QUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Counter tracking rate-limited requeues
pub static REQUEUES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

/// Global metrics registry
///
/// Counter names are registered without `_total`; the encoder appends it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "node_label_controller_reconcile_duration_seconds",
        "Duration of node reconciles in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "node_label_controller_reconcile_errors",
        "Total number of node reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "node_label_controller_patches",
        "Total number of node patches sent",
        PATCHES_TOTAL.clone(),
    );
    registry.register(
        "node_label_controller_queue_depth",
        "Number of node keys waiting in the work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "node_label_controller_requeues",
        "Total number of node keys re-queued with backoff",
        REQUEUES_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(seconds: f64) {
    RECONCILE_DURATION_SECONDS.observe(seconds);
}

pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_patch(kind: &str) {
    PATCHES_TOTAL
        .get_or_create(&PatchLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn inc_requeue() {
    REQUEUES_TOTAL.inc();
}
