//! Prometheus metrics for the coordinator.
//!
//! Metrics cover:
//! - Pipeline requests (count and latency per kind/operation/outcome)
//! - Allocator claims and frees per namespace
//! - Quota rejections
//! - Compensation actions executed during unwinds
//! - Notification delivery
//! - Retry attempts of bounded sub-operations
//! - Coordination session health
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "cfgtxn" prefix to
//! avoid name collisions with other libraries using the default Prometheus
//! registry. If a metric fails to register, an unregistered fallback is used
//! instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for coordinator metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("cfgtxn".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Pipeline metrics
// =============================================================================

define_counter_vec!(
    PIPELINE_REQUESTS,
    "pipeline_requests_total",
    "Total number of lifecycle requests by kind, operation and outcome",
    ["kind", "op", "outcome"]
);
define_histogram_vec!(
    PIPELINE_DURATION,
    "pipeline_duration_seconds",
    "Lifecycle request duration in seconds",
    ["kind", "op"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
);

// =============================================================================
// Allocator and quota metrics
// =============================================================================

define_counter_vec!(
    ALLOCATIONS,
    "allocations_total",
    "Allocator claims by namespace family and outcome",
    ["namespace", "outcome"]
);
define_counter_vec!(
    FREES,
    "frees_total",
    "Allocator frees by namespace family and outcome",
    ["namespace", "outcome"]
);
define_counter_vec!(
    QUOTA_REJECTIONS,
    "quota_rejections_total",
    "Quota reservations rejected by kind",
    ["kind"]
);

// =============================================================================
// Compensation, notification and retry metrics
// =============================================================================

define_counter_vec!(
    COMPENSATIONS,
    "compensations_total",
    "Compensation actions executed during unwinds",
    ["action", "outcome"]
);
define_counter_vec!(
    NOTIFICATIONS,
    "notifications_total",
    "Notification hook invocations by outcome",
    ["outcome"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retries of bounded sub-operations by policy",
    ["policy"]
);

// =============================================================================
// Session metrics
// =============================================================================

define_gauge!(
    SESSION_DEGRADED,
    "session_degraded",
    "Whether the coordination session is lost (1=degraded, 0=healthy)"
);
define_counter_vec!(
    SESSION_TRANSITIONS,
    "session_transitions_total",
    "Coordination session health transitions",
    ["direction"]
);

// =============================================================================
// Safe Registration Helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*PIPELINE_REQUESTS;
    let _ = &*PIPELINE_DURATION;
    let _ = &*ALLOCATIONS;
    let _ = &*FREES;
    let _ = &*QUOTA_REJECTIONS;
    let _ = &*COMPENSATIONS;
    let _ = &*NOTIFICATIONS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*SESSION_DEGRADED;
    let _ = &*SESSION_TRANSITIONS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Namespace family used as a label: per-router scopes collapse into one series.
fn namespace_label(namespace: &str) -> &str {
    namespace
        .split_once(crate::constants::NAMESPACE_SCOPE_SEPARATOR)
        .map(|(family, _)| family)
        .unwrap_or(namespace)
}

/// Record a finished pipeline request.
pub fn record_request(kind: &str, op: &str, outcome: &str, duration_secs: f64) {
    PIPELINE_REQUESTS
        .with_label_values(&[kind, op, outcome])
        .inc();
    PIPELINE_DURATION
        .with_label_values(&[kind, op])
        .observe(duration_secs);
}

/// Record an allocator claim. `outcome` is claimed/existing/conflict/exhausted/error.
pub fn record_allocation(namespace: &str, outcome: &str) {
    ALLOCATIONS
        .with_label_values(&[namespace_label(namespace), outcome])
        .inc();
}

/// Record an allocator free. `outcome` is released/already_free/owned_by_other.
pub fn record_free(namespace: &str, outcome: &str) {
    FREES
        .with_label_values(&[namespace_label(namespace), outcome])
        .inc();
}

pub fn record_quota_rejection(kind: &str) {
    QUOTA_REJECTIONS.with_label_values(&[kind]).inc();
}

pub fn record_compensation(action: &str, success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    COMPENSATIONS.with_label_values(&[action, outcome]).inc();
}

pub fn record_notification(success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    NOTIFICATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_retry(policy: &str) {
    RETRY_ATTEMPTS.with_label_values(&[policy]).inc();
}

/// Record the coordination session becoming unusable.
pub fn enter_degraded_mode() {
    SESSION_DEGRADED.set(1);
    SESSION_TRANSITIONS.with_label_values(&["enter"]).inc();
}

/// Record the coordination session recovering.
pub fn exit_degraded_mode() {
    SESSION_DEGRADED.set(0);
    SESSION_TRANSITIONS.with_label_values(&["exit"]).inc();
}
