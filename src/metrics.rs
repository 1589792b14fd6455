//! Prometheus metrics collection for dynfw.
//!
//! Tracks block/unblock throughput, expiry sweeps, reconciliation
//! discrepancies, detector triggers, and API auth failures. Served on the
//! API router's `/metrics` endpoint.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Total block intents successfully applied.
pub static BLOCKS_APPLIED: OnceLock<IntCounter> = OnceLock::new();

/// Total unblock operations completed.
pub static UNBLOCKS: OnceLock<IntCounter> = OnceLock::new();

/// Total expired intents removed by sweeps.
pub static SWEEP_REMOVED: OnceLock<IntCounter> = OnceLock::new();

/// Total reconciliation discrepancies (store and backend disagreed).
pub static DISCREPANCIES: OnceLock<IntCounter> = OnceLock::new();

/// Total blocks issued by the threshold detector.
pub static DETECTOR_TRIGGERS: OnceLock<IntCounter> = OnceLock::new();

/// Total rejected API requests (bad or missing token).
pub static AUTH_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Engine errors by error code.
pub static ENGINE_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(BLOCKS_APPLIED, IntCounter::new("dynfw_blocks_applied_total", "Block intents applied"));
    register!(UNBLOCKS, IntCounter::new("dynfw_unblocks_total", "Unblock operations completed"));
    register!(SWEEP_REMOVED, IntCounter::new("dynfw_sweep_removed_total", "Expired intents removed by sweeps"));
    register!(DISCREPANCIES, IntCounter::new("dynfw_discrepancies_total", "Reconciliation discrepancies observed"));
    register!(DETECTOR_TRIGGERS, IntCounter::new("dynfw_detector_triggers_total", "Blocks issued by the threshold detector"));
    register!(AUTH_FAILURES, IntCounter::new("dynfw_auth_failures_total", "Rejected API requests"));
    register!(ENGINE_ERRORS, IntCounterVec::new(Opts::new("dynfw_engine_errors_total", "Engine errors by code"), &["error"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// Bump a counter if metrics are initialized.
#[inline]
pub fn inc(metric: &OnceLock<IntCounter>) {
    if let Some(c) = metric.get() {
        c.inc();
    }
}

/// Add to a counter if metrics are initialized.
#[inline]
pub fn add(metric: &OnceLock<IntCounter>, n: u64) {
    if let Some(c) = metric.get() {
        c.inc_by(n);
    }
}

/// Record an engine error by its metric code.
#[inline]
pub fn record_engine_error(code: &str) {
    if let Some(c) = ENGINE_ERRORS.get() {
        c.with_label_values(&[code]).inc();
    }
}
