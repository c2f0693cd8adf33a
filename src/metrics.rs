//! Prometheus metrics for the bridge attestation service
//!
//! Exposed on `/metrics` for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::store::StoreStats;
use crate::types::ChainId;

lazy_static! {
    // Source chain observation
    pub static ref BURNS_OBSERVED: CounterVec = register_counter_vec!(
        "bridge_burns_observed_total",
        "Total number of burn events observed",
        &["chain"]
    ).unwrap();

    pub static ref LAST_PROCESSED_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_last_processed_block",
        "Latest source block scanned for burn events",
        &["chain"]
    ).unwrap();

    // Watchtower signatures
    pub static ref SIGNATURES_ACCEPTED: CounterVec = register_counter_vec!(
        "bridge_signatures_accepted_total",
        "Watchtower signatures verified and recorded",
        &["watchtower"]
    ).unwrap();

    pub static ref SIGNATURES_REJECTED: CounterVec = register_counter_vec!(
        "bridge_signatures_rejected_total",
        "Watchtower signatures rejected at verification",
        &["watchtower", "type"]
    ).unwrap();

    // Attestation lifecycle
    pub static ref ATTESTATIONS_READY: CounterVec = register_counter_vec!(
        "bridge_attestations_ready_total",
        "Attestations that reached the signature threshold",
        &["chain"]
    ).unwrap();

    pub static ref ATTESTATIONS_RELAYED: CounterVec = register_counter_vec!(
        "bridge_attestations_relayed_total",
        "Attestations whose mint was confirmed on the destination chain",
        &["dest_chain"]
    ).unwrap();

    pub static ref ATTESTATIONS_FAILED: CounterVec = register_counter_vec!(
        "bridge_attestations_failed_total",
        "Attestations moved to failed",
        &["reason"]
    ).unwrap();

    pub static ref BACKLOG: GaugeVec = register_gauge_vec!(
        "bridge_attestation_backlog",
        "Attestations by status (stuck = pending past the stuck threshold)",
        &["status"]
    ).unwrap();

    // Relaying
    pub static ref RELAY_ATTEMPTS: CounterVec = register_counter_vec!(
        "bridge_relay_attempts_total",
        "Mint submissions made by the relayer",
        &["dest_chain", "outcome"]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_relay_latency_seconds",
        "Time from ready to relayed",
        &["dest_chain"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    pub static ref RELAY_ALERTS: CounterVec = register_counter_vec!(
        "bridge_relay_alerts_total",
        "Attestations that exhausted the relay retry budget",
        &["dest_chain"]
    ).unwrap();

    // Errors
    pub static ref INTEGRITY_VIOLATIONS: CounterVec = register_counter_vec!(
        "bridge_integrity_violations_total",
        "Invalid status transitions and payload mismatches",
        &["type"]
    ).unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "bridge_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "bridge_up",
        "Whether the attestation service is up and running"
    ).unwrap();
}

pub fn record_burn_observed(chain: ChainId) {
    BURNS_OBSERVED.with_label_values(&[chain.name()]).inc();
}

pub fn record_block_processed(chain: ChainId, block_number: u64) {
    LAST_PROCESSED_BLOCK
        .with_label_values(&[chain.name()])
        .set(block_number as f64);
}

pub fn record_signature_accepted(watchtower: &str) {
    SIGNATURES_ACCEPTED.with_label_values(&[watchtower]).inc();
}

pub fn record_signature_rejected(watchtower: &str, error_type: &str) {
    SIGNATURES_REJECTED
        .with_label_values(&[watchtower, error_type])
        .inc();
}

pub fn record_attestation_ready(chain: ChainId) {
    ATTESTATIONS_READY.with_label_values(&[chain.name()]).inc();
}

/// Record a confirmed mint and the ready-to-relayed latency
pub fn record_attestation_relayed(dest_chain: ChainId, latency_seconds: Option<f64>) {
    ATTESTATIONS_RELAYED.with_label_values(&[dest_chain.name()]).inc();
    if let Some(seconds) = latency_seconds {
        RELAY_LATENCY
            .with_label_values(&[dest_chain.name()])
            .observe(seconds);
    }
}

pub fn record_attestation_failed(reason: &str) {
    ATTESTATIONS_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_relay_attempt(dest_chain: ChainId, outcome: &str) {
    RELAY_ATTEMPTS
        .with_label_values(&[dest_chain.name(), outcome])
        .inc();
}

pub fn record_relay_alert(dest_chain: ChainId) {
    RELAY_ALERTS.with_label_values(&[dest_chain.name()]).inc();
}

pub fn record_integrity_violation(violation: &str) {
    INTEGRITY_VIOLATIONS.with_label_values(&[violation]).inc();
}

pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}

/// Update backlog gauges from a stats snapshot
pub fn set_backlog(stats: &StoreStats) {
    BACKLOG.with_label_values(&["pending"]).set(stats.pending as f64);
    BACKLOG.with_label_values(&["ready"]).set(stats.ready as f64);
    BACKLOG.with_label_values(&["stuck"]).set(stats.stuck as f64);
    BACKLOG.with_label_values(&["failed"]).set(stats.failed as f64);
}
