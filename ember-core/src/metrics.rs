// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics for the lifecycle orchestrator.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref COLD_STARTS: IntCounterVec = register_int_counter_vec!(
        "ember_cold_starts_total",
        "Total number of cold starts that produced a ready instance",
        &["function_id"]
    )
    .unwrap();
    pub static ref WARM_STARTS: IntCounterVec = register_int_counter_vec!(
        "ember_warm_starts_total",
        "Total number of requests served by an existing instance",
        &["function_id", "kind"]
    )
    .unwrap();
    pub static ref ROLLBACKS: IntCounterVec = register_int_counter_vec!(
        "ember_rollbacks_total",
        "Total number of cold starts rolled back",
        &["function_id"]
    )
    .unwrap();
    pub static ref DESTROYS: IntCounter = register_int_counter!(
        "ember_destroys_total",
        "Total number of instances destroyed"
    )
    .unwrap();
    pub static ref ALLOCATED_PORTS: IntGauge = register_int_gauge!(
        "ember_allocated_ports",
        "Host NAT ports currently held by instances"
    )
    .unwrap();
    pub static ref ENSURE_DURATION: HistogramVec = register_histogram_vec!(
        "ember_ensure_duration_seconds",
        "Time taken to hand out an instance",
        &["path"],
        vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();
}

/// Warm start served by resuming a paused task.
pub const WARM_RESUMED: &str = "resumed";
/// Warm start served by an already running task.
pub const WARM_RUNNING: &str = "running";

/// Force registration so every series shows up before first use.
pub fn init() {
    lazy_static::initialize(&COLD_STARTS);
    lazy_static::initialize(&WARM_STARTS);
    lazy_static::initialize(&ROLLBACKS);
    lazy_static::initialize(&DESTROYS);
    lazy_static::initialize(&ALLOCATED_PORTS);
    lazy_static::initialize(&ENSURE_DURATION);
}

/// Render the default registry in the text exposition format.
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}
