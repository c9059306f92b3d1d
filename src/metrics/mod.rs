//! Metrics for Modbridge
//!
//! Recorded through the `metrics` facade:
//! - Bus read counts and latency histograms
//! - Error counts by type
//! - Device connection state
//! - Write delivery counts

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::store::ConnectionState;

/// Metrics for one bus read request
pub struct ReadMetrics {
    start: Instant,
    device_id: String,
}

impl ReadMetrics {
    /// Start timing a bus read
    pub fn start(device_id: &str) -> Self {
        Self {
            start: Instant::now(),
            device_id: device_id.to_string(),
        }
    }

    /// Record successful read
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "modbridge_bus_reads_total",
            "device" => self.device_id.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "modbridge_read_duration_seconds",
            "device" => self.device_id
        )
        .record(duration);
    }

    /// Record failed read
    pub fn failure(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "modbridge_bus_reads_total",
            "device" => self.device_id.clone(),
            "status" => "error"
        )
        .increment(1);

        counter!(
            "modbridge_errors_total",
            "device" => self.device_id.clone(),
            "type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            "modbridge_read_duration_seconds",
            "device" => self.device_id
        )
        .record(duration);
    }
}

/// Record device connection state
pub fn record_device_state(device_id: &str, state: ConnectionState) {
    gauge!(
        "modbridge_device_connected",
        "device" => device_id.to_string()
    )
    .set(if state == ConnectionState::Connected {
        1.0
    } else {
        0.0
    });
}

/// Record a write delivery attempt
pub fn record_write(device_id: &str, success: bool) {
    counter!(
        "modbridge_writes_total",
        "device" => device_id.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record poll cycle timing
pub fn record_poll_cycle(device_id: &str, duration_ms: u64) {
    histogram!(
        "modbridge_poll_cycle_seconds",
        "device" => device_id.to_string()
    )
    .record(duration_ms as f64 / 1000.0);
}
