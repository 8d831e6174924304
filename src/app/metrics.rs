//! Prometheus metrics
//!
//! Global registry plus the `Counter` bridge relays use for byte
//! accounting.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::common::Counter;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total sessions dispatched
    pub static ref SESSIONS_TOTAL: IntCounter = IntCounter::new(
        "nexum_sessions_total",
        "Total number of sessions dispatched"
    ).unwrap();

    /// Currently active sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "nexum_sessions_active",
        "Number of currently active sessions"
    ).unwrap();

    /// Sessions that failed to dispatch
    pub static ref SESSIONS_FAILED: IntCounter = IntCounter::new(
        "nexum_sessions_failed",
        "Total number of failed sessions"
    ).unwrap();

    /// Bytes client -> outbound, per outbound tag
    pub static ref BYTES_UPLINK: IntCounterVec = IntCounterVec::new(
        Opts::new("nexum_bytes_uplink_total", "Bytes relayed client to outbound"),
        &["outbound"]
    ).unwrap();

    /// Bytes outbound -> client, per outbound tag
    pub static ref BYTES_DOWNLINK: IntCounterVec = IntCounterVec::new(
        Opts::new("nexum_bytes_downlink_total", "Bytes relayed outbound to client"),
        &["outbound"]
    ).unwrap();

    /// Bytes written to dialed connections, per outbound tag
    pub static ref OUTBOUND_BYTES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("nexum_outbound_bytes_sent_total", "Bytes sent on dialed connections"),
        &["outbound"]
    ).unwrap();

    /// Bytes read from dialed connections, per outbound tag
    pub static ref OUTBOUND_BYTES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("nexum_outbound_bytes_received_total", "Bytes received on dialed connections"),
        &["outbound"]
    ).unwrap();
}

/// Register all metrics with the global registry.
pub fn init_metrics() {
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(BYTES_UPLINK.clone())).ok();
    REGISTRY.register(Box::new(BYTES_DOWNLINK.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_BYTES_SENT.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_BYTES_RECEIVED.clone())).ok();
}

impl Counter for IntCounter {
    fn add(&self, n: u64) {
        self.inc_by(n);
    }
}

/// Per-session counter feeding both the session total and a labelled
/// prometheus counter.
pub struct SessionCounter {
    session_total: std::sync::atomic::AtomicU64,
    labelled: prometheus::core::GenericCounter<prometheus::core::AtomicU64>,
}

impl SessionCounter {
    pub fn new(direction: &IntCounterVec, outbound_tag: &str) -> Self {
        Self {
            session_total: std::sync::atomic::AtomicU64::new(0),
            labelled: direction.with_label_values(&[outbound_tag]),
        }
    }

    pub fn total(&self) -> u64 {
        self.session_total.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Counter for SessionCounter {
    fn add(&self, n: u64) {
        self.session_total
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        self.labelled.inc_by(n);
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }

    #[test]
    fn test_session_counter_tracks_both() {
        let counter = SessionCounter::new(&BYTES_UPLINK, "test-tag");
        counter.add(10);
        counter.add(5);
        assert_eq!(counter.total(), 15);
    }
}
