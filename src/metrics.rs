use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for observability
///
/// This struct provides counters for monitoring a single connection's
/// health. Use `snapshot()` to get a point-in-time view of all metrics,
/// or use individual getter methods for specific values.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    messages_sent_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_queued_total: AtomicU64,
    queue_drops_total: AtomicU64,
    auth_failures_total: AtomicU64,
    auth_timeouts_total: AtomicU64,
    errors_total: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnect attempts scheduled
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total messages written to the wire
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total messages received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total messages buffered while not connected
    pub fn messages_queued(&self) -> u64 {
        self.messages_queued_total.load(Ordering::Relaxed)
    }

    /// Get total messages dropped due to a full queue
    pub fn queue_drops(&self) -> u64 {
        self.queue_drops_total.load(Ordering::Relaxed)
    }

    /// Get total auth handshake rejections
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures_total.load(Ordering::Relaxed)
    }

    /// Get total auth handshake timeouts
    pub fn auth_timeouts(&self) -> u64 {
        self.auth_timeouts_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_queued(&self) {
        self.messages_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_drop(&self) {
        self.queue_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_timeout(&self) {
        self.auth_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_queued_total: self.messages_queued_total.load(Ordering::Acquire),
            queue_drops_total: self.queue_drops_total.load(Ordering::Acquire),
            auth_failures_total: self.auth_failures_total.load(Ordering::Acquire),
            auth_timeouts_total: self.auth_timeouts_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub messages_sent_total: u64,
    pub messages_received_total: u64,
    pub messages_queued_total: u64,
    pub queue_drops_total: u64,
    pub auth_failures_total: u64,
    pub auth_timeouts_total: u64,
    pub errors_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();
        metrics.record_queue_drop();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.queue_drops(), 1);
        assert_eq!(metrics.messages_sent(), 0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_message_queued();
        metrics.record_message_queued();
        metrics.record_auth_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.messages_queued_total, 2);
        assert_eq!(snapshot.auth_failures_total, 1);
        assert_eq!(snapshot.errors_total, 0);
    }
}
