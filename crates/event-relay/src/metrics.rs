//! Relay counters.
//!
//! One shared instance is threaded through the registries and pumps so
//! operators (and tests) can observe resource lifecycles: how many upstream
//! publishers/consumers exist, how many subscribers are attached, and how
//! often pumps faulted or slow consumers were disconnected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared relay counters. Cheap to clone via `Arc`.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    publishers_created: AtomicU64,
    publishers_closed: AtomicU64,
    consumers_opened: AtomicU64,
    consumers_closed: AtomicU64,
    events_fanned_out: AtomicU64,
    subscribers_attached: AtomicU64,
    subscribers_detached: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    pump_faults: AtomicU64,
    lagged_disconnects: AtomicU64,
}

impl RelayMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an upstream publisher creation.
    pub fn record_publisher_created(&self) {
        self.publishers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream publisher close.
    pub fn record_publisher_closed(&self) {
        self.publishers_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream consumer open.
    pub fn record_consumer_opened(&self) {
        self.consumers_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream consumer close.
    pub fn record_consumer_closed(&self) {
        self.consumers_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one event delivered to one subscriber queue.
    pub fn record_event_fanned_out(&self) {
        self.events_fanned_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subscriber attach.
    pub fn record_subscriber_attached(&self) {
        self.subscribers_attached.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subscriber detach.
    pub fn record_subscriber_detached(&self) {
        self.subscribers_detached.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session open.
    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session teardown.
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream pull-loop fault.
    pub fn record_pump_fault(&self) {
        self.pump_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a slow-consumer disconnection.
    pub fn record_lagged_disconnect(&self) {
        self.lagged_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishers created since start.
    #[must_use]
    pub fn publishers_created(&self) -> u64 {
        self.publishers_created.load(Ordering::Relaxed)
    }

    /// Publishers closed since start.
    #[must_use]
    pub fn publishers_closed(&self) -> u64 {
        self.publishers_closed.load(Ordering::Relaxed)
    }

    /// Consumers opened since start.
    #[must_use]
    pub fn consumers_opened(&self) -> u64 {
        self.consumers_opened.load(Ordering::Relaxed)
    }

    /// Consumers closed since start.
    #[must_use]
    pub fn consumers_closed(&self) -> u64 {
        self.consumers_closed.load(Ordering::Relaxed)
    }

    /// Events delivered to subscriber queues since start.
    #[must_use]
    pub fn events_fanned_out(&self) -> u64 {
        self.events_fanned_out.load(Ordering::Relaxed)
    }

    /// Subscribers attached since start.
    #[must_use]
    pub fn subscribers_attached(&self) -> u64 {
        self.subscribers_attached.load(Ordering::Relaxed)
    }

    /// Subscribers detached since start.
    #[must_use]
    pub fn subscribers_detached(&self) -> u64 {
        self.subscribers_detached.load(Ordering::Relaxed)
    }

    /// Sessions opened since start.
    #[must_use]
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Sessions torn down since start.
    #[must_use]
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Upstream pull-loop faults since start.
    #[must_use]
    pub fn pump_faults(&self) -> u64 {
        self.pump_faults.load(Ordering::Relaxed)
    }

    /// Slow-consumer disconnections since start.
    #[must_use]
    pub fn lagged_disconnects(&self) -> u64 {
        self.lagged_disconnects.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let metrics = RelayMetrics::new();
        metrics.record_publisher_created();
        metrics.record_publisher_created();
        metrics.record_publisher_closed();
        assert_eq!(metrics.publishers_created(), 2);
        assert_eq!(metrics.publishers_closed(), 1);
        assert_eq!(metrics.consumers_opened(), 0);
    }
}
