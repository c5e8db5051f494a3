//! Unit tests for the pump registry, run as an integration test so the mock
//! broker and the crate share one `event_relay` instance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use common::types::TopicId;
use event_relay::{PumpRegistry, RelayConfig, RelayMetrics};
use relay_test_utils::MockBroker;

#[tokio::test]
async fn test_one_pump_per_topic() {
    let broker = MockBroker::<String>::new();
    let registry = PumpRegistry::new(
        Arc::new(broker),
        RelayConfig::default(),
        RelayMetrics::new(),
    );

    let t1 = TopicId::new("channel", "one");
    let t2 = TopicId::new("channel", "two");

    let a = registry.get_or_create(&t1);
    let b = registry.get_or_create(&t1);
    let c = registry.get_or_create(&t2);

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.pump_count(), 2);

    // Creation is lazy; no upstream resources exist yet.
    assert!(!a.has_upstream());
}
