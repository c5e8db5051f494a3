//! # Relay Test Utilities
//!
//! Shared test utilities for the event relay core.
//!
//! This crate provides an in-memory broker with call counters and fault
//! injection, so the relay can be tested in isolation without real
//! infrastructure.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::MockBroker;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let broker = MockBroker::<String>::new();
//!     // wire it into a registry / pump / coupler, then:
//!     broker.publish(&topic, "hello".to_string());
//!     assert_eq!(broker.consumers_opened(), 1);
//! }
//! ```

mod mock_broker;

pub use mock_broker::MockBroker;

/// Initialize tracing for a test binary. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
