//! Event Relay Core
//!
//! This library bridges a single durable per-topic broker stream with an
//! arbitrary number of concurrent local consumers (client sessions), sharing
//! exactly one upstream publisher and one upstream consumer per topic
//! regardless of how many local producers or subscribers attach, and tearing
//! both down automatically when unused.
//!
//! # Architecture
//!
//! ```text
//! producer ──► WriteStreamRegistry ──► shared publisher ──► broker topic
//!
//! broker topic ──► FanOutPump (one upstream consumer per topic)
//!                    ├── subscriber queue ──► relay ─┐
//!                    └── subscriber queue ──► relay ─┤
//!                                                    ▼
//!                              SessionCoupler merged output per session
//! ```
//!
//! # Key Design Decisions
//!
//! - **One upstream per topic**: the pump's pull loop is the only reader of a
//!   topic's broker consumer, so every local subscriber observes that topic's
//!   events in broker order.
//! - **Lazy creation, counted teardown**: publishers and consumers exist only
//!   while at least one lease is held; the last release/detach closes them.
//! - **Hierarchical cancellation**: session root tokens cascade to per-topic
//!   branch tokens via `CancellationToken::child_token`. Cancellation is
//!   normal control flow, never an error.
//! - **Fault isolation**: an upstream fault completes only that topic's
//!   subscriber queues; other topics and sessions are untouched.
//! - **Bounded subscriber queues**: a slow consumer is disconnected with a
//!   `Lagged` fault instead of blocking the fan-out writer or growing memory.
//!
//! # Modules
//!
//! - [`broker`] - The consumed broker contract (`BrokerPort`)
//! - [`write`] - Reference-counted shared publisher handles
//! - [`fanout`] - Per-topic fan-out pumps and their registry
//! - [`session`] - Session-scoped subscription multiplexing
//! - [`config`] - Relay configuration from environment
//! - [`errors`] - Error types
//! - [`metrics`] - Lightweight relay counters

pub mod broker;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod metrics;
pub mod session;
pub mod write;

pub use broker::{BrokerConsumer, BrokerError, BrokerPort, BrokerPublisher, Delivery};
pub use config::RelayConfig;
pub use errors::{RelayError, StreamFault};
pub use fanout::{FanOutPump, PumpRegistry, TopicSubscription};
pub use metrics::RelayMetrics;
pub use session::{SessionCoupler, SessionStream};
pub use write::{WriteHandle, WriteStreamRegistry};
