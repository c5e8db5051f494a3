//! The broker contract consumed by the relay core.
//!
//! The relay never talks to a concrete broker client; it sees only these
//! traits. An alternative durable log can be substituted without touching
//! the write registry, the fan-out pumps, or the session coupler.
//!
//! Consumers are pull-based with explicit per-item acks, bounded in-flight,
//! and deliver new messages only (no historical replay on attach).

use async_trait::async_trait;
use common::types::TopicId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error from a broker operation.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Stream/publisher/consumer provisioning failed.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// A publish was rejected or lost.
    #[error("Publish rejected: {0}")]
    Publish(String),

    /// A pull from an open consumer failed.
    #[error("Pull failed: {0}")]
    Pull(String),

    /// An ack was rejected.
    #[error("Ack rejected: {0}")]
    Ack(String),

    /// The broker is unreachable.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// One pulled item awaiting ack.
#[derive(Debug)]
pub struct Delivery<T> {
    /// The event payload.
    pub event: T,
    /// Broker-assigned token identifying this delivery for acking.
    pub ack_token: u64,
}

/// Durable per-topic publish/consume primitives.
#[async_trait]
pub trait BrokerPort<T>: Send + Sync {
    /// Idempotent provisioning of the durable stream backing `topic`.
    async fn ensure_stream(&self, topic: &TopicId) -> Result<(), BrokerError>;

    /// Create a publisher for `topic`. The stream must already exist.
    async fn create_publisher(
        &self,
        topic: &TopicId,
    ) -> Result<Arc<dyn BrokerPublisher<T>>, BrokerError>;

    /// Open a pull consumer for `topic`, delivering new messages only.
    async fn open_consumer(
        &self,
        topic: &TopicId,
    ) -> Result<Box<dyn BrokerConsumer<T>>, BrokerError>;
}

/// Publisher handle for one topic.
#[async_trait]
pub trait BrokerPublisher<T>: Send + Sync {
    /// Publish one event to the topic.
    async fn publish(&self, event: T) -> Result<(), BrokerError>;

    /// Close the publisher. Best-effort; callers log failures and move on.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Pull consumer handle for one topic.
#[async_trait]
pub trait BrokerConsumer<T>: Send {
    /// Pull up to `max_batch` deliveries, waiting at most `timeout`.
    /// Returns an empty batch on timeout; that is not an error.
    async fn pull(
        &mut self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery<T>>, BrokerError>;

    /// Acknowledge one delivery.
    async fn ack(&mut self, ack_token: u64) -> Result<(), BrokerError>;

    /// Close the consumer. Best-effort; callers log failures and move on.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
