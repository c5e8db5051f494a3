//! Event relay error types.
//!
//! Cancellation is not represented here: a cancelled session or subscription
//! ends cleanly, and no error is surfaced anywhere in this layer for it.

use common::types::{SessionId, TopicId};
use thiserror::Error;

use crate::broker::BrokerError;

/// Error surfaced by the relay's public surface.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker failed while creating a stream, publisher, or consumer.
    /// Nothing is cached on this path; calling again retries from scratch.
    #[error("Provisioning failed for topic {topic}: {source}")]
    Provisioning {
        /// Topic whose resource could not be created.
        topic: TopicId,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// A publish through a write handle failed. No retry at this layer.
    #[error("Publish failed for topic {topic}: {source}")]
    Publish {
        /// Topic the event was destined for.
        topic: TopicId,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// The named session does not exist (never created, or already torn down).
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// A subscription stream ended with a fault.
    #[error(transparent)]
    Stream(#[from] StreamFault),
}

/// Fault delivered through a subscriber queue.
///
/// Cloneable so one upstream fault can complete every attached queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamFault {
    /// The topic's upstream pull loop failed. All subscribers of the topic
    /// observe this; the pump resets so a fresh subscribe restarts cleanly.
    #[error("Upstream fault on topic {topic}: {message}")]
    Upstream {
        /// Faulting topic.
        topic: TopicId,
        /// Description of the broker-side failure.
        message: String,
    },

    /// This subscriber's queue overflowed and the subscriber was
    /// disconnected. Only the lagging subscriber observes this.
    #[error("Subscriber lagged on topic {topic} and was disconnected")]
    Lagged {
        /// Topic the subscriber was attached to.
        topic: TopicId,
    },
}
