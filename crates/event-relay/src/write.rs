//! Reference-counted shared publisher handles.
//!
//! One upstream publisher exists per topic regardless of how many local
//! producers hold a handle to it. The first `acquire` creates it; the
//! release that drops the count to zero removes it synchronously with that
//! release and closes the publisher in the background.

use common::types::TopicId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::broker::{BrokerPort, BrokerPublisher};
use crate::errors::RelayError;
use crate::metrics::RelayMetrics;

/// A lease on a topic's shared publisher.
///
/// Obtained from [`WriteStreamRegistry::acquire`]; must be returned via
/// [`WriteStreamRegistry::release`] exactly once. Releasing twice is a
/// caller bug that the registry tolerates as a logged no-op.
pub struct WriteHandle<T> {
    topic: TopicId,
    publisher: Arc<dyn BrokerPublisher<T>>,
}

impl<T> WriteHandle<T> {
    /// Topic this handle publishes to.
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Publish one event through the shared publisher.
    ///
    /// Delegates to the broker with no retry; cancellation is dropping the
    /// returned future.
    ///
    /// # Errors
    ///
    /// Returns whatever the broker publish returns.
    pub async fn fire(&self, event: T) -> Result<(), RelayError> {
        self.publisher
            .publish(event)
            .await
            .map_err(|source| RelayError::Publish {
                topic: self.topic.clone(),
                source,
            })
    }
}

struct WriteEntry<T> {
    publisher: Arc<dyn BrokerPublisher<T>>,
    ref_count: usize,
}

/// Reference-counted cache of shared publisher handles, one per topic.
pub struct WriteStreamRegistry<T> {
    broker: Arc<dyn BrokerPort<T>>,
    metrics: Arc<RelayMetrics>,
    /// Count mutations and removals happen in short sections under this
    /// lock, never across an await; acquires and releases on other topics
    /// are not stalled by an in-flight creation.
    entries: Mutex<HashMap<TopicId, WriteEntry<T>>>,
    /// Serializes the create path. Racing first-acquires queue here and the
    /// losers find the winner's entry on the re-check.
    create_lock: tokio::sync::Mutex<()>,
}

impl<T: Send + 'static> WriteStreamRegistry<T> {
    /// Create a registry over the given broker.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerPort<T>>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            broker,
            metrics,
            entries: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get a shared handle for `topic`, creating the underlying publisher on
    /// first acquire.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Provisioning`] if the broker fails to create the
    /// stream or publisher. Nothing is cached on failure; the next acquire
    /// retries from scratch.
    pub async fn acquire(&self, topic: &TopicId) -> Result<WriteHandle<T>, RelayError> {
        if let Some(handle) = self.acquire_existing(topic) {
            return Ok(handle);
        }

        let _guard = self.create_lock.lock().await;

        // A racing acquire may have created the entry while we waited.
        if let Some(handle) = self.acquire_existing(topic) {
            return Ok(handle);
        }

        self.broker
            .ensure_stream(topic)
            .await
            .map_err(|source| RelayError::Provisioning {
                topic: topic.clone(),
                source,
            })?;
        let publisher =
            self.broker
                .create_publisher(topic)
                .await
                .map_err(|source| RelayError::Provisioning {
                    topic: topic.clone(),
                    source,
                })?;

        self.lock().insert(
            topic.clone(),
            WriteEntry {
                publisher: Arc::clone(&publisher),
                ref_count: 1,
            },
        );
        self.metrics.record_publisher_created();

        info!(
            target: "relay.write",
            topic = %topic,
            "Publisher created"
        );

        Ok(WriteHandle {
            topic: topic.clone(),
            publisher,
        })
    }

    /// Bump the count on an existing entry, if there is one.
    fn acquire_existing(&self, topic: &TopicId) -> Option<WriteHandle<T>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(topic)?;
        entry.ref_count += 1;
        debug!(
            target: "relay.write",
            topic = %topic,
            ref_count = entry.ref_count,
            "Write handle acquired"
        );
        Some(WriteHandle {
            topic: topic.clone(),
            publisher: Arc::clone(&entry.publisher),
        })
    }

    /// Return a handle. The release that drops a topic's count to zero
    /// removes the entry and closes the publisher in the background;
    /// close failures are logged, never surfaced.
    pub fn release(&self, handle: WriteHandle<T>) {
        let closed = {
            let mut entries = self.lock();
            match entries.get_mut(&handle.topic) {
                Some(entry) => {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 {
                        entries.remove(&handle.topic)
                    } else {
                        debug!(
                            target: "relay.write",
                            topic = %handle.topic,
                            ref_count = entry.ref_count,
                            "Write handle released"
                        );
                        None
                    }
                }
                None => {
                    // Double release; the entry is already gone.
                    warn!(
                        target: "relay.write",
                        topic = %handle.topic,
                        "Release of an unknown write handle ignored"
                    );
                    None
                }
            }
        };

        if let Some(entry) = closed {
            info!(
                target: "relay.write",
                topic = %handle.topic,
                "Last write handle released, closing publisher"
            );
            let metrics = Arc::clone(&self.metrics);
            let topic = handle.topic.clone();
            tokio::spawn(async move {
                if let Err(error) = entry.publisher.close().await {
                    warn!(
                        target: "relay.write",
                        topic = %topic,
                        error = %error,
                        "Publisher close failed"
                    );
                }
                metrics.record_publisher_closed();
            });
        }
    }

    /// Number of topics with a live publisher entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TopicId, WriteEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

