//! `FanOutPump` - per-topic engine bridging one broker consumer to N local
//! subscriber queues.
//!
//! Each pump:
//! - Owns at most one upstream pull task for its topic
//! - Starts that task on the first subscribe, stops it on the last detach
//! - Writes every pulled event into every registered queue without blocking
//!   on any of them
//!
//! # Ordering
//!
//! Exactly one task reads the broker consumer and fans out serially, so all
//! subscribers of a topic observe its events in broker delivery order.
//! Nothing is promised across topics.
//!
//! # Failure
//!
//! A non-cancellation pull failure completes every attached queue with the
//! fault and resets the pump; the next subscribe restarts a fresh upstream
//! task. Faults never cross topic boundaries.

use common::types::TopicId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, BrokerPort};
use crate::config::RelayConfig;
use crate::errors::{RelayError, StreamFault};
use crate::metrics::RelayMetrics;

/// Slot for one attached subscriber.
struct SubscriberSlot<T> {
    /// Bounded queue the fan-out writer pushes into.
    tx: mpsc::Sender<T>,
    /// Set before the queue is completed so the subscriber can tell a fault
    /// from a clean end once the queue drains.
    fault: Arc<StdMutex<Option<StreamFault>>>,
}

/// The running upstream pull task.
struct UpstreamTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct PumpInner<T> {
    next_subscriber_id: u64,
    slots: HashMap<u64, SubscriberSlot<T>>,
    upstream: Option<UpstreamTask>,
}

/// Per-topic fan-out engine. One instance per topic, shared via `Arc`.
pub struct FanOutPump<T> {
    topic: TopicId,
    broker: Arc<dyn BrokerPort<T>>,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    inner: StdMutex<PumpInner<T>>,
    /// Serializes upstream start and stop. A fresh subscribe waits here until
    /// a closing consumer has fully stopped, so the broker never sees two
    /// live consumers for one topic.
    start_lock: tokio::sync::Mutex<()>,
}

impl<T: Clone + Send + 'static> FanOutPump<T> {
    /// Create an idle pump for `topic`. No upstream resources exist until the
    /// first subscribe.
    #[must_use]
    pub fn new(
        topic: TopicId,
        broker: Arc<dyn BrokerPort<T>>,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic,
            broker,
            config,
            metrics,
            inner: StdMutex::new(PumpInner {
                next_subscriber_id: 0,
                slots: HashMap::new(),
                upstream: None,
            }),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Topic this pump serves.
    #[must_use]
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    /// Attach a subscriber.
    ///
    /// The subscriber's queue is registered before the upstream start
    /// decision, so a just-started pump can never race ahead of the
    /// registration and drop an event meant for it. When this returns `Ok`,
    /// the topic's broker consumer is open and every subsequently published
    /// event will reach the returned subscription.
    ///
    /// `cancel` ends the subscription as a normal completion, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Provisioning`] if opening the broker consumer
    /// fails; the registration is rolled back and nothing is cached.
    pub async fn subscribe(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<TopicSubscription<T>, RelayError> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity);
        let fault = Arc::new(StdMutex::new(None));

        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.slots.insert(
                id,
                SubscriberSlot {
                    tx,
                    fault: Arc::clone(&fault),
                },
            );
            id
        };
        self.metrics.record_subscriber_attached();

        debug!(
            target: "relay.pump",
            topic = %self.topic,
            subscriber_id = id,
            "Subscriber attached"
        );

        if let Err(error) = self.ensure_upstream().await {
            let removed = {
                let mut inner = self.lock();
                inner.slots.remove(&id).is_some()
            };
            if removed {
                self.metrics.record_subscriber_detached();
            }
            return Err(error);
        }

        Ok(TopicSubscription {
            pump: Some(Arc::clone(self)),
            id,
            rx,
            fault,
            cancel,
            fault_delivered: false,
        })
    }

    /// Start the upstream pull task if none is running.
    async fn ensure_upstream(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.lock().upstream.is_some() {
            return Ok(());
        }

        let _guard = self.start_lock.lock().await;

        // A racing subscribe may have started it while we waited.
        if self.lock().upstream.is_some() {
            return Ok(());
        }

        let consumer =
            self.broker
                .open_consumer(&self.topic)
                .await
                .map_err(|source| RelayError::Provisioning {
                    topic: self.topic.clone(),
                    source,
                })?;
        self.metrics.record_consumer_opened();

        let cancel = CancellationToken::new();
        let join = tokio::spawn(Self::run_upstream(
            Arc::clone(self),
            consumer,
            cancel.clone(),
        ));

        self.lock().upstream = Some(UpstreamTask { cancel, join });

        info!(
            target: "relay.pump",
            topic = %self.topic,
            "Upstream consumer started"
        );

        Ok(())
    }

    /// The upstream pull loop: pull a batch, fan each item out, ack it.
    async fn run_upstream(
        pump: Arc<Self>,
        mut consumer: Box<dyn BrokerConsumer<T>>,
        cancel: CancellationToken,
    ) {
        debug!(
            target: "relay.pump",
            topic = %pump.topic,
            "Upstream pull loop started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(
                        target: "relay.pump",
                        topic = %pump.topic,
                        "Upstream pull loop cancelled"
                    );
                    break;
                }

                pulled = consumer.pull(pump.config.pull_batch_size, pump.config.pull_timeout) => {
                    match pulled {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                pump.fan_out(delivery.event);
                                if let Err(error) = consumer.ack(delivery.ack_token).await {
                                    warn!(
                                        target: "relay.pump",
                                        topic = %pump.topic,
                                        ack_token = delivery.ack_token,
                                        error = %error,
                                        "Ack failed"
                                    );
                                }
                            }
                        }
                        Err(error) => {
                            warn!(
                                target: "relay.pump",
                                topic = %pump.topic,
                                error = %error,
                                "Upstream pull failed, faulting subscribers"
                            );
                            pump.metrics.record_pump_fault();
                            pump.fault_all(StreamFault::Upstream {
                                topic: pump.topic.clone(),
                                message: error.to_string(),
                            });
                            pump.close_consumer(&mut consumer).await;
                            return;
                        }
                    }
                }
            }
        }

        pump.close_consumer(&mut consumer).await;
    }

    /// Best-effort consumer close; failures are logged, never surfaced.
    async fn close_consumer(&self, consumer: &mut Box<dyn BrokerConsumer<T>>) {
        if let Err(error) = consumer.close().await {
            warn!(
                target: "relay.pump",
                topic = %self.topic,
                error = %error,
                "Consumer close failed"
            );
        }
        self.metrics.record_consumer_closed();
        info!(
            target: "relay.pump",
            topic = %self.topic,
            "Upstream consumer stopped"
        );
    }

    /// Write one event into every registered queue. Never blocks: a full
    /// queue disconnects that subscriber alone with a `Lagged` fault, and a
    /// closed queue is dropped for its detach to finish cleaning up.
    fn fan_out(&self, event: T) {
        let mut lagged = 0_u64;
        {
            let mut inner = self.lock();
            let topic = &self.topic;
            let metrics = &self.metrics;
            inner.slots.retain(|id, slot| match slot.tx.try_send(event.clone()) {
                Ok(()) => {
                    metrics.record_event_fanned_out();
                    true
                }
                Err(TrySendError::Full(_)) => {
                    set_fault(&slot.fault, StreamFault::Lagged {
                        topic: topic.clone(),
                    });
                    warn!(
                        target: "relay.pump",
                        topic = %topic,
                        subscriber_id = id,
                        "Subscriber queue full, disconnecting"
                    );
                    lagged += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
        for _ in 0..lagged {
            self.metrics.record_lagged_disconnect();
            self.metrics.record_subscriber_detached();
        }
    }

    /// Complete every registered queue with `fault` and reset the pump so the
    /// next subscribe starts a fresh upstream task.
    fn fault_all(&self, fault: StreamFault) {
        let slots = {
            let mut inner = self.lock();
            inner.upstream = None;
            std::mem::take(&mut inner.slots)
        };
        for slot in slots.values() {
            set_fault(&slot.fault, fault.clone());
            self.metrics.record_subscriber_detached();
        }
        // Dropping the slots drops their senders, completing the queues.
    }

    /// Detach a subscriber. If it was the last one, cancel the upstream task
    /// and await its stop so the broker consumer is closed before returning.
    pub async fn detach(&self, id: u64) {
        let was_last = {
            let mut inner = self.lock();
            if inner.slots.remove(&id).is_some() {
                self.metrics.record_subscriber_detached();
                debug!(
                    target: "relay.pump",
                    topic = %self.topic,
                    subscriber_id = id,
                    "Subscriber detached"
                );
            }
            inner.slots.is_empty()
        };
        if !was_last {
            return;
        }

        // The upstream stays registered until the start lock is held, so a
        // racing subscribe either sees it and keeps it alive, or waits here
        // until the old consumer has fully stopped.
        let _guard = self.start_lock.lock().await;
        let stopping = {
            let mut inner = self.lock();
            if inner.slots.is_empty() {
                inner.upstream.take()
            } else {
                // A subscriber attached while we waited for the lock.
                None
            }
        };

        if let Some(task) = stopping {
            task.cancel.cancel();
            if let Err(join_error) = task.join.await {
                if join_error.is_panic() {
                    error!(
                        target: "relay.pump",
                        topic = %self.topic,
                        error = ?join_error,
                        "Upstream task panicked"
                    );
                }
            }
        }
    }

    /// Number of currently attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether an upstream pull task is currently registered.
    #[must_use]
    pub fn has_upstream(&self) -> bool {
        self.lock().upstream.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, PumpInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn set_fault(slot: &Arc<StdMutex<Option<StreamFault>>>, fault: StreamFault) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    guard.get_or_insert(fault);
}

/// One subscriber's live lease on a pump.
///
/// Yields events until the caller's token fires (clean end), the pump
/// completes the queue with a fault, or the subscription is dropped.
/// Detaching, explicitly via [`TopicSubscription::detach`] or implicitly on
/// drop, removes the queue and stops the upstream task if this was the
/// topic's last subscriber.
pub struct TopicSubscription<T: Clone + Send + 'static> {
    pump: Option<Arc<FanOutPump<T>>>,
    id: u64,
    rx: mpsc::Receiver<T>,
    fault: Arc<StdMutex<Option<StreamFault>>>,
    cancel: CancellationToken,
    fault_delivered: bool,
}

impl<T: Clone + Send + 'static> TopicSubscription<T> {
    /// Next event.
    ///
    /// Returns `None` when the caller's token fired or the queue ended
    /// cleanly, and `Some(Err(_))` exactly once if the queue was completed
    /// with a fault (after any buffered events drain).
    pub async fn next(&mut self) -> Option<Result<T, StreamFault>> {
        if self.fault_delivered {
            return None;
        }

        let item = tokio::select! {
            () = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        };

        match item {
            Some(event) => Some(Ok(event)),
            None => {
                let fault = {
                    let mut guard = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.take()
                };
                fault.map(|f| {
                    self.fault_delivered = true;
                    Err(f)
                })
            }
        }
    }

    /// Detach from the pump, awaiting upstream teardown if this was the last
    /// subscriber.
    pub async fn detach(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.detach(self.id).await;
        }
    }
}

impl<T: Clone + Send + 'static> Drop for TopicSubscription<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            let id = self.id;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pump.detach(id).await;
                });
            }
        }
    }
}

