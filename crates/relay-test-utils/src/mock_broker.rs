//! In-memory broker for relay testing.
//!
//! Implements the `BrokerPort` contract with:
//! - per-topic delivery to every consumer open at publish time
//!   ("new messages only" - nothing is replayed on attach)
//! - counters for every provisioning and teardown primitive
//! - single-shot fault injection for create/open/publish/pull paths

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::types::TopicId;
use event_relay::broker::{BrokerConsumer, BrokerError, BrokerPort, BrokerPublisher, Delivery};
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct Counters {
    streams_ensured: AtomicU64,
    publishers_created: AtomicU64,
    publishers_closed: AtomicU64,
    consumers_opened: AtomicU64,
    consumers_closed: AtomicU64,
    events_published: AtomicU64,
    acks: AtomicU64,
}

struct ConsumerSlot<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
    /// Message for a fault the next pull on this consumer should return.
    pull_fault: Arc<Mutex<Option<String>>>,
}

struct BrokerState<T> {
    consumers: HashMap<TopicId, Vec<ConsumerSlot<T>>>,
    next_consumer_id: u64,
    next_ack_token: u64,
    fail_publisher_create: HashMap<TopicId, String>,
    fail_consumer_open: HashMap<TopicId, String>,
    fail_next_publish: HashMap<TopicId, String>,
    hold_publisher_create: HashMap<TopicId, Arc<Notify>>,
}

impl<T> Default for BrokerState<T> {
    fn default() -> Self {
        Self {
            consumers: HashMap::new(),
            next_consumer_id: 0,
            next_ack_token: 0,
            fail_publisher_create: HashMap::new(),
            fail_consumer_open: HashMap::new(),
            fail_next_publish: HashMap::new(),
            hold_publisher_create: HashMap::new(),
        }
    }
}

/// In-memory broker. Cloneable; clones share state.
pub struct MockBroker<T> {
    state: Arc<Mutex<BrokerState<T>>>,
    counters: Arc<Counters>,
}

impl<T> Clone for MockBroker<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T> Default for MockBroker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MockBroker<T> {
    /// Deliver `event` to every consumer currently open on `topic`.
    pub fn publish(&self, topic: &TopicId, event: T) {
        let state = self.state.lock().unwrap();
        if let Some(slots) = state.consumers.get(topic) {
            for slot in slots {
                let _ = slot.tx.send(event.clone());
            }
        }
        self.counters.events_published.fetch_add(1, Ordering::SeqCst);
    }
}

impl<T> MockBroker<T> {
    /// Create a new empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Make the next `create_publisher` for `topic` fail.
    pub fn fail_next_publisher_create(&self, topic: &TopicId, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_publisher_create
            .insert(topic.clone(), message.to_string());
    }

    /// Make the next `open_consumer` for `topic` fail.
    pub fn fail_next_consumer_open(&self, topic: &TopicId, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_consumer_open
            .insert(topic.clone(), message.to_string());
    }

    /// Make the next publish to `topic` fail.
    pub fn fail_next_publish(&self, topic: &TopicId, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_next_publish
            .insert(topic.clone(), message.to_string());
    }

    /// Park the next `create_publisher` for `topic` until the returned gate
    /// is notified.
    pub fn hold_next_publisher_create(&self, topic: &TopicId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .hold_publisher_create
            .insert(topic.clone(), Arc::clone(&gate));
        gate
    }

    /// Make the next pull on every consumer currently open on `topic` fail.
    pub fn inject_pull_fault(&self, topic: &TopicId, message: &str) {
        let state = self.state.lock().unwrap();
        if let Some(slots) = state.consumers.get(topic) {
            for slot in slots {
                *slot.pull_fault.lock().unwrap() = Some(message.to_string());
            }
        }
    }

    /// Streams ensured so far.
    pub fn streams_ensured(&self) -> u64 {
        self.counters.streams_ensured.load(Ordering::SeqCst)
    }

    /// Publishers created so far.
    pub fn publishers_created(&self) -> u64 {
        self.counters.publishers_created.load(Ordering::SeqCst)
    }

    /// Publishers closed so far.
    pub fn publishers_closed(&self) -> u64 {
        self.counters.publishers_closed.load(Ordering::SeqCst)
    }

    /// Consumers opened so far.
    pub fn consumers_opened(&self) -> u64 {
        self.counters.consumers_opened.load(Ordering::SeqCst)
    }

    /// Consumers closed so far.
    pub fn consumers_closed(&self) -> u64 {
        self.counters.consumers_closed.load(Ordering::SeqCst)
    }

    /// Events published so far.
    pub fn events_published(&self) -> u64 {
        self.counters.events_published.load(Ordering::SeqCst)
    }

    /// Acks received so far.
    pub fn acks(&self) -> u64 {
        self.counters.acks.load(Ordering::SeqCst)
    }

    /// Consumers currently open on `topic`.
    pub fn live_consumers(&self, topic: &TopicId) -> usize {
        self.state
            .lock()
            .unwrap()
            .consumers
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn remove_consumer(&self, topic: &TopicId, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(slots) = state.consumers.get_mut(topic) {
            slots.retain(|slot| slot.id != id);
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BrokerPort<T> for MockBroker<T> {
    async fn ensure_stream(&self, _topic: &TopicId) -> Result<(), BrokerError> {
        self.counters.streams_ensured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_publisher(
        &self,
        topic: &TopicId,
    ) -> Result<Arc<dyn BrokerPublisher<T>>, BrokerError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_publisher_create.remove(topic) {
                return Err(BrokerError::Provisioning(message));
            }
            state.hold_publisher_create.remove(topic)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.counters
            .publishers_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPublisher {
            topic: topic.clone(),
            broker: self.clone(),
        }))
    }

    async fn open_consumer(
        &self,
        topic: &TopicId,
    ) -> Result<Box<dyn BrokerConsumer<T>>, BrokerError> {
        let (id, rx, pull_fault) = {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_consumer_open.remove(topic) {
                return Err(BrokerError::Provisioning(message));
            }

            let id = state.next_consumer_id;
            state.next_consumer_id += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            let pull_fault = Arc::new(Mutex::new(None));
            state
                .consumers
                .entry(topic.clone())
                .or_default()
                .push(ConsumerSlot {
                    id,
                    tx,
                    pull_fault: Arc::clone(&pull_fault),
                });
            (id, rx, pull_fault)
        };
        self.counters.consumers_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConsumer {
            topic: topic.clone(),
            id,
            rx,
            pull_fault,
            broker: self.clone(),
            closed: false,
        }))
    }
}

struct MockPublisher<T> {
    topic: TopicId,
    broker: MockBroker<T>,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BrokerPublisher<T> for MockPublisher<T> {
    async fn publish(&self, event: T) -> Result<(), BrokerError> {
        if let Some(message) = self
            .broker
            .state
            .lock()
            .unwrap()
            .fail_next_publish
            .remove(&self.topic)
        {
            return Err(BrokerError::Publish(message));
        }
        self.broker.publish(&self.topic, event);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker
            .counters
            .publishers_closed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockConsumer<T> {
    topic: TopicId,
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    pull_fault: Arc<Mutex<Option<String>>>,
    broker: MockBroker<T>,
    closed: bool,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> BrokerConsumer<T> for MockConsumer<T> {
    async fn pull(
        &mut self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<Delivery<T>>, BrokerError> {
        if let Some(message) = self.pull_fault.lock().unwrap().take() {
            return Err(BrokerError::Pull(message));
        }

        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => event,
            // Channel closed or timed out: an empty batch, not an error.
            Ok(None) | Err(_) => return Ok(Vec::new()),
        };

        let mut deliveries = vec![self.make_delivery(first)];
        while deliveries.len() < max_batch {
            match self.rx.try_recv() {
                Ok(event) => deliveries.push(self.make_delivery(event)),
                Err(_) => break,
            }
        }
        Ok(deliveries)
    }

    async fn ack(&mut self, _ack_token: u64) -> Result<(), BrokerError> {
        self.broker.counters.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.broker.remove_consumer(&self.topic, self.id);
            self.broker
                .counters
                .consumers_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl<T> MockConsumer<T> {
    fn make_delivery(&mut self, event: T) -> Delivery<T> {
        let token = {
            let mut state = self.broker.state.lock().unwrap();
            let token = state.next_ack_token;
            state.next_ack_token += 1;
            token
        };
        Delivery {
            event,
            ack_token: token,
        }
    }
}

impl<T> Drop for MockConsumer<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.remove_consumer(&self.topic, self.id);
        }
    }
}
