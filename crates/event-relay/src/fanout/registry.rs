//! `PumpRegistry` - lazily creates and caches one pump per topic.
//!
//! Pumps are never evicted: an idle pump holds no upstream resources, only a
//! map entry, and keeping it avoids a create/destroy churn on topics whose
//! subscriber count oscillates around zero.

use common::types::TopicId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::broker::BrokerPort;
use crate::config::RelayConfig;
use crate::fanout::FanOutPump;
use crate::metrics::RelayMetrics;

/// Cache of per-topic fan-out pumps.
pub struct PumpRegistry<T> {
    broker: Arc<dyn BrokerPort<T>>,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    pumps: Mutex<HashMap<TopicId, Arc<FanOutPump<T>>>>,
}

impl<T: Clone + Send + 'static> PumpRegistry<T> {
    /// Create a registry over the given broker.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerPort<T>>,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            metrics,
            pumps: Mutex::new(HashMap::new()),
        })
    }

    /// The single pump for `topic`, created idle on first access.
    #[must_use]
    pub fn get_or_create(&self, topic: &TopicId) -> Arc<FanOutPump<T>> {
        let mut pumps = self.lock();
        if let Some(pump) = pumps.get(topic) {
            return Arc::clone(pump);
        }

        debug!(
            target: "relay.pump",
            topic = %topic,
            "Pump created"
        );
        let pump = FanOutPump::new(
            topic.clone(),
            Arc::clone(&self.broker),
            self.config.clone(),
            Arc::clone(&self.metrics),
        );
        pumps.insert(topic.clone(), Arc::clone(&pump));
        pump
    }

    /// Number of cached pumps (active or idle).
    #[must_use]
    pub fn pump_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TopicId, Arc<FanOutPump<T>>>> {
        self.pumps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

