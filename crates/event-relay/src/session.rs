//! `SessionCoupler` - per-session subscription multiplexing.
//!
//! One session is one logical client connection. It may subscribe to and
//! unsubscribe from topics dynamically over its lifetime and observes all of
//! them as a single merged output stream.
//!
//! # Cancellation hierarchy
//!
//! ```text
//! caller token ──child──► session root ──child──► per-topic branch
//! ```
//!
//! Cancelling the root stops every branch; cancelling a branch stops only
//! that topic's relay. A relay stopping detaches from its pump, which stops
//! the topic's upstream consumer if it was the last subscriber anywhere in
//! the process.
//!
//! # Lifecycle
//!
//! A session is created on `open_session` and torn down exactly once by the
//! returned stream's guaranteed-cleanup path: end of enumeration, fault,
//! external cancellation, drop, or a re-open under the same id
//! (last-writer-wins). Teardown is epoch-guarded so concurrent terminal
//! triggers are idempotent.

use common::context::CallContext;
use common::types::{SessionId, TopicId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::errors::{RelayError, StreamFault};
use crate::fanout::{PumpRegistry, TopicSubscription};
use crate::metrics::RelayMetrics;

struct SessionEntry<T> {
    user_id: UserId,
    /// Distinguishes this instance from earlier/later ones under the same id.
    epoch: u64,
    root: CancellationToken,
    topics: HashMap<TopicId, CancellationToken>,
    output: mpsc::Sender<Result<T, StreamFault>>,
}

/// Aggregates per-topic subscriptions into one merged stream per session.
pub struct SessionCoupler<T: Clone + Send + 'static> {
    pumps: Arc<PumpRegistry<T>>,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    sessions: Mutex<HashMap<SessionId, SessionEntry<T>>>,
    next_epoch: AtomicU64,
}

impl<T: Clone + Send + 'static> SessionCoupler<T> {
    /// Create a coupler over the given pump registry.
    #[must_use]
    pub fn new(
        pumps: Arc<PumpRegistry<T>>,
        config: RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pumps,
            config,
            metrics,
            sessions: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
        })
    }

    /// Open a session and subscribe its first topic.
    ///
    /// If a session already exists under the same id it is torn down first;
    /// the last caller wins. The session root token is derived from `cancel`,
    /// so cancelling `cancel` ends the returned stream cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Provisioning`] if the initial topic's upstream
    /// consumer cannot be opened; no session is left behind in that case.
    pub async fn open_session(
        self: &Arc<Self>,
        ctx: CallContext,
        initial_topic: TopicId,
        cancel: CancellationToken,
    ) -> Result<SessionStream<T>, RelayError> {
        let previous = {
            let mut sessions = self.lock();
            sessions.remove(&ctx.session_id)
        };
        if let Some(old) = previous {
            old.root.cancel();
            self.metrics.record_session_closed();
            info!(
                target: "relay.session",
                session_id = %ctx.session_id,
                "Session re-opened, previous instance torn down"
            );
        }

        let root = cancel.child_token();
        let (output, rx) = mpsc::channel(self.config.session_buffer);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        {
            let mut sessions = self.lock();
            sessions.insert(
                ctx.session_id.clone(),
                SessionEntry {
                    user_id: ctx.user_id.clone(),
                    epoch,
                    root: root.clone(),
                    topics: HashMap::new(),
                    output,
                },
            );
        }
        self.metrics.record_session_opened();

        info!(
            target: "relay.session",
            session_id = %ctx.session_id,
            user_id = %ctx.user_id,
            topic = %initial_topic,
            "Session opened"
        );

        if let Err(error) = self.subscribe_topic(&ctx.session_id, initial_topic).await {
            self.teardown(&ctx.session_id, epoch);
            return Err(error);
        }

        Ok(SessionStream {
            coupler: Arc::clone(self),
            session_id: ctx.session_id,
            epoch,
            root,
            rx,
            finished: false,
        })
    }

    /// Subscribe a session to a topic.
    ///
    /// Idempotent: a session already subscribed to `topic` keeps its single
    /// relay task and this returns `Ok` without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] for an unknown session id and
    /// [`RelayError::Provisioning`] if the topic's upstream consumer cannot
    /// be opened (the branch registration is rolled back).
    pub async fn subscribe_topic(
        self: &Arc<Self>,
        session_id: &SessionId,
        topic: TopicId,
    ) -> Result<(), RelayError> {
        let (branch, output, epoch) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;

            if entry.topics.contains_key(&topic) {
                debug!(
                    target: "relay.session",
                    session_id = %session_id,
                    topic = %topic,
                    "Already subscribed, ignoring"
                );
                return Ok(());
            }

            let branch = entry.root.child_token();
            entry.topics.insert(topic.clone(), branch.clone());
            (branch, entry.output.clone(), entry.epoch)
        };

        let pump = self.pumps.get_or_create(&topic);
        let subscription = match pump.subscribe(branch.clone()).await {
            Ok(subscription) => subscription,
            Err(error) => {
                let mut sessions = self.lock();
                if let Some(entry) = sessions.get_mut(session_id) {
                    if entry.epoch == epoch {
                        entry.topics.remove(&topic);
                    }
                }
                return Err(error);
            }
        };

        debug!(
            target: "relay.session",
            session_id = %session_id,
            topic = %topic,
            "Topic subscribed"
        );

        let coupler = Arc::clone(self);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            coupler
                .run_relay(session_id, epoch, topic, subscription, output)
                .await;
        });

        Ok(())
    }

    /// Unsubscribe a session from a topic.
    ///
    /// Cancels the topic's branch token; the relay task stops enumerating,
    /// detaches from the pump, and the upstream consumer stops if this was
    /// the topic's last subscriber process-wide. Unsubscribing a topic the
    /// session is not subscribed to is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] for an unknown session id.
    pub fn unsubscribe_topic(
        &self,
        session_id: &SessionId,
        topic: &TopicId,
    ) -> Result<(), RelayError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;

        if let Some(branch) = entry.topics.remove(topic) {
            branch.cancel();
            debug!(
                target: "relay.session",
                session_id = %session_id,
                topic = %topic,
                "Topic unsubscribed"
            );
        }
        Ok(())
    }

    /// Forward pump items into the session output until the branch token
    /// fires or the pump's sequence ends.
    async fn run_relay(
        self: Arc<Self>,
        session_id: SessionId,
        epoch: u64,
        topic: TopicId,
        mut subscription: TopicSubscription<T>,
        output: mpsc::Sender<Result<T, StreamFault>>,
    ) {
        let mut fault = None;

        loop {
            match subscription.next().await {
                Some(Ok(event)) => {
                    if output.send(Ok(event)).await.is_err() {
                        // Session output gone; teardown is already underway.
                        break;
                    }
                }
                Some(Err(stream_fault)) => {
                    fault = Some(stream_fault);
                    break;
                }
                None => break,
            }
        }

        subscription.detach().await;

        let ends_session = {
            let mut sessions = self.lock();
            match sessions.get_mut(&session_id) {
                Some(entry) if entry.epoch == epoch => {
                    entry.topics.remove(&topic);
                    fault.is_some() && entry.topics.is_empty()
                }
                _ => false,
            }
        };

        if let Some(fault) = fault {
            warn!(
                target: "relay.session",
                session_id = %session_id,
                topic = %topic,
                fault = %fault,
                ends_session,
                "Relay stopped on fault"
            );
            if ends_session {
                let _ = output.send(Err(fault)).await;
            }
        } else {
            debug!(
                target: "relay.session",
                session_id = %session_id,
                topic = %topic,
                "Relay stopped"
            );
        }
    }

    /// Tear the session down: cancel its root (cascading to every branch),
    /// complete its output, and drop it from the registry. Epoch-guarded so
    /// concurrent terminal triggers run this once.
    fn teardown(&self, session_id: &SessionId, epoch: u64) {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(session_id) {
                Some(entry) if entry.epoch == epoch => sessions.remove(session_id),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            entry.root.cancel();
            self.metrics.record_session_closed();
            info!(
                target: "relay.session",
                session_id = %session_id,
                user_id = %entry.user_id,
                "Session torn down"
            );
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Topics a session is currently subscribed to, if it exists.
    #[must_use]
    pub fn subscribed_topics(&self, session_id: &SessionId) -> Option<Vec<TopicId>> {
        let sessions = self.lock();
        sessions
            .get(session_id)
            .map(|entry| entry.topics.keys().cloned().collect())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry<T>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session's merged output stream.
///
/// Ends cleanly (`None`) when the session root is cancelled or the session
/// is re-opened elsewhere; ends with `Some(Err(_))` only when the session's
/// last remaining topic faulted. Either way, including on drop, the owning
/// session is torn down exactly once.
pub struct SessionStream<T: Clone + Send + 'static> {
    coupler: Arc<SessionCoupler<T>>,
    session_id: SessionId,
    epoch: u64,
    root: CancellationToken,
    rx: mpsc::Receiver<Result<T, StreamFault>>,
    finished: bool,
}

impl<T: Clone + Send + 'static> SessionStream<T> {
    /// The session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next merged event.
    ///
    /// Cross-topic interleaving is unspecified; per-topic order matches
    /// broker delivery order.
    pub async fn next(&mut self) -> Option<Result<T, RelayError>> {
        if self.finished {
            return None;
        }

        let item = tokio::select! {
            () = self.root.cancelled() => None,
            item = self.rx.recv() => item,
        };

        match item {
            Some(Ok(event)) => Some(Ok(event)),
            Some(Err(fault)) => {
                self.finish();
                Some(Err(RelayError::Stream(fault)))
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.coupler.teardown(&self.session_id, self.epoch);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for SessionStream<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

