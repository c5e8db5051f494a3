//! End-to-end tests wiring the write registry, pump registry, and session
//! coupler together over the in-memory broker, with real event envelopes as
//! the payload.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::context::CallContext;
use common::envelope::{EventBody, EventEnvelope, MessagePosted};
use common::types::{SessionId, TopicId, UserId};
use event_relay::{
    BrokerPort, FanOutPump, PumpRegistry, RelayConfig, RelayError, RelayMetrics, SessionCoupler,
    SessionStream, WriteStreamRegistry,
};
use relay_test_utils::{init_test_tracing, MockBroker};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Harness {
    broker: MockBroker<EventEnvelope>,
    writes: Arc<WriteStreamRegistry<EventEnvelope>>,
    pumps: Arc<PumpRegistry<EventEnvelope>>,
    coupler: Arc<SessionCoupler<EventEnvelope>>,
    metrics: Arc<RelayMetrics>,
}

fn harness() -> Harness {
    init_test_tracing();
    let broker = MockBroker::<EventEnvelope>::new();
    let config = RelayConfig {
        pull_timeout: Duration::from_millis(20),
        ..RelayConfig::default()
    };
    let metrics = RelayMetrics::new();
    let port: Arc<dyn BrokerPort<EventEnvelope>> = Arc::new(broker.clone());
    let writes = Arc::new(WriteStreamRegistry::new(
        Arc::clone(&port),
        Arc::clone(&metrics),
    ));
    let pumps = PumpRegistry::new(port, config.clone(), Arc::clone(&metrics));
    let coupler = SessionCoupler::new(Arc::clone(&pumps), config, Arc::clone(&metrics));
    Harness {
        broker,
        writes,
        pumps,
        coupler,
        metrics,
    }
}

fn message(topic: &TopicId, text: &str) -> EventEnvelope {
    EventEnvelope::new(
        topic.clone(),
        EventBody::MessagePosted(MessagePosted {
            message_id: text.to_string(),
            author: UserId::from("author-1"),
            content: text.to_string(),
        }),
    )
}

fn text_of(envelope: &EventEnvelope) -> &str {
    match &envelope.body {
        EventBody::MessagePosted(posted) => &posted.content,
        other => panic!("unexpected body: {other:?}"),
    }
}

async fn recv_text(stream: &mut SessionStream<EventEnvelope>) -> String {
    let item = timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("session stream did not yield in time")
        .expect("session stream ended")
        .expect("session stream faulted");
    text_of(&item).to_string()
}

#[tokio::test]
async fn test_events_flow_from_writer_to_session_in_order() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");

    let mut session = h
        .coupler
        .open_session(
            CallContext::new(SessionId::from("s1"), UserId::from("u1")),
            t1.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let writer = h.writes.acquire(&t1).await.unwrap();
    writer.fire(message(&t1, "e1")).await.unwrap();
    writer.fire(message(&t1, "e2")).await.unwrap();
    writer.fire(message(&t1, "e3")).await.unwrap();

    assert_eq!(recv_text(&mut session).await, "e1");
    assert_eq!(recv_text(&mut session).await, "e2");
    assert_eq!(recv_text(&mut session).await, "e3");

    h.writes.release(writer);
}

#[tokio::test]
async fn test_added_topic_delivers_only_to_its_subscribers() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");
    let t2 = TopicId::new("channel", "random");
    let s1 = SessionId::from("s1");

    let mut first = h
        .coupler
        .open_session(
            CallContext::new(s1.clone(), UserId::from("u1")),
            t1.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    h.coupler.subscribe_topic(&s1, t2.clone()).await.unwrap();

    let mut second = h
        .coupler
        .open_session(
            CallContext::new(SessionId::from("s2"), UserId::from("u2")),
            t1.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let w1 = h.writes.acquire(&t1).await.unwrap();
    let w2 = h.writes.acquire(&t2).await.unwrap();
    w2.fire(message(&t2, "f1")).await.unwrap();
    w1.fire(message(&t1, "e1")).await.unwrap();

    // The first session sees both topics, in any interleaving.
    let mut seen = HashSet::new();
    seen.insert(recv_text(&mut first).await);
    seen.insert(recv_text(&mut first).await);
    assert!(seen.contains("f1"));
    assert!(seen.contains("e1"));

    // The second session is only on t1 and must never see f1.
    assert_eq!(recv_text(&mut second).await, "e1");

    h.writes.release(w1);
    h.writes.release(w2);
}

#[tokio::test]
async fn test_sessions_share_one_consumer_per_topic() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");

    let mut streams = Vec::new();
    for i in 0..4 {
        let stream = h
            .coupler
            .open_session(
                CallContext::new(
                    SessionId::from(format!("s{i}").as_str()),
                    UserId::from("u1"),
                ),
                t1.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        streams.push(stream);
    }

    assert_eq!(h.broker.consumers_opened(), 1);
    assert_eq!(h.pumps.pump_count(), 1);

    let writer = h.writes.acquire(&t1).await.unwrap();
    writer.fire(message(&t1, "shared")).await.unwrap();
    for stream in &mut streams {
        assert_eq!(recv_text(stream).await, "shared");
    }
    h.writes.release(writer);
}

#[tokio::test]
async fn test_fault_on_one_topic_does_not_reach_other_topics() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");
    let t2 = TopicId::new("channel", "random");

    let mut on_faulted = h
        .coupler
        .open_session(
            CallContext::new(SessionId::from("s1"), UserId::from("u1")),
            t1.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut on_healthy = h
        .coupler
        .open_session(
            CallContext::new(SessionId::from("s2"), UserId::from("u2")),
            t2.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    h.broker.inject_pull_fault(&t1, "stream reset");

    let fault = timeout(Duration::from_secs(1), on_faulted.next())
        .await
        .expect("faulted session did not yield in time");
    assert!(matches!(fault, Some(Err(RelayError::Stream(_)))));
    assert_eq!(h.metrics.pump_faults(), 1);

    // The other topic's pump is untouched.
    let writer = h.writes.acquire(&t2).await.unwrap();
    writer.fire(message(&t2, "unaffected")).await.unwrap();
    assert_eq!(recv_text(&mut on_healthy).await, "unaffected");
    h.writes.release(writer);
}

#[tokio::test]
async fn test_concurrent_writers_share_one_publisher() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");

    let mut session = h
        .coupler
        .open_session(
            CallContext::new(SessionId::from("s1"), UserId::from("u1")),
            t1.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Pin the entry so the count stays above zero for the whole burst.
    let anchor = h.writes.acquire(&t1).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let writes = Arc::clone(&h.writes);
        let topic = t1.clone();
        tasks.spawn(async move {
            let handle = writes.acquire(&topic).await.unwrap();
            handle.fire(message(&topic, &format!("w{i}"))).await.unwrap();
            writes.release(handle);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    assert_eq!(h.broker.publishers_created(), 1);
    h.writes.release(anchor);
    assert!(h.writes.is_empty());

    let mut seen = HashSet::new();
    for _ in 0..8 {
        seen.insert(recv_text(&mut session).await);
    }
    assert_eq!(seen.len(), 8);
}

#[tokio::test]
async fn test_idle_pump_survives_subscriber_churn() {
    let h = harness();
    let t1 = TopicId::new("channel", "general");

    let pump: Arc<FanOutPump<EventEnvelope>> = h.pumps.get_or_create(&t1);

    for _ in 0..3 {
        let sub = pump.subscribe(CancellationToken::new()).await.unwrap();
        sub.detach().await;
    }

    // One pump throughout; one consumer per active stretch.
    assert_eq!(h.pumps.pump_count(), 1);
    assert_eq!(h.broker.consumers_opened(), 3);
    assert_eq!(h.broker.consumers_closed(), 3);
    assert!(!pump.has_upstream());
}
