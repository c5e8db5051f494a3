//! Unit tests for the session coupler, run as an integration test so the
//! mock broker and the crate share one `event_relay` instance.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::context::CallContext;
use common::types::{SessionId, TopicId, UserId};
use event_relay::{
    PumpRegistry, RelayConfig, RelayError, RelayMetrics, SessionCoupler, SessionStream,
    StreamFault,
};
use relay_test_utils::MockBroker;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn t1() -> TopicId {
    TopicId::new("channel", "general")
}

fn t2() -> TopicId {
    TopicId::new("channel", "random")
}

fn ctx(session: &str) -> CallContext {
    CallContext::new(SessionId::from(session), UserId::from("user-1"))
}

fn setup() -> (MockBroker<String>, Arc<SessionCoupler<String>>) {
    let broker = MockBroker::<String>::new();
    let config = RelayConfig {
        pull_timeout: Duration::from_millis(20),
        ..RelayConfig::default()
    };
    let metrics = RelayMetrics::new();
    let pumps = PumpRegistry::new(
        Arc::new(broker.clone()),
        config.clone(),
        Arc::clone(&metrics),
    );
    let coupler = SessionCoupler::new(pumps, config, metrics);
    (broker, coupler)
}

async fn recv(stream: &mut SessionStream<String>) -> Option<Result<String, RelayError>> {
    timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("session stream did not yield in time")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_session_receives_initial_topic_events() {
    relay_test_utils::init_test_tracing();
    let (broker, coupler) = setup();

    let mut stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(coupler.session_count(), 1);

    broker.publish(&t1(), "hello".to_string());
    assert!(matches!(recv(&mut stream).await, Some(Ok(event)) if event == "hello"));
}

#[tokio::test]
async fn test_merged_stream_carries_all_subscribed_topics() {
    let (broker, coupler) = setup();
    let session = SessionId::from("s1");

    let mut stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    coupler.subscribe_topic(&session, t2()).await.unwrap();

    broker.publish(&t1(), "from-general".to_string());
    broker.publish(&t2(), "from-random".to_string());

    // Cross-topic interleaving is unspecified; compare as a set.
    let mut seen = HashSet::new();
    seen.insert(recv(&mut stream).await.unwrap().unwrap());
    seen.insert(recv(&mut stream).await.unwrap().unwrap());
    assert!(seen.contains("from-general"));
    assert!(seen.contains("from-random"));
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let (broker, coupler) = setup();
    let session = SessionId::from("s1");

    let _stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    coupler.subscribe_topic(&session, t1()).await.unwrap();
    coupler.subscribe_topic(&session, t1()).await.unwrap();

    assert_eq!(coupler.subscribed_topics(&session).unwrap().len(), 1);
    assert_eq!(broker.consumers_opened(), 1);
}

#[tokio::test]
async fn test_unknown_session_is_an_error() {
    let (_broker, coupler) = setup();
    let unknown = SessionId::from("nope");

    let result = coupler.subscribe_topic(&unknown, t1()).await;
    assert!(matches!(result, Err(RelayError::SessionNotFound(_))));

    let result = coupler.unsubscribe_topic(&unknown, &t1());
    assert!(matches!(result, Err(RelayError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_unsubscribe_stops_topic_but_keeps_session() {
    let (broker, coupler) = setup();
    let session = SessionId::from("s1");

    let _stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();

    coupler.unsubscribe_topic(&session, &t1()).unwrap();
    // Unsubscribing a topic the session does not hold is a no-op.
    coupler.unsubscribe_topic(&session, &t2()).unwrap();

    eventually(|| broker.consumers_closed() == 1).await;
    assert_eq!(coupler.session_count(), 1);
    assert!(coupler.subscribed_topics(&session).unwrap().is_empty());
}

#[tokio::test]
async fn test_reopen_same_session_id_is_last_writer_wins() {
    let (broker, coupler) = setup();

    let mut first = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    let mut second = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();

    // The first instance ends cleanly; the second owns the id.
    assert!(recv(&mut first).await.is_none());
    assert_eq!(coupler.session_count(), 1);

    broker.publish(&t1(), "for-second".to_string());
    assert!(matches!(recv(&mut second).await, Some(Ok(event)) if event == "for-second"));
}

#[tokio::test]
async fn test_external_cancellation_cascades() {
    let (broker, coupler) = setup();
    let cancel = CancellationToken::new();

    let mut stream = coupler
        .open_session(ctx("s1"), t1(), cancel.clone())
        .await
        .unwrap();
    assert_eq!(broker.consumers_opened(), 1);

    cancel.cancel();
    assert!(recv(&mut stream).await.is_none());

    // Teardown cascades: session gone, relay detached, consumer closed.
    assert_eq!(coupler.session_count(), 0);
    eventually(|| broker.consumers_closed() == 1).await;
}

#[tokio::test]
async fn test_dropping_stream_tears_the_session_down() {
    let (broker, coupler) = setup();

    let stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    drop(stream);

    assert_eq!(coupler.session_count(), 0);
    eventually(|| broker.consumers_closed() == 1).await;
}

#[tokio::test]
async fn test_open_fails_cleanly_when_consumer_cannot_open() {
    let (broker, coupler) = setup();

    broker.fail_next_consumer_open(&t1(), "broker down");
    let result = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RelayError::Provisioning { .. })));
    assert_eq!(coupler.session_count(), 0);
}

#[tokio::test]
async fn test_fault_on_last_topic_ends_session_with_error() {
    let (broker, coupler) = setup();

    let mut stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();

    broker.inject_pull_fault(&t1(), "stream reset");
    assert!(matches!(
        recv(&mut stream).await,
        Some(Err(RelayError::Stream(StreamFault::Upstream { .. })))
    ));
    assert!(recv(&mut stream).await.is_none());
    assert_eq!(coupler.session_count(), 0);
}

#[tokio::test]
async fn test_fault_on_one_topic_leaves_others_running() {
    let (broker, coupler) = setup();
    let session = SessionId::from("s1");

    let mut stream = coupler
        .open_session(ctx("s1"), t1(), CancellationToken::new())
        .await
        .unwrap();
    coupler.subscribe_topic(&session, t2()).await.unwrap();

    broker.inject_pull_fault(&t1(), "stream reset");
    eventually(|| {
        coupler
            .subscribed_topics(&session)
            .is_some_and(|topics| topics == vec![t2()])
    })
    .await;

    // The surviving topic still delivers.
    broker.publish(&t2(), "still-alive".to_string());
    assert!(matches!(recv(&mut stream).await, Some(Ok(event)) if event == "still-alive"));
    assert_eq!(coupler.session_count(), 1);
}
