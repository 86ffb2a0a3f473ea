//! End-to-end duplex sessions: the responder streams greetings until the
//! initiator's health turns `stopped`.
//!
//! Real sockets and wall-clock time, so reply counts are asserted as
//! ranges around the nominal value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde_json::Value;

use duplex_watchdog::config::WatchdogMode;
use duplex_watchdog::models::health::HealthState;
use duplex_watchdog::models::message::Message;
use duplex_watchdog::roles::{HEALTH_POLL_ROUTE, HEALTH_ROUTE};
use duplex_watchdog::router::Router;
use duplex_watchdog::{AppError, Result};

use super::test_helpers::{
    connect_initiator, connect_with_routes, eventually, fast_responder, start_responder,
};

const DEADLINE: Duration = Duration::from_secs(5);

async fn collect_greetings(
    initiator: &duplex_watchdog::roles::initiator::Initiator,
    client_id: u32,
) -> Vec<Message> {
    let replies = initiator.greetings(client_id).await.expect("session opens");
    tokio::time::timeout(DEADLINE, replies.map(|reply| reply.expect("reply")).collect())
        .await
        .expect("session ends on its own")
}

fn assert_well_formed(messages: &[Message], client_id: u32) {
    let session_id = &messages[0].session_id;
    for (position, message) in messages.iter().enumerate() {
        assert_eq!(&message.session_id, session_id);
        assert_eq!(message.sequence, position as u64);
        let text = message.payload.as_str().expect("text payload");
        assert!(
            text.starts_with(&format!("Hello Client #{client_id} @ ")),
            "unexpected greeting {text}"
        );
    }
}

#[tokio::test]
async fn subscribed_health_ends_the_session() {
    // Replies every 100ms; health ticks every 40ms and stops at 250ms.
    let responder = start_responder(fast_responder(WatchdogMode::Subscribe)).await;
    let (initiator, _) = connect_initiator(&responder, Duration::from_millis(250), None).await;

    let messages = collect_greetings(&initiator, 1).await;

    assert!((2..=3).contains(&messages.len()), "got {} replies", messages.len());
    assert_well_formed(&messages, 1);
}

#[tokio::test]
async fn polled_health_ends_the_session() {
    let responder = start_responder(fast_responder(WatchdogMode::Poll)).await;
    let (initiator, monitor) =
        connect_initiator(&responder, Duration::from_millis(250), None).await;

    let messages = collect_greetings(&initiator, 1).await;

    assert!((2..=4).contains(&messages.len()), "got {} replies", messages.len());
    assert_well_formed(&messages, 1);
    assert_eq!(monitor.tracked_sessions(), 0, "stopped session is forgotten");
}

#[tokio::test]
async fn reply_limit_completes_before_health_stops() {
    let mut settings = fast_responder(WatchdogMode::Subscribe);
    settings.reply_interval = Duration::from_millis(30);
    settings.reply_limit = Some(3);
    let responder = start_responder(settings).await;
    let (initiator, _) = connect_initiator(&responder, Duration::from_secs(60), None).await;

    let messages = collect_greetings(&initiator, 7).await;

    assert_eq!(messages.len(), 3);
    assert_well_formed(&messages, 7);
}

#[tokio::test]
async fn concurrent_clients_get_independent_sessions() {
    let mut settings = fast_responder(WatchdogMode::Subscribe);
    settings.reply_interval = Duration::from_millis(30);
    settings.reply_limit = Some(2);
    let responder = start_responder(settings).await;
    let (initiator, _) = connect_initiator(&responder, Duration::from_secs(60), None).await;

    let merged: Vec<(u32, Message)> = tokio::time::timeout(
        DEADLINE,
        initiator
            .launch_clients()
            .map(|(client_id, reply)| (client_id, reply.expect("reply")))
            .collect::<Vec<_>>(),
    )
    .await
    .expect("all clients finish");

    let mut by_client: HashMap<u32, Vec<Message>> = HashMap::new();
    for (client_id, message) in merged {
        by_client.entry(client_id).or_default().push(message);
    }

    assert_eq!(by_client.len(), 2);
    for (client_id, messages) in &by_client {
        assert_eq!(messages.len(), 2);
        assert_well_formed(messages, *client_id);
    }
    assert_ne!(by_client[&1][0].session_id, by_client[&2][0].session_id);
}

#[tokio::test]
async fn abandoned_session_releases_both_ends() {
    let responder = start_responder(fast_responder(WatchdogMode::Subscribe)).await;
    let (initiator, _) = connect_initiator(&responder, Duration::from_secs(60), None).await;

    let mut replies = Box::pin(initiator.greetings(1).await.expect("session opens"));
    assert!(replies.next().await.expect("first").is_ok());
    drop(replies);

    // The responder cancels its health subscription along with the session.
    assert!(
        eventually(DEADLINE, || initiator.peer().open_streams() == 0).await,
        "{} streams still open",
        initiator.peer().open_streams()
    );
}

fn verdict(state: HealthState) -> Result<Value> {
    Ok(serde_json::to_value(state)?)
}

fn transient() -> AppError {
    AppError::Handler("transient".into())
}

/// `health` stream whose first subscription fails after one `started`;
/// later subscriptions report `stopped` after 150ms.
fn flaky_subscription(subscriptions: &Arc<AtomicU32>) -> Router {
    let subscriptions = Arc::clone(subscriptions);
    Router::new().stream(HEALTH_ROUTE, move |_request| {
        if subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
            stream::iter(vec![verdict(HealthState::started()), Err(transient())]).boxed()
        } else {
            stream::once(async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                verdict(HealthState::stopped())
            })
            .boxed()
        }
    })
}

/// `health.poll` failing `failures` times, then reporting `stopped`.
fn flaky_polls(polls: &Arc<AtomicU32>, failures: u32) -> Router {
    let polls = Arc::clone(polls);
    Router::new().response(HEALTH_POLL_ROUTE, move |_request| {
        let outcome = if polls.fetch_add(1, Ordering::SeqCst) < failures {
            Err(transient())
        } else {
            verdict(HealthState::stopped())
        };
        std::future::ready(outcome)
    })
}

#[tokio::test]
async fn failed_subscription_is_reopened_until_health_stops() {
    let responder = start_responder(fast_responder(WatchdogMode::Subscribe)).await;
    let subscriptions = Arc::new(AtomicU32::new(0));
    let initiator = connect_with_routes(&responder, flaky_subscription(&subscriptions)).await;

    let messages = collect_greetings(&initiator, 3).await;

    assert_eq!(subscriptions.load(Ordering::SeqCst), 2, "one resubscription");
    assert!(messages.len() <= 3, "got {} replies", messages.len());
    if !messages.is_empty() {
        assert_well_formed(&messages, 3);
    }
    assert!(eventually(DEADLINE, || initiator.peer().open_streams() == 0).await);
}

#[tokio::test]
async fn failed_polls_do_not_disable_the_watchdog() {
    let responder = start_responder(fast_responder(WatchdogMode::Poll)).await;
    let polls = Arc::new(AtomicU32::new(0));
    let initiator = connect_with_routes(&responder, flaky_polls(&polls, 3)).await;

    let messages = collect_greetings(&initiator, 4).await;

    assert!(polls.load(Ordering::SeqCst) >= 4, "polled past the failures");
    assert!(messages.len() <= 3, "got {} replies", messages.len());
    if !messages.is_empty() {
        assert_well_formed(&messages, 4);
    }
}

#[tokio::test]
async fn completed_polled_sessions_are_released() {
    let mut settings = fast_responder(WatchdogMode::Poll);
    settings.reply_interval = Duration::from_millis(30);
    settings.reply_limit = Some(3);
    let responder = start_responder(settings).await;
    let (initiator, monitor) = connect_initiator(&responder, Duration::from_secs(60), None).await;

    for client_id in 1..=3 {
        let messages = collect_greetings(&initiator, client_id).await;
        assert_eq!(messages.len(), 3);
    }

    // Health never stopped these sessions; they age out once polls cease.
    assert!(
        eventually(DEADLINE, || monitor.tracked_sessions() == 0).await,
        "{} sessions still tracked",
        monitor.tracked_sessions()
    );
}
