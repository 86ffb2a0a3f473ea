//! Duplex session coordinator on a paused clock.
//!
//! Replies tick once per second. A watchdog stop injected at tick `k`
//! races the reply due at the same instant and must win it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use duplex_watchdog::duplex::{ticks, DuplexSession, TimedSequence, Watchdog};
use duplex_watchdog::models::health::HealthState;
use duplex_watchdog::models::session::{CloseReason, SessionStatus};
use duplex_watchdog::{AppError, Result};

const SECOND: Duration = Duration::from_secs(1);

/// Watchdog polled every second that reports `stopped` from tick `stop_tick`.
fn stop_at_tick(stop_tick: u32) -> Watchdog {
    let mut polls = 0u32;
    Watchdog::polling(
        move || {
            polls += 1;
            std::future::ready(Ok(if polls >= stop_tick {
                HealthState::stopped()
            } else {
                HealthState::started()
            }))
        },
        SECOND,
    )
}

/// Watchdog that reports `stopped` once strictly more than `after` has
/// elapsed. Replies share this clock, so `>=` would tie with the reply at
/// `after` and the stop would win.
fn stop_past(after: Duration) -> Watchdog {
    let start = Instant::now();
    Watchdog::polling(
        move || {
            std::future::ready(Ok(if start.elapsed() > after {
                HealthState::stopped()
            } else {
                HealthState::started()
            }))
        },
        SECOND,
    )
}

async fn drain<S>(session: &mut DuplexSession<S>) -> Vec<u64>
where
    S: futures_util::Stream<Item = Result<u64>> + Unpin,
{
    let mut out = Vec::new();
    while let Some(reply) = session.next().await {
        out.push(reply.expect("reply"));
    }
    out
}

#[tokio::test(start_paused = true)]
async fn stop_at_tick_k_keeps_only_earlier_replies() {
    for k in 1..=6u32 {
        let mut session = DuplexSession::new("s", ticks(SECOND).with_limit(10), stop_at_tick(k));
        let replies = drain(&mut session).await;

        let expected: Vec<u64> = (0..u64::from(k - 1)).collect();
        assert_eq!(replies, expected, "stop injected at tick {k}");
        assert_eq!(session.handle().close_reason(), Some(CloseReason::Stopped));
    }
}

#[tokio::test(start_paused = true)]
async fn finite_replies_complete_when_watchdog_never_fires() {
    let mut session = DuplexSession::new("s", ticks(SECOND).with_limit(4), Watchdog::never());
    let handle = session.handle();

    let replies = drain(&mut session).await;

    assert_eq!(replies, vec![0, 1, 2, 3]);
    assert_eq!(handle.status(), SessionStatus::Closed);
    assert_eq!(handle.close_reason(), Some(CloseReason::Completed));
    assert_eq!(session.delivered(), 4);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sessions_stop_independently() {
    let first = tokio::spawn(async {
        let mut session = DuplexSession::new("a", ticks(SECOND).with_limit(20), stop_at_tick(3));
        drain(&mut session).await.len()
    });
    let second = tokio::spawn(async {
        let mut session = DuplexSession::new("b", ticks(SECOND).with_limit(20), stop_at_tick(6));
        drain(&mut session).await.len()
    });

    assert_eq!(first.await.expect("first session"), 2);
    assert_eq!(second.await.expect("second session"), 5);
}

#[tokio::test(start_paused = true)]
async fn failing_health_checks_let_replies_finish() {
    let polls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&polls);
    let watchdog = Watchdog::polling(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<HealthState, _>(AppError::Disconnected("no peer".into())))
        },
        SECOND,
    );
    let mut session = DuplexSession::new("s", ticks(SECOND).with_limit(5), watchdog);

    let replies = drain(&mut session).await;

    assert_eq!(replies.len(), 5);
    assert_eq!(session.handle().close_reason(), Some(CloseReason::Completed));
    assert!(polls.load(Ordering::SeqCst) >= 4, "watchdog kept polling");
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_closed_session_is_a_no_op() {
    let mut session = DuplexSession::new("s", ticks(SECOND).with_limit(1), Watchdog::never());
    let handle = session.handle();
    drain(&mut session).await;
    assert!(handle.is_closed());

    assert!(!handle.cancel());
    assert!(!handle.cancel());
    assert_eq!(handle.close_reason(), Some(CloseReason::Completed));
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_an_open_session() {
    let mut session = DuplexSession::new("s", ticks(SECOND), Watchdog::never());
    let handle = session.handle();

    assert_eq!(session.next().await, Some(Ok(0)));
    assert!(handle.cancel());
    assert_eq!(session.next().await, None);

    assert_eq!(handle.close_reason(), Some(CloseReason::Cancelled));
    assert!(!handle.cancel());
}

#[tokio::test(start_paused = true)]
async fn three_second_health_yields_three_replies() {
    let start = Instant::now();
    let greeting = "Client #1".to_owned();
    let replies = TimedSequence::new(
        move || -> Result<String> {
            Ok(format!("Hello {greeting} @ {}", start.elapsed().as_secs()))
        },
        SECOND,
    );
    let mut session = DuplexSession::new("s", replies, stop_past(Duration::from_secs(3)));

    let mut received = Vec::new();
    while let Some(reply) = session.next().await {
        received.push(reply.expect("reply"));
    }

    assert_eq!(
        received,
        vec![
            "Hello Client #1 @ 1",
            "Hello Client #1 @ 2",
            "Hello Client #1 @ 3",
        ]
    );
    assert_eq!(session.handle().close_reason(), Some(CloseReason::Stopped));
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_the_session() {
    let disconnect = CancellationToken::new();
    let mut session = DuplexSession::new("s", ticks(SECOND), Watchdog::never())
        .on_disconnect(disconnect.clone());

    assert_eq!(session.next().await, Some(Ok(0)));
    disconnect.cancel();
    assert_eq!(session.next().await, None);
    assert_eq!(session.handle().close_reason(), Some(CloseReason::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_watchdog_polling() {
    let polls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&polls);
    let watchdog = Watchdog::polling(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(HealthState::started()))
        },
        SECOND,
    );
    let disconnect = CancellationToken::new();
    let mut session = DuplexSession::new("s", ticks(SECOND), watchdog).on_disconnect(disconnect.clone());

    session.next().await;
    session.next().await;
    disconnect.cancel();
    assert!(session.next().await.is_none());

    let seen = polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(polls.load(Ordering::SeqCst), seen, "no orphaned watchdog timer");
}

#[tokio::test(start_paused = true)]
async fn generator_failure_closes_as_failed() {
    let mut n = 0u64;
    let replies = TimedSequence::new(
        move || -> Result<u64> {
            n += 1;
            if n == 2 {
                Err(AppError::Handler("reply broke".into()))
            } else {
                Ok(n)
            }
        },
        SECOND,
    );
    let mut session = DuplexSession::new("s", replies, Watchdog::never());

    assert_eq!(session.next().await, Some(Ok(1)));
    assert_eq!(
        session.next().await,
        Some(Err(AppError::Handler("reply broke".into())))
    );
    assert_eq!(session.next().await, None);
    assert_eq!(session.handle().close_reason(), Some(CloseReason::Failed));
}

#[tokio::test(start_paused = true)]
async fn dropping_an_open_session_marks_it_cancelled() {
    let session = DuplexSession::new("s", ticks(SECOND), Watchdog::never());
    let handle = session.handle();
    assert_eq!(handle.status(), SessionStatus::Open);
    assert_eq!(handle.id(), "s");

    drop(session);

    assert!(handle.is_closed());
    assert_eq!(handle.close_reason(), Some(CloseReason::Cancelled));
}

#[test]
fn status_transitions_only_move_forward() {
    use SessionStatus::{Closed, Open, Terminating};

    assert!(Open.can_transition_to(Terminating));
    assert!(Open.can_transition_to(Closed));
    assert!(Terminating.can_transition_to(Closed));
    assert!(!Closed.can_transition_to(Open));
    assert!(!Closed.can_transition_to(Terminating));
    assert!(!Terminating.can_transition_to(Open));
}
