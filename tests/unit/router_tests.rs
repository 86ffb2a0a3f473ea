//! Route table: resolution order, destination variables, handler kinds.

use std::collections::HashMap;

use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use duplex_watchdog::protocol::frame::{Interaction, Metadata};
use duplex_watchdog::router::{Invocation, Request, Router};
use duplex_watchdog::transport::{spawn_connection, ConnectionContext, Requester, Side};
use duplex_watchdog::AppError;

#[derive(serde::Deserialize)]
struct Order {
    qty: u32,
}

/// A requester on an in-memory pipe nobody reads from.
fn idle_peer(ct: &CancellationToken) -> Requester {
    let (local, _remote) = tokio::io::duplex(1024);
    spawn_connection(local, Side::Acceptor, ConnectionContext::default(), ct)
}

fn request(peer: Requester, route: &str, vars: HashMap<String, String>, payload: Value) -> Request {
    Request {
        stream_id: 1,
        interaction: Interaction::RequestResponse,
        route: route.to_owned(),
        vars,
        metadata: Metadata::default(),
        payload,
        principal: None,
        peer,
    }
}

fn echo_router() -> Router {
    Router::new()
        .response("orders.{id}", |req| async move { req.var("id").map(|id| json!(id)) })
        .response("orders.latest", |_req| async { Ok(json!("latest")) })
        .require_auth("orders.{id}")
}

#[test]
fn exact_route_wins_over_template() {
    let router = echo_router();

    let resolved = router.resolve("orders.latest").expect("resolves");
    assert!(resolved.vars.is_empty());
    assert!(!resolved.requires_auth);
}

#[test]
fn template_captures_variables_and_auth_flag() {
    let router = echo_router();

    let resolved = router.resolve("orders.42").expect("resolves");
    assert_eq!(resolved.vars.get("id").map(String::as_str), Some("42"));
    assert!(resolved.requires_auth);
}

#[test]
fn unknown_destination_names_route() {
    let router = echo_router();

    let err = router.resolve("invoices.1").err().expect("no match");
    assert_eq!(
        err,
        AppError::Route("no handler for destination 'invoices.1'".into())
    );
}

#[test]
fn len_counts_exact_and_templated_routes() {
    assert!(Router::new().is_empty());
    assert_eq!(echo_router().len(), 2);
}

#[test]
fn re_registering_a_template_replaces_it() {
    let router = Router::new()
        .response("a.{x}", |_req| async { Ok(json!(1)) })
        .response("a.{x}", |_req| async { Ok(json!(2)) });
    assert_eq!(router.len(), 1);
}

#[test]
fn setup_handlers_are_looked_up_by_route() {
    let router = Router::new().on_setup("connect", |_setup, _principal, _peer| {});
    assert!(router.setup_handler("connect").is_some());
    assert!(router.setup_handler("other").is_none());
}

#[tokio::test]
async fn response_handler_yields_single_reply() {
    let ct = CancellationToken::new();
    let router = echo_router();
    let resolved = router.resolve("orders.7").expect("resolves");

    let req = request(idle_peer(&ct), "orders.7", resolved.vars, Value::Null);
    let Invocation::Replies(mut replies) = resolved.handler.invoke(req, None) else {
        panic!("response handlers produce replies");
    };
    assert_eq!(replies.next().await, Some(Ok(json!("7"))));
    assert_eq!(replies.next().await, None);
    ct.cancel();
}

#[tokio::test]
async fn channel_handler_without_inbound_uses_payload() {
    let ct = CancellationToken::new();
    let router = Router::new().channel("shout", |_req, inbound| {
        inbound.map(|v| Ok(json!(v.as_str().unwrap_or_default().to_uppercase())))
    });
    let resolved = router.resolve("shout").expect("resolves");

    let req = request(idle_peer(&ct), "shout", HashMap::new(), json!("hi"));
    let Invocation::Replies(replies) = resolved.handler.invoke(req, None) else {
        panic!("channel handlers produce replies");
    };
    let all: Vec<_> = replies.collect().await;
    assert_eq!(all, vec![Ok(json!("HI"))]);
    ct.cancel();
}

#[tokio::test]
async fn channel_handler_reads_inbound_stream() {
    let ct = CancellationToken::new();
    let router = Router::new().channel("count", |_req, inbound| {
        inbound.enumerate().map(|(i, _)| Ok(json!(i)))
    });
    let resolved = router.resolve("count").expect("resolves");

    let req = request(idle_peer(&ct), "count", HashMap::new(), json!("first"));
    let inbound = stream::iter(vec![json!("a"), json!("b"), json!("c")]).boxed();
    let Invocation::Replies(replies) = resolved.handler.invoke(req, Some(inbound)) else {
        panic!("channel handlers produce replies");
    };
    let all: Vec<_> = replies.collect().await;
    assert_eq!(all, vec![Ok(json!(0)), Ok(json!(1)), Ok(json!(2))]);
    ct.cancel();
}

#[tokio::test]
async fn fire_and_forget_handler_is_detached() {
    let ct = CancellationToken::new();
    let router = Router::new().fire_and_forget("log", |_req| async {});
    let resolved = router.resolve("log").expect("resolves");

    let req = request(idle_peer(&ct), "log", HashMap::new(), Value::Null);
    let Invocation::Detached(work) = resolved.handler.invoke(req, None) else {
        panic!("fire-and-forget handlers are detached");
    };
    work.await;
    ct.cancel();
}

#[tokio::test]
async fn destination_variables_parse_or_fail() {
    let ct = CancellationToken::new();
    let vars = HashMap::from([("id".to_owned(), "abc".to_owned())]);
    let req = request(idle_peer(&ct), "orders.abc", vars, json!({"qty": 2}));

    assert_eq!(req.var("id").expect("present"), "abc");
    assert!(matches!(req.parse_var::<i64>("id"), Err(AppError::Route(_))));
    assert!(matches!(req.var("missing"), Err(AppError::Route(_))));
    assert_eq!(req.payload_text(), r#"{"qty":2}"#);

    let order: Order = req.payload_as().expect("payload decodes");
    assert_eq!(order.qty, 2);
    ct.cancel();
}
