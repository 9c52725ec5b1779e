//! Retry/ack delivery assurance against a lossy, unconfirmed transport.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use postlink_core::error::ErrorKind;
use postlink_engine::{HandlerReply, ListenOptions, RequestEvent, RpcValue, SendOptions};

use common::{ctx, World};

#[tokio::test]
async fn never_acked_request_times_out() {
    let w = World::new();
    let a = w.engine("win-a", "http://a.example", World::fast_cfg());
    // Registered as live, but no inbox and no engine: nothing ever ACKs.
    w.contexts.register(ctx("black-hole"), "http://hole.example");

    let err = a
        .send(
            &ctx("black-hole"),
            "ping",
            RpcValue::Null,
            SendOptions {
                timeout_ms: Some(120),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn retries_stop_on_ack_even_while_response_is_pending() {
    let w = World::new();
    let a = w.engine("win-a", "http://a.example", World::fast_cfg());
    let b = w.engine("win-b", "http://b.example", World::fast_cfg());

    let _guard = b.on("linger", ListenOptions::default(), |_ev: RequestEvent| {
        HandlerReply::future(async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(RpcValue::Bool(true))
        })
    });

    let send = tokio::spawn({
        let target = ctx("win-b");
        async move {
            a.send(&target, "linger", RpcValue::Null, SendOptions::default())
                .await
        }
    });

    // Let the request land and the ACK come back, then watch the wire: with
    // retries stopped, no further traffic reaches win-b until the RESPONSE.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let settled = w.hub.delivered_to(&ctx("win-b"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(w.hub.delivered_to(&ctx("win-b")), settled);

    assert!(send.await.unwrap().is_ok());
}

#[tokio::test]
async fn lost_deliveries_are_covered_by_retries() {
    let w = World::new();
    let a = w.engine("win-a", "http://a.example", World::fast_cfg());
    let b = w.engine("win-b", "http://b.example", World::fast_cfg());

    let _guard = b.on("echo", ListenOptions::default(), |ev: RequestEvent| {
        HandlerReply::value(ev.data)
    });

    // First two deliveries to win-b vanish; the retry loop covers them.
    w.hub.lose_next(&ctx("win-b"), 2);

    let result = a
        .send(
            &ctx("win-b"),
            "echo",
            RpcValue::from_json(json!("still here")),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), json!("still here"));
}

#[tokio::test]
async fn duplicate_request_after_lost_ack_dispatches_once() {
    let w = World::new();
    let a = w.engine("win-a", "http://a.example", World::fast_cfg());
    let b = w.engine("win-b", "http://b.example", World::fast_cfg());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_handler = fired.clone();
    let _guard = b.on("touchy", ListenOptions::default(), move |_ev: RequestEvent| {
        fired_in_handler.fetch_add(1, Ordering::SeqCst);
        // slow enough that the sender retransmits while the handler runs
        HandlerReply::future(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(RpcValue::Bool(true))
        })
    });

    // Drop the first delivery back to win-a (the ACK). win-a retransmits,
    // win-b sees a duplicate REQUEST id: re-ACK, never re-dispatch.
    w.hub.lose_next(&ctx("win-a"), 1);

    let result = a
        .send(&ctx("win-b"), "touchy", RpcValue::Null, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), json!(true));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_timeout_waits_past_the_default_window() {
    let w = World::new();
    // Default window far shorter than the handler; the explicit 0 means the
    // sender keeps waiting anyway.
    let a = w.engine(
        "win-a",
        "http://a.example",
        postlink_engine::config::EngineConfig {
            retry_interval_ms: 10,
            response_timeout_ms: 100,
        },
    );
    let b = w.engine("win-b", "http://b.example", World::fast_cfg());

    let _guard = b.on("glacial", ListenOptions::default(), |_ev: RequestEvent| {
        HandlerReply::future(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(RpcValue::Bool(true))
        })
    });

    let result = a
        .send(
            &ctx("win-b"),
            "glacial",
            RpcValue::Null,
            SendOptions {
                timeout_ms: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), json!(true));
}

#[tokio::test]
async fn default_timeout_applies_when_unset() {
    let w = World::new();
    let a = w.engine(
        "win-a",
        "http://a.example",
        postlink_engine::config::EngineConfig {
            retry_interval_ms: 10,
            response_timeout_ms: 100,
        },
    );
    w.contexts.register(ctx("black-hole"), "http://hole.example");

    let err = a
        .send(&ctx("black-hole"), "ping", RpcValue::Null, SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.to_string().contains("100"));
}
