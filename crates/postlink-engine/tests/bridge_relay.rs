//! Bridge relay: indirect delivery between contexts that cannot message
//! each other directly.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use postlink_core::error::{ErrorKind, PostlinkError};
use postlink_core::origin::DomainPattern;
use postlink_engine::bridge::BridgeRelay;
use postlink_engine::{HandlerReply, ListenOptions, RequestEvent, RpcValue, SendOptions};

use common::{ctx, World};

fn spawn_relay(w: &World, id: &str, origin: &str) -> BridgeRelay {
    let relay_ctx = ctx(id);
    let (post, inbound) = w.hub.attach(&relay_ctx, origin, 64);
    BridgeRelay::spawn(relay_ctx, origin, post, inbound, w.contexts.clone())
}

#[tokio::test]
async fn bridged_request_resolves_like_a_direct_one() {
    let w = World::new();
    let p = w.engine("opener", "http://parent.example", World::fast_cfg());
    let q = w.engine("popup", "http://popup.example", World::fast_cfg());
    let _relay = spawn_relay(&w, "relay", "http://popup.example");

    // opener and popup cannot message each other directly
    w.hub.block(&ctx("opener"), &ctx("popup"));
    w.hub.block(&ctx("popup"), &ctx("opener"));

    p.open_bridge(&ctx("popup"), &ctx("relay"));

    let _guard = q.on("greet", ListenOptions::default(), |ev: RequestEvent| {
        let who = ev
            .data
            .get("who")
            .and_then(|v| v.as_json())
            .unwrap_or(json!(null));
        HandlerReply::value(RpcValue::from_json(json!({ "hello": who })))
    });

    let result = p
        .send(
            &ctx("popup"),
            "greet",
            RpcValue::from_json(json!({ "who": "opener" })),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), json!({ "hello": "opener" }));
}

#[tokio::test]
async fn function_references_survive_the_bridge() {
    let w = World::new();
    let p = w.engine("opener", "http://parent.example", World::fast_cfg());
    let q = w.engine("popup", "http://popup.example", World::fast_cfg());
    let _relay = spawn_relay(&w, "relay", "http://popup.example");

    w.hub.block(&ctx("opener"), &ctx("popup"));
    w.hub.block(&ctx("popup"), &ctx("opener"));
    p.open_bridge(&ctx("popup"), &ctx("relay"));

    // The proxy minted on the popup side must route its CALL back through
    // the relay; a direct post to the opener would never arrive.
    let _guard = q.on("run", ListenOptions::default(), |ev: RequestEvent| {
        HandlerReply::future(async move {
            let f = ev
                .data
                .get("f")
                .and_then(RpcValue::as_remote_function)
                .cloned()
                .ok_or_else(|| PostlinkError::HandlerError("expected a function".into()))?;
            f.call(vec![RpcValue::from_json(json!(20))]).await
        })
    });

    let mut payload = BTreeMap::new();
    payload.insert(
        "f".to_owned(),
        RpcValue::from_fn(|args| {
            let n = args
                .first()
                .and_then(|a| a.as_json())
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            Ok(RpcValue::from_json(json!(n + 1)))
        }),
    );

    let result = p
        .send(
            &ctx("popup"),
            "run",
            RpcValue::Object(payload),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.as_json().unwrap(), json!(21));
}

#[tokio::test]
async fn recipient_validates_against_the_true_origin_not_the_relay() {
    let w = World::new();
    let p = w.engine("opener", "http://parent.example", World::fast_cfg());
    let q = w.engine("popup", "http://popup.example", World::fast_cfg());
    let _relay = spawn_relay(&w, "relay", "http://popup.example");

    w.hub.block(&ctx("opener"), &ctx("popup"));
    w.hub.block(&ctx("popup"), &ctx("opener"));
    p.open_bridge(&ctx("popup"), &ctx("relay"));

    let seen_origin = Arc::new(Mutex::new(String::new()));
    let seen_in_handler = seen_origin.clone();
    // Admits the opener's origin only. The relay's own origin would fail
    // this filter, so a resolution proves the stamped origin got through.
    let _guard = q.on(
        "hello",
        ListenOptions {
            domain: Some(DomainPattern::parse("http://parent.example")),
            ..Default::default()
        },
        move |ev: RequestEvent| {
            *seen_in_handler.lock().unwrap() = ev.source.origin.clone();
            HandlerReply::value(RpcValue::Bool(true))
        },
    );

    p.send(&ctx("popup"), "hello", RpcValue::Null, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(seen_origin.lock().unwrap().as_str(), "http://parent.example");
}

#[tokio::test]
async fn sender_cannot_spoof_the_stamped_origin() {
    let w = World::new();
    let p = w.engine("opener", "http://parent.example", World::fast_cfg());
    let q = w.engine("popup", "http://popup.example", World::fast_cfg());
    let _relay = spawn_relay(&w, "relay", "http://popup.example");

    w.hub.block(&ctx("opener"), &ctx("popup"));
    w.hub.block(&ctx("popup"), &ctx("opener"));
    p.open_bridge(&ctx("popup"), &ctx("relay"));

    // Only a fabricated origin would be admitted; since the relay overwrites
    // the stamp with what it observed, the request must be turned away.
    let _guard = q.on(
        "hello",
        ListenOptions {
            domain: Some(DomainPattern::parse("http://forged.example")),
            ..Default::default()
        },
        |_ev: RequestEvent| HandlerReply::value(RpcValue::Bool(true)),
    );

    let err = p
        .send(&ctx("popup"), "hello", RpcValue::Null, SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoListener);
}

#[tokio::test]
async fn relay_reports_bridge_error_when_it_cannot_forward() {
    let w = World::new();
    let p = w.engine("opener", "http://parent.example", World::fast_cfg());
    let _relay = spawn_relay(&w, "relay", "http://popup.example");

    // Route to a context the relay has never heard of.
    p.open_bridge(&ctx("ghost"), &ctx("relay"));

    let err = p
        .send(&ctx("ghost"), "hello", RpcValue::Null, SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BridgeError);
}
