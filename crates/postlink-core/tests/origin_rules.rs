//! Origin/window admission rule tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use postlink_core::error::ErrorKind;
use postlink_core::origin::{validate, ContextId, DomainPattern, ExpectedSource, ObservedSource};

fn observed(ctx: &str, origin: &str) -> ObservedSource {
    ObservedSource {
        context: ContextId::from(ctx),
        origin: origin.to_owned(),
    }
}

#[test]
fn exact_origin_match() {
    let p = DomainPattern::parse("http://a.example");
    assert!(p.matches("http://a.example"));
    assert!(!p.matches("http://b.example"));
    assert!(!p.matches("https://a.example"));
}

#[test]
fn wildcard_any() {
    assert!(DomainPattern::parse("*").matches("http://anything.at.all"));
}

#[test]
fn suffix_wildcard_matches_host_only() {
    let p = DomainPattern::parse("*.example.com");
    assert!(p.matches("https://a.example.com"));
    assert!(p.matches("https://deep.a.example.com:8443"));
    assert!(p.matches("http://example.com"));
    assert!(!p.matches("http://example.com.evil.net"));
    assert!(!p.matches("http://badexample.com"));
}

#[test]
fn open_channel_admits_everything() {
    let expected = ExpectedSource::default();
    assert!(validate(&expected, &observed("w1", "http://x.example")).is_ok());
}

#[test]
fn window_filter_is_identity() {
    let expected = ExpectedSource {
        context: Some(ContextId::from("w1")),
        domain: None,
    };
    assert!(validate(&expected, &observed("w1", "http://x.example")).is_ok());
    let err = validate(&expected, &observed("w2", "http://x.example")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WindowMismatch);
}

#[test]
fn domain_filter_rejects_cross_origin() {
    let expected = ExpectedSource {
        context: None,
        domain: Some(DomainPattern::parse("http://a.example")),
    };
    let err = validate(&expected, &observed("w1", "http://b.example")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DomainMismatch);
}
