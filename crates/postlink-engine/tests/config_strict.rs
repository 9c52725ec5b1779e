#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use postlink_core::error::ErrorKind;
use postlink_engine::config;

#[test]
fn deny_unknown_fields() {
    let bad = r#"
retry_interval_ms: 25
retry_intervl_ms: 25 # typo should fail
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn defaults_apply() {
    let cfg = config::load_from_str("{}").expect("must parse");
    assert_eq!(cfg.retry_interval_ms, 50);
    assert_eq!(cfg.response_timeout_ms, 5000);
}

#[test]
fn retry_interval_out_of_range() {
    let err = config::load_from_str("retry_interval_ms: 0").expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn timeout_zero_means_indefinite_and_is_valid() {
    let cfg = config::load_from_str("response_timeout_ms: 0").expect("must parse");
    assert_eq!(cfg.response_timeout_ms, 0);
    assert!(cfg.validate().is_ok());
}

#[test]
fn timeout_below_retry_interval_rejected() {
    let bad = r#"
retry_interval_ms: 100
response_timeout_ms: 50
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::Config);
}
