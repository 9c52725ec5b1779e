//! Protocol wire shapes.
//!
//! One envelope format (JSON) carries every message kind: requests, the two
//! response kinds, remote-function calls, and the delivery-assurance ACK.
//! All parsers are panic-free: malformed input is reported as
//! `PostlinkError::BadEnvelope` instead of panicking, keeping a context
//! resilient to hostile traffic.

pub mod envelope;

pub use envelope::{BridgeMeta, Envelope, MsgKind};
