//! postlink core: transport-agnostic protocol primitives, error types, and
//! origin validation.
//!
//! This crate defines the wire-level envelope, the error surface, and the
//! origin/window admission rules shared by the engine and embedders. It
//! intentionally carries no transport or runtime dependencies so it can be
//! reused in multiple contexts.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `PostlinkError`/`Result` so a context
//! never crashes on malformed or hostile traffic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod origin;
pub mod protocol;

/// Shared result type.
pub use error::{PostlinkError, Result};
