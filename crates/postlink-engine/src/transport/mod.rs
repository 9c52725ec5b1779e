//! Transport adapter over the raw cross-context post primitive.
//!
//! The primitive delivers an opaque payload plus the platform-observed
//! sender identity and origin, at most once, unordered, with no delivery
//! confirmation and no readiness signal. Everything above this module is
//! built to survive that.

mod adapter;
pub mod memory;

pub use adapter::{RawInbound, RawPost, TransportAdapter};
