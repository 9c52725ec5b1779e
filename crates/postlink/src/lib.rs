//! Top-level facade crate for postlink.
//!
//! Re-exports the core protocol types and the engine so users can depend on
//! a single crate.

pub mod core {
    pub use postlink_core::*;
}

pub mod engine {
    pub use postlink_engine::*;
}
