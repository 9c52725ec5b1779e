//! postlink engine: request/response RPC over a fire-and-forget primitive.
//!
//! The engine layers correlation, retry/ack delivery assurance, listener
//! dispatch, remote function references, and bridge relaying on top of a
//! transport that gives no delivery, ordering, or readiness guarantees.
//!
//! One [`Engine`] runs per execution context. Peers are addressed by
//! [`postlink_core::origin::ContextId`]; liveness is tracked in a shared
//! [`context::ContextRegistry`] rather than by holding references to peers.

pub mod bridge;
pub mod config;
pub mod context;
mod correlation;
pub mod engine;
pub mod functions;
pub mod listeners;
pub mod transport;

pub use engine::{Engine, ListenerGuard, SendOptions};
pub use functions::{FunctionRef, RemoteFunction, RpcValue};
pub use listeners::{Completer, HandlerReply, ListenOptions, RequestEvent, RequestHandler};
