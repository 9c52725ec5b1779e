//! Correlation table: pending request records and ack bookkeeping.
//!
//! One record per in-flight id. Exactly one of resolve/reject fires, exactly
//! once: completion consumes the record, so late or duplicate responses are
//! no-ops. Ack state lives separately because an ACK stops retransmission
//! without resolving anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use postlink_core::error::{PostlinkError, Result};
use postlink_core::origin::{ContextId, ExpectedSource};

use crate::functions::RpcValue;

pub(crate) struct Pending {
    pub target: ContextId,
    pub expected: ExpectedSource,
    tx: oneshot::Sender<Result<RpcValue>>,
}

impl Pending {
    pub fn new(
        target: ContextId,
        expected: ExpectedSource,
        tx: oneshot::Sender<Result<RpcValue>>,
    ) -> Self {
        Self {
            target,
            expected,
            tx,
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    inner: DashMap<String, Pending>,
}

impl PendingTable {
    pub fn insert(&self, id: String, pending: Pending) {
        self.inner.insert(id, pending);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// Expected-source filter for a live pending, if any.
    pub fn expected(&self, id: &str) -> Option<ExpectedSource> {
        self.inner.get(id).map(|p| p.expected.clone())
    }

    /// Resolve exactly once. Returns false for late/duplicate completions.
    pub fn complete(&self, id: &str, result: Result<RpcValue>) -> bool {
        match self.inner.remove(id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every pending aimed at a destroyed context.
    pub fn reject_for_target(&self, ctx: &ContextId) {
        let ids: Vec<String> = self
            .inner
            .iter()
            .filter(|e| e.value().target == *ctx)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if self.complete(
                &id,
                Err(PostlinkError::ContextGone(format!(
                    "target context {ctx} destroyed"
                ))),
            ) {
                debug!(%id, context = %ctx, "pending rejected: target destroyed");
            }
        }
    }

    /// Reject everything (own context teardown).
    pub fn reject_all(&self, reason: &str) {
        let ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.complete(&id, Err(PostlinkError::ContextGone(reason.to_owned())));
        }
    }
}

/// Ack flags for envelopes this context is currently retransmitting.
#[derive(Default)]
pub(crate) struct AckTable {
    flags: DashMap<String, Arc<AtomicBool>>,
}

impl AckTable {
    pub fn register(&self, id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.insert(id.to_owned(), flag.clone());
        flag
    }

    /// Idempotent: duplicate ACKs for the same id are harmless.
    pub fn mark(&self, id: &str) {
        if let Some(flag) = self.flags.get(id) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn unregister(&self, id: &str) {
        self.flags.remove(id);
    }
}
