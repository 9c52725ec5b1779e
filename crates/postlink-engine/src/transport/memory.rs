//! In-process implementation of the post primitive.
//!
//! Faithful to the primitive's contract: unordered with respect to other
//! senders, silent drop on unknown or detached targets, no confirmation.
//! Adds fault knobs (directed blocks, planned loss) so the retry/ack and
//! bridge machinery can be exercised without a browser.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use postlink_core::origin::ContextId;

use super::{RawInbound, RawPost};

#[derive(Default)]
pub struct MemoryHub {
    inboxes: DashMap<ContextId, mpsc::Sender<RawInbound>>,
    blocked: DashMap<(ContextId, ContextId), ()>,
    loss_plan: DashMap<ContextId, AtomicUsize>,
    delivered: DashMap<ContextId, AtomicUsize>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a context. Returns its posting handle and the inbound receiver
    /// that feeds its transport adapter.
    pub fn attach(
        self: &Arc<Self>,
        ctx: &ContextId,
        origin: &str,
        capacity: usize,
    ) -> (Arc<HubEndpoint>, mpsc::Receiver<RawInbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.inboxes.insert(ctx.clone(), tx);
        let endpoint = Arc::new(HubEndpoint {
            hub: self.clone(),
            me: ctx.clone(),
            origin: origin.to_owned(),
        });
        (endpoint, rx)
    }

    /// Remove a context's inbox; posts to it become silent drops.
    pub fn detach(&self, ctx: &ContextId) {
        self.inboxes.remove(ctx);
    }

    /// Forbid direct delivery from `from` to `to`. Directed: call twice for
    /// both directions.
    pub fn block(&self, from: &ContextId, to: &ContextId) {
        self.blocked.insert((from.clone(), to.clone()), ());
    }

    /// Silently drop the next `n` deliveries destined to `target`.
    pub fn lose_next(&self, target: &ContextId, n: usize) {
        self.loss_plan
            .entry(target.clone())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Number of messages actually delivered to `target` so far.
    pub fn delivered_to(&self, target: &ContextId) -> usize {
        self.delivered
            .get(target)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn deliver(&self, from: &ContextId, from_origin: &str, target: &ContextId, raw: String) {
        if self.blocked.contains_key(&(from.clone(), target.clone())) {
            trace!(%from, %target, "delivery blocked");
            return;
        }
        if let Some(plan) = self.loss_plan.get(target) {
            let stole = plan
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if stole {
                trace!(%from, %target, "delivery lost (planned)");
                return;
            }
        }
        let Some(tx) = self.inboxes.get(target) else {
            trace!(%from, %target, "delivery to detached context dropped");
            return;
        };
        let inbound = RawInbound {
            raw,
            source_context: from.clone(),
            source_origin: from_origin.to_owned(),
        };
        if tx.try_send(inbound).is_ok() {
            self.delivered
                .entry(target.clone())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Posting handle bound to one attached context. The hub stamps the sender
/// identity itself, the way the platform does: a sender cannot claim to be
/// someone else.
pub struct HubEndpoint {
    hub: Arc<MemoryHub>,
    me: ContextId,
    origin: String,
}

#[async_trait]
impl RawPost for HubEndpoint {
    async fn post(&self, target: &ContextId, raw: String, _target_origin_hint: &str) {
        self.hub.deliver(&self.me, &self.origin, target, raw);
    }
}
