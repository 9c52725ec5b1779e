use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use postlink_core::origin::ContextId;
use postlink_core::protocol::Envelope;
use postlink_core::Result;

/// One inbound delivery as surfaced by the primitive.
#[derive(Debug)]
pub struct RawInbound {
    pub raw: String,
    pub source_context: ContextId,
    pub source_origin: String,
}

/// The underlying fire-and-forget post primitive.
///
/// Delivery is best-effort, asynchronous, and unordered. Posting to a
/// context that no longer exists is a silent no-op; callers detect that via
/// timeout, never via this call.
#[async_trait]
pub trait RawPost: Send + Sync {
    async fn post(&self, target: &ContextId, raw: String, target_origin_hint: &str);
}

/// Wraps the primitive: serializes envelopes outbound, and owns the single
/// process-wide inbound subscription.
pub struct TransportAdapter {
    post: Arc<dyn RawPost>,
    inbound: Mutex<Option<mpsc::Receiver<RawInbound>>>,
}

impl TransportAdapter {
    pub fn new(post: Arc<dyn RawPost>, inbound: mpsc::Receiver<RawInbound>) -> Self {
        Self {
            post,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    /// Serialize and post. Fire-and-forget: the only failure surfaced here
    /// is a local encode failure.
    pub async fn send_raw(
        &self,
        target: &ContextId,
        env: &Envelope,
        origin_hint: &str,
    ) -> Result<()> {
        let raw = env.encode()?;
        self.post.post(target, raw, origin_hint).await;
        Ok(())
    }

    /// Hand out the inbound subscription. Idempotent: only the first call
    /// yields the receiver; there is exactly one underlying subscription for
    /// the lifetime of the context.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<RawInbound>> {
        self.inbound.lock().ok().and_then(|mut slot| slot.take())
    }
}
