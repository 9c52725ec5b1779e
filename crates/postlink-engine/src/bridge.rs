//! Bridge relay: generic forwarder for context pairs that cannot message
//! each other directly but can both reach an intermediate context.
//!
//! The relay performs no protocol interpretation of REQUEST/RESPONSE/CALL
//! payloads. It rewrites routing metadata only: `bridge_meta.origin_*` is
//! overwritten with the identity the transport observed, so the final
//! recipient validates against the true original sender (and a sender cannot
//! pre-stamp a forged origin). The trust placed in the bridge is exactly
//! "relays faithfully", nothing more.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use postlink_core::error::PostlinkError;
use postlink_core::origin::ContextId;
use postlink_core::protocol::Envelope;

use crate::context::ContextRegistry;
use crate::transport::{RawInbound, RawPost};

pub struct BridgeRelay {
    _inner: Arc<RelayInner>,
}

struct RelayInner {
    ctx: ContextId,
    post: Arc<dyn RawPost>,
    contexts: Arc<ContextRegistry>,
}

impl BridgeRelay {
    /// Start relaying inside the intermediate context. Registers the relay
    /// context as live and forwards every bridge-tagged envelope it receives.
    pub fn spawn(
        ctx: ContextId,
        origin: &str,
        post: Arc<dyn RawPost>,
        mut inbound: mpsc::Receiver<RawInbound>,
        contexts: Arc<ContextRegistry>,
    ) -> BridgeRelay {
        contexts.register(ctx.clone(), origin);
        let inner = Arc::new(RelayInner {
            ctx,
            post,
            contexts,
        });
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(delivery) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.forward(delivery).await;
            }
        });
        BridgeRelay { _inner: inner }
    }
}

impl RelayInner {
    async fn forward(&self, delivery: RawInbound) {
        let mut env = match Envelope::decode(&delivery.raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(source = %delivery.source_context, error = %e, "relay dropping malformed envelope");
                return;
            }
        };
        let Some(meta) = env.bridge_meta.as_mut() else {
            debug!(id = %env.id, "relay dropping untagged envelope");
            return;
        };
        if meta.target == self.ctx {
            debug!(id = %env.id, "relay is not a protocol endpoint, dropping");
            return;
        }
        let target = meta.target.clone();

        // Preserve the true original identity through the hop. Always
        // overwritten with what the transport observed.
        meta.origin_context = Some(delivery.source_context.clone());
        meta.origin_domain = Some(delivery.source_origin.clone());

        if !self.contexts.is_live(&target) {
            warn!(id = %env.id, %target, "relay cannot forward, reporting back");
            self.report_failure(&env.id, &delivery.source_context, &target)
                .await;
            return;
        }
        match env.encode() {
            Ok(raw) => {
                self.post.post(&target, raw, "*").await;
                debug!(id = %env.id, from = %delivery.source_context, to = %target, "relayed");
            }
            Err(e) => warn!(id = %env.id, error = %e, "relay re-encode failed"),
        }
    }

    /// Forwarding failures travel back along the reverse path; they are
    /// never swallowed.
    async fn report_failure(&self, id: &str, back_to: &ContextId, target: &ContextId) {
        let err = PostlinkError::BridgeError(format!("relay could not forward to {target}"));
        let env = Envelope::error_response(id, &err.to_wire());
        if let Ok(raw) = env.encode() {
            self.post.post(back_to, raw, "*").await;
        }
    }
}
