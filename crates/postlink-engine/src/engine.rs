//! Dispatcher / protocol engine.
//!
//! One engine per execution context. Outbound: assign an id, wrap, re-send
//! until ACKed, await the correlated response or a timeout. Inbound: decode,
//! resolve the effective source (direct or bridge-stamped), classify by kind,
//! and route to the correlation table or the listener registry. Exactly one
//! RESPONSE or ERROR_RESPONSE is sent per REQUEST id.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use postlink_core::error::{PostlinkError, Result};
use postlink_core::origin::{validate, ContextId, DomainPattern, ExpectedSource, ObservedSource};
use postlink_core::protocol::{BridgeMeta, Envelope, MsgKind};

use crate::config::EngineConfig;
use crate::context::ContextRegistry;
use crate::correlation::{AckTable, Pending, PendingTable};
use crate::functions::{FunctionBroker, RpcValue};
use crate::listeners::{ListenOptions, ListenerRegistry, RequestEvent, RequestHandler};
use crate::transport::{RawInbound, RawPost, TransportAdapter};

/// Options recognized on send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Pattern the responder's origin must match for the response to
    /// resolve. Unset means any origin is accepted (open channel). An exact
    /// origin is also forwarded to the transport as the target-origin hint.
    pub domain: Option<DomainPattern>,
    /// Response wait override; `Some(0)` waits indefinitely. Unset applies
    /// the configured default.
    pub timeout_ms: Option<u64>,
    /// Context the response must come from. Defaults to the send target.
    pub window: Option<ContextId>,
}

/// Disposer returned by listener registration.
pub struct ListenerGuard {
    registry: Weak<ListenerRegistry>,
    name: String,
    seq: u64,
}

impl ListenerGuard {
    /// Remove the registration. Dropping the guard without calling this
    /// leaves the listener in place.
    pub fn dispose(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, self.seq);
        }
    }
}

/// Where a reply must go: the wire hop it arrived through and the logical
/// context it originated from. Equal for direct traffic; distinct when the
/// envelope came through a bridge.
#[derive(Clone)]
struct ReplyRoute {
    via: ContextId,
    target: ContextId,
    /// Effective origin of the target, handed to the transport as the
    /// target-origin hint on direct replies.
    target_origin: String,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    ctx: ContextId,
    origin: String,
    cfg: EngineConfig,
    transport: TransportAdapter,
    contexts: Arc<ContextRegistry>,
    pending: PendingTable,
    acks: AckTable,
    listeners: Arc<ListenerRegistry>,
    broker: FunctionBroker,
    /// target -> relay context, set by `open_bridge`.
    routes: DashMap<ContextId, ContextId>,
    /// REQUEST/CALL ids already dispatched. Retries that crossed a lost ACK
    /// are re-ACKed but never re-dispatched. Grows for the context lifetime.
    seen: DashMap<String, ()>,
}

impl Engine {
    /// Create the engine for one execution context and start its inbound
    /// loop. Registers the context as live in the shared registry.
    pub fn new(
        ctx: ContextId,
        origin: &str,
        cfg: EngineConfig,
        post: Arc<dyn RawPost>,
        inbound: mpsc::Receiver<RawInbound>,
        contexts: Arc<ContextRegistry>,
    ) -> Result<Engine> {
        cfg.validate()?;
        let inner = Arc::new(EngineInner {
            ctx: ctx.clone(),
            origin: origin.to_owned(),
            cfg,
            transport: TransportAdapter::new(post, inbound),
            contexts: contexts.clone(),
            pending: PendingTable::default(),
            acks: AckTable::default(),
            listeners: Arc::new(ListenerRegistry::new()),
            broker: FunctionBroker::new(),
            routes: DashMap::new(),
            seen: DashMap::new(),
        });

        contexts.register(ctx, origin);

        let weak = Arc::downgrade(&inner);
        contexts.on_destroy(move |gone| {
            if let Some(inner) = weak.upgrade() {
                inner.on_context_destroyed(gone);
            }
        });

        // Single process-wide inbound subscription for this context.
        if let Some(mut rx) = inner.transport.take_inbound() {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.handle_inbound(delivery).await;
                }
            });
        }

        Ok(Engine { inner })
    }

    pub fn context_id(&self) -> &ContextId {
        &self.inner.ctx
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Register a persistent listener for `name`.
    pub fn on(
        &self,
        name: &str,
        opts: ListenOptions,
        handler: impl RequestHandler + 'static,
    ) -> ListenerGuard {
        let seq = self
            .inner
            .listeners
            .register(name, opts, Arc::new(handler));
        ListenerGuard {
            registry: Arc::downgrade(&self.inner.listeners),
            name: name.to_owned(),
            seq,
        }
    }

    /// Register a listener that fires for at most one matching request.
    pub fn once(
        &self,
        name: &str,
        mut opts: ListenOptions,
        handler: impl RequestHandler + 'static,
    ) -> ListenerGuard {
        opts.once = true;
        self.on(name, opts, handler)
    }

    /// Send a named request. Resolves with the handler's value, or rejects
    /// with the remote error, a timeout, or a local failure. Settles exactly
    /// once.
    pub async fn send(
        &self,
        target: &ContextId,
        name: &str,
        data: RpcValue,
        opts: SendOptions,
    ) -> Result<RpcValue> {
        self.inner.send(target, name, data, opts).await
    }

    /// Route traffic for `target` through the relay running in `via`. The
    /// caller is responsible for the relay context being loaded and trusted.
    pub fn open_bridge(&self, target: &ContextId, via: &ContextId) {
        debug!(target = %target, via = %via, "bridge route opened");
        self.inner.routes.insert(target.clone(), via.clone());
    }

    /// Tear down this context: rejects everything pending, purges listeners
    /// and function tokens, and notifies other engines in the process.
    pub fn shutdown(&self) {
        self.inner.contexts.destroy(&self.inner.ctx);
    }
}

impl EngineInner {
    pub(crate) async fn send(
        self: &Arc<Self>,
        target: &ContextId,
        name: &str,
        data: RpcValue,
        opts: SendOptions,
    ) -> Result<RpcValue> {
        // Liveness is only assessable for directly reachable contexts; a
        // bridged target lives in a realm this registry may not cover.
        if !self.routes.contains_key(target) && !self.contexts.is_live(target) {
            return Err(PostlinkError::ContextGone(format!(
                "target context {target} is not live"
            )));
        }
        let id = Uuid::new_v4().to_string();
        let env = Envelope {
            id,
            kind: MsgKind::Request,
            name: Some(name.to_owned()),
            data: Some(self.broker.serialize(&data)),
            source_domain: Some(self.origin.clone()),
            ack_requested: true,
            bridge_meta: None,
        };
        let expected = ExpectedSource {
            context: Some(opts.window.clone().unwrap_or_else(|| target.clone())),
            domain: opts.domain.clone(),
        };
        // An exact domain doubles as the target-origin hint: a conforming
        // transport may refuse to deliver to a context at another origin.
        let hint = match &opts.domain {
            Some(DomainPattern::Exact(origin)) => origin.clone(),
            _ => "*".to_owned(),
        };
        debug!(id = %env.id, %name, target = %target, "sending request");
        self.round_trip(target, env, expected, opts.timeout_ms, hint)
            .await
    }

    /// Remote function invocation: CALL/CALL_RESPONSE, not routed through
    /// the listener registry on the owning side.
    pub(crate) async fn call_remote(
        self: &Arc<Self>,
        owner: ContextId,
        token: String,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        if !self.routes.contains_key(&owner) && !self.contexts.is_live(&owner) {
            return Err(PostlinkError::ContextGone(format!(
                "function owner {owner} is gone"
            )));
        }
        let args: Vec<Value> = args.iter().map(|a| self.broker.serialize(a)).collect();
        let mut data = serde_json::Map::new();
        data.insert("token".to_owned(), Value::String(token));
        data.insert("args".to_owned(), Value::Array(args));
        let env = Envelope {
            id: Uuid::new_v4().to_string(),
            kind: MsgKind::Call,
            name: None,
            data: Some(Value::Object(data)),
            source_domain: Some(self.origin.clone()),
            ack_requested: true,
            bridge_meta: None,
        };
        let expected = ExpectedSource {
            context: Some(owner.clone()),
            domain: None,
        };
        debug!(id = %env.id, owner = %owner, "sending remote call");
        self.round_trip(&owner, env, expected, None, "*".to_owned())
            .await
    }

    /// Shared outbound state machine: pending record, retry-until-ACK,
    /// timeout, await resolution.
    async fn round_trip(
        self: &Arc<Self>,
        target: &ContextId,
        env: Envelope,
        expected: ExpectedSource,
        timeout_ms: Option<u64>,
        hint: String,
    ) -> Result<RpcValue> {
        let id = env.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(id.clone(), Pending::new(target.clone(), expected, tx));
        let acked = self.acks.register(&id);

        // Retry until ACKed or resolved. The transport gives no delivery
        // confirmation and no readiness signal (the target's listener
        // subsystem may not even be initialized yet), so re-sending is the
        // only way to assure delivery. The ACK stops retries; it never
        // resolves the pending.
        {
            let weak = Arc::downgrade(self);
            let target = target.clone();
            let id = id.clone();
            tokio::spawn(async move {
                loop {
                    let Some(inner) = weak.upgrade() else { break };
                    if acked.load(Ordering::Acquire) || !inner.pending.contains(&id) {
                        inner.acks.unregister(&id);
                        break;
                    }
                    inner.post_routed(&target, env.clone(), &hint).await;
                    let interval = inner.cfg.retry_interval_ms;
                    drop(inner);
                    tokio::time::sleep(Duration::from_millis(interval)).await;
                }
            });
        }

        let ms = timeout_ms.unwrap_or(self.cfg.response_timeout_ms);
        if ms > 0 {
            let weak = Arc::downgrade(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if let Some(inner) = weak.upgrade() {
                    if inner.pending.complete(&id, Err(PostlinkError::Timeout(ms))) {
                        debug!(%id, ms, "request timed out");
                    }
                }
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PostlinkError::ContextGone(
                "local context shut down".into(),
            )),
        }
    }

    /// Outbound post honoring bridge routes. The wire hop through a relay is
    /// not the target, so the origin hint is widened there.
    async fn post_routed(&self, target: &ContextId, mut env: Envelope, hint: &str) {
        let (wire_target, hint) = match self.routes.get(target) {
            Some(via) if *via.value() != *target => {
                env.bridge_meta = Some(BridgeMeta {
                    target: target.clone(),
                    origin_context: None,
                    origin_domain: None,
                });
                (via.value().clone(), "*")
            }
            _ => (target.clone(), hint),
        };
        if let Err(e) = self.transport.send_raw(&wire_target, &env, hint).await {
            warn!(error = %e, "outbound envelope dropped");
        }
    }

    /// Reply post along an inbound route (back through a bridge if that is
    /// how the request arrived).
    async fn post_reply(&self, route: &ReplyRoute, mut env: Envelope) {
        let hint = if route.via == route.target {
            route.target_origin.as_str()
        } else {
            env.bridge_meta = Some(BridgeMeta {
                target: route.target.clone(),
                origin_context: None,
                origin_domain: None,
            });
            "*"
        };
        if let Err(e) = self.transport.send_raw(&route.via, &env, hint).await {
            warn!(error = %e, "reply envelope dropped");
        }
    }

    /// Replies carry results, so they get the same delivery assurance as
    /// requests: re-send until ACKed, bounded by the response timeout.
    fn post_reply_reliable(self: &Arc<Self>, route: ReplyRoute, env: Envelope) {
        let acked = self.acks.register(&env.id);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut elapsed = 0u64;
            loop {
                let Some(inner) = weak.upgrade() else { break };
                if acked.load(Ordering::Acquire) {
                    inner.acks.unregister(&env.id);
                    break;
                }
                let bound = match inner.cfg.response_timeout_ms {
                    0 => u64::MAX,
                    ms => ms,
                };
                if elapsed > bound {
                    warn!(id = %env.id, "giving up on unacked reply");
                    inner.acks.unregister(&env.id);
                    break;
                }
                inner.post_reply(&route, env.clone()).await;
                let step = inner.cfg.retry_interval_ms;
                drop(inner);
                tokio::time::sleep(Duration::from_millis(step)).await;
                elapsed = elapsed.saturating_add(step);
            }
        });
    }

    async fn handle_inbound(self: &Arc<Self>, delivery: RawInbound) {
        let env = match Envelope::decode(&delivery.raw) {
            Ok(env) => env,
            Err(e) => {
                warn!(source = %delivery.source_context, error = %e, "dropping malformed envelope");
                return;
            }
        };
        let observed = ObservedSource {
            context: delivery.source_context,
            origin: delivery.source_origin,
        };

        // Engines never relay; that is the bridge's job.
        if let Some(meta) = &env.bridge_meta {
            if meta.target != self.ctx {
                warn!(id = %env.id, target = %meta.target, "misrouted bridged envelope dropped");
                return;
            }
        }

        // For bridged traffic the relay stamped the true original identity;
        // validation must see the original sender, not the bridge.
        let effective = match &env.bridge_meta {
            Some(BridgeMeta {
                origin_context: Some(ctx),
                origin_domain,
                ..
            }) => ObservedSource {
                context: ctx.clone(),
                origin: origin_domain.clone().unwrap_or_default(),
            },
            _ => observed.clone(),
        };
        let route = ReplyRoute {
            via: observed.context,
            target: effective.context.clone(),
            target_origin: effective.origin.clone(),
        };

        // A context that reached us through a relay is only reachable back
        // through that relay: remember the hop so fresh envelopes to it
        // (chained function calls, later sends) take the same path.
        if route.via != route.target {
            self.routes.insert(route.target.clone(), route.via.clone());
        }

        match env.kind {
            MsgKind::Ack => self.acks.mark(&env.id),
            MsgKind::Request => self.handle_request(env, effective, route).await,
            MsgKind::Call => self.handle_call(env, effective, route).await,
            MsgKind::Response | MsgKind::CallResponse => {
                self.handle_settlement(env, effective, route, true).await
            }
            MsgKind::ErrorResponse => {
                self.handle_settlement(env, effective, route, false).await
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        env: Envelope,
        effective: ObservedSource,
        route: ReplyRoute,
    ) {
        // ACK on first sight of any envelope for this id, independent of how
        // long the handler takes.
        if env.ack_requested {
            self.post_reply(&route, Envelope::ack(&env.id)).await;
        }
        if self.seen.insert(env.id.clone(), ()).is_some() {
            debug!(id = %env.id, "duplicate request re-acked, not re-dispatched");
            return;
        }

        let name = env.name.clone().unwrap_or_default();
        match self.listeners.select(&name, &effective) {
            None => {
                debug!(id = %env.id, %name, source = %effective.context, "no admissible listener");
                let err = PostlinkError::NoListener(name);
                self.post_reply_reliable(route, Envelope::error_response(&env.id, &err.to_wire()));
            }
            Some(handler) => {
                let data = self.broker.deserialize(
                    env.data.as_ref().unwrap_or(&Value::Null),
                    &effective.context,
                    &Arc::downgrade(self),
                );
                let event = RequestEvent {
                    data,
                    source: effective,
                };
                let inner = self.clone();
                let id = env.id.clone();
                tokio::spawn(async move {
                    let result = handler.handle(event).settle().await;
                    inner.send_result(route, &id, result, MsgKind::Response).await;
                });
            }
        }
    }

    async fn handle_call(
        self: &Arc<Self>,
        env: Envelope,
        effective: ObservedSource,
        route: ReplyRoute,
    ) {
        if env.ack_requested {
            self.post_reply(&route, Envelope::ack(&env.id)).await;
        }
        if self.seen.insert(env.id.clone(), ()).is_some() {
            return;
        }

        let parsed = env.data.as_ref().and_then(|d| {
            let token = d.get("token")?.as_str()?.to_owned();
            let args = d.get("args")?.as_array()?.clone();
            Some((token, args))
        });
        let Some((token, args)) = parsed else {
            let err = PostlinkError::HandlerError("malformed CALL payload".into());
            self.post_reply_reliable(route, Envelope::error_response(&env.id, &err.to_wire()));
            return;
        };
        let Some(function) = self.broker.lookup(&token) else {
            // Unknown token: either never minted here or purged on teardown.
            let err = PostlinkError::ContextGone(format!("no such function token {token}"));
            self.post_reply_reliable(route, Envelope::error_response(&env.id, &err.to_wire()));
            return;
        };
        let args: Vec<RpcValue> = args
            .iter()
            .map(|a| self.broker.deserialize(a, &effective.context, &Arc::downgrade(self)))
            .collect();
        let inner = self.clone();
        let id = env.id.clone();
        tokio::spawn(async move {
            let result = function(args).await;
            inner
                .send_result(route, &id, result, MsgKind::CallResponse)
                .await;
        });
    }

    /// The one place a RESPONSE/ERROR_RESPONSE for a request id is produced.
    async fn send_result(
        self: &Arc<Self>,
        route: ReplyRoute,
        id: &str,
        result: Result<RpcValue>,
        ok_kind: MsgKind,
    ) {
        let env = match result {
            Ok(value) => Envelope {
                id: id.to_owned(),
                kind: ok_kind,
                name: None,
                data: Some(self.broker.serialize(&value)),
                source_domain: Some(self.origin.clone()),
                ack_requested: true,
                bridge_meta: None,
            },
            Err(e) => {
                debug!(%id, kind = e.kind().as_str(), "handler produced error");
                Envelope::error_response(id, &e.to_wire())
            }
        };
        self.post_reply_reliable(route, env);
    }

    async fn handle_settlement(
        self: &Arc<Self>,
        env: Envelope,
        effective: ObservedSource,
        route: ReplyRoute,
        is_success: bool,
    ) {
        // ACK stops the responder's retries even when the pending is already
        // gone (late duplicate).
        if env.ack_requested {
            self.post_reply(&route, Envelope::ack(&env.id)).await;
        }
        let Some(expected) = self.pending.expected(&env.id) else {
            debug!(id = %env.id, "late or duplicate response ignored");
            return;
        };
        let result = if is_success {
            // A success resolves only if it comes from the expected window
            // and an admissible origin.
            match validate(&expected, &effective) {
                Ok(()) => Ok(self.broker.deserialize(
                    env.data.as_ref().unwrap_or(&Value::Null),
                    &effective.context,
                    &Arc::downgrade(self),
                )),
                Err(e) => Err(e),
            }
        } else {
            // Errors settle regardless of source filters: they carry no data
            // that could be spoofed into a success, and bridge failures
            // legitimately arrive from the relay itself.
            Err(env.wire_error())
        };
        if self.pending.complete(&env.id, result) {
            debug!(id = %env.id, "request settled");
        }
    }

    fn on_context_destroyed(&self, gone: &ContextId) {
        if *gone == self.ctx {
            self.pending.reject_all("local context shut down");
            self.listeners.clear();
            self.broker.purge();
            self.routes.clear();
            self.seen.clear();
        } else {
            self.pending.reject_for_target(gone);
            self.listeners.purge_window(gone);
            self.routes.remove(gone);
            self.routes.retain(|_, via| via != gone);
        }
    }
}
