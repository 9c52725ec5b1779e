//! Listener registry and dispatch matching.
//!
//! Registrations for one name are tried in registration order; the first
//! whose filters admit the observed source wins. A `once` winner is removed
//! before its handler runs so retried/concurrent requests cannot double-fire
//! it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use postlink_core::error::{PostlinkError, Result};
use postlink_core::origin::{validate, ContextId, DomainPattern, ExpectedSource, ObservedSource};

use crate::functions::RpcValue;

/// What a handler sees: the deserialized payload plus the validated source.
pub struct RequestEvent {
    pub data: RpcValue,
    pub source: ObservedSource,
}

/// Options recognized on listener registration.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Admit only this source context.
    pub window: Option<ContextId>,
    /// Admit only sources whose origin matches.
    pub domain: Option<DomainPattern>,
    /// Remove the registration when it first fires.
    pub once: bool,
}

/// One eventual value-or-error, however the handler chooses to produce it:
/// a direct value, a future, or a deferred completion capability.
pub struct HandlerReply(BoxFuture<'static, Result<RpcValue>>);

impl HandlerReply {
    pub fn value(v: RpcValue) -> Self {
        Self(Box::pin(async move { Ok(v) }))
    }

    pub fn error(e: PostlinkError) -> Self {
        Self(Box::pin(async move { Err(e) }))
    }

    pub fn future<F>(f: F) -> Self
    where
        F: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        Self(Box::pin(f))
    }

    /// Callback-style handlers: the returned [`Completer`] settles the reply
    /// when invoked. Dropping it without settling yields a handler error.
    pub fn deferred() -> (Self, Completer) {
        let (tx, rx) = oneshot::channel();
        let reply = Self(Box::pin(async move {
            rx.await.unwrap_or_else(|_| {
                Err(PostlinkError::HandlerError(
                    "handler dropped its completer without settling".into(),
                ))
            })
        }));
        let completer = Completer {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (reply, completer)
    }

    pub(crate) async fn settle(self) -> Result<RpcValue> {
        self.0.await
    }
}

/// Completion capability handed to callback-style handlers. Settles at most
/// once; later invocations are no-ops.
#[derive(Clone)]
pub struct Completer {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<RpcValue>>>>>,
}

impl Completer {
    pub fn complete(&self, result: Result<RpcValue>) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(result);
            }
        }
    }
}

/// A registered operation handler.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, event: RequestEvent) -> HandlerReply;
}

impl<F> RequestHandler for F
where
    F: Fn(RequestEvent) -> HandlerReply + Send + Sync,
{
    fn handle(&self, event: RequestEvent) -> HandlerReply {
        self(event)
    }
}

struct Registration {
    seq: u64,
    filter: ExpectedSource,
    once: bool,
    handler: Arc<dyn RequestHandler>,
}

/// Process-wide map from operation name to ordered registrations.
#[derive(Default)]
pub struct ListenerRegistry {
    by_name: Mutex<HashMap<String, Vec<Registration>>>,
    seq: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registration's sequence number, used by disposers.
    pub fn register(
        &self,
        name: &str,
        opts: ListenOptions,
        handler: Arc<dyn RequestHandler>,
    ) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            seq,
            filter: ExpectedSource {
                context: opts.window,
                domain: opts.domain,
            },
            once: opts.once,
            handler,
        };
        if let Ok(mut map) = self.by_name.lock() {
            map.entry(name.to_owned()).or_default().push(registration);
        }
        seq
    }

    pub fn remove(&self, name: &str, seq: u64) -> bool {
        let Ok(mut map) = self.by_name.lock() else {
            return false;
        };
        let Some(regs) = map.get_mut(name) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.seq != seq);
        let removed = regs.len() != before;
        if regs.is_empty() {
            map.remove(name);
        }
        removed
    }

    /// First admissible registration wins. A `once` hit is removed here,
    /// before its handler runs.
    pub fn select(
        &self,
        name: &str,
        observed: &ObservedSource,
    ) -> Option<Arc<dyn RequestHandler>> {
        let mut map = self.by_name.lock().ok()?;
        let regs = map.get_mut(name)?;
        let idx = regs
            .iter()
            .position(|r| validate(&r.filter, observed).is_ok())?;
        let handler = regs[idx].handler.clone();
        if regs[idx].once {
            regs.remove(idx);
            if regs.is_empty() {
                map.remove(name);
            }
        }
        Some(handler)
    }

    /// Drop registrations whose window filter referenced a destroyed context.
    pub fn purge_window(&self, ctx: &ContextId) {
        if let Ok(mut map) = self.by_name.lock() {
            for regs in map.values_mut() {
                regs.retain(|r| r.filter.context.as_ref() != Some(ctx));
            }
            map.retain(|_, regs| !regs.is_empty());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.by_name.lock() {
            map.clear();
        }
    }
}
