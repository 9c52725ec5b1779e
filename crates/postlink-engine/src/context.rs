//! Context liveness registry.
//!
//! Weak addressing, arena+index style: peers are referenced by stable
//! [`ContextId`] and resolved here. Destroying a context flips liveness and
//! runs the registered teardown hooks exactly once, which is how dependent
//! pending requests, listener registrations, and function tokens get purged.

use std::sync::Mutex;

use dashmap::DashMap;
use tracing::debug;

use postlink_core::origin::ContextId;

type TeardownHook = Box<dyn Fn(&ContextId) + Send + Sync>;

pub struct ContextRegistry {
    live: DashMap<ContextId, String>,
    hooks: Mutex<Vec<TeardownHook>>,
}

impl ContextRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            live: DashMap::new(),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, ctx: ContextId, origin: &str) {
        self.live.insert(ctx, origin.to_owned());
    }

    pub fn is_live(&self, ctx: &ContextId) -> bool {
        self.live.contains_key(ctx)
    }

    pub fn origin_of(&self, ctx: &ContextId) -> Option<String> {
        self.live.get(ctx).map(|e| e.value().clone())
    }

    /// Observe context destruction. Hooks run synchronously inside
    /// [`ContextRegistry::destroy`], after liveness has flipped.
    pub fn on_destroy(&self, hook: impl Fn(&ContextId) + Send + Sync + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(Box::new(hook));
        }
    }

    /// Tear a context down. Idempotent: a second destroy is a no-op.
    pub fn destroy(&self, ctx: &ContextId) {
        if self.live.remove(ctx).is_none() {
            return;
        }
        debug!(context = %ctx, "context destroyed");
        if let Ok(hooks) = self.hooks.lock() {
            for hook in hooks.iter() {
                hook(ctx);
            }
        }
    }
}
