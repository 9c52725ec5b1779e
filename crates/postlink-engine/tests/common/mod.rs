//! Shared test harness: one in-memory hub plus a context registry stands in
//! for the browser realm.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use postlink_core::origin::ContextId;
use postlink_engine::config::EngineConfig;
use postlink_engine::context::ContextRegistry;
use postlink_engine::transport::memory::MemoryHub;
use postlink_engine::Engine;

pub struct World {
    pub hub: Arc<MemoryHub>,
    pub contexts: Arc<ContextRegistry>,
}

impl World {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        Self {
            hub: MemoryHub::new(),
            contexts: ContextRegistry::new(),
        }
    }

    pub fn engine(&self, id: &str, origin: &str, cfg: EngineConfig) -> Engine {
        let ctx = ContextId::from(id);
        let (post, inbound) = self.hub.attach(&ctx, origin, 64);
        Engine::new(ctx, origin, cfg, post, inbound, self.contexts.clone()).unwrap()
    }

    /// Tight timings so retry/timeout paths run in test time.
    pub fn fast_cfg() -> EngineConfig {
        EngineConfig {
            retry_interval_ms: 10,
            response_timeout_ms: 500,
        }
    }

    /// Simulate a context being torn down: its inbox disappears and the
    /// registry notifies every engine in the realm.
    pub fn destroy(&self, id: &str) {
        let ctx = ContextId::from(id);
        self.hub.detach(&ctx);
        self.contexts.destroy(&ctx);
    }
}

pub fn ctx(id: &str) -> ContextId {
    ContextId::from(id)
}
