//! Function-reference broker and the structured payload type.
//!
//! Function values never cross the boundary. Outbound serialization replaces
//! each one with a `{"__isRemoteFunction": true, "token": ...}` marker and
//! parks the real function in the sending context's broker; inbound
//! deserialization turns markers back into proxies. Invoking a proxy always
//! performs a fresh CALL round trip to the owning context.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use postlink_core::error::{PostlinkError, Result};
use postlink_core::origin::ContextId;

use crate::engine::EngineInner;

const MARKER_KEY: &str = "__isRemoteFunction";
const TOKEN_KEY: &str = "token";

/// A locally-owned function value: args in, eventual value-or-error out.
pub type LocalFn = Arc<dyn Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync>;

/// Structured payload: JSON plus live function values.
#[derive(Clone)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    Function(FunctionRef),
}

impl RpcValue {
    /// Pure data, no functions.
    pub fn from_json(v: Value) -> Self {
        match v {
            Value::Null => RpcValue::Null,
            Value::Bool(b) => RpcValue::Bool(b),
            Value::Number(n) => RpcValue::Number(n),
            Value::String(s) => RpcValue::String(s),
            Value::Array(items) => {
                RpcValue::Array(items.into_iter().map(RpcValue::from_json).collect())
            }
            Value::Object(map) => RpcValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, RpcValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Back to plain JSON; `None` if any function value remains inside.
    pub fn as_json(&self) -> Option<Value> {
        match self {
            RpcValue::Null => Some(Value::Null),
            RpcValue::Bool(b) => Some(Value::Bool(*b)),
            RpcValue::Number(n) => Some(Value::Number(n.clone())),
            RpcValue::String(s) => Some(Value::String(s.clone())),
            RpcValue::Array(items) => items
                .iter()
                .map(RpcValue::as_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            RpcValue::Object(map) => map
                .iter()
                .map(|(k, v)| v.as_json().map(|j| (k.clone(), j)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
            RpcValue::Function(_) => None,
        }
    }

    /// Wrap a synchronous function value.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Result<RpcValue> + Send + Sync + 'static,
    {
        RpcValue::Function(FunctionRef::Local(Arc::new(move |args| {
            let out = f(args);
            Box::pin(async move { out })
        })))
    }

    /// Wrap an asynchronous function value.
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        RpcValue::Function(FunctionRef::Local(Arc::new(move |args| Box::pin(f(args)))))
    }

    /// Object field lookup.
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            RpcValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_remote_function(&self) -> Option<&RemoteFunction> {
        match self {
            RpcValue::Function(FunctionRef::Remote(r)) => Some(r),
            _ => None,
        }
    }
}

impl From<Value> for RpcValue {
    fn from(v: Value) -> Self {
        RpcValue::from_json(v)
    }
}

impl fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Null => f.write_str("Null"),
            RpcValue::Bool(b) => write!(f, "Bool({b})"),
            RpcValue::Number(n) => write!(f, "Number({n})"),
            RpcValue::String(s) => write!(f, "String({s:?})"),
            RpcValue::Array(items) => f.debug_list().entries(items).finish(),
            RpcValue::Object(map) => f.debug_map().entries(map).finish(),
            RpcValue::Function(FunctionRef::Local(_)) => f.write_str("Function(<local>)"),
            RpcValue::Function(FunctionRef::Remote(r)) => {
                write!(f, "Function(<remote {} @ {}>)", r.token, r.owner)
            }
        }
    }
}

/// A function value inside a payload: either ours or a remote proxy.
#[derive(Clone)]
pub enum FunctionRef {
    Local(LocalFn),
    Remote(RemoteFunction),
}

/// Proxy for a function owned by another context. Invocation always performs
/// a fresh CALL round trip; results are never cached.
#[derive(Clone)]
pub struct RemoteFunction {
    token: String,
    owner: ContextId,
    engine: Weak<EngineInner>,
}

impl RemoteFunction {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn owner(&self) -> &ContextId {
        &self.owner
    }

    pub async fn call(&self, args: Vec<RpcValue>) -> Result<RpcValue> {
        let engine = self.engine.upgrade().ok_or_else(|| {
            PostlinkError::ContextGone("calling context has been torn down".into())
        })?;
        engine
            .call_remote(self.owner.clone(), self.token.clone(), args)
            .await
    }
}

/// Process-wide map from token to locally-owned function.
#[derive(Default)]
pub struct FunctionBroker {
    table: DashMap<String, LocalFn>,
}

impl FunctionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self, f: LocalFn) -> String {
        let token = Uuid::new_v4().to_string();
        self.table.insert(token.clone(), f);
        debug!(token = %token, "function token minted");
        token
    }

    pub fn lookup(&self, token: &str) -> Option<LocalFn> {
        self.table.get(token).map(|f| f.value().clone())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Owner teardown: every token dies with its context.
    pub fn purge(&self) {
        self.table.clear();
    }

    /// Outbound walk: functions become token markers; everything else passes
    /// through structurally unchanged.
    pub fn serialize(&self, v: &RpcValue) -> Value {
        match v {
            RpcValue::Null => Value::Null,
            RpcValue::Bool(b) => Value::Bool(*b),
            RpcValue::Number(n) => Value::Number(n.clone()),
            RpcValue::String(s) => Value::String(s.clone()),
            RpcValue::Array(items) => {
                Value::Array(items.iter().map(|i| self.serialize(i)).collect())
            }
            RpcValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, val)| (k.clone(), self.serialize(val)))
                    .collect(),
            ),
            RpcValue::Function(fref) => {
                let token = match fref {
                    FunctionRef::Local(f) => self.mint(f.clone()),
                    // A proxy passed onward gets a fresh token owned here;
                    // invoking it chains the call back through this context.
                    FunctionRef::Remote(remote) => {
                        let remote = remote.clone();
                        self.mint(Arc::new(move |args| {
                            let remote = remote.clone();
                            Box::pin(async move { remote.call(args).await })
                        }))
                    }
                };
                let mut marker = serde_json::Map::new();
                marker.insert(MARKER_KEY.to_owned(), Value::Bool(true));
                marker.insert(TOKEN_KEY.to_owned(), Value::String(token));
                Value::Object(marker)
            }
        }
    }

    /// Inbound walk: token markers become proxies bound to the sending
    /// context; a malformed marker is treated as a plain object.
    pub fn deserialize(&self, v: &Value, owner: &ContextId, engine: &Weak<EngineInner>) -> RpcValue {
        match v {
            Value::Null => RpcValue::Null,
            Value::Bool(b) => RpcValue::Bool(*b),
            Value::Number(n) => RpcValue::Number(n.clone()),
            Value::String(s) => RpcValue::String(s.clone()),
            Value::Array(items) => RpcValue::Array(
                items
                    .iter()
                    .map(|i| self.deserialize(i, owner, engine))
                    .collect(),
            ),
            Value::Object(map) => {
                if map.get(MARKER_KEY).and_then(Value::as_bool) == Some(true) {
                    if let Some(token) = map.get(TOKEN_KEY).and_then(Value::as_str) {
                        return RpcValue::Function(FunctionRef::Remote(RemoteFunction {
                            token: token.to_owned(),
                            owner: owner.clone(),
                            engine: engine.clone(),
                        }));
                    }
                }
                RpcValue::Object(
                    map.iter()
                        .map(|(k, val)| (k.clone(), self.deserialize(val, owner, engine)))
                        .collect(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_replaces_functions_with_token_markers() {
        let broker = FunctionBroker::new();
        let mut payload = BTreeMap::new();
        payload.insert("n".to_owned(), RpcValue::from_json(json!(7)));
        payload.insert("f".to_owned(), RpcValue::from_fn(|_| Ok(RpcValue::Null)));
        let wire = broker.serialize(&RpcValue::Object(payload));
        assert_eq!(wire["n"], json!(7));
        assert_eq!(wire["f"][MARKER_KEY], json!(true));
        let token = wire["f"][TOKEN_KEY].as_str().unwrap();
        assert!(broker.lookup(token).is_some());
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn deserialize_turns_markers_into_proxies() {
        let broker = FunctionBroker::new();
        let wire = json!({ "f": { "__isRemoteFunction": true, "token": "t-1" }, "x": [1, 2] });
        let owner = ContextId::from("win-x");
        let value = broker.deserialize(&wire, &owner, &Weak::new());
        let proxy = value.get("f").and_then(RpcValue::as_remote_function).unwrap();
        assert_eq!(proxy.token(), "t-1");
        assert_eq!(proxy.owner(), &owner);
        assert_eq!(value.get("x").unwrap().as_json().unwrap(), json!([1, 2]));
    }

    #[test]
    fn malformed_marker_stays_a_plain_object() {
        let broker = FunctionBroker::new();
        let wire = json!({ "__isRemoteFunction": true });
        let value = broker.deserialize(&wire, &ContextId::from("w"), &Weak::new());
        assert_eq!(value.as_json().unwrap(), wire);
    }

    #[test]
    fn purge_drops_all_tokens() {
        let broker = FunctionBroker::new();
        broker.serialize(&RpcValue::from_fn(|_| Ok(RpcValue::Null)));
        assert!(!broker.is_empty());
        broker.purge();
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn proxy_outliving_its_engine_rejects_context_gone() {
        let broker = FunctionBroker::new();
        let wire = json!({ "__isRemoteFunction": true, "token": "t-1" });
        let value = broker.deserialize(&wire, &ContextId::from("w"), &Weak::new());
        let proxy = value.as_remote_function().unwrap();
        let err = proxy.call(vec![]).await.unwrap_err();
        assert_eq!(err.kind(), postlink_core::error::ErrorKind::ContextGone);
    }
}
