//! The server-side callable surface: a method table keyed by lowercase
//! name, built once per handler at construction, plus lifecycle hooks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tether_core::{ConnectionId, HubError};

use crate::proxy::ClientProxy;
use crate::registry::Registry;

type BoxedInvoke =
    Pin<Box<dyn Future<Output = Result<Option<Value>, HubError>> + Send + 'static>>;
type Invoker = Arc<dyn Fn(HubContext, Vec<Value>) -> BoxedInvoke + Send + Sync>;

/// One registered method: its declared arity and the typed invoker closure.
#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) arity: usize,
    invoker: Invoker,
}

impl MethodEntry {
    pub(crate) fn invoke(&self, ctx: HubContext, arguments: Vec<Value>) -> BoxedInvoke {
        (self.invoker)(ctx, arguments)
    }
}

/// Mapping from lowercase method name to invoker. Lookup is
/// case-insensitive; a later registration of a colliding name wins.
#[derive(Clone, Default)]
pub struct MethodTable {
    entries: HashMap<String, MethodEntry>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method under `name` with a declared argument count.
    ///
    /// The invoker receives the caller's context and the raw positional
    /// arguments; use [`arg`] to coerce each one to its declared type and
    /// [`reply`]/[`done`] to produce the result.
    pub fn method<F, Fut>(&mut self, name: &str, arity: usize, invoker: F)
    where
        F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HubError>> + Send + 'static,
    {
        self.entries.insert(
            name.to_ascii_lowercase(),
            MethodEntry {
                arity,
                invoker: Arc::new(move |ctx, args| Box::pin(invoker(ctx, args))),
            },
        );
    }

    pub(crate) fn get(&self, method: &str) -> Option<&MethodEntry> {
        self.entries.get(&method.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Coerce the positional argument at `index` to its declared type.
/// A missing argument coerces from JSON null.
pub fn arg<T: DeserializeOwned>(arguments: &[Value], index: usize) -> Result<T, HubError> {
    let value = arguments.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| HubError::BadArgument {
        index,
        reason: e.to_string(),
    })
}

/// Wrap a method's return value for the reply envelope.
pub fn reply<T: Serialize>(value: T) -> Result<Option<Value>, HubError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| HubError::invocation(e.to_string()))
}

/// Result of a void method: nothing is written back.
pub fn done() -> Result<Option<Value>, HubError> {
    Ok(None)
}

/// A hub: the unit the acceptor constructs per accepted connection.
///
/// `methods` builds the dispatch table once at construction; the hook
/// methods default to no-ops so hubs implement only what they observe.
#[async_trait]
pub trait Hub: Send + Sync + 'static {
    fn methods(self: Arc<Self>) -> MethodTable;

    async fn on_connected(&self, _ctx: &HubContext) {}
    async fn on_disconnected(&self, _ctx: &HubContext) {}

    /// A heartbeat pulse arrived; no dispatch happens for it.
    fn on_heartbeat(&self, _id: &ConnectionId) {}
    /// An inbound frame failed to decode; the connection stays open.
    fn on_decode_error(&self, _id: &ConnectionId, _error: &HubError) {}
    /// Dispatch or the target method failed; the connection stays open.
    fn on_invocation_error(&self, _id: &ConnectionId, _method: &str, _error: &HubError) {}
}

/// Per-connection view handed to invokers and hooks: the caller's identity
/// plus the addressing operations of the registry.
#[derive(Clone)]
pub struct HubContext {
    connection_id: ConnectionId,
    registry: Arc<dyn Registry>,
}

impl HubContext {
    pub fn new(connection_id: ConnectionId, registry: Arc<dyn Registry>) -> Self {
        Self {
            connection_id,
            registry,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Proxy for the calling connection itself.
    pub async fn caller(&self) -> Arc<dyn ClientProxy> {
        self.registry.client(&self.connection_id).await
    }

    pub async fn client(&self, id: &ConnectionId) -> Arc<dyn ClientProxy> {
        self.registry.client(id).await
    }

    pub async fn clients(&self, ids: &[ConnectionId]) -> Arc<dyn ClientProxy> {
        self.registry.clients(ids).await
    }

    pub async fn group(&self, name: &str) -> Arc<dyn ClientProxy> {
        self.registry.group(name).await
    }

    pub async fn all(&self) -> Arc<dyn ClientProxy> {
        self.registry.all().await
    }

    /// Everyone but the calling connection.
    pub async fn others(&self) -> Arc<dyn ClientProxy> {
        self.registry.all_except(&self.connection_id).await
    }

    pub async fn join_group(&self, name: &str) {
        self.registry.add_to_group(&self.connection_id, name).await;
    }

    pub async fn leave_group(&self, name: &str) {
        self.registry.remove_from_group(&self.connection_id, name).await;
    }
}
