//! Sendable-target capability and its null-object implementation.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::FormatError;

/// Why a send to one concrete target did not go out. Fan-out callers treat
/// these as per-member conditions, never as fan-out failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FormatError),
}

/// A target that can be addressed with `send(method, arguments)`.
///
/// Implemented by the per-connection handle, the shared null object, the
/// lazy composite proxies, and (in distributed mode) the remote proxy.
#[async_trait]
pub trait ClientProxy: Send + Sync {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError>;
}

/// Proxy whose `send` is a guaranteed no-op success, returned wherever a
/// connection id does not resolve so call sites stay branch-free.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullClientProxy;

#[async_trait]
impl ClientProxy for NullClientProxy {
    async fn send(&self, _method: &str, _arguments: Vec<Value>) -> Result<(), SendError> {
        Ok(())
    }
}

static NULL_PROXY: LazyLock<Arc<NullClientProxy>> = LazyLock::new(|| Arc::new(NullClientProxy));

/// The shared null-object proxy instance.
pub fn null_proxy() -> Arc<dyn ClientProxy> {
    NULL_PROXY.clone()
}
