//! Process-local bookkeeping of connections and groups, plus the composite
//! proxies that fan a send out over them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tether_core::ConnectionId;
use tracing::warn;

use crate::proxy::{null_proxy, ClientProxy, SendError};

/// Addressing surface shared by the local registry and the distributed
/// decorator. Lookups never hold registry locks across network I/O.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn add(&self, id: ConnectionId, proxy: Arc<dyn ClientProxy>);
    async fn remove(&self, id: &ConnectionId);
    async fn add_to_group(&self, id: &ConnectionId, group: &str);
    async fn remove_from_group(&self, id: &ConnectionId, group: &str);
    /// A working proxy, or the null-object proxy when the id is unknown.
    async fn client(&self, id: &ConnectionId) -> Arc<dyn ClientProxy>;
    async fn clients(&self, ids: &[ConnectionId]) -> Arc<dyn ClientProxy>;
    async fn group(&self, name: &str) -> Arc<dyn ClientProxy>;
    async fn all(&self) -> Arc<dyn ClientProxy>;
    async fn all_except(&self, id: &ConnectionId) -> Arc<dyn ClientProxy>;
    async fn count(&self) -> usize;
}

/// Registry of all connected clients on this process, with a secondary
/// index from group name to member connection ids.
///
/// Cloning is cheap; clones share the same maps.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    clients: DashMap<ConnectionId, Arc<dyn ClientProxy>>,
    groups: RwLock<HashMap<String, HashSet<ConnectionId>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; last write wins on a duplicate id.
    pub fn insert(&self, id: ConnectionId, proxy: Arc<dyn ClientProxy>) {
        self.inner.clients.insert(id, proxy);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn ClientProxy>> {
        self.inner.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a connection and purge it from every group it belongs to.
    /// No-op when the id is absent.
    pub fn drop_connection(&self, id: &ConnectionId) {
        self.inner.clients.remove(id);
        let mut groups = self.inner.groups.write();
        for members in groups.values_mut() {
            members.remove(id);
        }
    }

    /// Groups are created lazily; duplicate joins are no-ops.
    pub fn join(&self, id: &ConnectionId, group: &str) {
        self.inner
            .groups
            .write()
            .entry(group.to_owned())
            .or_default()
            .insert(id.clone());
    }

    /// Idempotent. An emptied group remains a valid, addressable group.
    pub fn leave(&self, id: &ConnectionId, group: &str) {
        if let Some(members) = self.inner.groups.write().get_mut(group) {
            members.remove(id);
        }
    }

    /// Snapshot of a group's current membership.
    pub fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.inner
            .groups
            .read()
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every connected id.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }
}

/// Deliver to each resolved target, isolating per-member failures.
async fn fan_out(registry: &ClientRegistry, targets: Vec<ConnectionId>, method: &str, arguments: &[Value]) {
    for id in targets {
        if let Some(proxy) = registry.get(&id) {
            if let Err(e) = proxy.send(method, arguments.to_vec()).await {
                warn!(conn_id = %id, error = %e, "fan-out member send failed");
            }
        }
    }
}

/// Fan-out over an explicit id list, resolved lazily at send time.
struct MultiProxy {
    registry: ClientRegistry,
    targets: Vec<ConnectionId>,
}

#[async_trait]
impl ClientProxy for MultiProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        fan_out(&self.registry, self.targets.clone(), method, &arguments).await;
        Ok(())
    }
}

/// Fan-out over a named group; membership is read when `send` runs, so
/// joins and leaves between obtaining the handle and sending are honored.
struct GroupProxy {
    registry: ClientRegistry,
    group: String,
}

#[async_trait]
impl ClientProxy for GroupProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let targets = self.registry.members(&self.group);
        fan_out(&self.registry, targets, method, &arguments).await;
        Ok(())
    }
}

/// Whole-registry fan-out, optionally excluding one connection ("all but
/// self").
struct BroadcastProxy {
    registry: ClientRegistry,
    exclude: Option<ConnectionId>,
}

#[async_trait]
impl ClientProxy for BroadcastProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let targets = self
            .registry
            .connection_ids()
            .into_iter()
            .filter(|id| self.exclude.as_ref() != Some(id))
            .collect();
        fan_out(&self.registry, targets, method, &arguments).await;
        Ok(())
    }
}

/// Fan-out over prebuilt proxies. Used by the distributed registry to
/// combine a local fan-out with one batched remote proxy per node.
pub struct FanOutProxy {
    targets: Vec<Arc<dyn ClientProxy>>,
}

impl FanOutProxy {
    pub fn new(targets: Vec<Arc<dyn ClientProxy>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl ClientProxy for FanOutProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        for target in &self.targets {
            if let Err(e) = target.send(method, arguments.clone()).await {
                warn!(error = %e, "fan-out target send failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for ClientRegistry {
    async fn add(&self, id: ConnectionId, proxy: Arc<dyn ClientProxy>) {
        self.insert(id, proxy);
    }

    async fn remove(&self, id: &ConnectionId) {
        self.drop_connection(id);
    }

    async fn add_to_group(&self, id: &ConnectionId, group: &str) {
        self.join(id, group);
    }

    async fn remove_from_group(&self, id: &ConnectionId, group: &str) {
        self.leave(id, group);
    }

    async fn client(&self, id: &ConnectionId) -> Arc<dyn ClientProxy> {
        self.get(id).unwrap_or_else(null_proxy)
    }

    async fn clients(&self, ids: &[ConnectionId]) -> Arc<dyn ClientProxy> {
        Arc::new(MultiProxy {
            registry: self.clone(),
            targets: ids.to_vec(),
        })
    }

    async fn group(&self, name: &str) -> Arc<dyn ClientProxy> {
        Arc::new(GroupProxy {
            registry: self.clone(),
            group: name.to_owned(),
        })
    }

    async fn all(&self) -> Arc<dyn ClientProxy> {
        Arc::new(BroadcastProxy {
            registry: self.clone(),
            exclude: None,
        })
    }

    async fn all_except(&self, id: &ConnectionId) -> Arc<dyn ClientProxy> {
        Arc::new(BroadcastProxy {
            registry: self.clone(),
            exclude: Some(id.clone()),
        })
    }

    async fn count(&self) -> usize {
        self.len()
    }
}
