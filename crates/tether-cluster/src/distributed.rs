//! Distributed registry: identical addressing semantics when connections
//! are spread across nodes. Identity lives in a shared key-value store;
//! delivery crosses nodes over a broadcast topic that every node filters
//! for itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tether_core::{ConnectionId, InvokeMessage, NodeId};
use tether_server::registry::FanOutProxy;
use tether_server::{null_proxy, ClientProxy, ClientRegistry, Registry, SendError};

use crate::bus::{KeyValueStore, MessageBus};

/// Well-known topic every node subscribes to.
pub const CLUSTER_TOPIC: &str = "tether.cluster";

/// One cross-node delivery: the owning node, the target connections on it,
/// and the envelope to hand them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterEnvelope {
    pub node: NodeId,
    pub connections: Vec<ConnectionId>,
    pub message: InvokeMessage,
}

/// Decorates the process-local registry. Local ids resolve locally; ids
/// owned by another node resolve to a proxy that publishes to the bus.
#[derive(Clone)]
pub struct DistributedRegistry {
    node: NodeId,
    local: ClientRegistry,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KeyValueStore>,
}

impl DistributedRegistry {
    pub fn new(
        node: NodeId,
        local: ClientRegistry,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            node,
            local,
            bus,
            store,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn local(&self) -> &ClientRegistry {
        &self.local
    }

    /// Start this node's subscriber: every cluster message arrives here,
    /// and only envelopes addressed to this node are delivered, resolved
    /// against the local registry exclusively.
    pub fn start(&self) -> JoinHandle<()> {
        let node = self.node.clone();
        let local = self.local.clone();
        let bus = Arc::clone(&self.bus);

        tokio::spawn(async move {
            let mut subscription = match bus.subscribe(CLUSTER_TOPIC).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(error = %e, "cluster subscribe failed, node unreachable for remote sends");
                    return;
                }
            };
            while let Some(payload) = subscription.next().await {
                let envelope: ClusterEnvelope = match serde_json::from_str(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable cluster message");
                        continue;
                    }
                };
                if envelope.node != node {
                    continue;
                }
                for id in &envelope.connections {
                    if let Some(proxy) = local.get(id) {
                        if let Err(e) = proxy
                            .send(&envelope.message.method, envelope.message.arguments.clone())
                            .await
                        {
                            warn!(conn_id = %id, error = %e, "cluster delivery failed");
                        }
                    } else {
                        debug!(conn_id = %id, "cluster message for unknown local connection");
                    }
                }
            }
        })
    }

    /// Look up the owning node for a connection id. Store failures degrade
    /// to "not found".
    async fn owner_of(&self, id: &ConnectionId) -> Option<NodeId> {
        match self.store.get(id.as_str()).await {
            Ok(Some(node)) => Some(NodeId::from_raw(node)),
            Ok(None) => None,
            Err(e) => {
                warn!(conn_id = %id, error = %e, "store lookup failed, treating as not found");
                None
            }
        }
    }

    fn remote_proxy(&self, node: NodeId, connections: Vec<ConnectionId>) -> Arc<dyn ClientProxy> {
        Arc::new(RemoteProxy {
            bus: Arc::clone(&self.bus),
            node,
            connections,
        })
    }
}

/// Proxy for connections owned by another node: `send` publishes one
/// cluster envelope instead of writing bytes. Publish failures degrade to
/// a silent no-op, matching the null-object contract.
struct RemoteProxy {
    bus: Arc<dyn MessageBus>,
    node: NodeId,
    connections: Vec<ConnectionId>,
}

#[async_trait]
impl ClientProxy for RemoteProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let envelope = ClusterEnvelope {
            node: self.node.clone(),
            connections: self.connections.clone(),
            message: InvokeMessage::call(method, arguments),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node = %self.node, error = %e, "failed to encode cluster envelope");
                return Ok(());
            }
        };
        if let Err(e) = self.bus.publish(CLUSTER_TOPIC, payload).await {
            warn!(node = %self.node, error = %e, "cluster publish failed, dropping send");
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for DistributedRegistry {
    /// Local insertion plus the alive-key record; the record's lifetime is
    /// the connection's, not a cache TTL.
    async fn add(&self, id: ConnectionId, proxy: Arc<dyn ClientProxy>) {
        self.local.insert(id.clone(), proxy);
        if let Err(e) = self.store.put(id.as_str(), self.node.as_str()).await {
            warn!(conn_id = %id, error = %e, "failed to record connection owner");
        }
    }

    async fn remove(&self, id: &ConnectionId) {
        self.local.drop_connection(id);
        if let Err(e) = self.store.delete(id.as_str()).await {
            warn!(conn_id = %id, error = %e, "failed to delete connection owner record");
        }
    }

    async fn add_to_group(&self, id: &ConnectionId, group: &str) {
        self.local.join(id, group);
    }

    async fn remove_from_group(&self, id: &ConnectionId, group: &str) {
        self.local.leave(id, group);
    }

    async fn client(&self, id: &ConnectionId) -> Arc<dyn ClientProxy> {
        if let Some(proxy) = self.local.get(id) {
            return proxy;
        }
        match self.owner_of(id).await {
            Some(node) => self.remote_proxy(node, vec![id.clone()]),
            None => null_proxy(),
        }
    }

    /// Partition into the local fan-out plus one batched publish per
    /// distinct owning node. Unresolvable ids drop out silently.
    async fn clients(&self, ids: &[ConnectionId]) -> Arc<dyn ClientProxy> {
        let mut local_ids = Vec::new();
        let mut by_node: HashMap<NodeId, Vec<ConnectionId>> = HashMap::new();

        for id in ids {
            if self.local.get(id).is_some() {
                local_ids.push(id.clone());
            } else if let Some(node) = self.owner_of(id).await {
                by_node.entry(node).or_default().push(id.clone());
            }
        }

        let mut targets: Vec<Arc<dyn ClientProxy>> = Vec::new();
        if !local_ids.is_empty() {
            targets.push(self.local.clients(&local_ids).await);
        }
        for (node, connections) in by_node {
            targets.push(self.remote_proxy(node, connections));
        }
        Arc::new(FanOutProxy::new(targets))
    }

    // Group membership and broadcast fan-out stay node-local; cross-node
    // addressing is by connection id.
    async fn group(&self, name: &str) -> Arc<dyn ClientProxy> {
        self.local.group(name).await
    }

    async fn all(&self) -> Arc<dyn ClientProxy> {
        self.local.all().await
    }

    async fn all_except(&self, id: &ConnectionId) -> Arc<dyn ClientProxy> {
        self.local.all_except(id).await
    }

    async fn count(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, InMemoryStore};
    use serde_json::json;
    use tether_core::Direction;

    #[test]
    fn cluster_envelope_roundtrip() {
        let envelope = ClusterEnvelope {
            node: NodeId::from_raw("node_x"),
            connections: vec![ConnectionId::from_raw("conn_1"), ConnectionId::from_raw("conn_2")],
            message: InvokeMessage::call("Ping", vec![json!(1)]),
        };
        let parsed: ClusterEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(parsed.node, envelope.node);
        assert_eq!(parsed.connections, envelope.connections);
        assert_eq!(parsed.message, envelope.message);
        assert_eq!(parsed.message.direction, Direction::Call);
    }

    #[tokio::test]
    async fn add_records_owner_and_remove_deletes_it() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStore::new());
        let registry = DistributedRegistry::new(
            NodeId::from_raw("node_x"),
            ClientRegistry::new(),
            bus,
            store.clone(),
        );

        let id = ConnectionId::from_raw("conn_1");
        registry.add(id.clone(), null_proxy()).await;
        assert_eq!(store.get("conn_1").await.unwrap().as_deref(), Some("node_x"));

        registry.remove(&id).await;
        assert_eq!(store.get("conn_1").await.unwrap(), None);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn unknown_id_resolves_to_null_object() {
        let registry = DistributedRegistry::new(
            NodeId::from_raw("node_x"),
            ClientRegistry::new(),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryStore::new()),
        );

        let proxy = registry.client(&ConnectionId::from_raw("conn_ghost")).await;
        assert!(proxy.send("Ping", vec![]).await.is_ok());
    }
}
