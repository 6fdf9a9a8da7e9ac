//! Two-node addressing over the in-memory bus and store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tether_cluster::{ClusterEnvelope, DistributedRegistry, InMemoryBus, InMemoryStore, MessageBus, CLUSTER_TOPIC};
use tether_core::{ConnectionId, NodeId};
use tether_server::{ClientProxy, ClientRegistry, Registry, SendError};

struct RecordingProxy {
    tx: mpsc::UnboundedSender<(String, Vec<Value>)>,
}

#[async_trait]
impl ClientProxy for RecordingProxy {
    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        self.tx
            .send((method.to_owned(), arguments))
            .map_err(|_| SendError::Closed)
    }
}

fn recording() -> (Arc<dyn ClientProxy>, mpsc::UnboundedReceiver<(String, Vec<Value>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingProxy { tx }), rx)
}

struct TwoNodes {
    bus: Arc<InMemoryBus>,
    store: Arc<InMemoryStore>,
    node_x: DistributedRegistry,
    node_y: DistributedRegistry,
}

/// Two registries sharing one bus and one store, both subscribers started.
async fn two_nodes() -> TwoNodes {
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryStore::new());
    let node_x = DistributedRegistry::new(
        NodeId::from_raw("node_x"),
        ClientRegistry::new(),
        bus.clone(),
        store.clone(),
    );
    let node_y = DistributedRegistry::new(
        NodeId::from_raw("node_y"),
        ClientRegistry::new(),
        bus.clone(),
        store.clone(),
    );
    node_x.start();
    node_y.start();
    // Let both subscriber tasks attach before anything publishes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    TwoNodes {
        bus,
        store,
        node_x,
        node_y,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn remote_send_reaches_owning_node_exactly_once() {
    let nodes = two_nodes().await;

    let c1 = ConnectionId::from_raw("conn_1");
    let (proxy_c1, mut rx_c1) = recording();
    nodes.node_x.add(c1.clone(), proxy_c1).await;

    // c2 also lives on X but is not addressed.
    let c2 = ConnectionId::from_raw("conn_2");
    let (proxy_c2, mut rx_c2) = recording();
    nodes.node_x.add(c2.clone(), proxy_c2).await;

    // Y has no local knowledge of c1; the send must cross the bus.
    nodes
        .node_y
        .client(&c1)
        .await
        .send("Ping", vec![])
        .await
        .unwrap();
    settle().await;

    assert_eq!(rx_c1.recv().await.unwrap().0, "Ping");
    assert!(rx_c1.try_recv().is_err(), "delivered more than once");
    assert!(rx_c2.try_recv().is_err(), "delivered to an unaddressed connection");
}

#[tokio::test]
async fn local_resolution_bypasses_the_bus() {
    let nodes = two_nodes().await;

    let c1 = ConnectionId::from_raw("conn_1");
    let (proxy, mut rx) = recording();
    nodes.node_x.add(c1.clone(), proxy).await;

    // Observe all bus traffic.
    let mut taps = nodes.bus.subscribe(CLUSTER_TOPIC).await.unwrap();

    nodes
        .node_x
        .client(&c1)
        .await
        .send("Ping", vec![])
        .await
        .unwrap();
    settle().await;

    assert_eq!(rx.recv().await.unwrap().0, "Ping");
    assert!(
        tokio::time::timeout(Duration::from_millis(50), taps.next())
            .await
            .is_err(),
        "a local send crossed the bus"
    );
}

#[tokio::test]
async fn store_miss_is_a_silent_no_op() {
    let nodes = two_nodes().await;

    let ghost = ConnectionId::from_raw("conn_ghost");
    let proxy = nodes.node_y.client(&ghost).await;
    assert!(proxy.send("Ping", vec![]).await.is_ok());
    settle().await;
    assert!(nodes.store.is_empty());
}

#[tokio::test]
async fn clients_batches_one_publish_per_remote_node() {
    let nodes = two_nodes().await;

    // c1, c2 on X; c3 on Y.
    let c1 = ConnectionId::from_raw("conn_1");
    let c2 = ConnectionId::from_raw("conn_2");
    let c3 = ConnectionId::from_raw("conn_3");
    let (p1, mut rx1) = recording();
    let (p2, mut rx2) = recording();
    let (p3, mut rx3) = recording();
    nodes.node_x.add(c1.clone(), p1).await;
    nodes.node_x.add(c2.clone(), p2).await;
    nodes.node_y.add(c3.clone(), p3).await;

    let mut taps = nodes.bus.subscribe(CLUSTER_TOPIC).await.unwrap();

    // From Y: c3 is local, c1 + c2 ride one batched envelope to X.
    nodes
        .node_y
        .clients(&[c1.clone(), c2.clone(), c3.clone()])
        .await
        .send("Sweep", vec![])
        .await
        .unwrap();
    settle().await;

    assert_eq!(rx1.recv().await.unwrap().0, "Sweep");
    assert_eq!(rx2.recv().await.unwrap().0, "Sweep");
    assert_eq!(rx3.recv().await.unwrap().0, "Sweep");

    let payload = taps.next().await.unwrap();
    let envelope: ClusterEnvelope = serde_json::from_str(&payload).unwrap();
    assert_eq!(envelope.node, NodeId::from_raw("node_x"));
    assert_eq!(envelope.connections.len(), 2);
    assert!(envelope.connections.contains(&c1));
    assert!(envelope.connections.contains(&c2));
    assert!(
        tokio::time::timeout(Duration::from_millis(50), taps.next())
            .await
            .is_err(),
        "expected exactly one publish for the remote node"
    );
}

#[tokio::test]
async fn removed_connection_is_unaddressable_from_every_node() {
    let nodes = two_nodes().await;

    let c1 = ConnectionId::from_raw("conn_1");
    let (proxy, mut rx) = recording();
    nodes.node_x.add(c1.clone(), proxy).await;
    nodes.node_x.remove(&c1).await;

    nodes
        .node_y
        .client(&c1)
        .await
        .send("Ping", vec![])
        .await
        .unwrap();
    settle().await;

    assert!(rx.try_recv().is_err());
    assert!(nodes.store.is_empty());
}

#[tokio::test]
async fn foreign_envelopes_are_ignored() {
    let nodes = two_nodes().await;

    let c1 = ConnectionId::from_raw("conn_1");
    let (proxy, mut rx) = recording();
    nodes.node_x.add(c1.clone(), proxy).await;

    // Hand-craft an envelope addressed to a node that does not exist; both
    // running nodes must filter it out, even though c1 is listed.
    let envelope = ClusterEnvelope {
        node: NodeId::from_raw("node_z"),
        connections: vec![c1],
        message: tether_core::InvokeMessage::call("Ping", vec![]),
    };
    nodes
        .bus
        .publish(CLUSTER_TOPIC, serde_json::to_string(&envelope).unwrap())
        .await
        .unwrap();
    settle().await;

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn group_operations_stay_node_local() {
    let nodes = two_nodes().await;

    let c1 = ConnectionId::from_raw("conn_1");
    let (proxy, mut rx) = recording();
    nodes.node_x.add(c1.clone(), proxy).await;
    nodes.node_x.add_to_group(&c1, "room1").await;

    // The same group name on Y is a different, empty group.
    nodes
        .node_y
        .group("room1")
        .await
        .send("Message", vec![])
        .await
        .unwrap();
    settle().await;
    assert!(rx.try_recv().is_err());

    nodes
        .node_x
        .group("room1")
        .await
        .send("Message", vec![])
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().0, "Message");
}
