//! External-collaborator seams for distributed mode: a publish/subscribe
//! bus and a shared key-value store, plus in-memory implementations for
//! tests and single-host clusters.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Backend(String),
}

/// An active subscription draining one topic.
pub struct BusSubscription {
    rx: mpsc::Receiver<String>,
}

impl BusSubscription {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Broadcast bus: every subscriber of a topic sees every message published
/// to it. Delivery guarantees are whatever the backing implementation
/// offers; this core adds none of its own.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;
}

/// Shared key-value store with explicit lifetime management; entries live
/// until deleted, never expiring on their own.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

const CHANNEL_DEPTH: usize = 256;

/// Process-local bus over tokio broadcast channels, one per topic.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_DEPTH).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not a failure; the message just goes nowhere.
        let _ = self.topic_sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut broadcast_rx = self.topic_sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged, dropped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }
}

/// DashMap-backed store for tests and single-host clusters.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
