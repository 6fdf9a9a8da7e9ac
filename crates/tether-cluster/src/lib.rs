pub mod bus;
pub mod distributed;

pub use bus::{BusError, BusSubscription, InMemoryBus, InMemoryStore, KeyValueStore, MessageBus, StoreError};
pub use distributed::{ClusterEnvelope, DistributedRegistry, CLUSTER_TOPIC};
