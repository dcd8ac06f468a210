//! fitreg Registry
//!
//! The registry node: memory and durable tiers, write-behind, reconciliation,
//! peer replication, subscriptions and subscriber notification.
//!
//! # Overview
//!
//! The registry provides:
//! - An in-memory fitable index with TTL expiry and cascade removal
//! - A durable tier behind table ports, fed by sharded write-behind queues
//! - Periodic reconciliation tagged with a generation counter
//! - Batched, per-peer ordered replication to other registry nodes
//! - Subscriptions with two-strike listener garbage collection
//! - `notifyFitables` fan-out to subscribers
//!
//! # TigerStyle
//! - Explicit limits on batches, retries and pending work
//! - Drop-and-log under backpressure, reconciliation as the backstop
//! - Optional collaborators degrade to failure codes, never panics

pub mod async_repo;
pub mod election;
pub mod error;
pub mod executor;
pub mod handler;
pub mod memory;
pub mod persistent;
pub mod publisher;
pub mod repository;
pub mod service;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod tables;

pub use async_repo::{AsyncServiceInfo, AsyncServiceRepository, AsyncServiceState};
pub use election::{GcElection, StaticGcElection};
pub use error::{RegistryError, RegistryResult};
pub use executor::{SerialExecutor, SerialExecutorPool, SerialTask};
pub use handler::RegistryRpcHandler;
pub use memory::{FitableMemoryRepository, SaveOutcome, TimeoutCallback, WorkerDetail};
pub use persistent::PersistentServiceRepository;
pub use publisher::{FitableQuery, FitableStatusPublisher};
pub use repository::ServiceRepository;
pub use service::{ReadyState, RegistryMemoryRepository};
pub use store::{
    AddressTableOperation, FitableRow, FitableTableOperation, MemoryTableStore,
    SubscriptionTableOperation, WorkerRow, WorkerTableOperation,
};
pub use subscription::{
    AsyncSubscriptionInfo, AsyncSubscriptionRepository, AsyncSubscriptionState,
    ListenerGarbageCollector, ListenerLiveness, PersistentSubscriptionRepository, StaticLiveness,
    SubscriptionMemoryRepository, SubscriptionRepository, SubscriptionService,
};
pub use sync::{
    BatchReplicator, FitableNodeSync, RegistryDirectory, ReplicationItem, StaticRegistryDirectory,
    SubscriptionNodeSync,
};
pub use tables::{AddressTable, FitableMeta, FitableTable, WorkerEntry, WorkerTable};
