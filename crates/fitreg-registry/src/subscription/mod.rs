//! Subscriptions: who wants to hear about which fitable
//!
//! TigerStyle: Memory is authoritative for reads, the durable tier is written
//! behind, peers are kept in step by node-sync.

mod async_repo;
mod gc;
mod memory;
mod persistent;
mod service;

pub use async_repo::{AsyncSubscriptionInfo, AsyncSubscriptionRepository, AsyncSubscriptionState};
pub use gc::{ListenerGarbageCollector, ListenerLiveness, StaticLiveness};
pub use memory::SubscriptionMemoryRepository;
pub use persistent::PersistentSubscriptionRepository;
pub use service::SubscriptionService;

use crate::error::RegistryResult;
use async_trait::async_trait;
use fitreg_core::{FitableKey, Listener, SubscriptionEntry};

/// CRUD over subscription entries in the durable tier
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn start(&self) -> RegistryResult<()>;

    async fn stop(&self) -> RegistryResult<()>;

    async fn insert(&self, entry: &SubscriptionEntry) -> RegistryResult<()>;

    async fn remove(&self, entry: &SubscriptionEntry) -> RegistryResult<()>;

    /// Remove every entry of `listener`; returns the deleted entries
    async fn remove_by_listener(&self, listener: &Listener) -> RegistryResult<Vec<SubscriptionEntry>>;

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<SubscriptionEntry>>;

    async fn query_all(&self) -> RegistryResult<Vec<SubscriptionEntry>>;
}
