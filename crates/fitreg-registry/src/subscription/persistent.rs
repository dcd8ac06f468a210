//! Persistent subscription repository

use super::SubscriptionRepository;
use crate::error::RegistryResult;
use crate::store::SubscriptionTableOperation;
use async_trait::async_trait;
use fitreg_core::{FitableKey, Listener, SubscriptionEntry};
use std::sync::Arc;
use tracing::info;

/// Subscription repository backed by the subscription table port
pub struct PersistentSubscriptionRepository {
    table: Arc<dyn SubscriptionTableOperation>,
}

impl PersistentSubscriptionRepository {
    pub fn new(table: Arc<dyn SubscriptionTableOperation>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl SubscriptionRepository for PersistentSubscriptionRepository {
    async fn start(&self) -> RegistryResult<()> {
        self.table.init().await?;
        info!("persistent subscription repository started");
        Ok(())
    }

    async fn stop(&self) -> RegistryResult<()> {
        Ok(())
    }

    async fn insert(&self, entry: &SubscriptionEntry) -> RegistryResult<()> {
        self.table.save(entry).await
    }

    async fn remove(&self, entry: &SubscriptionEntry) -> RegistryResult<()> {
        self.table
            .delete(&entry.fitable_key, &entry.listener.id())
            .await
    }

    async fn remove_by_listener(&self, listener: &Listener) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.table.delete_by_listener(&listener.id()).await
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.table.query(key).await
    }

    async fn query_all(&self) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.table.query_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTableStore;
    use fitreg_core::Address;

    #[tokio::test]
    async fn test_insert_query_remove() {
        let store = Arc::new(MemoryTableStore::new());
        let repo = PersistentSubscriptionRepository::new(store.clone());
        repo.start().await.unwrap();

        let key = FitableKey::new("g1", "v1", "f1");
        let listener = Listener::new("cb", Address::new("w9", "10.0.0.9", 9000));
        let entry = SubscriptionEntry::new(key.clone(), listener.clone());
        repo.insert(&entry).await.unwrap();
        repo.insert(&entry).await.unwrap();
        assert_eq!(repo.query(&key).await.unwrap().len(), 1);

        let removed = repo.remove_by_listener(&listener).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(repo.query_all().await.unwrap().is_empty());
    }
}
