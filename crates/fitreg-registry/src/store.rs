//! Durable table ports
//!
//! Narrow per-entity CRUD interfaces to the durable store, plus an in-memory
//! backend for tests and single-node deployments.
//!
//! TigerStyle: Explicit trait bounds, explicit error handling.

use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use fitreg_core::{Address, Application, Extensions, FitableKey, ListenerId, SubscriptionEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::instrument;

// =============================================================================
// Rows
// =============================================================================

/// Durable worker row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: String,
    pub application: Application,
    pub environment: String,
}

/// Durable fitable row: one fitable served by one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitableRow {
    pub fitable: FitableKey,
    pub worker_id: String,
    pub application: Application,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extensions: Extensions,
}

// =============================================================================
// Ports
// =============================================================================

/// Worker table in the durable store
#[async_trait]
pub trait WorkerTableOperation: Send + Sync {
    async fn init(&self) -> RegistryResult<()>;
    async fn save(&self, row: &WorkerRow) -> RegistryResult<()>;
    async fn query(&self, worker_id: &str) -> RegistryResult<Option<WorkerRow>>;
    async fn query_all(&self) -> RegistryResult<Vec<WorkerRow>>;
    async fn delete(&self, worker_id: &str) -> RegistryResult<()>;
}

/// Address table in the durable store
#[async_trait]
pub trait AddressTableOperation: Send + Sync {
    async fn init(&self) -> RegistryResult<()>;
    /// Upsert by `(id, port)`
    async fn save(&self, addresses: &[Address]) -> RegistryResult<()>;
    async fn query(&self, worker_id: &str) -> RegistryResult<Vec<Address>>;
    async fn query_all(&self) -> RegistryResult<Vec<Address>>;
    async fn delete(&self, worker_id: &str) -> RegistryResult<()>;
}

/// Fitable table in the durable store
#[async_trait]
pub trait FitableTableOperation: Send + Sync {
    async fn init(&self) -> RegistryResult<()>;
    /// Upsert by `(fitable, worker_id)`
    async fn save(&self, row: &FitableRow) -> RegistryResult<()>;
    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<FitableRow>>;
    async fn query_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<FitableRow>>;
    async fn query_by_worker(&self, worker_id: &str) -> RegistryResult<Vec<FitableRow>>;
    async fn query_all(&self) -> RegistryResult<Vec<FitableRow>>;
    async fn delete(&self, key: &FitableKey, worker_id: &str) -> RegistryResult<()>;
}

/// Subscription table in the durable store
#[async_trait]
pub trait SubscriptionTableOperation: Send + Sync {
    async fn init(&self) -> RegistryResult<()>;
    /// Upsert by `(fitable_key, listener identity)`
    async fn save(&self, entry: &SubscriptionEntry) -> RegistryResult<()>;
    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<SubscriptionEntry>>;
    async fn query_all(&self) -> RegistryResult<Vec<SubscriptionEntry>>;
    async fn delete(&self, key: &FitableKey, listener: &ListenerId) -> RegistryResult<()>;
    /// Remove every entry of one listener; returns the removed entries
    async fn delete_by_listener(&self, listener: &ListenerId) -> RegistryResult<Vec<SubscriptionEntry>>;
}

// =============================================================================
// MemoryTableStore
// =============================================================================

#[derive(Debug, Default)]
struct StoreData {
    workers: BTreeMap<String, WorkerRow>,
    addresses: BTreeMap<(String, u16), Address>,
    fitables: BTreeMap<(FitableKey, String), FitableRow>,
    subscriptions: BTreeMap<(FitableKey, ListenerId), SubscriptionEntry>,
}

/// In-memory durable store implementing every table port
///
/// Writes can be made to fail with [`MemoryTableStore::set_fail_writes`] to
/// simulate an unavailable store.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    data: RwLock<StoreData>,
    fail_writes: AtomicBool,
    write_count: AtomicU64,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes and deletes across all tables
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    fn check_write(&self, table: &str) -> RegistryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RegistryError::storage_failed(table, "store unavailable"));
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of fitable rows (test helper)
    pub async fn fitable_row_count(&self) -> usize {
        self.data.read().await.fitables.len()
    }

    /// Number of subscription rows (test helper)
    pub async fn subscription_row_count(&self) -> usize {
        self.data.read().await.subscriptions.len()
    }
}

#[async_trait]
impl WorkerTableOperation for MemoryTableStore {
    async fn init(&self) -> RegistryResult<()> {
        Ok(())
    }

    #[instrument(skip(self, row), fields(worker_id = %row.worker_id))]
    async fn save(&self, row: &WorkerRow) -> RegistryResult<()> {
        self.check_write("worker")?;
        self.data
            .write()
            .await
            .workers
            .insert(row.worker_id.clone(), row.clone());
        Ok(())
    }

    async fn query(&self, worker_id: &str) -> RegistryResult<Option<WorkerRow>> {
        Ok(self.data.read().await.workers.get(worker_id).cloned())
    }

    async fn query_all(&self) -> RegistryResult<Vec<WorkerRow>> {
        Ok(self.data.read().await.workers.values().cloned().collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, worker_id: &str) -> RegistryResult<()> {
        self.check_write("worker")?;
        self.data.write().await.workers.remove(worker_id);
        Ok(())
    }
}

#[async_trait]
impl AddressTableOperation for MemoryTableStore {
    async fn init(&self) -> RegistryResult<()> {
        Ok(())
    }

    #[instrument(skip(self, addresses), fields(count = addresses.len()))]
    async fn save(&self, addresses: &[Address]) -> RegistryResult<()> {
        self.check_write("address")?;
        let mut data = self.data.write().await;
        for address in addresses {
            data.addresses
                .insert((address.id.clone(), address.port), address.clone());
        }
        Ok(())
    }

    async fn query(&self, worker_id: &str) -> RegistryResult<Vec<Address>> {
        let data = self.data.read().await;
        Ok(data
            .addresses
            .range((worker_id.to_string(), 0)..=(worker_id.to_string(), u16::MAX))
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn query_all(&self) -> RegistryResult<Vec<Address>> {
        Ok(self.data.read().await.addresses.values().cloned().collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, worker_id: &str) -> RegistryResult<()> {
        self.check_write("address")?;
        self.data
            .write()
            .await
            .addresses
            .retain(|(id, _), _| id != worker_id);
        Ok(())
    }
}

#[async_trait]
impl FitableTableOperation for MemoryTableStore {
    async fn init(&self) -> RegistryResult<()> {
        Ok(())
    }

    #[instrument(skip(self, row), fields(fitable = %row.fitable, worker_id = %row.worker_id))]
    async fn save(&self, row: &FitableRow) -> RegistryResult<()> {
        self.check_write("fitable")?;
        self.data
            .write()
            .await
            .fitables
            .insert((row.fitable.clone(), row.worker_id.clone()), row.clone());
        Ok(())
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<FitableRow>> {
        let data = self.data.read().await;
        Ok(data
            .fitables
            .range((key.clone(), String::new())..)
            .take_while(|((k, _), _)| k == key)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn query_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<FitableRow>> {
        let data = self.data.read().await;
        Ok(data
            .fitables
            .values()
            .filter(|row| row.fitable.generic_id == generic_id)
            .cloned()
            .collect())
    }

    async fn query_by_worker(&self, worker_id: &str) -> RegistryResult<Vec<FitableRow>> {
        let data = self.data.read().await;
        Ok(data
            .fitables
            .values()
            .filter(|row| row.worker_id == worker_id)
            .cloned()
            .collect())
    }

    async fn query_all(&self) -> RegistryResult<Vec<FitableRow>> {
        Ok(self.data.read().await.fitables.values().cloned().collect())
    }

    #[instrument(skip(self, key), fields(fitable = %key))]
    async fn delete(&self, key: &FitableKey, worker_id: &str) -> RegistryResult<()> {
        self.check_write("fitable")?;
        self.data
            .write()
            .await
            .fitables
            .remove(&(key.clone(), worker_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl SubscriptionTableOperation for MemoryTableStore {
    async fn init(&self) -> RegistryResult<()> {
        Ok(())
    }

    #[instrument(skip(self, entry), fields(fitable = %entry.fitable_key, listener = %entry.listener.address.id))]
    async fn save(&self, entry: &SubscriptionEntry) -> RegistryResult<()> {
        self.check_write("subscription")?;
        self.data.write().await.subscriptions.insert(
            (entry.fitable_key.clone(), entry.listener.id()),
            entry.clone(),
        );
        Ok(())
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<SubscriptionEntry>> {
        let data = self.data.read().await;
        Ok(data
            .subscriptions
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn query_all(&self) -> RegistryResult<Vec<SubscriptionEntry>> {
        Ok(self.data.read().await.subscriptions.values().cloned().collect())
    }

    #[instrument(skip(self, key, listener), fields(fitable = %key, listener = %listener.address_id))]
    async fn delete(&self, key: &FitableKey, listener: &ListenerId) -> RegistryResult<()> {
        self.check_write("subscription")?;
        self.data
            .write()
            .await
            .subscriptions
            .remove(&(key.clone(), listener.clone()));
        Ok(())
    }

    #[instrument(skip(self, listener), fields(listener = %listener.address_id))]
    async fn delete_by_listener(&self, listener: &ListenerId) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.check_write("subscription")?;
        let mut data = self.data.write().await;
        let mut removed = Vec::new();
        data.subscriptions.retain(|(_, id), entry| {
            if id == listener {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitreg_core::Listener;

    fn row(f: &str, worker: &str) -> FitableRow {
        FitableRow {
            fitable: FitableKey::new("g1", "v1", f),
            worker_id: worker.into(),
            application: Application::new("appA", "vA"),
            timeout_seconds: 60,
            aliases: vec![],
            tags: vec![],
            extensions: Extensions::new(),
        }
    }

    #[tokio::test]
    async fn test_fitable_rows_by_key_and_worker() {
        let store = MemoryTableStore::new();
        FitableTableOperation::save(&store, &row("f1", "w1")).await.unwrap();
        FitableTableOperation::save(&store, &row("f1", "w2")).await.unwrap();
        FitableTableOperation::save(&store, &row("f2", "w1")).await.unwrap();

        let key = FitableKey::new("g1", "v1", "f1");
        assert_eq!(FitableTableOperation::query(&store, &key).await.unwrap().len(), 2);
        assert_eq!(store.query_by_worker("w1").await.unwrap().len(), 2);
        assert_eq!(store.query_by_generic_id("g1").await.unwrap().len(), 3);

        FitableTableOperation::delete(&store, &key, "w1").await.unwrap();
        assert_eq!(FitableTableOperation::query(&store, &key).await.unwrap().len(), 1);
        assert_eq!(store.write_count(), 4);
    }

    #[test]
    fn test_fitable_row_decodes_without_optional_columns() {
        let json = r#"{
            "fitable": {"generic_id": "g1", "generic_version": "v1", "fitable_id": "f1"},
            "worker_id": "w1",
            "application": {"name": "appA", "name_version": "vA"},
            "timeout_seconds": 60
        }"#;
        let decoded: FitableRow = serde_json::from_str(json).unwrap();
        assert_eq!(decoded, row("f1", "w1"));
    }

    #[tokio::test]
    async fn test_address_rows_grouped_by_worker() {
        let store = MemoryTableStore::new();
        AddressTableOperation::save(
            &store,
            &[
                Address::new("w1", "10.0.0.1", 8080),
                Address::new("w1", "10.0.0.1", 8081),
                Address::new("w10", "10.0.0.2", 8080),
            ],
        )
        .await
        .unwrap();

        assert_eq!(AddressTableOperation::query(&store, "w1").await.unwrap().len(), 2);
        AddressTableOperation::delete(&store, "w1").await.unwrap();
        assert_eq!(AddressTableOperation::query_all(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_toggle() {
        let store = MemoryTableStore::new();
        store.set_fail_writes(true);
        let err = FitableTableOperation::save(&store, &row("f1", "w1"))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.fitable_row_count().await, 0);

        store.set_fail_writes(false);
        FitableTableOperation::save(&store, &row("f1", "w1")).await.unwrap();
        assert_eq!(store.fitable_row_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscription_rows_by_listener() {
        let store = MemoryTableStore::new();
        let listener = Listener::new("cb", Address::new("w9", "10.0.0.9", 9000));
        for f in ["f1", "f2"] {
            SubscriptionTableOperation::save(
                &store,
                &SubscriptionEntry::new(FitableKey::new("g1", "v1", f), listener.clone()),
            )
            .await
            .unwrap();
        }

        let removed = store.delete_by_listener(&listener.id()).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.subscription_row_count().await, 0);
    }
}
