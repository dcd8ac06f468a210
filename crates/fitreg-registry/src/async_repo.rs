//! Write-behind service repository
//!
//! TigerStyle: Bounded retries, per-shard FIFO, explicit queue mutations.
//!
//! Every save/remove becomes an [`AsyncServiceInfo`] batch appended to one of N
//! shard queues, picked by hashing the primary address ID. One consumer task
//! per shard applies batches to the wrapped repository in order.
//!
//! Queue mutations on enqueue:
//! - ClearSameFitable: a queued item with the same `(fitable, worker ID, port)`
//!   is removed from its batch, so only the latest intent survives
//! - adjacent batches of the same state are merged
//!
//! Batches live in a per-shard arena keyed by monotonically increasing IDs.
//! The identity index points at arena IDs; an ID no longer in the arena means
//! the batch was already taken by the consumer.

use crate::error::RegistryResult;
use crate::repository::ServiceRepository;
use async_trait::async_trait;
use fitreg_core::{Address, Application, FitableKey, PersistenceConfig, ServiceRegistration};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a queued batch does to the durable tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncServiceState {
    Save,
    Remove,
    RemoveByWorkerAddress,
}

/// A queued write-behind batch
#[derive(Debug, Clone)]
pub struct AsyncServiceInfo {
    pub state: AsyncServiceState,
    pub items: Vec<ServiceRegistration>,
}

type BatchId = u64;

/// `(fitable, worker ID, port)` of a queued item
type ItemIdentity = (FitableKey, String, u16);

fn identity(registration: &ServiceRegistration) -> Option<ItemIdentity> {
    registration
        .primary_address()
        .map(|a| (registration.fitable.clone(), a.id.clone(), a.port))
}

#[derive(Debug, Default)]
struct ShardQueue {
    order: VecDeque<BatchId>,
    batches: HashMap<BatchId, AsyncServiceInfo>,
    index: HashMap<ItemIdentity, BatchId>,
    next_id: BatchId,
    in_flight_items: usize,
    stopping: bool,
}

impl ShardQueue {
    fn clear_same_fitable(&mut self, target: &ItemIdentity) {
        let Some(batch_id) = self.index.remove(target) else {
            return;
        };
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        batch
            .items
            .retain(|item| identity(item).as_ref() != Some(target));
        if batch.items.is_empty() {
            self.batches.remove(&batch_id);
            self.order.retain(|id| *id != batch_id);
        }
    }

    fn push(&mut self, info: AsyncServiceInfo) {
        if info.state != AsyncServiceState::RemoveByWorkerAddress {
            for item in &info.items {
                if let Some(id) = identity(item) {
                    self.clear_same_fitable(&id);
                }
            }
        }

        let merge_target = self
            .order
            .back()
            .copied()
            .filter(|id| self.batches.get(id).map(|b| b.state) == Some(info.state));

        let batch_id = match merge_target {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.batches.insert(
                    id,
                    AsyncServiceInfo {
                        state: info.state,
                        items: Vec::new(),
                    },
                );
                self.order.push_back(id);
                id
            }
        };

        if info.state != AsyncServiceState::RemoveByWorkerAddress {
            for item in &info.items {
                if let Some(id) = identity(item) {
                    self.index.insert(id, batch_id);
                }
            }
        }
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.items.extend(info.items);
        }
    }

    fn pop(&mut self) -> Option<AsyncServiceInfo> {
        let id = self.order.pop_front()?;
        let batch = self.batches.remove(&id)?;
        for item in &batch.items {
            if let Some(identity) = identity(item) {
                if self.index.get(&identity) == Some(&id) {
                    self.index.remove(&identity);
                }
            }
        }
        self.in_flight_items = batch.items.len();
        Some(batch)
    }

    fn queued_items(&self) -> usize {
        self.batches.values().map(|b| b.items.len()).sum()
    }
}

#[derive(Debug, Default)]
struct Shard {
    queue: Mutex<ShardQueue>,
    notify: Notify,
}

/// Write-behind decorator over a [`ServiceRepository`]
///
/// Reads pass straight through to the wrapped repository.
pub struct AsyncServiceRepository {
    inner: Arc<dyn ServiceRepository>,
    shards: Vec<Arc<Shard>>,
    config: PersistenceConfig,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncServiceRepository {
    pub fn new(inner: Arc<dyn ServiceRepository>, config: PersistenceConfig) -> Self {
        assert!(config.shard_count > 0, "shard count must be positive");
        let shards = (0..config.shard_count)
            .map(|_| Arc::new(Shard::default()))
            .collect();
        Self {
            inner,
            shards,
            config,
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn shard_index(&self, registration: &ServiceRegistration) -> usize {
        let mut hasher = DefaultHasher::new();
        registration.worker_id().unwrap_or_default().hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    async fn enqueue(&self, state: AsyncServiceState, registrations: &[ServiceRegistration]) {
        let mut by_shard: HashMap<usize, Vec<ServiceRegistration>> = HashMap::new();
        for registration in registrations.iter().filter(|r| r.primary_address().is_some()) {
            by_shard
                .entry(self.shard_index(registration))
                .or_default()
                .push(registration.clone());
        }

        for (index, items) in by_shard {
            let shard = &self.shards[index];
            shard.queue.lock().await.push(AsyncServiceInfo { state, items });
            shard.notify.notify_one();
        }
    }

    /// Items queued or being applied across all shards
    pub async fn pending_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            let queue = shard.queue.lock().await;
            total += queue.queued_items() + queue.in_flight_items;
        }
        total
    }

    /// Number of queued batches in all shards (merge/clear diagnostics)
    pub async fn queued_batch_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.queue.lock().await.order.len();
        }
        total
    }

    /// Wait until every shard has drained
    pub async fn flush(&self) {
        while self.pending_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn consume(shard: Arc<Shard>, inner: Arc<dyn ServiceRepository>, config: PersistenceConfig) {
        loop {
            let batch = {
                let mut queue = shard.queue.lock().await;
                queue.in_flight_items = 0;
                match queue.pop() {
                    Some(batch) => batch,
                    None if queue.stopping => break,
                    None => {
                        drop(queue);
                        shard.notify.notified().await;
                        continue;
                    }
                }
            };
            Self::apply(inner.as_ref(), &config, batch).await;
        }
    }

    /// Apply one batch with bounded retry; the last failure is logged and dropped
    async fn apply(inner: &dyn ServiceRepository, config: &PersistenceConfig, batch: AsyncServiceInfo) {
        let count = batch.items.len();
        for attempt in 1..=config.write_retry_count_max {
            let result = match batch.state {
                AsyncServiceState::Save => inner.save_all(&batch.items).await,
                AsyncServiceState::Remove => inner.remove_all(&batch.items).await,
                AsyncServiceState::RemoveByWorkerAddress => {
                    Self::remove_workers(inner, &batch.items).await
                }
            };
            match result {
                Ok(()) => {
                    debug!(state = ?batch.state, count, "write-behind batch applied");
                    return;
                }
                Err(e) if attempt < config.write_retry_count_max => {
                    warn!(state = ?batch.state, count, attempt, error = %e, "write-behind batch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(config.write_retry_backoff_ms)).await;
                }
                Err(e) => {
                    error!(state = ?batch.state, count, attempt, error = %e, "write-behind batch dropped");
                }
            }
        }
    }

    async fn remove_workers(inner: &dyn ServiceRepository, items: &[ServiceRegistration]) -> RegistryResult<()> {
        for address in items.iter().filter_map(|r| r.primary_address()) {
            inner.remove_by_address(address).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRepository for AsyncServiceRepository {
    async fn start(&self) -> RegistryResult<()> {
        self.inner.start().await?;
        let mut consumers = self.consumers.lock().await;
        if !consumers.is_empty() {
            return Ok(());
        }
        for shard in &self.shards {
            shard.queue.lock().await.stopping = false;
            consumers.push(tokio::spawn(Self::consume(
                shard.clone(),
                self.inner.clone(),
                self.config.clone(),
            )));
        }
        info!(shards = self.shards.len(), "write-behind repository started");
        Ok(())
    }

    /// Drain every shard, then stop the consumers and the wrapped repository
    async fn stop(&self) -> RegistryResult<()> {
        for shard in &self.shards {
            shard.queue.lock().await.stopping = true;
            shard.notify.notify_one();
        }
        let consumers: Vec<JoinHandle<()>> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "write-behind consumer ended abnormally");
            }
        }
        info!("write-behind repository stopped");
        self.inner.stop().await
    }

    async fn save(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        self.enqueue(AsyncServiceState::Save, std::slice::from_ref(registration))
            .await;
        Ok(())
    }

    async fn save_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
        self.enqueue(AsyncServiceState::Save, registrations).await;
        Ok(())
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<ServiceRegistration>> {
        self.inner.query(key).await
    }

    async fn remove(&self, key: &FitableKey, address: &Address) -> RegistryResult<()> {
        let item = ServiceRegistration::new(key.clone(), Application::default(), vec![address.clone()], 0);
        self.enqueue(AsyncServiceState::Remove, &[item]).await;
        Ok(())
    }

    async fn remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
        self.enqueue(AsyncServiceState::Remove, registrations).await;
        Ok(())
    }

    /// Returns the rows durable right now; the deletion itself is deferred
    async fn remove_by_address(&self, address: &Address) -> RegistryResult<Vec<ServiceRegistration>> {
        let existing: Vec<ServiceRegistration> = self
            .inner
            .get_all_services()
            .await?
            .into_iter()
            .filter(|r| r.worker_id() == Some(address.id.as_str()))
            .collect();
        let marker = ServiceRegistration::new(
            FitableKey::new("", "", ""),
            Application::default(),
            vec![address.clone()],
            0,
        );
        self.enqueue(AsyncServiceState::RemoveByWorkerAddress, &[marker])
            .await;
        Ok(existing)
    }

    async fn get_all_services(&self) -> RegistryResult<Vec<ServiceRegistration>> {
        self.inner.get_all_services().await
    }

    async fn get_services_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<ServiceRegistration>> {
        self.inner.get_services_by_generic_id(generic_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::PersistentServiceRepository;
    use crate::store::MemoryTableStore;

    fn registration(f: &str, worker: &str, timeout: u64) -> ServiceRegistration {
        ServiceRegistration::new(
            FitableKey::new("g1", "v1", f),
            Application::new("appA", "vA"),
            vec![Address::new(worker, "10.0.0.1", 8080)],
            timeout,
        )
    }

    fn config(shards: usize) -> PersistenceConfig {
        PersistenceConfig {
            shard_count: shards,
            write_retry_count_max: 3,
            write_retry_backoff_ms: 10,
        }
    }

    fn repo(shards: usize) -> (Arc<MemoryTableStore>, AsyncServiceRepository) {
        let store = Arc::new(MemoryTableStore::new());
        let inner = Arc::new(PersistentServiceRepository::from_store(store.clone()));
        (store, AsyncServiceRepository::new(inner, config(shards)))
    }

    #[test]
    fn test_clear_same_fitable_keeps_latest_intent() {
        let mut queue = ShardQueue::default();
        queue.push(AsyncServiceInfo {
            state: AsyncServiceState::Save,
            items: vec![registration("f1", "w1", 60)],
        });
        queue.push(AsyncServiceInfo {
            state: AsyncServiceState::Remove,
            items: vec![registration("f1", "w1", 60)],
        });

        assert_eq!(queue.order.len(), 1);
        let batch = queue.pop().unwrap();
        assert_eq!(batch.state, AsyncServiceState::Remove);
        assert_eq!(batch.items.len(), 1);
    }

    #[test]
    fn test_adjacent_same_state_batches_merge() {
        let mut queue = ShardQueue::default();
        for f in ["f1", "f2", "f3"] {
            queue.push(AsyncServiceInfo {
                state: AsyncServiceState::Save,
                items: vec![registration(f, "w1", 60)],
            });
        }
        queue.push(AsyncServiceInfo {
            state: AsyncServiceState::Save,
            items: vec![registration("f1", "w1", 90)],
        });

        assert_eq!(queue.order.len(), 1);
        assert_eq!(queue.queued_items(), 3);
        let batch = queue.pop().unwrap();
        let f1 = batch
            .items
            .iter()
            .find(|r| r.fitable.fitable_id == "f1")
            .unwrap();
        assert_eq!(f1.timeout_seconds, 90);
    }

    #[test]
    fn test_taken_batch_is_not_mutated() {
        let mut queue = ShardQueue::default();
        queue.push(AsyncServiceInfo {
            state: AsyncServiceState::Save,
            items: vec![registration("f1", "w1", 60)],
        });
        let taken = queue.pop().unwrap();
        queue.push(AsyncServiceInfo {
            state: AsyncServiceState::Save,
            items: vec![registration("f1", "w1", 90)],
        });

        assert_eq!(taken.items[0].timeout_seconds, 60);
        assert_eq!(queue.queued_items(), 1);
    }

    #[test]
    fn test_drained_queue_forgets_identities() {
        let mut queue = ShardQueue::default();
        for i in 0..1000 {
            queue.push(AsyncServiceInfo {
                state: AsyncServiceState::Save,
                items: vec![registration("f1", &format!("w{}", i), 60)],
            });
            if i % 3 == 0 {
                queue.push(AsyncServiceInfo {
                    state: AsyncServiceState::Remove,
                    items: vec![registration("f1", &format!("w{}", i), 60)],
                });
            }
            while queue.pop().is_some() {}
        }

        assert_eq!(queue.queued_items(), 0);
        assert!(queue.batches.is_empty());
        assert!(queue.index.is_empty());
    }

    #[tokio::test]
    async fn test_writes_land_after_flush() {
        let (store, repo) = repo(4);
        repo.start().await.unwrap();

        repo.save_all(&[registration("f1", "w1", 60), registration("f2", "w2", 60)])
            .await
            .unwrap();
        repo.flush().await;
        assert_eq!(store.fitable_row_count().await, 2);

        let removed = repo
            .remove_by_address(&Address::new("w1", "10.0.0.1", 8080))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        repo.flush().await;
        assert_eq!(store.fitable_row_count().await, 1);

        repo.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_after_retries() {
        let (store, repo) = repo(1);
        store.set_fail_writes(true);
        repo.start().await.unwrap();

        repo.save(&registration("f1", "w1", 60)).await.unwrap();
        repo.flush().await;
        assert_eq!(repo.pending_count().await, 0);

        store.set_fail_writes(false);
        assert_eq!(store.fitable_row_count().await, 0);
        repo.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let (store, repo) = repo(2);
        for i in 0..10 {
            repo.save(&registration(&format!("f{}", i), "w1", 60))
                .await
                .unwrap();
        }
        repo.start().await.unwrap();
        repo.stop().await.unwrap();
        assert_eq!(store.fitable_row_count().await, 10);
    }
}
