//! Node-sync replication to peer registry nodes
//!
//! TigerStyle: Bounded buffers, per-peer FIFO, drop instead of block.
//!
//! Events are buffered; the buffer is swapped out when it reaches the batch
//! threshold or when the flush interval fires. Each batch is fanned out to every
//! known peer through the serial executor bound to that peer. A peer whose
//! executor is at its pending ceiling loses the batch; reconciliation is the
//! backstop. RPC failures are logged and not retried here.
//!
//! Taking a batch, resolving peers and submitting to the executors happen under
//! one lock, so batches reach every peer executor in the order they were taken.

use crate::executor::SerialExecutorPool;
use async_trait::async_trait;
use fitreg_core::{
    Address, GenericInvoker, InvokeRequest, OperateType, ReplicationConfig, RpcPayload,
    ServiceRegistration, SubscriptionEntry, SyncFitableInstance, SyncSubscriptionService, Timer,
    TimerId,
};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

// =============================================================================
// RegistryDirectory
// =============================================================================

/// Source of the peer registry nodes to replicate to
#[async_trait]
pub trait RegistryDirectory: Send + Sync {
    async fn get_registry_addresses(&self) -> Vec<Address>;
}

/// Fixed peer list, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticRegistryDirectory {
    addresses: RwLock<Vec<Address>>,
}

impl StaticRegistryDirectory {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses: RwLock::new(addresses),
        }
    }

    pub async fn set_addresses(&self, addresses: Vec<Address>) {
        *self.addresses.write().await = addresses;
    }
}

#[async_trait]
impl RegistryDirectory for StaticRegistryDirectory {
    async fn get_registry_addresses(&self) -> Vec<Address> {
        self.addresses.read().await.clone()
    }
}

// =============================================================================
// BatchReplicator
// =============================================================================

/// An item type that can be shipped to peers in one RPC
pub trait ReplicationItem: Clone + Send + Sync + 'static {
    fn into_payload(items: Vec<Self>) -> RpcPayload;
}

impl ReplicationItem for SyncFitableInstance {
    fn into_payload(items: Vec<Self>) -> RpcPayload {
        RpcPayload::SynchronizeFitService { items }
    }
}

impl ReplicationItem for SyncSubscriptionService {
    fn into_payload(items: Vec<Self>) -> RpcPayload {
        RpcPayload::SyncSubscriptionFitService { items }
    }
}

struct ReplicatorInner<T> {
    local_worker_id: String,
    buffer: Mutex<Vec<T>>,
    /// Held from buffer take to executor submit
    fan_out_lock: Mutex<()>,
    invoker: Arc<dyn GenericInvoker>,
    directory: Arc<dyn RegistryDirectory>,
    executors: SerialExecutorPool,
    batch_count_max: usize,
}

impl<T: ReplicationItem> ReplicatorInner<T> {
    async fn flush(&self) {
        let _fan_out = self.fan_out_lock.lock().await;
        let batch = std::mem::take(&mut *self.buffer.lock().await);
        if !batch.is_empty() {
            self.fan_out(batch).await;
        }
    }

    async fn fan_out(&self, batch: Vec<T>) {
        let peers: Vec<Address> = self
            .directory
            .get_registry_addresses()
            .await
            .into_iter()
            .filter(|peer| peer.id != self.local_worker_id)
            .collect();
        if peers.is_empty() {
            debug!(count = batch.len(), "no peers, replication batch discarded");
            return;
        }

        let count = batch.len();
        for peer in peers {
            let request = InvokeRequest::new(T::into_payload(batch.clone())).with_target(peer.clone());
            let generic_id = request.generic_id.clone();
            let invoker = self.invoker.clone();
            let peer_id = peer.id.clone();
            let task = async move {
                match invoker.invoke(request).await {
                    Ok(_) => debug!(peer = %peer, generic_id = %generic_id, count, "replication delivered"),
                    Err(e) => error!(
                        peer = %peer,
                        generic_id = %generic_id,
                        code = %e.code(),
                        error = %e,
                        "replication call failed"
                    ),
                }
            }
            .boxed();

            if !self.executors.submit(&peer_id, task) {
                error!(peer = %peer_id, count, "peer executor saturated, replication batch dropped");
            }
        }
    }
}

/// Buffered, backpressured fan-out of items to every peer
pub struct BatchReplicator<T> {
    inner: Arc<ReplicatorInner<T>>,
    timer: Timer,
    flush_interval_ms: u64,
    flush_timer: Mutex<Option<TimerId>>,
}

impl<T: ReplicationItem> BatchReplicator<T> {
    /// Create a replicator; spawns the serial executors, so call within a runtime
    pub fn new(
        local_worker_id: impl Into<String>,
        invoker: Arc<dyn GenericInvoker>,
        directory: Arc<dyn RegistryDirectory>,
        config: &ReplicationConfig,
        timer: Timer,
    ) -> Self {
        Self {
            inner: Arc::new(ReplicatorInner {
                local_worker_id: local_worker_id.into(),
                buffer: Mutex::new(Vec::new()),
                fan_out_lock: Mutex::new(()),
                invoker,
                directory,
                executors: SerialExecutorPool::new(config.executor_count, config.pending_task_count_max),
                batch_count_max: config.batch_count_max,
            }),
            timer,
            flush_interval_ms: config.flush_interval_ms,
            flush_timer: Mutex::new(None),
        }
    }

    /// Buffer items; flushes immediately once the batch threshold is reached
    pub async fn push(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let full = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.extend(items);
            buffer.len() >= self.inner.batch_count_max
        };
        if full {
            self.inner.flush().await;
        }
    }

    /// Fan out whatever is buffered now
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Start the periodic flush
    pub async fn start(&self) {
        let mut flush_timer = self.flush_timer.lock().await;
        if flush_timer.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *flush_timer = Some(self.timer.set_interval(
            self.flush_interval_ms,
            self.flush_interval_ms,
            move || {
                let inner = inner.clone();
                async move { inner.flush().await }
            },
        ));
    }

    /// Stop the periodic flush and ship what is buffered
    pub async fn stop(&self) {
        if let Some(id) = self.flush_timer.lock().await.take() {
            self.timer.remove(id);
        }
        self.inner.flush().await;
    }

    pub async fn buffered_count(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// Batches queued or in flight across all peer executors
    pub fn pending_count(&self) -> usize {
        self.inner.executors.pending_count()
    }

    /// Batches dropped by backpressure since creation
    pub fn dropped_count(&self) -> u64 {
        self.inner.executors.dropped_count()
    }
}

// =============================================================================
// Fitable / Subscription node-sync
// =============================================================================

/// Replicates registration changes with `synchronizeFitService`
pub struct FitableNodeSync {
    replicator: BatchReplicator<SyncFitableInstance>,
}

impl FitableNodeSync {
    pub fn new(
        local_worker_id: impl Into<String>,
        invoker: Arc<dyn GenericInvoker>,
        directory: Arc<dyn RegistryDirectory>,
        config: &ReplicationConfig,
        timer: Timer,
    ) -> Self {
        Self {
            replicator: BatchReplicator::new(local_worker_id, invoker, directory, config, timer),
        }
    }

    pub async fn add(&self, registrations: &[ServiceRegistration]) {
        self.push(registrations, OperateType::Add).await;
    }

    pub async fn remove(&self, registrations: &[ServiceRegistration]) {
        self.push(registrations, OperateType::Remove).await;
    }

    async fn push(&self, registrations: &[ServiceRegistration], operate_type: OperateType) {
        let items = registrations
            .iter()
            .cloned()
            .map(|r| SyncFitableInstance::new(r, operate_type))
            .collect();
        self.replicator.push(items).await;
    }

    pub async fn start(&self) {
        self.replicator.start().await;
        info!("fitable node-sync started");
    }

    pub async fn stop(&self) {
        self.replicator.stop().await;
        info!("fitable node-sync stopped");
    }

    pub async fn flush(&self) {
        self.replicator.flush().await;
    }

    pub fn replicator(&self) -> &BatchReplicator<SyncFitableInstance> {
        &self.replicator
    }
}

/// Replicates subscription changes with `syncSubscriptionFitService`
pub struct SubscriptionNodeSync {
    replicator: BatchReplicator<SyncSubscriptionService>,
}

impl SubscriptionNodeSync {
    pub fn new(
        local_worker_id: impl Into<String>,
        invoker: Arc<dyn GenericInvoker>,
        directory: Arc<dyn RegistryDirectory>,
        config: &ReplicationConfig,
        timer: Timer,
    ) -> Self {
        Self {
            replicator: BatchReplicator::new(local_worker_id, invoker, directory, config, timer),
        }
    }

    pub async fn add(&self, entries: &[SubscriptionEntry]) {
        self.push(entries, OperateType::Add).await;
    }

    pub async fn remove(&self, entries: &[SubscriptionEntry]) {
        self.push(entries, OperateType::Remove).await;
    }

    async fn push(&self, entries: &[SubscriptionEntry], operate_type: OperateType) {
        let items = entries
            .iter()
            .map(|e| SyncSubscriptionService::from_entry(e, operate_type))
            .collect();
        self.replicator.push(items).await;
    }

    pub async fn start(&self) {
        self.replicator.start().await;
        info!("subscription node-sync started");
    }

    pub async fn stop(&self) {
        self.replicator.stop().await;
        info!("subscription node-sync stopped");
    }

    pub async fn flush(&self) {
        self.replicator.flush().await;
    }

    pub fn replicator(&self) -> &BatchReplicator<SyncSubscriptionService> {
        &self.replicator
    }
}
