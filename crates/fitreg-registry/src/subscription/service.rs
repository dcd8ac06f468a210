//! Subscription service
//!
//! TigerStyle: Memory first, then durable write-behind, then peers.
//!
//! Local subscribe/unsubscribe calls change memory and, only when memory
//! actually changed, enqueue the durable write and the peer replication.
//! Replicated calls from peers (`sync_*`) touch memory only. With a timer
//! attached, memory and the durable tier are reconciled periodically.

use super::{SubscriptionMemoryRepository, SubscriptionRepository};
use crate::election::GcElection;
use crate::sync::SubscriptionNodeSync;
use fitreg_core::{
    FitableKey, Listener, ListenerId, ReconciliationConfig, RegistryCode, SubscriptionEntry, Timer,
    TimerId,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Orchestrates subscription memory, durable tier and peer replication
pub struct SubscriptionService {
    memory: Arc<SubscriptionMemoryRepository>,
    persistent: Option<Arc<dyn SubscriptionRepository>>,
    node_sync: Option<Arc<SubscriptionNodeSync>>,
    election: Option<Arc<dyn GcElection>>,
    reconciliation: Option<(Timer, ReconciliationConfig)>,
    reconcile_timer: Mutex<Option<TimerId>>,
    sync_count: AtomicU64,
}

impl SubscriptionService {
    pub fn new(memory: Arc<SubscriptionMemoryRepository>) -> Self {
        Self {
            memory,
            persistent: None,
            node_sync: None,
            election: None,
            reconciliation: None,
            reconcile_timer: Mutex::new(None),
            sync_count: AtomicU64::new(0),
        }
    }

    pub fn with_persistent(mut self, persistent: Arc<dyn SubscriptionRepository>) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn with_node_sync(mut self, node_sync: Arc<SubscriptionNodeSync>) -> Self {
        self.node_sync = Some(node_sync);
        self
    }

    pub fn with_election(mut self, election: Arc<dyn GcElection>) -> Self {
        self.election = Some(election);
        self
    }

    /// Reconcile memory with the durable tier on `timer` once started
    pub fn with_reconciliation(mut self, timer: Timer, config: ReconciliationConfig) -> Self {
        self.reconciliation = Some((timer, config));
        self
    }

    pub fn memory(&self) -> &Arc<SubscriptionMemoryRepository> {
        &self.memory
    }

    /// Generation of the last reconciliation pass
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Whether this node performs cluster-wide repair; true without an election port
    pub async fn is_elected_for_gc(&self) -> bool {
        match &self.election {
            Some(election) => election.is_elected_for_gc().await,
            None => true,
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.start().await {
                error!(error = %e, "subscription persistence failed to start");
            }
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.start().await;
        }

        if let Some((timer, config)) = &self.reconciliation {
            let mut reconcile_timer = self.reconcile_timer.lock().await;
            if config.enabled && self.persistent.is_some() && reconcile_timer.is_none() {
                let weak = Arc::downgrade(self);
                *reconcile_timer = Some(timer.set_interval(
                    config.first_delay_ms,
                    config.interval_ms,
                    move || {
                        let weak = weak.clone();
                        async move {
                            if let Some(service) = weak.upgrade() {
                                service.sync_subscription_between_memory_and_db().await;
                            }
                        }
                    },
                ));
            }
        }
        info!("subscription service started");
    }

    pub async fn stop(&self) {
        let reconcile_timer = self.reconcile_timer.lock().await.take();
        if let (Some((timer, _)), Some(id)) = (&self.reconciliation, reconcile_timer) {
            timer.remove(id);
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.stop().await;
        }
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.stop().await {
                warn!(error = %e, "subscription persistence failed to stop cleanly");
            }
        }
        info!("subscription service stopped");
    }

    /// Subscribe `listener` to `key`; `Exist` if it already was
    #[instrument(skip(self, listener), fields(fitable = %key, listener = %listener.address.id))]
    pub async fn subscribe(&self, key: &FitableKey, listener: &Listener) -> RegistryCode {
        let entry = SubscriptionEntry::new(key.clone(), listener.clone());
        let code = self.memory.insert_subscription_entry(&entry).await;
        if code == RegistryCode::Success {
            self.persist_inserts(std::slice::from_ref(&entry)).await;
            if let Some(node_sync) = &self.node_sync {
                node_sync.add(std::slice::from_ref(&entry)).await;
            }
            debug!("listener subscribed");
        }
        code
    }

    /// Unsubscribe `listener` from `key`; unknown pairs are a successful no-op
    #[instrument(skip(self, listener), fields(fitable = %key, listener = %listener.address.id))]
    pub async fn unsubscribe(&self, key: &FitableKey, listener: &Listener) -> RegistryCode {
        let entry = SubscriptionEntry::new(key.clone(), listener.clone());
        if self.memory.remove_subscription_entry(&entry).await {
            self.persist_removals(std::slice::from_ref(&entry)).await;
            if let Some(node_sync) = &self.node_sync {
                node_sync.remove(std::slice::from_ref(&entry)).await;
            }
            debug!("listener unsubscribed");
        }
        RegistryCode::Success
    }

    pub async fn query_listener_set(&self, key: &FitableKey) -> Vec<Listener> {
        self.memory.query_listener_set(key).await
    }

    /// Apply replicated inserts; `Exist` when every entry was already present
    pub async fn sync_insert(&self, entries: &[SubscriptionEntry]) -> RegistryCode {
        let mut all_exist = true;
        for entry in entries {
            if self.memory.insert_subscription_entry(entry).await == RegistryCode::Success {
                all_exist = false;
            }
        }
        if all_exist && !entries.is_empty() {
            RegistryCode::Exist
        } else {
            RegistryCode::Success
        }
    }

    /// Apply replicated removals
    pub async fn sync_remove(&self, entries: &[SubscriptionEntry]) -> RegistryCode {
        for entry in entries {
            self.memory.remove_subscription_entry(entry).await;
        }
        RegistryCode::Success
    }

    /// Drop every subscription of listeners on the given workers
    pub async fn remove_listeners(&self, worker_ids: &[String]) -> Vec<SubscriptionEntry> {
        let removed = self.memory.remove_by_listener_ids(worker_ids).await;
        if removed.is_empty() {
            return removed;
        }
        self.persist_listener_removals(&removed).await;
        if let Some(node_sync) = &self.node_sync {
            node_sync.remove(&removed).await;
        }
        info!(workers = worker_ids.len(), count = removed.len(), "listener subscriptions removed");
        removed
    }

    /// One reconciliation pass between memory and the durable tier
    ///
    /// Durable entries are loaded into memory tagged with a fresh generation;
    /// on the elected node, memory entries left untagged are re-persisted.
    pub async fn sync_subscription_between_memory_and_db(&self) -> RegistryCode {
        let Some(persistent) = &self.persistent else {
            return RegistryCode::Error;
        };
        let sync_count = self.sync_count.fetch_add(1, Ordering::SeqCst) + 1;

        let durable = match persistent.query_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(sync_count, error = %e, "subscription reconciliation could not read durable tier");
                return RegistryCode::Error;
            }
        };
        for mut entry in durable {
            entry.listener.sync_count = sync_count;
            self.memory.insert_subscription_entry(&entry).await;
        }

        if !self.is_elected_for_gc().await {
            return RegistryCode::Success;
        }
        let stale = self.memory.get_entries_not_updated(sync_count).await;
        if !stale.is_empty() {
            info!(sync_count, count = stale.len(), "re-persisting subscriptions missing from durable tier");
            self.persist_inserts(&stale).await;
            for entry in &stale {
                self.memory.update_sync_count(entry, sync_count).await;
            }
        }
        RegistryCode::Success
    }

    async fn persist_inserts(&self, entries: &[SubscriptionEntry]) {
        let Some(persistent) = &self.persistent else {
            return;
        };
        for entry in entries {
            if let Err(e) = persistent.insert(entry).await {
                error!(fitable = %entry.fitable_key, error = %e, "subscription persist failed");
            }
        }
    }

    /// One durable delete per listener rather than per entry
    async fn persist_listener_removals(&self, entries: &[SubscriptionEntry]) {
        let Some(persistent) = &self.persistent else {
            return;
        };
        let mut seen: HashSet<ListenerId> = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.listener.id()) {
                continue;
            }
            if let Err(e) = persistent.remove_by_listener(&entry.listener).await {
                error!(listener = %entry.listener.address.id, error = %e, "listener removal failed");
            }
        }
    }

    async fn persist_removals(&self, entries: &[SubscriptionEntry]) {
        let Some(persistent) = &self.persistent else {
            return;
        };
        for entry in entries {
            if let Err(e) = persistent.remove(entry).await {
                error!(fitable = %entry.fitable_key, error = %e, "subscription removal failed");
            }
        }
    }
}
