//! Registry memory repository
//!
//! TigerStyle: Memory is the fast path; every other tier is optional and fed
//! only with what actually changed.
//!
//! The orchestrator in front of the registry:
//! - local writes land in memory, then go write-behind to the durable tier, to
//!   peer registries through node-sync, and to subscribers through the publisher
//! - writes replicated from peers touch memory only
//! - a periodic reconciliation pass pulls the durable tier into memory under a
//!   fresh generation and, on the elected node, re-persists what memory holds
//!   that the durable tier lost
//!
//! The very first write is serialized behind a bootstrap step that makes sure
//! this node's own replication fitable is registered. Writes arriving while the
//! bootstrap runs are buffered and replayed in arrival order. The bootstrap and
//! the replay run on their own task, so a caller that gives up waiting does not
//! leave the gate half open.

use crate::election::GcElection;
use crate::memory::{FitableMemoryRepository, SaveOutcome, TimeoutCallback, WorkerDetail};
use crate::publisher::FitableStatusPublisher;
use crate::repository::ServiceRepository;
use crate::sync::FitableNodeSync;
use fitreg_core::rpc::sync_fit_service_key;
use fitreg_core::{
    Address, Application, FitableInstance, FitableKey, NodeConfig, ReconciliationConfig,
    RegistryCode, ServiceRegistration, TimeProvider, Timer, TimerId, REGISTRATION_TIMEOUT_SECONDS_MAX,
};
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Readiness of the orchestrator for local writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    #[default]
    NotReady,
    Bootstrapping,
    Ready,
}

#[derive(Debug, Default)]
struct Gate {
    state: ReadyState,
    pending: VecDeque<Vec<ServiceRegistration>>,
}

/// Orchestrates the memory tier, the durable tier, node-sync and the publisher
pub struct RegistryMemoryRepository {
    local: ServiceRegistration,
    memory: Option<Arc<FitableMemoryRepository>>,
    persistent: Option<Arc<dyn ServiceRepository>>,
    direct: Option<Arc<dyn ServiceRepository>>,
    node_sync: Option<Arc<FitableNodeSync>>,
    publisher: Option<Arc<FitableStatusPublisher>>,
    election: Option<Arc<dyn GcElection>>,
    time: Arc<dyn TimeProvider>,
    timer: Timer,
    config: ReconciliationConfig,
    gate: Mutex<Gate>,
    sync_count: AtomicU64,
    timers: Mutex<Vec<TimerId>>,
}

impl RegistryMemoryRepository {
    pub fn new(
        node: &NodeConfig,
        config: ReconciliationConfig,
        time: Arc<dyn TimeProvider>,
        timer: Timer,
    ) -> Self {
        let local = ServiceRegistration::new(
            sync_fit_service_key(),
            node.application(),
            vec![node.local_address()],
            REGISTRATION_TIMEOUT_SECONDS_MAX,
        );
        Self {
            local,
            memory: None,
            persistent: None,
            direct: None,
            node_sync: None,
            publisher: None,
            election: None,
            time,
            timer,
            config,
            gate: Mutex::new(Gate::default()),
            sync_count: AtomicU64::new(0),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_memory(mut self, memory: Arc<FitableMemoryRepository>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Durable tier for regular writes, usually the write-behind decorator
    pub fn with_persistent(mut self, persistent: Arc<dyn ServiceRepository>) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Direct durable channel used for the bootstrap registration only
    pub fn with_direct(mut self, direct: Arc<dyn ServiceRepository>) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn with_node_sync(mut self, node_sync: Arc<FitableNodeSync>) -> Self {
        self.node_sync = Some(node_sync);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<FitableStatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_election(mut self, election: Arc<dyn GcElection>) -> Self {
        self.election = Some(election);
        self
    }

    pub fn memory(&self) -> Option<&Arc<FitableMemoryRepository>> {
        self.memory.as_ref()
    }

    /// This node's own replication fitable registration
    pub fn local_registration(&self) -> &ServiceRegistration {
        &self.local
    }

    pub async fn ready_state(&self) -> ReadyState {
        self.gate.lock().await.state
    }

    /// Generation of the last reconciliation pass
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    async fn is_elected_for_gc(&self) -> bool {
        match &self.election {
            Some(election) => election.is_elected_for_gc().await,
            None => true,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the tiers and schedule reconciliation and TTL checks
    pub async fn start(self: &Arc<Self>) {
        for repository in self.persistent.iter().chain(self.direct.iter()) {
            if let Err(e) = repository.start().await {
                error!(error = %e, "durable tier failed to start");
            }
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.start().await;
        }

        if let Some(memory) = &self.memory {
            let weak = Arc::downgrade(self);
            let callback: TimeoutCallback = Arc::new(move |expired: Vec<ServiceRegistration>| {
                let weak = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.on_registrations_expired(&expired).await;
                    }
                }
                .boxed()
            });
            memory.init_timeout_callback(callback).await;
        }

        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            return;
        }
        if self.config.enabled {
            let weak = Arc::downgrade(self);
            timers.push(self.timer.set_interval(
                self.config.first_delay_ms,
                self.config.interval_ms,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(registry) = weak.upgrade() {
                            registry.sync_service_between_memory_and_db().await;
                        }
                    }
                },
            ));
        }
        let weak = Arc::downgrade(self);
        timers.push(self.timer.set_interval(
            self.config.ttl_check_interval_ms,
            self.config.ttl_check_interval_ms,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.check_timeouts().await;
                    }
                }
            },
        ));
        info!(
            reconcile_enabled = self.config.enabled,
            reconcile_interval_ms = self.config.interval_ms,
            ttl_check_interval_ms = self.config.ttl_check_interval_ms,
            "registry started"
        );
    }

    /// Cancel scheduled work, then drain replication and the durable tier
    pub async fn stop(&self) {
        for id in self.timers.lock().await.drain(..) {
            self.timer.remove(id);
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.stop().await;
        }
        if let Some(publisher) = &self.publisher {
            publisher.stop();
        }
        for repository in self.persistent.iter().chain(self.direct.iter()) {
            if let Err(e) = repository.stop().await {
                warn!(error = %e, "durable tier failed to stop cleanly");
            }
        }
        info!("registry stopped");
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    pub async fn save(self: &Arc<Self>, registration: &ServiceRegistration) -> RegistryCode {
        self.save_all(std::slice::from_ref(registration)).await
    }

    /// Register a batch; invalid input rejects the whole batch untouched
    #[instrument(skip(self, registrations), fields(count = registrations.len()))]
    pub async fn save_all(self: &Arc<Self>, registrations: &[ServiceRegistration]) -> RegistryCode {
        if let Some(e) = registrations.iter().find_map(|r| r.validate().err()) {
            error!(error = %e, "registration batch rejected");
            return RegistryCode::Error;
        }
        if registrations.is_empty() {
            return RegistryCode::Success;
        }

        {
            let mut gate = self.gate.lock().await;
            let state = gate.state;
            match state {
                ReadyState::Ready => {
                    drop(gate);
                    return self.apply_save(registrations).await;
                }
                ReadyState::Bootstrapping => {
                    gate.pending.push_back(registrations.to_vec());
                    debug!(buffered = gate.pending.len(), "registration buffered until ready");
                    return RegistryCode::Success;
                }
                ReadyState::NotReady => gate.state = ReadyState::Bootstrapping,
            }
        }

        let registry = self.clone();
        let first = registrations.to_vec();
        match tokio::spawn(async move { registry.bootstrap_and_replay(&first).await }).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "bootstrap task failed");
                let mut gate = self.gate.lock().await;
                if gate.state == ReadyState::Bootstrapping {
                    gate.state = ReadyState::NotReady;
                }
                RegistryCode::Error
            }
        }
    }

    /// Bootstrap, apply the first batch, then drain the buffer and open the gate
    async fn bootstrap_and_replay(&self, first: &[ServiceRegistration]) -> RegistryCode {
        self.bootstrap().await;
        let code = self.apply_save(first).await;
        loop {
            let next = {
                let mut gate = self.gate.lock().await;
                match gate.pending.pop_front() {
                    Some(batch) => batch,
                    None => {
                        gate.state = ReadyState::Ready;
                        break;
                    }
                }
            };
            self.apply_save(&next).await;
        }
        info!("registry ready");
        code
    }

    /// Make sure this node's replication fitable is registered and durable
    async fn bootstrap(&self) {
        let Some(memory) = &self.memory else {
            return;
        };
        memory.save(&self.local).await;

        let Some(channel) = self.direct.as_ref().or(self.persistent.as_ref()) else {
            return;
        };
        let local_worker = self.local.worker_id();
        match channel.query(&self.local.fitable).await {
            Ok(existing) if existing.iter().any(|r| r.worker_id() == local_worker) => {
                debug!("bootstrap registration already durable");
            }
            Ok(_) => {
                if let Err(e) = channel.save(&self.local).await {
                    error!(error = %e, "bootstrap registration not persisted");
                }
            }
            Err(e) => error!(error = %e, "bootstrap registration lookup failed"),
        }
        info!(worker_id = ?local_worker, "registry bootstrapped");
    }

    async fn apply_save(&self, registrations: &[ServiceRegistration]) -> RegistryCode {
        let Some(memory) = &self.memory else {
            return RegistryCode::Error;
        };
        let mut changed = Vec::new();
        for registration in registrations {
            if memory.save(registration).await.is_change() {
                changed.push(registration.clone());
            }
        }
        if changed.is_empty() {
            debug!(count = registrations.len(), "registrations renewed");
            return RegistryCode::Success;
        }

        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.save_all(&changed).await {
                error!(count = changed.len(), error = %e, "registrations not queued for persistence");
            }
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.add(&changed).await;
        }
        if let Some(publisher) = &self.publisher {
            publisher.on_fitables_changed(&changed).await;
        }
        RegistryCode::Success
    }

    /// Memory first; the durable tier answers when memory has nothing
    pub async fn query(&self, key: &FitableKey) -> Vec<ServiceRegistration> {
        if let Some(memory) = &self.memory {
            let found = memory.query(key).await;
            if !found.is_empty() {
                return found;
            }
        }
        let Some(persistent) = &self.persistent else {
            return Vec::new();
        };
        persistent.query(key).await.unwrap_or_else(|e| {
            warn!(fitable = %key, error = %e, "durable query failed");
            Vec::new()
        })
    }

    /// Remove the registration of `key` on the worker of `address`
    pub async fn remove(&self, key: &FitableKey, address: &Address) -> RegistryCode {
        let Some(memory) = &self.memory else {
            return RegistryCode::Error;
        };
        let found = memory.query_by_address(key, address).await;
        let mut removed = memory.remove(&found).await;
        if removed.is_empty() {
            // Peers and subscribers may still know it
            removed.push(ServiceRegistration::new(
                key.clone(),
                Application::default(),
                vec![address.clone()],
                0,
            ));
        }

        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.remove(key, address).await {
                error!(fitable = %key, worker_id = %address.id, error = %e, "removal not queued for persistence");
            }
        }
        self.propagate_removed(&removed).await;
        RegistryCode::Success
    }

    pub async fn remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryCode {
        let Some(memory) = &self.memory else {
            return RegistryCode::Error;
        };
        memory.remove(registrations).await;
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.remove_all(registrations).await {
                error!(count = registrations.len(), error = %e, "removals not queued for persistence");
            }
        }
        self.propagate_removed(registrations).await;
        RegistryCode::Success
    }

    /// Remove every registration of the worker at `address`; returns what existed
    pub async fn remove_by_address(&self, address: &Address) -> Vec<ServiceRegistration> {
        let mut removed = match &self.memory {
            Some(memory) => memory.remove_by_address(address).await,
            None => Vec::new(),
        };
        if let Some(persistent) = &self.persistent {
            match persistent.remove_by_address(address).await {
                Ok(durable) if removed.is_empty() => removed = durable,
                Ok(_) => {}
                Err(e) => error!(worker_id = %address.id, error = %e, "worker removal not queued for persistence"),
            }
        }
        self.propagate_removed(&removed).await;
        removed
    }

    async fn propagate_removed(&self, removed: &[ServiceRegistration]) {
        if removed.is_empty() {
            return;
        }
        if let Some(node_sync) = &self.node_sync {
            node_sync.remove(removed).await;
        }
        if let Some(publisher) = &self.publisher {
            publisher.on_fitables_changed(removed).await;
        }
    }

    async fn on_registrations_expired(&self, expired: &[ServiceRegistration]) {
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.remove_all(expired).await {
                error!(count = expired.len(), error = %e, "expired registrations not queued for persistence");
            }
        }
        self.propagate_removed(expired).await;
    }

    /// Renew this node's own registration, then expire overdue ones
    pub async fn check_timeouts(&self) -> Vec<ServiceRegistration> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        if self.ready_state().await == ReadyState::Ready {
            memory.save(&self.local).await;
        }
        memory.check_timeouts(self.time.now_ms()).await
    }

    // =========================================================================
    // Replicated writes
    // =========================================================================

    /// Apply a registration replicated from a peer; `Exist` if identical
    pub async fn sync_save(&self, registration: &ServiceRegistration) -> RegistryCode {
        let Some(memory) = &self.memory else {
            return RegistryCode::Error;
        };
        if let Err(e) = registration.validate() {
            warn!(error = %e, "replicated registration rejected");
            return RegistryCode::Error;
        }
        match memory.save(registration).await {
            SaveOutcome::Unchanged => RegistryCode::Exist,
            SaveOutcome::Ignored => RegistryCode::Error,
            SaveOutcome::New | SaveOutcome::Changed => RegistryCode::Success,
        }
    }

    /// `Error` if any item failed, `Exist` if all were identical
    pub async fn sync_save_all(&self, registrations: &[ServiceRegistration]) -> RegistryCode {
        let mut codes = Vec::with_capacity(registrations.len());
        for registration in registrations {
            codes.push(self.sync_save(registration).await);
        }
        combine_codes(&codes)
    }

    pub async fn sync_remove(&self, registration: &ServiceRegistration) -> RegistryCode {
        self.sync_remove_all(std::slice::from_ref(registration)).await
    }

    pub async fn sync_remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryCode {
        let Some(memory) = &self.memory else {
            return RegistryCode::Error;
        };
        let removed = memory.remove(registrations).await;
        debug!(requested = registrations.len(), removed = removed.len(), "replicated removals applied");
        RegistryCode::Success
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// One reconciliation pass between memory and the durable tier
    pub async fn sync_service_between_memory_and_db(&self) -> RegistryCode {
        let (Some(memory), Some(persistent)) = (&self.memory, &self.persistent) else {
            return RegistryCode::Error;
        };
        let sync_count = self.sync_count.fetch_add(1, Ordering::SeqCst) + 1;

        let durable = match persistent.get_all_services().await {
            Ok(durable) => durable,
            Err(e) => {
                error!(sync_count, error = %e, "reconciliation could not read durable tier");
                return RegistryCode::Error;
            }
        };
        memory
            .insert_service_or_update_sync_count(&durable, sync_count)
            .await;

        if !self.is_elected_for_gc().await {
            debug!(sync_count, durable = durable.len(), "reconciled, not elected for backfill");
            return RegistryCode::Success;
        }
        let stale = memory.get_services_not_updated(sync_count).await;
        if !stale.is_empty() {
            info!(sync_count, count = stale.len(), "re-persisting registrations missing from durable tier");
            if let Err(e) = persistent.save_all(&stale).await {
                error!(sync_count, error = %e, "backfill not queued for persistence");
                return RegistryCode::Error;
            }
            memory.update_sync_count(&stale, sync_count).await;
        }
        RegistryCode::Success
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Discovery projection of every fitable under `generic_id`
    pub async fn get_fitable_instances(&self, generic_id: &str) -> Vec<FitableInstance> {
        if let Some(memory) = &self.memory {
            let instances = memory.get_fitable_instances(generic_id).await;
            if !instances.is_empty() {
                return instances;
            }
        }
        let Some(persistent) = &self.persistent else {
            return Vec::new();
        };
        let durable = match persistent.get_services_by_generic_id(generic_id).await {
            Ok(durable) => durable,
            Err(e) => {
                warn!(generic_id, error = %e, "durable query failed");
                return Vec::new();
            }
        };
        let mut by_key: BTreeMap<FitableKey, Vec<ServiceRegistration>> = BTreeMap::new();
        for registration in durable {
            by_key
                .entry(registration.fitable.clone())
                .or_default()
                .push(registration);
        }
        by_key
            .iter()
            .map(|(key, registrations)| FitableInstance::from_registrations(key, registrations))
            .collect()
    }

    pub async fn query_worker_detail(&self, worker_id: &str) -> Option<WorkerDetail> {
        match &self.memory {
            Some(memory) => memory.query_worker_detail(worker_id).await,
            None => None,
        }
    }

    /// Every worker memory knows, with endpoints and fitables
    pub async fn query_all_workers(&self) -> Vec<WorkerDetail> {
        match &self.memory {
            Some(memory) => memory.query_all_workers().await,
            None => Vec::new(),
        }
    }
}

/// `Error` dominates; `Exist` only if every part was `Exist`
pub(crate) fn combine_codes(codes: &[RegistryCode]) -> RegistryCode {
    if codes.contains(&RegistryCode::Error) {
        RegistryCode::Error
    } else if !codes.is_empty() && codes.iter().all(|c| *c == RegistryCode::Exist) {
        RegistryCode::Exist
    } else {
        RegistryCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryResult;
    use crate::persistent::PersistentServiceRepository;
    use crate::store::MemoryTableStore;
    use async_trait::async_trait;
    use fitreg_core::ManualClock;
    use std::time::Duration;

    fn registration(f: &str, worker: &str, timeout: u64) -> ServiceRegistration {
        ServiceRegistration::new(
            FitableKey::new("g1", "v1", f),
            Application::new("appA", "vA"),
            vec![Address::new(worker, "10.0.0.1", 8080)],
            timeout,
        )
    }

    fn registry(clock: Arc<ManualClock>) -> (Arc<MemoryTableStore>, Arc<RegistryMemoryRepository>) {
        let store = Arc::new(MemoryTableStore::new());
        let durable: Arc<dyn ServiceRepository> =
            Arc::new(PersistentServiceRepository::from_store(store.clone()));
        let registry = RegistryMemoryRepository::new(
            &NodeConfig::default(),
            ReconciliationConfig::default(),
            clock.clone(),
            Timer::new(),
        )
        .with_memory(Arc::new(FitableMemoryRepository::new(clock)))
        .with_persistent(durable.clone())
        .with_direct(durable);
        (store, Arc::new(registry))
    }

    /// Durable channel whose lookups stall
    struct SlowLookup {
        inner: Arc<dyn ServiceRepository>,
        delay_ms: u64,
    }

    #[async_trait]
    impl ServiceRepository for SlowLookup {
        async fn start(&self) -> RegistryResult<()> {
            self.inner.start().await
        }

        async fn stop(&self) -> RegistryResult<()> {
            self.inner.stop().await
        }

        async fn save(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
            self.inner.save(registration).await
        }

        async fn save_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
            self.inner.save_all(registrations).await
        }

        async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<ServiceRegistration>> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.inner.query(key).await
        }

        async fn remove(&self, key: &FitableKey, address: &Address) -> RegistryResult<()> {
            self.inner.remove(key, address).await
        }

        async fn remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
            self.inner.remove_all(registrations).await
        }

        async fn remove_by_address(&self, address: &Address) -> RegistryResult<Vec<ServiceRegistration>> {
            self.inner.remove_by_address(address).await
        }

        async fn get_all_services(&self) -> RegistryResult<Vec<ServiceRegistration>> {
            self.inner.get_all_services().await
        }

        async fn get_services_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<ServiceRegistration>> {
            self.inner.get_services_by_generic_id(generic_id).await
        }
    }

    #[test]
    fn test_combine_codes() {
        use RegistryCode::*;
        assert_eq!(combine_codes(&[]), Success);
        assert_eq!(combine_codes(&[Exist, Exist]), Exist);
        assert_eq!(combine_codes(&[Exist, Success]), Success);
        assert_eq!(combine_codes(&[Success, Error, Exist]), Error);
    }

    #[tokio::test]
    async fn test_first_save_bootstraps_local_registration() {
        let (store, registry) = registry(Arc::new(ManualClock::new(0)));
        assert_eq!(registry.ready_state().await, ReadyState::NotReady);

        assert_eq!(registry.save(&registration("f1", "w1", 60)).await, RegistryCode::Success);
        assert_eq!(registry.ready_state().await, ReadyState::Ready);

        let local = registry.query(&sync_fit_service_key()).await;
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].worker_id(), Some("fitreg-0"));
        // bootstrap row plus f1
        assert_eq!(store.fitable_row_count().await, 2);
    }

    #[tokio::test]
    async fn test_abandoned_first_save_still_opens_gate() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryTableStore::new());
        let durable: Arc<dyn ServiceRepository> =
            Arc::new(PersistentServiceRepository::from_store(store.clone()));
        let registry = Arc::new(
            RegistryMemoryRepository::new(
                &NodeConfig::default(),
                ReconciliationConfig::default(),
                clock.clone(),
                Timer::new(),
            )
            .with_memory(Arc::new(FitableMemoryRepository::new(clock)))
            .with_persistent(durable.clone())
            .with_direct(Arc::new(SlowLookup {
                inner: durable,
                delay_ms: 200,
            })),
        );

        let f1 = registration("f1", "w1", 60);
        let abandoned = tokio::time::timeout(Duration::from_millis(20), registry.save(&f1)).await;
        assert!(abandoned.is_err());
        assert_eq!(registry.ready_state().await, ReadyState::Bootstrapping);

        let f2 = registration("f2", "w2", 60);
        assert_eq!(registry.save(&f2).await, RegistryCode::Success);

        while registry.ready_state().await != ReadyState::Ready {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.query(&f1.fitable).await, vec![f1]);
        assert_eq!(registry.query(&f2.fitable).await, vec![f2]);
    }

    #[tokio::test]
    async fn test_mixed_worker_addresses_rejected() {
        let (store, registry) = registry(Arc::new(ManualClock::new(0)));
        let mut mixed = registration("f1", "w1", 60);
        mixed.addresses.push(Address::new("w1b", "10.0.0.2", 8080));

        assert_eq!(registry.save(&mixed).await, RegistryCode::Error);
        assert_eq!(registry.sync_save(&mixed).await, RegistryCode::Error);
        assert!(registry.query(&mixed.fitable).await.is_empty());
        assert!(registry.query_worker_detail("w1b").await.is_none());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_query_all_workers() {
        let (_, registry) = registry(Arc::new(ManualClock::new(0)));
        registry.save(&registration("f1", "w1", 60)).await;
        registry.save(&registration("f2", "w1", 60)).await;
        registry.save(&registration("f1", "w2", 60)).await;

        let workers = registry.query_all_workers().await;
        // w1, w2 and this node's own worker
        assert_eq!(workers.len(), 3);
        let w1 = workers.iter().find(|w| w.worker.worker_id == "w1").unwrap();
        assert_eq!(w1.fitables.len(), 2);
        assert_eq!(w1.addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_batch_touches_nothing() {
        let (store, registry) = registry(Arc::new(ManualClock::new(0)));
        let mut bad = registration("f2", "w1", 60);
        bad.addresses.clear();

        let code = registry
            .save_all(&[registration("f1", "w1", 60), bad])
            .await;
        assert_eq!(code, RegistryCode::Error);
        assert_eq!(registry.ready_state().await, ReadyState::NotReady);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_save_reports_exist() {
        let (store, registry) = registry(Arc::new(ManualClock::new(0)));
        let reg = registration("f1", "w1", 60);

        assert_eq!(registry.sync_save(&reg).await, RegistryCode::Success);
        assert_eq!(registry.sync_save(&reg).await, RegistryCode::Exist);
        assert_eq!(registry.sync_save(&registration("f1", "w1", 30)).await, RegistryCode::Success);
        // replicated writes never reach the durable tier
        assert_eq!(store.write_count(), 0);

        assert_eq!(registry.sync_remove(&reg).await, RegistryCode::Success);
        assert!(registry.query(&reg.fitable).await.is_empty());
    }

    #[tokio::test]
    async fn test_query_falls_back_to_durable_tier() {
        let (store, registry) = registry(Arc::new(ManualClock::new(0)));
        let reg = registration("f1", "w9", 60);
        PersistentServiceRepository::from_store(store)
            .save(&reg)
            .await
            .unwrap();

        assert_eq!(registry.query(&reg.fitable).await, vec![reg]);
        assert_eq!(registry.get_fitable_instances("g1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_removes_durable_rows() {
        let clock = Arc::new(ManualClock::new(0));
        let (store, registry) = registry(clock.clone());
        registry.start().await;
        registry.save(&registration("f1", "w1", 5)).await;
        assert_eq!(store.fitable_row_count().await, 2);

        clock.advance_ms(6_000);
        let expired = registry.check_timeouts().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(store.fitable_row_count().await, 1);
        // the node's own registration is renewed, not expired
        assert_eq!(registry.query(&sync_fit_service_key()).await.len(), 1);
        registry.stop().await;
    }
}
