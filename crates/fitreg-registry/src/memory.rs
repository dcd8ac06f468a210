//! Fitable memory repository
//!
//! TigerStyle: One lock over all tables, explicit cascade rules.
//!
//! Composes the worker, address and fitable tables with a registration index
//! keyed by `(FitableKey, worker ID)`. The index carries each registration's TTL
//! deadline and reconciliation generation.
//!
//! Cascade on removal:
//! - a worker with no remaining registrations loses its worker and address rows
//! - a `(fitable, application)` binding goes when no worker of that application
//!   still registers the fitable
//! - an application with no workers loses all of its fitable bindings

use crate::tables::{AddressTable, FitableMeta, FitableTable, WorkerEntry, WorkerTable};
use fitreg_core::{
    Address, Application, FitableInstance, FitableKey, RegistrationId, ServiceRegistration,
    TimeProvider, REGISTRATION_TIMEOUT_SECONDS_DEFAULT,
};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Invoked with the registrations a TTL scan just expired
pub type TimeoutCallback = Arc<dyn Fn(Vec<ServiceRegistration>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
struct RegistrationMark {
    timeout_seconds: u64,
    sync_count: u64,
    expires_at_ms: u64,
}

/// What a save did to the stored registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    New,
    /// Present before with a different TTL
    Changed,
    /// Present before with the same TTL; only the deadline moved
    Unchanged,
    /// No addresses, nothing stored
    Ignored,
}

impl SaveOutcome {
    /// Whether downstream tiers need to hear about it
    pub fn is_change(self) -> bool {
        matches!(self, Self::New | Self::Changed)
    }
}

/// A worker with its endpoints and the fitables it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDetail {
    pub worker: WorkerEntry,
    pub addresses: Vec<Address>,
    pub fitables: Vec<FitableKey>,
}

#[derive(Debug, Default)]
struct MemoryState {
    workers: WorkerTable,
    addresses: AddressTable,
    fitables: FitableTable,
    registrations: BTreeMap<RegistrationId, RegistrationMark>,
}

impl MemoryState {
    fn build(&self, id: &RegistrationId, mark: &RegistrationMark) -> Option<ServiceRegistration> {
        let worker = self.workers.query(&id.worker_id).into_iter().next()?;
        let meta = self
            .fitables
            .query(&id.fitable)
            .into_iter()
            .find(|m| m.application == worker.application);
        let (aliases, tags, extensions) = match meta {
            Some(m) => (m.aliases, m.tags, m.extensions),
            None => Default::default(),
        };

        Some(ServiceRegistration {
            fitable: id.fitable.clone(),
            application: worker.application,
            addresses: self.addresses.query(&id.worker_id),
            timeout_seconds: mark.timeout_seconds,
            aliases,
            tags,
            extensions,
            sync_count: mark.sync_count,
        })
    }

    fn by_fitable<'a>(
        &'a self,
        key: &FitableKey,
    ) -> impl Iterator<Item = (&'a RegistrationId, &'a RegistrationMark)> + 'a {
        let start = RegistrationId {
            fitable: key.clone(),
            worker_id: String::new(),
        };
        let key = key.clone();
        self.registrations
            .range(start..)
            .take_while(move |(id, _)| id.fitable == key)
    }

    fn upsert(&mut self, id: RegistrationId, registration: &ServiceRegistration, mark: RegistrationMark) {
        let environment = registration
            .primary_address()
            .map(|a| a.environment.clone())
            .unwrap_or_default();

        let previous = self.workers.save(WorkerEntry {
            worker_id: id.worker_id.clone(),
            application: registration.application.clone(),
            environment,
        });
        self.addresses.save(&registration.addresses);
        self.fitables.save(FitableMeta {
            fitable: registration.fitable.clone(),
            application: registration.application.clone(),
            aliases: registration.aliases.clone(),
            tags: registration.tags.clone(),
            extensions: registration.extensions.clone(),
        });
        self.registrations.insert(id, mark);

        // Worker moved to another application
        if let Some(previous) = previous {
            if previous.application != registration.application {
                self.prune_application(&previous.application);
            }
        }
    }

    fn remove(&mut self, id: &RegistrationId) -> Option<ServiceRegistration> {
        let mark = self.registrations.get(id)?.clone();
        let removed = self.build(id, &mark);
        self.registrations.remove(id);

        let application = removed.as_ref().map(|r| r.application.clone());
        let worker_still_registered = self
            .registrations
            .keys()
            .any(|other| other.worker_id == id.worker_id);
        if !worker_still_registered {
            self.workers.delete(&id.worker_id);
            self.addresses.delete(&id.worker_id);
        }
        if let Some(application) = application {
            self.prune_binding(&id.fitable, &application);
            self.prune_application(&application);
        }
        removed
    }

    /// Drop the `(fitable, application)` binding if no worker of the application serves it
    fn prune_binding(&mut self, key: &FitableKey, application: &Application) {
        let served = self.by_fitable(key).any(|(id, _)| {
            self.workers
                .query(&id.worker_id)
                .iter()
                .any(|w| &w.application == application)
        });
        if !served {
            self.fitables.delete_fitable(key, application);
        }
    }

    fn prune_application(&mut self, application: &Application) {
        if self.workers.query_by_application(application).is_empty() {
            let removed = self.fitables.delete(application);
            if !removed.is_empty() {
                debug!(application = %application, count = removed.len(), "application has no workers, bindings removed");
            }
        }
    }
}

/// In-memory registration store with TTL tracking
pub struct FitableMemoryRepository {
    state: RwLock<MemoryState>,
    time: Arc<dyn TimeProvider>,
    timeout_callback: RwLock<Option<TimeoutCallback>>,
}

impl std::fmt::Debug for FitableMemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitableMemoryRepository").finish_non_exhaustive()
    }
}

impl FitableMemoryRepository {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            time,
            timeout_callback: RwLock::new(None),
        }
    }

    fn deadline_ms(&self, timeout_seconds: u64) -> u64 {
        let seconds = if timeout_seconds == 0 {
            REGISTRATION_TIMEOUT_SECONDS_DEFAULT
        } else {
            timeout_seconds
        };
        self.time.now_ms().saturating_add(seconds.saturating_mul(1000))
    }

    /// Store a registration and classify it against what was stored
    ///
    /// Fields are always replaced with the incoming values and the TTL restarts.
    /// A renewal keeps the stored generation marker.
    pub async fn save(&self, registration: &ServiceRegistration) -> SaveOutcome {
        let Some(id) = registration.id() else {
            warn!(fitable = %registration.fitable, "registration without addresses ignored");
            return SaveOutcome::Ignored;
        };

        let expires_at_ms = self.deadline_ms(registration.timeout_seconds);
        let mut state = self.state.write().await;
        let (outcome, sync_count) = match state.registrations.get(&id) {
            Some(mark) if mark.timeout_seconds == registration.timeout_seconds => {
                (SaveOutcome::Unchanged, mark.sync_count)
            }
            Some(mark) => (SaveOutcome::Changed, mark.sync_count),
            None => (SaveOutcome::New, registration.sync_count),
        };
        state.upsert(
            id,
            registration,
            RegistrationMark {
                timeout_seconds: registration.timeout_seconds,
                sync_count,
                expires_at_ms,
            },
        );
        outcome
    }

    pub async fn query(&self, key: &FitableKey) -> Vec<ServiceRegistration> {
        let state = self.state.read().await;
        state
            .by_fitable(key)
            .filter_map(|(id, mark)| state.build(id, mark))
            .collect()
    }

    /// Registrations of `key` served by the worker of `address`
    pub async fn query_by_address(&self, key: &FitableKey, address: &Address) -> Vec<ServiceRegistration> {
        let state = self.state.read().await;
        state
            .by_fitable(key)
            .filter(|(id, _)| id.worker_id == address.id)
            .filter_map(|(id, mark)| state.build(id, mark))
            .collect()
    }

    pub async fn query_all(&self) -> Vec<ServiceRegistration> {
        let state = self.state.read().await;
        state
            .registrations
            .iter()
            .filter_map(|(id, mark)| state.build(id, mark))
            .collect()
    }

    /// Whether an identical registration (same TTL) is already stored
    pub async fn is_same(&self, registration: &ServiceRegistration) -> bool {
        let Some(id) = registration.id() else {
            return false;
        };
        self.state
            .read()
            .await
            .registrations
            .get(&id)
            .map(|mark| mark.timeout_seconds == registration.timeout_seconds)
            .unwrap_or(false)
    }

    /// Remove registrations; returns the rows that existed
    pub async fn remove(&self, registrations: &[ServiceRegistration]) -> Vec<ServiceRegistration> {
        let mut state = self.state.write().await;
        registrations
            .iter()
            .filter_map(|r| r.id())
            .filter_map(|id| state.remove(&id))
            .collect()
    }

    /// Remove every registration of the worker at `address`
    pub async fn remove_by_address(&self, address: &Address) -> Vec<ServiceRegistration> {
        let mut state = self.state.write().await;
        let ids: Vec<RegistrationId> = state
            .registrations
            .keys()
            .filter(|id| id.worker_id == address.id)
            .cloned()
            .collect();
        let removed: Vec<ServiceRegistration> = ids.iter().filter_map(|id| state.remove(id)).collect();
        if !removed.is_empty() {
            info!(worker_id = %address.id, count = removed.len(), "worker registrations removed");
        }
        removed
    }

    /// Registrations not confirmed by reconciliation pass `sync_count`
    pub async fn get_services_not_updated(&self, sync_count: u64) -> Vec<ServiceRegistration> {
        let state = self.state.read().await;
        state
            .registrations
            .iter()
            .filter(|(_, mark)| mark.sync_count != sync_count)
            .filter_map(|(id, mark)| state.build(id, mark))
            .collect()
    }

    /// Upsert durable records into memory tagged with `sync_count`
    ///
    /// Existing registrations only get their generation updated. Returns true if
    /// any record was inserted.
    pub async fn insert_service_or_update_sync_count(
        &self,
        registrations: &[ServiceRegistration],
        sync_count: u64,
    ) -> bool {
        let mut state = self.state.write().await;
        let mut inserted = 0usize;
        for registration in registrations {
            let Some(id) = registration.id() else {
                continue;
            };
            match state.registrations.get_mut(&id) {
                Some(mark) => mark.sync_count = sync_count,
                None => {
                    let mark = RegistrationMark {
                        timeout_seconds: registration.timeout_seconds,
                        sync_count,
                        expires_at_ms: self.deadline_ms(registration.timeout_seconds),
                    };
                    state.upsert(id, registration, mark);
                    inserted += 1;
                }
            }
        }
        if inserted > 0 {
            debug!(inserted, sync_count, "durable records loaded into memory");
        }
        inserted > 0
    }

    /// Tag existing registrations with `sync_count`; unknown ones are skipped
    pub async fn update_sync_count(&self, registrations: &[ServiceRegistration], sync_count: u64) {
        let mut state = self.state.write().await;
        for id in registrations.iter().filter_map(|r| r.id()) {
            if let Some(mark) = state.registrations.get_mut(&id) {
                mark.sync_count = sync_count;
            }
        }
    }

    pub async fn init_timeout_callback(&self, callback: TimeoutCallback) {
        *self.timeout_callback.write().await = Some(callback);
    }

    /// Expire registrations whose TTL elapsed at `now_ms`
    ///
    /// Expired rows are removed with the usual cascade, then handed to the
    /// timeout callback.
    pub async fn check_timeouts(&self, now_ms: u64) -> Vec<ServiceRegistration> {
        let expired = {
            let mut state = self.state.write().await;
            let ids: Vec<RegistrationId> = state
                .registrations
                .iter()
                .filter(|(_, mark)| mark.expires_at_ms <= now_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.remove(id)).collect::<Vec<_>>()
        };

        if expired.is_empty() {
            return expired;
        }
        info!(count = expired.len(), "registrations expired");

        let callback = self.timeout_callback.read().await.clone();
        if let Some(callback) = callback {
            callback(expired.clone()).await;
        }
        expired
    }

    /// Discovery projection of every fitable under a generic ID
    pub async fn get_fitable_instances(&self, generic_id: &str) -> Vec<FitableInstance> {
        let state = self.state.read().await;
        state
            .fitables
            .keys_by_generic_id(generic_id)
            .iter()
            .map(|key| {
                let registrations: Vec<ServiceRegistration> = state
                    .by_fitable(key)
                    .filter_map(|(id, mark)| state.build(id, mark))
                    .collect();
                FitableInstance::from_registrations(key, &registrations)
            })
            .filter(|instance| !instance.application_instances.is_empty())
            .collect()
    }

    pub async fn query_worker_detail(&self, worker_id: &str) -> Option<WorkerDetail> {
        let state = self.state.read().await;
        Self::detail(&state, worker_id)
    }

    pub async fn query_all_workers(&self) -> Vec<WorkerDetail> {
        let state = self.state.read().await;
        state
            .workers
            .query_all()
            .iter()
            .filter_map(|w| Self::detail(&state, &w.worker_id))
            .collect()
    }

    fn detail(state: &MemoryState, worker_id: &str) -> Option<WorkerDetail> {
        let worker = state.workers.query(worker_id).into_iter().next()?;
        let fitables = state
            .registrations
            .keys()
            .filter(|id| id.worker_id == worker_id)
            .map(|id| id.fitable.clone())
            .collect();
        Some(WorkerDetail {
            addresses: state.addresses.query(worker_id),
            worker,
            fitables,
        })
    }

    /// Number of stored registrations
    pub async fn len(&self) -> usize {
        self.state.read().await.registrations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fitable bindings for `key` (test and diagnostics view of the fitable table)
    pub async fn query_bindings(&self, key: &FitableKey) -> Vec<Application> {
        self.state
            .read()
            .await
            .fitables
            .query(key)
            .into_iter()
            .map(|m| m.application)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitreg_core::ManualClock;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(f: &str) -> FitableKey {
        FitableKey::new("g1", "v1", f)
    }

    fn registration(f: &str, worker: &str, application: &str) -> ServiceRegistration {
        ServiceRegistration::new(
            key(f),
            Application::new(application, "vA"),
            vec![Address::new(worker, "10.0.0.1", 8080)],
            60,
        )
    }

    fn repo() -> (Arc<ManualClock>, FitableMemoryRepository) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let repo = FitableMemoryRepository::new(clock.clone());
        (clock, repo)
    }

    #[tokio::test]
    async fn test_save_reports_new_then_duplicate() {
        let (_, repo) = repo();
        let reg = registration("f1", "w1", "appA");

        assert_eq!(repo.save(&reg).await, SaveOutcome::New);
        assert_eq!(repo.save(&reg).await, SaveOutcome::Unchanged);
        assert_eq!(repo.query(&key("f1")).await.len(), 1);
        assert!(repo.is_same(&reg).await);

        let mut renewed = reg.clone();
        renewed.timeout_seconds = 120;
        assert!(!repo.is_same(&renewed).await);
        assert_eq!(repo.save(&renewed).await, SaveOutcome::Changed);
        assert!(!SaveOutcome::Unchanged.is_change());

        let mut empty = reg.clone();
        empty.addresses.clear();
        assert_eq!(repo.save(&empty).await, SaveOutcome::Ignored);
        assert_eq!(repo.query(&key("f1")).await[0].timeout_seconds, 120);
    }

    #[tokio::test]
    async fn test_query_returns_all_fields() {
        let (_, repo) = repo();
        let mut reg = registration("f1", "w1", "appA");
        reg.aliases = vec!["alias".into()];
        reg.tags = vec!["tag".into()];
        repo.save(&reg).await;

        let found = repo.query(&key("f1")).await;
        assert_eq!(found, vec![reg.clone()]);

        let other = Address::new("w2", "10.0.0.2", 8080);
        assert!(repo.query_by_address(&key("f1"), &other).await.is_empty());
        assert_eq!(repo.query_by_address(&key("f1"), &reg.addresses[0]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_last_worker_removes_bindings() {
        let (_, repo) = repo();
        let w1 = registration("f1", "w1", "appA");
        let w2 = registration("f1", "w2", "appA");
        repo.save(&w1).await;
        repo.save(&w2).await;

        let removed = repo.remove_by_address(&Address::new("w1", "", 0)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(repo.query_bindings(&key("f1")).await.len(), 1);
        assert_eq!(repo.query(&key("f1")).await.len(), 1);

        repo.remove_by_address(&Address::new("w2", "", 0)).await;
        assert!(repo.query_bindings(&key("f1")).await.is_empty());
        assert!(repo.query(&key("f1")).await.is_empty());
        assert!(repo.query_worker_detail("w2").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_keeps_worker_with_other_fitables() {
        let (_, repo) = repo();
        let f1 = registration("f1", "w1", "appA");
        let f2 = registration("f2", "w1", "appA");
        repo.save(&f1).await;
        repo.save(&f2).await;

        assert_eq!(repo.remove(&[f1.clone()]).await.len(), 1);
        assert!(repo.remove(&[f1]).await.is_empty());
        assert!(repo.query_bindings(&key("f1")).await.is_empty());

        let detail = repo.query_worker_detail("w1").await.unwrap();
        assert_eq!(detail.fitables, vec![key("f2")]);
        assert_eq!(detail.addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_count_generation() {
        let (_, repo) = repo();
        let a = registration("f1", "w1", "appA");
        let b = registration("f2", "w1", "appA");
        repo.save(&a).await;

        let inserted = repo
            .insert_service_or_update_sync_count(&[a.clone(), b.clone()], 3)
            .await;
        assert!(inserted);
        assert!(repo.get_services_not_updated(3).await.is_empty());

        let c = registration("f3", "w2", "appA");
        repo.save(&c).await;
        let stale = repo.get_services_not_updated(3).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].fitable, key("f3"));

        repo.update_sync_count(&stale, 3).await;
        assert!(repo.get_services_not_updated(3).await.is_empty());
        assert!(!repo.insert_service_or_update_sync_count(&[a], 4).await);
    }

    #[tokio::test]
    async fn test_check_timeouts_invokes_callback() {
        let (clock, repo) = repo();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        repo.init_timeout_callback(Arc::new(move |expired: Vec<ServiceRegistration>| {
            let h = h.clone();
            async move {
                h.fetch_add(expired.len(), Ordering::SeqCst);
            }
            .boxed()
        }))
        .await;

        repo.save(&registration("f1", "w1", "appA")).await;
        let mut long = registration("f2", "w2", "appA");
        long.timeout_seconds = 600;
        repo.save(&long).await;

        assert!(repo.check_timeouts(clock.now_ms()).await.is_empty());

        clock.advance_ms(61_000);
        let expired = repo.check_timeouts(clock.now_ms()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(repo.len().await, 1);
        assert_eq!(repo.query_bindings(&key("f2")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_fitable_instances_projection() {
        let (_, repo) = repo();
        repo.save(&registration("f1", "w1", "appA")).await;
        repo.save(&registration("f1", "w2", "appB")).await;
        repo.save(&registration("f2", "w1", "appA")).await;

        let instances = repo.get_fitable_instances("g1").await;
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].application_instances.len(), 2);
        assert_eq!(repo.query_all_workers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_worker_changing_application_moves_bindings() {
        let (_, repo) = repo();
        repo.save(&registration("f1", "w1", "appA")).await;
        repo.save(&registration("f1", "w1", "appB")).await;

        let bindings = repo.query_bindings(&key("f1")).await;
        assert_eq!(bindings, vec![Application::new("appB", "vA")]);
    }
}
