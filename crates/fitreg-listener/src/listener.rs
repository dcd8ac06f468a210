//! Caller-side registry listener
//!
//! TigerStyle: One lock over cache and isolation state, RPC outside the lock.
//!
//! The listener caches the endpoint set of every fitable the process calls.
//! A cache miss subscribes lazily, after which the registry pushes changes with
//! `notifyFitables`. A periodic refresh re-queries every cached key so a lost
//! notification heals within one refresh interval.
//!
//! Isolation is a soft circuit breaker: an endpoint the caller failed to reach
//! is hidden from lookups for a configured window without touching the cached
//! topology.

use crate::client::RegistryClient;
use crate::error::ListenerResult;
use async_trait::async_trait;
use fitreg_core::{
    Address, ApplicationInstance, FitCode, FitableInstance, FitableKey, GenericInvoker,
    InvokeRequest, Listener, ListenerConfig, RegistryCode, RpcPayload, RpcReply, TimeProvider,
    Timer, TimerId, WorkerInstance,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

// =============================================================================
// FitableInfo
// =============================================================================

/// What a caller knows about the fitable it wants to reach
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FitableInfo {
    pub genericable_id: String,
    pub genericable_version: String,
    pub fitable_id: String,
    pub fitable_version: String,
}

impl FitableInfo {
    pub fn new(
        genericable_id: impl Into<String>,
        genericable_version: impl Into<String>,
        fitable_id: impl Into<String>,
        fitable_version: impl Into<String>,
    ) -> Self {
        Self {
            genericable_id: genericable_id.into(),
            genericable_version: genericable_version.into(),
            fitable_id: fitable_id.into(),
            fitable_version: fitable_version.into(),
        }
    }

    /// Registry key; registrations are not versioned per fitable
    pub fn to_key(&self) -> FitableKey {
        FitableKey::new(
            self.genericable_id.as_str(),
            self.genericable_version.as_str(),
            self.fitable_id.as_str(),
        )
    }
}

// =============================================================================
// Observers
// =============================================================================

/// Subscription churn seen by the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Subscribed(Vec<FitableKey>),
    Unsubscribed(Vec<FitableKey>),
    /// Cached endpoints replaced by a notification or refresh
    Changed(Vec<FitableKey>),
}

/// Callback for local components interested in subscription churn
pub trait ListenerObserver: Send + Sync {
    fn on_event(&self, event: &ListenerEvent);
}

/// Observer that keeps every event, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<ListenerEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ListenerObserver for RecordingObserver {
    fn on_event(&self, event: &ListenerEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

// =============================================================================
// RegistryListener
// =============================================================================

#[derive(Debug, Default)]
struct ListenerState {
    cache: HashMap<FitableKey, FitableInstance>,
    /// (host, port) -> isolation deadline
    isolated: HashMap<(String, u16), u64>,
}

impl ListenerState {
    fn is_isolated(&self, host: &str, port: u16, now_ms: u64) -> bool {
        self.isolated
            .get(&(host.to_string(), port))
            .map(|expires_at_ms| *expires_at_ms > now_ms)
            .unwrap_or(false)
    }

    /// Cached applications minus isolated endpoints; workers left without
    /// endpoints and applications left without workers are dropped
    fn available(&self, key: &FitableKey, now_ms: u64) -> Option<Vec<ApplicationInstance>> {
        let instance = self.cache.get(key)?;
        let applications = instance
            .application_instances
            .iter()
            .filter_map(|app| {
                let workers: Vec<WorkerInstance> = app
                    .workers
                    .iter()
                    .filter_map(|worker| {
                        let endpoints: Vec<_> = worker
                            .endpoints
                            .iter()
                            .filter(|e| !self.is_isolated(&e.host, e.port, now_ms))
                            .cloned()
                            .collect();
                        (!endpoints.is_empty()).then(|| WorkerInstance {
                            endpoints,
                            ..worker.clone()
                        })
                    })
                    .collect();
                (!workers.is_empty()).then(|| ApplicationInstance {
                    workers,
                    ..app.clone()
                })
            })
            .collect();
        Some(applications)
    }

    fn prune_isolation(&mut self, now_ms: u64) -> usize {
        let before = self.isolated.len();
        self.isolated.retain(|_, expires_at_ms| *expires_at_ms > now_ms);
        before - self.isolated.len()
    }
}

/// Lazily subscribed endpoint cache for one calling process
pub struct RegistryListener {
    client: Arc<dyn RegistryClient>,
    listener: Listener,
    config: ListenerConfig,
    time: Arc<dyn TimeProvider>,
    state: RwLock<ListenerState>,
    observers: RwLock<Vec<Arc<dyn ListenerObserver>>>,
    /// Private scheduler for the listener's own periodic work
    timer: Timer,
    refresh_task: Mutex<Option<TimerId>>,
}

impl RegistryListener {
    /// Create a listener whose callback is served at `local`
    pub fn new(
        client: Arc<dyn RegistryClient>,
        local: Address,
        config: ListenerConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let listener = Listener::new(config.callback_fitable_id.clone(), local);
        Self {
            client,
            listener,
            config,
            time,
            state: RwLock::new(ListenerState::default()),
            observers: RwLock::new(Vec::new()),
            timer: Timer::new(),
            refresh_task: Mutex::new(None),
        }
    }

    /// The identity this process subscribes under
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Schedule the periodic refresh
    pub async fn start(self: &Arc<Self>) {
        let mut refresh_task = self.refresh_task.lock().await;
        if refresh_task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval_ms = self.config.refresh_interval_ms;
        *refresh_task = Some(self.schedule_task(interval_ms, interval_ms, move || {
            let weak = weak.clone();
            async move {
                if let Some(listener) = weak.upgrade() {
                    if let Err(e) = listener.refresh().await {
                        warn!(error = %e, "listener refresh failed");
                    }
                }
            }
        }));
        info!(refresh_interval_ms = interval_ms, "registry listener started");
    }

    /// Cancel every scheduled task
    pub async fn stop(&self) {
        self.refresh_task.lock().await.take();
        self.timer.stop();
        info!("registry listener stopped");
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Reachable endpoints of `info`
    ///
    /// A miss subscribes once when `subscribe_new` is set and retries the
    /// lookup without subscribing. `None` means the fitable is not cached.
    #[instrument(skip(self), fields(fitable = %info.fitable_id))]
    pub async fn get_addresses(
        &self,
        info: &FitableInfo,
        subscribe_new: bool,
    ) -> Option<Vec<ApplicationInstance>> {
        let key = info.to_key();
        if let Some(applications) = self.cached(&key).await {
            return Some(applications);
        }
        if !subscribe_new {
            return None;
        }
        if let Err(e) = self.subscribe_fitables(std::slice::from_ref(&key)).await {
            warn!(fitable = %key, code = %e.code(), error = %e, "lazy subscribe failed");
            return None;
        }
        self.cached(&key).await
    }

    async fn cached(&self, key: &FitableKey) -> Option<Vec<ApplicationInstance>> {
        let now_ms = self.time.now_ms();
        self.state.read().await.available(key, now_ms)
    }

    /// Hide every endpoint of `worker` for the isolation window
    pub async fn isolate(&self, info: &FitableInfo, worker: &WorkerInstance) {
        let expires_at_ms = self
            .time
            .now_ms()
            .saturating_add(self.config.isolation_expire_ms);
        let mut state = self.state.write().await;
        for endpoint in &worker.endpoints {
            state
                .isolated
                .insert((endpoint.host.clone(), endpoint.port), expires_at_ms);
        }
        warn!(
            fitable = %info.to_key(),
            worker_id = %worker.id,
            endpoints = worker.endpoints.len(),
            expires_at_ms,
            "worker isolated"
        );
    }

    /// Number of endpoints currently hidden
    pub async fn isolated_count(&self) -> usize {
        let now_ms = self.time.now_ms();
        let state = self.state.read().await;
        state
            .isolated
            .values()
            .filter(|expires_at_ms| **expires_at_ms > now_ms)
            .count()
    }

    pub async fn cached_keys(&self) -> Vec<FitableKey> {
        let mut keys: Vec<FitableKey> = self.state.read().await.cache.keys().cloned().collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to `keys` and cache their current endpoints
    ///
    /// Keys the registry returned nothing for are cached empty, so a later
    /// lookup is a hit rather than another subscribe.
    pub async fn subscribe_fitables(&self, keys: &[FitableKey]) -> ListenerResult<Vec<FitableInstance>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let instances = self.client.subscribe(keys, &self.listener).await?;
        {
            let mut state = self.state.write().await;
            for key in keys {
                let instance = instances
                    .iter()
                    .find(|i| &i.fitable == key)
                    .cloned()
                    .unwrap_or_else(|| FitableInstance::from_registrations(key, &[]));
                state.cache.insert(key.clone(), instance);
            }
        }
        debug!(count = keys.len(), "fitables subscribed");
        self.notify_observers(ListenerEvent::Subscribed(keys.to_vec()))
            .await;
        Ok(instances)
    }

    /// Unsubscribe from `keys` and drop them from the cache
    pub async fn unsubscribe_fitables(&self, keys: &[FitableKey]) -> ListenerResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.client.unsubscribe(keys, &self.listener).await?;
        {
            let mut state = self.state.write().await;
            for key in keys {
                state.cache.remove(key);
            }
        }
        debug!(count = keys.len(), "fitables unsubscribed");
        self.notify_observers(ListenerEvent::Unsubscribed(keys.to_vec()))
            .await;
        Ok(())
    }

    /// Apply a `notifyFitables` push; keys not subscribed here are ignored
    pub async fn on_fitables_notified(&self, instances: Vec<FitableInstance>) -> RegistryCode {
        let changed = self.replace_cached(instances).await;
        if !changed.is_empty() {
            debug!(count = changed.len(), "cached endpoints updated by notification");
            self.notify_observers(ListenerEvent::Changed(changed)).await;
        }
        RegistryCode::Success
    }

    /// Re-query every cached key and expire old isolation marks
    ///
    /// Returns the number of keys whose endpoints were replaced.
    pub async fn refresh(&self) -> ListenerResult<usize> {
        let now_ms = self.time.now_ms();
        let (keys, pruned) = {
            let mut state = self.state.write().await;
            let pruned = state.prune_isolation(now_ms);
            (state.cache.keys().cloned().collect::<Vec<_>>(), pruned)
        };
        if pruned > 0 {
            debug!(pruned, "isolation marks expired");
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let instances = self.client.query(&keys).await?;
        let changed = self.replace_cached(instances).await;
        let count = changed.len();
        if count > 0 {
            self.notify_observers(ListenerEvent::Changed(changed)).await;
        }
        Ok(count)
    }

    /// Overwrite cached keys with differing instances; returns the keys changed
    async fn replace_cached(&self, instances: Vec<FitableInstance>) -> Vec<FitableKey> {
        let mut state = self.state.write().await;
        let mut changed = Vec::new();
        for instance in instances {
            match state.cache.get_mut(&instance.fitable) {
                Some(cached) if *cached != instance => {
                    changed.push(instance.fitable.clone());
                    *cached = instance;
                }
                Some(_) => {}
                None => debug!(fitable = %instance.fitable, "endpoints for unsubscribed fitable ignored"),
            }
        }
        changed
    }

    // =========================================================================
    // Observers and scheduling
    // =========================================================================

    pub async fn add_observer(&self, observer: Arc<dyn ListenerObserver>) {
        self.observers.write().await.push(observer);
    }

    async fn notify_observers(&self, event: ListenerEvent) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }

    /// Run `task` periodically on the listener's private scheduler
    pub fn schedule_task<F, Fut>(&self, first_delay_ms: u64, interval_ms: u64, task: F) -> TimerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.timer.set_interval(first_delay_ms, interval_ms, task)
    }

    pub fn unschedule_task(&self, id: TimerId) -> bool {
        self.timer.remove(id)
    }
}

/// Serves the inbound `notifyFitables` callback
#[async_trait]
impl GenericInvoker for RegistryListener {
    async fn invoke(&self, request: InvokeRequest) -> fitreg_core::Result<RpcReply> {
        match request.payload {
            RpcPayload::NotifyFitables { instances } => {
                Ok(RpcReply::code(self.on_fitables_notified(instances).await))
            }
            _ => Err(fitreg_core::Error::rpc_failed(
                request.generic_id,
                self.listener.address.id.clone(),
                FitCode::ERR_NOT_FOUND,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcRegistryClient;
    use fitreg_core::rpc::{GENERIC_ID_QUERY_RUNNING_FITABLES, GENERIC_ID_SUBSCRIBE_FITABLES};
    use fitreg_core::{Application, ManualClock, RecordingInvoker, ServiceRegistration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn info() -> FitableInfo {
        FitableInfo::new("g1", "v1", "f1", "1.0.0")
    }

    fn registration(worker: &str, ip: &str) -> ServiceRegistration {
        ServiceRegistration::new(
            info().to_key(),
            Application::new("appA", "vA"),
            vec![Address::new(worker, ip, 8080)],
            60,
        )
    }

    fn instance(registrations: &[ServiceRegistration]) -> FitableInstance {
        FitableInstance::from_registrations(&info().to_key(), registrations)
    }

    /// Registry double answering subscribe and query with the same two workers
    async fn registry() -> Arc<RecordingInvoker> {
        let invoker = Arc::new(RecordingInvoker::new());
        let current = instance(&[registration("w1", "10.0.0.1"), registration("w2", "10.0.0.2")]);
        invoker
            .set_responder(move |request: &InvokeRequest| match &request.payload {
                RpcPayload::SubscribeFitables { .. } | RpcPayload::QueryRunningFitables { .. } => {
                    Ok(RpcReply::Fitables {
                        instances: vec![current.clone()],
                    })
                }
                _ => Ok(RpcReply::code(RegistryCode::Success)),
            })
            .await;
        invoker
    }

    fn listener(invoker: Arc<RecordingInvoker>, clock: Arc<ManualClock>) -> RegistryListener {
        let client = Arc::new(RpcRegistryClient::new(invoker, 1000));
        RegistryListener::new(
            client,
            Address::new("caller", "10.0.0.9", 9000),
            ListenerConfig {
                isolation_expire_ms: 1000,
                ..ListenerConfig::default()
            },
            clock,
        )
    }

    #[tokio::test]
    async fn test_miss_subscribes_once_then_hits() {
        let invoker = registry().await;
        let listener = listener(invoker.clone(), Arc::new(ManualClock::new(0)));

        assert!(listener.get_addresses(&info(), false).await.is_none());
        assert_eq!(invoker.call_count().await, 0);

        let apps = listener.get_addresses(&info(), true).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].workers.len(), 2);

        listener.get_addresses(&info(), true).await.unwrap();
        assert_eq!(invoker.calls_for(GENERIC_ID_SUBSCRIBE_FITABLES).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_a_miss() {
        let invoker = Arc::new(RecordingInvoker::new());
        invoker
            .set_responder(|_| Ok(RpcReply::code(RegistryCode::Error)))
            .await;
        let listener = listener(invoker, Arc::new(ManualClock::new(0)));

        assert!(listener.get_addresses(&info(), true).await.is_none());
        assert!(listener.cached_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_isolation_hides_endpoint_until_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let listener = listener(registry().await, clock.clone());

        let apps = listener.get_addresses(&info(), true).await.unwrap();
        let w1 = apps[0].workers.iter().find(|w| w.id == "w1").unwrap().clone();
        listener.isolate(&info(), &w1).await;
        assert_eq!(listener.isolated_count().await, 1);

        let apps = listener.get_addresses(&info(), false).await.unwrap();
        assert_eq!(apps[0].workers.len(), 1);
        assert_eq!(apps[0].workers[0].id, "w2");

        clock.advance_ms(1000);
        assert_eq!(listener.isolated_count().await, 0);
        let apps = listener.get_addresses(&info(), false).await.unwrap();
        assert_eq!(apps[0].workers.len(), 2);
    }

    #[tokio::test]
    async fn test_notification_updates_subscribed_keys_only() {
        let listener = listener(registry().await, Arc::new(ManualClock::new(0)));
        let observer = Arc::new(RecordingObserver::new());
        listener.add_observer(observer.clone()).await;
        listener.subscribe_fitables(&[info().to_key()]).await.unwrap();

        let other = FitableInstance::from_registrations(&FitableKey::new("g2", "v1", "f9"), &[]);
        let code = listener
            .invoke(InvokeRequest::new(RpcPayload::NotifyFitables {
                instances: vec![instance(&[registration("w3", "10.0.0.3")]), other],
            }))
            .await
            .unwrap();
        assert_eq!(code, RpcReply::code(RegistryCode::Success));

        let apps = listener.get_addresses(&info(), false).await.unwrap();
        assert_eq!(apps[0].workers.len(), 1);
        assert_eq!(apps[0].workers[0].id, "w3");
        assert_eq!(listener.cached_keys().await, vec![info().to_key()]);
        assert_eq!(
            observer.events(),
            vec![
                ListenerEvent::Subscribed(vec![info().to_key()]),
                ListenerEvent::Changed(vec![info().to_key()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_restores_lost_updates() {
        let invoker = registry().await;
        let listener = listener(invoker.clone(), Arc::new(ManualClock::new(0)));
        listener.subscribe_fitables(&[info().to_key()]).await.unwrap();
        assert_eq!(listener.refresh().await.unwrap(), 0);

        listener
            .on_fitables_notified(vec![instance(&[registration("w3", "10.0.0.3")])])
            .await;
        assert_eq!(listener.refresh().await.unwrap(), 1);
        let apps = listener.get_addresses(&info(), false).await.unwrap();
        assert_eq!(apps[0].workers.len(), 2);
        assert_eq!(invoker.calls_for(GENERIC_ID_QUERY_RUNNING_FITABLES).await.len(), 2);

        listener.unsubscribe_fitables(&[info().to_key()]).await.unwrap();
        assert!(listener.get_addresses(&info(), false).await.is_none());
        assert_eq!(listener.refresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_task_runs_until_unscheduled() {
        let listener = listener(registry().await, Arc::new(ManualClock::new(0)));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let id = listener.schedule_task(0, 10, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(listener.unschedule_task(id));
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert!(!listener.unschedule_task(id));
    }
}
