//! Fitable status publisher
//!
//! TigerStyle: Lookups are memory-only; delivery is per-listener FIFO and
//! backpressured.
//!
//! On every registration change the publisher groups the changed records by
//! fitable key, looks up the listeners of each key and sends every listener one
//! `notifyFitables` call carrying the key's current endpoint set. Either lookup
//! collaborator may be absent, in which case publishing is a no-op.

use crate::executor::SerialExecutorPool;
use crate::memory::FitableMemoryRepository;
use crate::subscription::SubscriptionService;
use async_trait::async_trait;
use fitreg_core::{
    FitableInstance, FitableKey, GenericInvoker, InvokeRequest, ReplicationConfig, RpcPayload,
    ServiceRegistration,
};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Current endpoint set of a fitable
#[async_trait]
pub trait FitableQuery: Send + Sync {
    async fn query_fitable_instance(&self, key: &FitableKey) -> FitableInstance;
}

#[async_trait]
impl FitableQuery for FitableMemoryRepository {
    async fn query_fitable_instance(&self, key: &FitableKey) -> FitableInstance {
        let registrations = self.query(key).await;
        FitableInstance::from_registrations(key, &registrations)
    }
}

/// Pushes endpoint changes to subscribed listeners
pub struct FitableStatusPublisher {
    fitables: Option<Arc<dyn FitableQuery>>,
    subscriptions: Option<Arc<SubscriptionService>>,
    invoker: Arc<dyn GenericInvoker>,
    executors: SerialExecutorPool,
}

impl FitableStatusPublisher {
    /// Create a publisher; spawns the delivery executors, so call within a runtime
    pub fn new(
        fitables: Option<Arc<dyn FitableQuery>>,
        subscriptions: Option<Arc<SubscriptionService>>,
        invoker: Arc<dyn GenericInvoker>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            fitables,
            subscriptions,
            invoker,
            executors: SerialExecutorPool::new(config.executor_count, config.pending_task_count_max),
        }
    }

    /// Notify the listeners of every key touched by `registrations`
    ///
    /// Returns the number of notifications queued.
    pub async fn on_fitables_changed(&self, registrations: &[ServiceRegistration]) -> usize {
        let (Some(fitables), Some(subscriptions)) = (&self.fitables, &self.subscriptions) else {
            return 0;
        };

        let keys: BTreeSet<&FitableKey> = registrations.iter().map(|r| &r.fitable).collect();
        let mut queued = 0;
        for key in keys {
            let listeners = subscriptions.query_listener_set(key).await;
            if listeners.is_empty() {
                continue;
            }
            let instance = fitables.query_fitable_instance(key).await;
            for listener in listeners {
                let request = InvokeRequest::new(RpcPayload::NotifyFitables {
                    instances: vec![instance.clone()],
                })
                .with_target(listener.address.clone())
                .with_fitable_id(listener.fitable_id.clone());

                let invoker = self.invoker.clone();
                let fitable = key.to_string();
                let task = async move {
                    let target = request.target_label();
                    if let Err(e) = invoker.invoke(request).await {
                        error!(fitable = %fitable, target = %target, code = %e.code(), error = %e, "notify listener failed");
                    }
                }
                .boxed();

                if self.executors.submit(&listener.address.id, task) {
                    queued += 1;
                } else {
                    warn!(fitable = %key, listener = %listener.address.id, "listener executor saturated, notification dropped");
                }
            }
        }
        if queued > 0 {
            debug!(queued, "listener notifications queued");
        }
        queued
    }

    /// Notifications queued or in flight
    pub fn pending_count(&self) -> usize {
        self.executors.pending_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.executors.dropped_count()
    }

    pub fn stop(&self) {
        self.executors.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionMemoryRepository;
    use fitreg_core::rpc::GENERIC_ID_NOTIFY_FITABLES;
    use fitreg_core::{Address, Application, Listener, ListenerId, ManualClock, RecordingInvoker};
    use std::time::Duration;

    fn key() -> FitableKey {
        FitableKey::new("g1", "v1", "f1")
    }

    fn registration(worker: &str) -> ServiceRegistration {
        ServiceRegistration::new(
            key(),
            Application::new("appA", "vA"),
            vec![Address::new(worker, "10.0.0.1", 8080)],
            60,
        )
    }

    async fn wait_idle(publisher: &FitableStatusPublisher) {
        while publisher.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_listener_notified_once_per_key() {
        let memory = Arc::new(FitableMemoryRepository::new(Arc::new(ManualClock::new(0))));
        let subscriptions = Arc::new(SubscriptionService::new(Arc::new(
            SubscriptionMemoryRepository::new(),
        )));
        let invoker = Arc::new(RecordingInvoker::new());
        let publisher = FitableStatusPublisher::new(
            Some(memory.clone() as Arc<dyn FitableQuery>),
            Some(subscriptions.clone()),
            invoker.clone(),
            &ReplicationConfig::default(),
        );

        let listener = Listener::new("onChange", Address::new("L", "10.0.0.9", 9000));
        subscriptions.subscribe(&key(), &listener).await;
        let w1 = registration("w1");
        let w2 = registration("w2");
        memory.save(&w1).await;
        memory.save(&w2).await;

        assert_eq!(publisher.on_fitables_changed(&[w1, w2]).await, 1);
        wait_idle(&publisher).await;

        let calls = invoker.calls_for(GENERIC_ID_NOTIFY_FITABLES).await;
        assert_eq!(calls.len(), 1);
        let request = &calls[0].request;
        assert_eq!(request.fitable_id.as_deref(), Some("onChange"));
        let target = request.target.as_ref().unwrap();
        assert_eq!(
            ListenerId {
                address_id: target.id.clone(),
                port: target.port,
                fitable_id: "onChange".into()
            },
            listener.id()
        );
        match &request.payload {
            RpcPayload::NotifyFitables { instances } => {
                assert_eq!(instances.len(), 1);
                assert_eq!(instances[0].endpoint_count(), 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_collaborators_are_noop() {
        let invoker = Arc::new(RecordingInvoker::new());
        let publisher =
            FitableStatusPublisher::new(None, None, invoker.clone(), &ReplicationConfig::default());

        assert_eq!(publisher.on_fitables_changed(&[registration("w1")]).await, 0);
        assert_eq!(invoker.call_count().await, 0);
    }
}
