//! Integration tests for a registry node and small clusters
//!
//! TigerStyle: Every tier wired for real, RPC captured or routed in-process.

use async_trait::async_trait;
use fitreg_core::rpc::{GENERIC_ID_NOTIFY_FITABLES, GENERIC_ID_SYNC_FIT_SERVICE};
use fitreg_core::{
    Address, Application, FitableKey, GenericInvoker, InvokeRequest, Listener, ManualClock,
    NodeConfig, OperateType, PersistenceConfig, ReconciliationConfig, RecordingInvoker,
    RegistryCode, ReplicationConfig, RpcPayload, RpcReply, ServiceRegistration, SubscriptionConfig,
    SubscriptionEntry, Timer,
};
use fitreg_registry::{
    AsyncServiceRepository, AsyncSubscriptionRepository, FitableMemoryRepository, FitableNodeSync,
    FitableQuery, FitableStatusPublisher, MemoryTableStore, PersistentServiceRepository,
    PersistentSubscriptionRepository, RegistryDirectory, RegistryMemoryRepository,
    RegistryRpcHandler, SaveOutcome, ServiceRepository, StaticRegistryDirectory,
    SubscriptionMemoryRepository, SubscriptionNodeSync, SubscriptionService,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

// =============================================================================
// Test Helpers
// =============================================================================

fn key(f: &str) -> FitableKey {
    FitableKey::new("g1", "v1", f)
}

fn registration(f: &str, worker: &str, app: &str) -> ServiceRegistration {
    ServiceRegistration::new(
        key(f),
        Application::new(app, "vA"),
        vec![Address::new(worker, "10.0.0.1", 8080)],
        60,
    )
}

fn node_address(worker_id: &str) -> Address {
    Address::new(worker_id, "127.0.0.1", 8866)
}

fn persistence_config() -> PersistenceConfig {
    PersistenceConfig {
        shard_count: 2,
        write_retry_count_max: 2,
        write_retry_backoff_ms: 5,
    }
}

fn replication_config(batch_count_max: usize) -> ReplicationConfig {
    ReplicationConfig {
        batch_count_max,
        flush_interval_ms: 60_000,
        executor_count: 2,
        pending_task_count_max: 16,
    }
}

/// Routes calls to the handler of the target worker ID
#[derive(Default)]
struct PeerRouter {
    handlers: RwLock<HashMap<String, Arc<RegistryRpcHandler>>>,
}

impl PeerRouter {
    async fn attach(&self, worker_id: &str, handler: Arc<RegistryRpcHandler>) {
        self.handlers
            .write()
            .await
            .insert(worker_id.to_string(), handler);
    }
}

#[async_trait]
impl GenericInvoker for PeerRouter {
    async fn invoke(&self, request: InvokeRequest) -> fitreg_core::Result<RpcReply> {
        let target = request.target.as_ref().map(|a| a.id.clone()).unwrap_or_default();
        let handler = self.handlers.read().await.get(&target).cloned();
        match handler {
            Some(handler) => handler.invoke(request).await,
            None => Err(fitreg_core::Error::rpc_failed(
                request.generic_id,
                target,
                fitreg_core::FitCode::ERR_NOT_FOUND,
            )),
        }
    }
}

/// One fully wired registry node
struct Node {
    store: Arc<MemoryTableStore>,
    write_behind: Arc<AsyncServiceRepository>,
    subscription_write_behind: Arc<AsyncSubscriptionRepository>,
    memory: Arc<FitableMemoryRepository>,
    registry: Arc<RegistryMemoryRepository>,
    subscriptions: Arc<SubscriptionService>,
    node_sync: Arc<FitableNodeSync>,
    subscription_sync: Arc<SubscriptionNodeSync>,
    publisher: Arc<FitableStatusPublisher>,
    handler: Arc<RegistryRpcHandler>,
}

impl Node {
    async fn new(
        worker_id: &str,
        invoker: Arc<dyn GenericInvoker>,
        directory: Arc<dyn RegistryDirectory>,
        replication: ReplicationConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let timer = Timer::new();
        let node = NodeConfig {
            worker_id: worker_id.to_string(),
            ..NodeConfig::default()
        };

        let store = Arc::new(MemoryTableStore::new());
        let direct: Arc<dyn ServiceRepository> =
            Arc::new(PersistentServiceRepository::from_store(store.clone()));
        let write_behind = Arc::new(AsyncServiceRepository::new(
            direct.clone(),
            persistence_config(),
        ));
        let memory = Arc::new(FitableMemoryRepository::new(clock.clone()));

        let subscription_write_behind = Arc::new(AsyncSubscriptionRepository::new(
            Arc::new(PersistentSubscriptionRepository::new(store.clone())),
            SubscriptionConfig {
                gc_interval_ms: 60_000,
                write_retry_count_max: 2,
                write_retry_backoff_ms: 5,
            },
        ));
        let subscription_sync = Arc::new(SubscriptionNodeSync::new(
            worker_id,
            invoker.clone(),
            directory.clone(),
            &replication,
            timer.clone(),
        ));
        let subscriptions = Arc::new(
            SubscriptionService::new(Arc::new(SubscriptionMemoryRepository::new()))
                .with_persistent(subscription_write_behind.clone())
                .with_node_sync(subscription_sync.clone())
                .with_reconciliation(
                    timer.clone(),
                    ReconciliationConfig {
                        enabled: false,
                        ..ReconciliationConfig::default()
                    },
                ),
        );

        let node_sync = Arc::new(FitableNodeSync::new(
            worker_id,
            invoker.clone(),
            directory,
            &replication,
            timer.clone(),
        ));
        let publisher = Arc::new(FitableStatusPublisher::new(
            Some(memory.clone() as Arc<dyn FitableQuery>),
            Some(subscriptions.clone()),
            invoker,
            &replication,
        ));
        let registry = Arc::new(
            RegistryMemoryRepository::new(
                &node,
                ReconciliationConfig {
                    enabled: false,
                    ..ReconciliationConfig::default()
                },
                clock,
                timer,
            )
            .with_memory(memory.clone())
            .with_persistent(write_behind.clone())
            .with_direct(direct)
            .with_node_sync(node_sync.clone())
            .with_publisher(publisher.clone()),
        );
        let handler = Arc::new(RegistryRpcHandler::new(
            registry.clone(),
            Some(subscriptions.clone()),
        ));

        registry.start().await;
        subscriptions.start().await;

        Self {
            store,
            write_behind,
            subscription_write_behind,
            memory,
            registry,
            subscriptions,
            node_sync,
            subscription_sync,
            publisher,
            handler,
        }
    }

    /// Ship buffered replication and drain every background queue
    async fn settle(&self) {
        self.node_sync.flush().await;
        self.subscription_sync.flush().await;
        while self.node_sync.replicator().pending_count() > 0
            || self.subscription_sync.replicator().pending_count() > 0
            || self.publisher.pending_count() > 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.write_behind.flush().await;
        self.subscription_write_behind.flush().await;
    }
}

async fn single_node(invoker: Arc<RecordingInvoker>) -> Node {
    let directory = Arc::new(StaticRegistryDirectory::new(vec![
        node_address("reg-a"),
        node_address("reg-b"),
    ]));
    Node::new("reg-a", invoker, directory, replication_config(100)).await
}

// =============================================================================
// Single Node
// =============================================================================

#[tokio::test]
async fn test_register_query_remove_end_to_end() {
    let node = single_node(Arc::new(RecordingInvoker::new())).await;
    let reg = registration("f1", "w1", "appA");

    node.registry.save(&reg).await;
    assert_eq!(node.registry.query(&key("f1")).await, vec![reg.clone()]);

    let removed = node
        .registry
        .remove_by_address(&Address::new("w1", "10.0.0.1", 8080))
        .await;
    assert_eq!(removed, vec![reg]);

    // Query falls back to the durable tier, so let the deletion land first
    node.settle().await;
    assert!(node.registry.query(&key("f1")).await.is_empty());
}

#[tokio::test]
async fn test_idempotent_registration_writes_once() {
    let invoker = Arc::new(RecordingInvoker::new());
    let node = single_node(invoker.clone()).await;
    let reg = registration("f1", "w1", "appA");

    node.registry.save(&reg).await;
    node.settle().await;
    let writes = node.store.write_count();
    let sync_calls = invoker.calls_for(GENERIC_ID_SYNC_FIT_SERVICE).await.len();
    assert_eq!(sync_calls, 1);

    node.registry.save(&reg).await;
    node.settle().await;
    assert_eq!(node.store.write_count(), writes);
    assert_eq!(invoker.calls_for(GENERIC_ID_SYNC_FIT_SERVICE).await.len(), sync_calls);
    assert_eq!(node.memory.save(&reg).await, SaveOutcome::Unchanged);
    // the node's own replication fitable plus f1
    assert_eq!(node.memory.len().await, 2);
    assert_eq!(node.store.fitable_row_count().await, 2);
}

#[tokio::test]
async fn test_cascade_delete_through_registry() {
    let node = single_node(Arc::new(RecordingInvoker::new())).await;
    let w1 = registration("f1", "w1", "appA");
    let w2 = registration("f1", "w2", "appA");
    node.registry.save_all(&[w1.clone(), w2.clone()]).await;

    node.registry
        .remove(&key("f1"), &w1.addresses[0])
        .await;
    assert_eq!(
        node.memory.query_bindings(&key("f1")).await,
        vec![Application::new("appA", "vA")]
    );

    node.registry.remove_all(&[w2]).await;
    assert!(node.memory.query_bindings(&key("f1")).await.is_empty());
    node.settle().await;
    assert!(node.registry.query(&key("f1")).await.is_empty());
}

#[tokio::test]
async fn test_reconciliation_repairs_lost_durable_writes() {
    let node = single_node(Arc::new(RecordingInvoker::new())).await;
    node.store.set_fail_writes(true);

    let regs: Vec<ServiceRegistration> = ["f1", "f2", "f3"]
        .iter()
        .map(|f| registration(f, "w1", "appA"))
        .collect();
    node.registry.save_all(&regs).await;
    node.settle().await;
    node.store.set_fail_writes(false);
    assert_eq!(node.store.fitable_row_count().await, 0);

    assert_eq!(
        node.registry.sync_service_between_memory_and_db().await,
        RegistryCode::Success
    );
    node.settle().await;

    // three registrations plus the bootstrap row lost with them
    assert_eq!(node.store.fitable_row_count().await, 4);
    let sync_count = node.registry.sync_count();
    assert!(node.memory.get_services_not_updated(sync_count).await.is_empty());

    // a second pass finds everything durable and nothing stale
    assert_eq!(
        node.registry.sync_service_between_memory_and_db().await,
        RegistryCode::Success
    );
    let sync_count = node.registry.sync_count();
    assert!(node.memory.get_services_not_updated(sync_count).await.is_empty());
}

#[tokio::test]
async fn test_subscriber_notified_once_on_change() {
    let invoker = Arc::new(RecordingInvoker::new());
    let node = single_node(invoker.clone()).await;
    let listener = Listener::new("onFitablesChanged", Address::new("L", "10.0.0.9", 9000));

    node.subscriptions
        .memory()
        .insert_subscription_entry(&SubscriptionEntry::new(key("f1"), listener.clone()))
        .await;
    assert!(node
        .subscriptions
        .query_listener_set(&key("f1"))
        .await
        .contains(&listener));

    node.registry.save(&registration("f1", "w1", "appA")).await;
    node.settle().await;

    let calls = invoker.calls_for(GENERIC_ID_NOTIFY_FITABLES).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.target.as_ref(), Some(&listener.address));
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test]
async fn test_replication_backpressure_drops_excess_batches() {
    let invoker = Arc::new(RecordingInvoker::new());
    let directory = Arc::new(StaticRegistryDirectory::new(vec![node_address("peer-1")]));
    let node_sync = FitableNodeSync::new(
        "reg-a",
        invoker.clone(),
        directory,
        &ReplicationConfig {
            batch_count_max: 1,
            flush_interval_ms: 60_000,
            executor_count: 1,
            pending_task_count_max: 2,
        },
        Timer::new(),
    );

    invoker.hold();
    for f in ["f1", "f2", "f3", "f4"] {
        node_sync.add(&[registration(f, "w1", "appA")]).await;
        assert!(node_sync.replicator().pending_count() <= 2);
    }
    assert_eq!(node_sync.replicator().dropped_count(), 2);

    invoker.release();
    while node_sync.replicator().pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(invoker.calls_to("peer-1").await.len(), 2);
}

#[tokio::test]
async fn test_peer_observes_submission_order() {
    let invoker = Arc::new(RecordingInvoker::new());
    invoker.set_delay_ms(10);
    let directory = Arc::new(StaticRegistryDirectory::new(vec![
        node_address("peer-1"),
        node_address("peer-2"),
    ]));
    let node_sync = FitableNodeSync::new(
        "reg-a",
        invoker.clone(),
        directory,
        &replication_config(1),
        Timer::new(),
    );

    let reg = registration("f1", "w1", "appA");
    node_sync.add(&[reg.clone()]).await;
    node_sync.remove(&[reg]).await;
    while node_sync.replicator().pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for peer in ["peer-1", "peer-2"] {
        let calls = invoker.calls_to(peer).await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].seq < calls[1].seq);
        let operations: Vec<OperateType> = calls
            .iter()
            .map(|c| match &c.request.payload {
                RpcPayload::SynchronizeFitService { items } => items[0].operate_type,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(operations, vec![OperateType::Add, OperateType::Remove]);
        assert_eq!(invoker.max_in_flight(peer).await, 1);
    }
}

#[tokio::test]
async fn test_two_nodes_converge() {
    let router = Arc::new(PeerRouter::default());
    let directory = Arc::new(StaticRegistryDirectory::new(vec![
        node_address("reg-a"),
        node_address("reg-b"),
    ]));
    let a = Node::new("reg-a", router.clone(), directory.clone(), replication_config(100)).await;
    let b = Node::new("reg-b", router.clone(), directory, replication_config(100)).await;
    router.attach("reg-a", a.handler.clone()).await;
    router.attach("reg-b", b.handler.clone()).await;

    let reg = registration("f1", "w1", "appA");
    a.registry.save(&reg).await;
    a.settle().await;
    assert_eq!(b.memory.query(&key("f1")).await, vec![reg.clone()]);
    // replicated state stays in memory on the receiving node
    assert_eq!(b.store.fitable_row_count().await, 0);

    let listener = Listener::new("cb", Address::new("L", "10.0.0.9", 9000));
    a.subscriptions.subscribe(&key("f1"), &listener).await;
    a.settle().await;
    assert_eq!(b.subscriptions.query_listener_set(&key("f1")).await, vec![listener]);

    a.registry.remove_all(&[reg]).await;
    a.settle().await;
    assert!(b.memory.query(&key("f1")).await.is_empty());
}
