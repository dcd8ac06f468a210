//! Registry RPC messages and the generic invoker port
//!
//! TigerStyle: Typed payloads, explicit generic IDs, bounded in-memory doubles.
//!
//! Marshaling and transport belong to the generic RPC layer. The registry only
//! decides which generic service to call, at which address, with which payload.

use crate::codes::{FitCode, RegistryCode};
use crate::error::{Error, Result};
use crate::fitable::{
    Address, FitableInstance, FitableKey, Listener, ServiceRegistration, SubscriptionEntry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

// =============================================================================
// Generic IDs
// =============================================================================

/// Peer replication of service registrations
pub const GENERIC_ID_SYNC_FIT_SERVICE: &str = "synchronizeFitService";

/// Peer replication of subscriptions
pub const GENERIC_ID_SYNC_SUBSCRIPTION: &str = "syncSubscriptionFitService";

/// Push of changed endpoints to a subscriber
pub const GENERIC_ID_NOTIFY_FITABLES: &str = "notifyFitables";

/// Endpoint lookup by fitable key
pub const GENERIC_ID_QUERY_RUNNING_FITABLES: &str = "queryRunningFitables";

pub const GENERIC_ID_SUBSCRIBE_FITABLES: &str = "subscribeFitables";
pub const GENERIC_ID_UNSUBSCRIBE_FITABLES: &str = "unsubscribeFitables";
pub const GENERIC_ID_REGISTER_FITABLES: &str = "registerFitables";
pub const GENERIC_ID_UNREGISTER_FITABLES: &str = "unregisterFitables";

/// Version shared by the registry's own genericables
pub const REGISTRY_GENERIC_VERSION: &str = "1.0.0";

/// Key of the replication bootstrap fitable every registry node registers for itself
pub fn sync_fit_service_key() -> FitableKey {
    FitableKey::new(
        GENERIC_ID_SYNC_FIT_SERVICE,
        REGISTRY_GENERIC_VERSION,
        GENERIC_ID_SYNC_FIT_SERVICE,
    )
}

// =============================================================================
// Replication payloads
// =============================================================================

/// Whether a replicated item adds or removes state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum OperateType {
    Add = 0,
    Remove = 1,
}

impl From<OperateType> for i32 {
    fn from(op: OperateType) -> Self {
        op as i32
    }
}

impl TryFrom<i32> for OperateType {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Add),
            1 => Ok(Self::Remove),
            other => Err(format!("unknown operate type {}", other)),
        }
    }
}

/// One replicated registration change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFitableInstance {
    pub registration: ServiceRegistration,
    pub operate_type: OperateType,
}

impl SyncFitableInstance {
    pub fn new(registration: ServiceRegistration, operate_type: OperateType) -> Self {
        Self {
            registration,
            operate_type,
        }
    }
}

/// One replicated subscription change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSubscriptionService {
    pub fitable: FitableKey,
    pub listener_address: Address,
    pub operate_type: OperateType,
    pub callback_fit_id: String,
    #[serde(default)]
    pub sync_count: u64,
}

impl SyncSubscriptionService {
    pub fn from_entry(entry: &SubscriptionEntry, operate_type: OperateType) -> Self {
        Self {
            fitable: entry.fitable_key.clone(),
            listener_address: entry.listener.address.clone(),
            operate_type,
            callback_fit_id: entry.listener.fitable_id.clone(),
            sync_count: entry.listener.sync_count,
        }
    }

    pub fn to_entry(&self) -> SubscriptionEntry {
        SubscriptionEntry {
            fitable_key: self.fitable.clone(),
            listener: Listener {
                fitable_id: self.callback_fit_id.clone(),
                address: self.listener_address.clone(),
                sync_count: self.sync_count,
            },
        }
    }
}

// =============================================================================
// Request / Reply
// =============================================================================

/// Payload of a registry RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcPayload {
    SynchronizeFitService {
        items: Vec<SyncFitableInstance>,
    },
    SyncSubscriptionFitService {
        items: Vec<SyncSubscriptionService>,
    },
    NotifyFitables {
        instances: Vec<FitableInstance>,
    },
    QueryRunningFitables {
        keys: Vec<FitableKey>,
    },
    SubscribeFitables {
        keys: Vec<FitableKey>,
        listener: Listener,
    },
    UnsubscribeFitables {
        keys: Vec<FitableKey>,
        listener: Listener,
    },
    RegisterFitables {
        registrations: Vec<ServiceRegistration>,
    },
    UnregisterFitables {
        registrations: Vec<ServiceRegistration>,
    },
}

impl RpcPayload {
    /// Generic ID the payload is delivered to
    pub fn generic_id(&self) -> &'static str {
        match self {
            Self::SynchronizeFitService { .. } => GENERIC_ID_SYNC_FIT_SERVICE,
            Self::SyncSubscriptionFitService { .. } => GENERIC_ID_SYNC_SUBSCRIPTION,
            Self::NotifyFitables { .. } => GENERIC_ID_NOTIFY_FITABLES,
            Self::QueryRunningFitables { .. } => GENERIC_ID_QUERY_RUNNING_FITABLES,
            Self::SubscribeFitables { .. } => GENERIC_ID_SUBSCRIBE_FITABLES,
            Self::UnsubscribeFitables { .. } => GENERIC_ID_UNSUBSCRIBE_FITABLES,
            Self::RegisterFitables { .. } => GENERIC_ID_REGISTER_FITABLES,
            Self::UnregisterFitables { .. } => GENERIC_ID_UNREGISTER_FITABLES,
        }
    }
}

/// Reply to a registry RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcReply {
    Code { code: RegistryCode },
    Fitables { instances: Vec<FitableInstance> },
}

impl RpcReply {
    pub fn code(code: RegistryCode) -> Self {
        Self::Code { code }
    }
}

/// An outbound generic invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub generic_id: String,
    /// Specific fitable to route to; the RPC layer load-balances when absent
    pub fitable_id: Option<String>,
    /// Specific worker to call; the RPC layer resolves one when absent
    pub target: Option<Address>,
    pub payload: RpcPayload,
}

impl InvokeRequest {
    pub fn new(payload: RpcPayload) -> Self {
        Self {
            generic_id: payload.generic_id().to_string(),
            fitable_id: None,
            target: None,
            payload,
        }
    }

    pub fn with_target(mut self, target: Address) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_fitable_id(mut self, fitable_id: impl Into<String>) -> Self {
        self.fitable_id = Some(fitable_id.into());
        self
    }

    /// Printable target for logs
    pub fn target_label(&self) -> String {
        self.target
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<any>".to_string())
    }
}

// =============================================================================
// GenericInvoker
// =============================================================================

/// Black-box generic RPC capability
///
/// Failures carry a `FitCode` through `Error::RpcFailed`.
#[async_trait]
pub trait GenericInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<RpcReply>;
}

// =============================================================================
// RecordingInvoker
// =============================================================================

/// A captured invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Global call order, starting at 0
    pub seq: u64,
    pub request: InvokeRequest,
}

impl RecordedCall {
    pub fn target_id(&self) -> Option<&str> {
        self.request.target.as_ref().map(|a| a.id.as_str())
    }
}

type Responder = Arc<dyn Fn(&InvokeRequest) -> Result<RpcReply> + Send + Sync>;

#[derive(Debug, Default)]
struct InFlight {
    current: HashMap<String, usize>,
    max: HashMap<String, usize>,
}

/// In-memory invoker that captures every call
///
/// Calls can be held at a gate, delayed, or failed per target worker ID.
pub struct RecordingInvoker {
    calls: Mutex<Vec<RecordedCall>>,
    seq: AtomicU64,
    delay_ms: AtomicU64,
    failing_targets: Mutex<HashSet<String>>,
    responder: Mutex<Option<Responder>>,
    in_flight: Mutex<InFlight>,
    gate: watch::Sender<bool>,
}

impl std::fmt::Debug for RecordingInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingInvoker")
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for RecordingInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingInvoker {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            delay_ms: AtomicU64::new(0),
            failing_targets: Mutex::new(HashSet::new()),
            responder: Mutex::new(None),
            in_flight: Mutex::new(InFlight::default()),
            gate,
        }
    }

    /// Delay every call by `ms` after it is recorded
    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Fail calls whose target worker ID is `id` with `FitCode::ERR_NETWORK`
    pub async fn fail_target(&self, id: impl Into<String>) {
        self.failing_targets.lock().await.insert(id.into());
    }

    pub async fn heal_target(&self, id: &str) {
        self.failing_targets.lock().await.remove(id);
    }

    /// Compute replies with `f` instead of `RegistryCode::Success`
    pub async fn set_responder<F>(&self, f: F)
    where
        F: Fn(&InvokeRequest) -> Result<RpcReply> + Send + Sync + 'static,
    {
        *self.responder.lock().await = Some(Arc::new(f));
    }

    /// Hold recorded calls until `release` is called
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn calls_for(&self, generic_id: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.request.generic_id == generic_id)
            .cloned()
            .collect()
    }

    pub async fn calls_to(&self, target_id: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.target_id() == Some(target_id))
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous calls ever observed for one target
    pub async fn max_in_flight(&self, target_id: &str) -> usize {
        self.in_flight
            .lock()
            .await
            .max
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn clear(&self) {
        self.calls.lock().await.clear();
    }

    async fn enter(&self, target: &str) {
        let mut in_flight = self.in_flight.lock().await;
        let current = {
            let c = in_flight.current.entry(target.to_string()).or_insert(0);
            *c += 1;
            *c
        };
        let max = in_flight.max.entry(target.to_string()).or_insert(0);
        *max = (*max).max(current);
    }

    async fn leave(&self, target: &str) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(c) = in_flight.current.get_mut(target) {
            *c = c.saturating_sub(1);
        }
    }
}

#[async_trait]
impl GenericInvoker for RecordingInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<RpcReply> {
        let target = request
            .target
            .as_ref()
            .map(|a| a.id.clone())
            .unwrap_or_default();

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().await.push(RecordedCall {
            seq,
            request: request.clone(),
        });
        self.enter(&target).await;

        let mut gate = self.gate.subscribe();
        // The sender lives in self, so wait_for only fails if self is gone
        let _ = gate.wait_for(|open| *open).await;

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
        }

        let result = if self.failing_targets.lock().await.contains(&target) {
            Err(Error::rpc_failed(
                request.generic_id.clone(),
                request.target_label(),
                FitCode::ERR_NETWORK,
            ))
        } else {
            let responder = self.responder.lock().await.clone();
            match responder {
                Some(f) => f(&request),
                None => Ok(RpcReply::code(RegistryCode::Success)),
            }
        };

        self.leave(&target).await;
        result
    }
}
