//! Inbound registry RPC handler
//!
//! TigerStyle: One match over the payload, no partial routing.
//!
//! Routes registry RPCs to the orchestrator and the subscription service. The
//! handler also implements [`GenericInvoker`], so an in-process caller can
//! address a registry node exactly as a remote one.

use crate::error::{RegistryError, RegistryResult};
use crate::service::{combine_codes, RegistryMemoryRepository};
use crate::subscription::SubscriptionService;
use async_trait::async_trait;
use fitreg_core::{
    FitableInstance, GenericInvoker, InvokeRequest, OperateType, RegistryCode, RpcPayload, RpcReply,
    ServiceRegistration, SyncFitableInstance,
};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Serves the registry's own genericables
pub struct RegistryRpcHandler {
    registry: Arc<RegistryMemoryRepository>,
    subscriptions: Option<Arc<SubscriptionService>>,
}

impl RegistryRpcHandler {
    pub fn new(
        registry: Arc<RegistryMemoryRepository>,
        subscriptions: Option<Arc<SubscriptionService>>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
        }
    }

    fn subscriptions(&self) -> RegistryResult<&Arc<SubscriptionService>> {
        self.subscriptions
            .as_ref()
            .ok_or(RegistryError::NotConfigured {
                component: "subscription service",
            })
    }

    #[instrument(skip(self, request), fields(generic_id = %request.generic_id))]
    pub async fn handle(&self, request: InvokeRequest) -> RegistryResult<RpcReply> {
        let reply = match request.payload {
            RpcPayload::SynchronizeFitService { items } => {
                RpcReply::code(self.apply_fitable_sync(items).await)
            }
            RpcPayload::SyncSubscriptionFitService { items } => {
                let subscriptions = self.subscriptions()?;
                let mut codes = Vec::with_capacity(items.len());
                for item in items {
                    let entry = item.to_entry();
                    let code = match item.operate_type {
                        OperateType::Add => subscriptions.sync_insert(&[entry]).await,
                        OperateType::Remove => subscriptions.sync_remove(&[entry]).await,
                    };
                    codes.push(code);
                }
                RpcReply::code(combine_codes(&codes))
            }
            RpcPayload::QueryRunningFitables { keys } => {
                let mut instances = Vec::with_capacity(keys.len());
                for key in &keys {
                    let registrations = self.registry.query(key).await;
                    instances.push(FitableInstance::from_registrations(key, &registrations));
                }
                RpcReply::Fitables { instances }
            }
            RpcPayload::SubscribeFitables { keys, listener } => {
                let subscriptions = self.subscriptions()?;
                let mut instances = Vec::with_capacity(keys.len());
                for key in &keys {
                    subscriptions.subscribe(key, &listener).await;
                    let registrations = self.registry.query(key).await;
                    instances.push(FitableInstance::from_registrations(key, &registrations));
                }
                RpcReply::Fitables { instances }
            }
            RpcPayload::UnsubscribeFitables { keys, listener } => {
                let subscriptions = self.subscriptions()?;
                for key in &keys {
                    subscriptions.unsubscribe(key, &listener).await;
                }
                RpcReply::code(RegistryCode::Success)
            }
            RpcPayload::RegisterFitables { registrations } => {
                RpcReply::code(self.registry.save_all(&registrations).await)
            }
            RpcPayload::UnregisterFitables { registrations } => {
                RpcReply::code(self.registry.remove_all(&registrations).await)
            }
            RpcPayload::NotifyFitables { .. } => {
                return Err(RegistryError::UnsupportedRequest {
                    generic_id: request.generic_id,
                })
            }
        };
        Ok(reply)
    }

    /// Apply replicated changes, batching consecutive items of the same kind
    async fn apply_fitable_sync(&self, items: Vec<SyncFitableInstance>) -> RegistryCode {
        let mut codes = Vec::new();
        let mut run: Vec<ServiceRegistration> = Vec::new();
        let mut run_type: Option<OperateType> = None;

        for item in items {
            if run_type.is_some() && run_type != Some(item.operate_type) {
                codes.push(self.apply_run(run_type, std::mem::take(&mut run)).await);
            }
            run_type = Some(item.operate_type);
            run.push(item.registration);
        }
        if !run.is_empty() {
            codes.push(self.apply_run(run_type, run).await);
        }
        debug!(runs = codes.len(), "replicated registrations applied");
        combine_codes(&codes)
    }

    async fn apply_run(&self, operate_type: Option<OperateType>, run: Vec<ServiceRegistration>) -> RegistryCode {
        match operate_type {
            Some(OperateType::Add) => self.registry.sync_save_all(&run).await,
            Some(OperateType::Remove) => self.registry.sync_remove_all(&run).await,
            None => RegistryCode::Success,
        }
    }
}

#[async_trait]
impl GenericInvoker for RegistryRpcHandler {
    async fn invoke(&self, request: InvokeRequest) -> fitreg_core::Result<RpcReply> {
        let generic_id = request.generic_id.clone();
        let target = request.target_label();
        self.handle(request)
            .await
            .map_err(|e| fitreg_core::Error::rpc_failed(generic_id, target, e.code()))
    }
}
