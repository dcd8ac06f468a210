//! Registry client port
//!
//! TigerStyle: Every call bounded by a timeout, every reply shape checked.

use crate::error::{ListenerError, ListenerResult};
use async_trait::async_trait;
use fitreg_core::{
    Address, FitableInstance, FitableKey, GenericInvoker, InvokeRequest, Listener, RegistryCode,
    RpcPayload, RpcReply,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Calls the listener makes on the registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Subscribe `listener` to `keys`; returns their current endpoints
    async fn subscribe(
        &self,
        keys: &[FitableKey],
        listener: &Listener,
    ) -> ListenerResult<Vec<FitableInstance>>;

    async fn unsubscribe(&self, keys: &[FitableKey], listener: &Listener) -> ListenerResult<()>;

    /// Current endpoints of `keys` without subscribing
    async fn query(&self, keys: &[FitableKey]) -> ListenerResult<Vec<FitableInstance>>;
}

/// [`RegistryClient`] over the generic invoker
pub struct RpcRegistryClient {
    invoker: Arc<dyn GenericInvoker>,
    /// Fixed registry node; the RPC layer picks one when absent
    registry: Option<Address>,
    timeout_ms: u64,
}

impl RpcRegistryClient {
    pub fn new(invoker: Arc<dyn GenericInvoker>, timeout_ms: u64) -> Self {
        Self {
            invoker,
            registry: None,
            timeout_ms,
        }
    }

    /// Pin every call to one registry node
    pub fn with_registry(mut self, registry: Address) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn call(&self, payload: RpcPayload) -> ListenerResult<RpcReply> {
        let mut request = InvokeRequest::new(payload);
        if let Some(registry) = &self.registry {
            request = request.with_target(registry.clone());
        }
        let generic_id = request.generic_id.clone();

        match tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.invoker.invoke(request),
        )
        .await
        {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(ListenerError::Timeout {
                generic_id,
                timeout_ms: self.timeout_ms,
            }),
        }
    }

    fn expect_fitables(generic_id: &str, reply: RpcReply) -> ListenerResult<Vec<FitableInstance>> {
        match reply {
            RpcReply::Fitables { instances } => Ok(instances),
            RpcReply::Code { code } if !code.is_ok() => Err(ListenerError::Rejected {
                generic_id: generic_id.to_string(),
                code,
            }),
            RpcReply::Code { .. } => Err(ListenerError::UnexpectedReply {
                generic_id: generic_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RegistryClient for RpcRegistryClient {
    #[instrument(skip(self, keys, listener), fields(count = keys.len()))]
    async fn subscribe(
        &self,
        keys: &[FitableKey],
        listener: &Listener,
    ) -> ListenerResult<Vec<FitableInstance>> {
        let payload = RpcPayload::SubscribeFitables {
            keys: keys.to_vec(),
            listener: listener.clone(),
        };
        let generic_id = payload.generic_id();
        let instances = Self::expect_fitables(generic_id, self.call(payload).await?)?;
        debug!(instances = instances.len(), "subscribed");
        Ok(instances)
    }

    #[instrument(skip(self, keys, listener), fields(count = keys.len()))]
    async fn unsubscribe(&self, keys: &[FitableKey], listener: &Listener) -> ListenerResult<()> {
        let payload = RpcPayload::UnsubscribeFitables {
            keys: keys.to_vec(),
            listener: listener.clone(),
        };
        let generic_id = payload.generic_id();
        match self.call(payload).await? {
            RpcReply::Code { code } if !code.is_ok() => Err(ListenerError::Rejected {
                generic_id: generic_id.to_string(),
                code,
            }),
            RpcReply::Code { .. } => Ok(()),
            RpcReply::Fitables { .. } => Err(ListenerError::UnexpectedReply {
                generic_id: generic_id.to_string(),
            }),
        }
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn query(&self, keys: &[FitableKey]) -> ListenerResult<Vec<FitableInstance>> {
        let payload = RpcPayload::QueryRunningFitables {
            keys: keys.to_vec(),
        };
        let generic_id = payload.generic_id();
        Self::expect_fitables(generic_id, self.call(payload).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitreg_core::rpc::GENERIC_ID_SUBSCRIBE_FITABLES;
    use fitreg_core::{Application, RecordingInvoker, ServiceRegistration};

    fn key() -> FitableKey {
        FitableKey::new("g1", "v1", "f1")
    }

    fn listener() -> Listener {
        Listener::new("notifyFitables", Address::new("caller", "10.0.0.9", 9000))
    }

    #[tokio::test]
    async fn test_subscribe_returns_instances() {
        let invoker = Arc::new(RecordingInvoker::new());
        invoker
            .set_responder(|request: &InvokeRequest| match &request.payload {
                RpcPayload::SubscribeFitables { keys, .. } => {
                    let registration = ServiceRegistration::new(
                        keys[0].clone(),
                        Application::new("appA", "vA"),
                        vec![Address::new("w1", "10.0.0.1", 8080)],
                        60,
                    );
                    Ok(RpcReply::Fitables {
                        instances: vec![FitableInstance::from_registrations(&keys[0], &[registration])],
                    })
                }
                _ => Ok(RpcReply::code(RegistryCode::Success)),
            })
            .await;
        let client = RpcRegistryClient::new(invoker.clone(), 1000)
            .with_registry(Address::new("reg-a", "127.0.0.1", 8866));

        let instances = client.subscribe(&[key()], &listener()).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint_count(), 1);

        let calls = invoker.calls_for(GENERIC_ID_SUBSCRIBE_FITABLES).await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target_id(), Some("reg-a"));

        client.unsubscribe(&[key()], &listener()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_shape_and_codes_checked() {
        let invoker = Arc::new(RecordingInvoker::new());
        let client = RpcRegistryClient::new(invoker.clone(), 1000);

        // default reply is a bare success code
        let err = client.query(&[key()]).await.unwrap_err();
        assert!(matches!(err, ListenerError::UnexpectedReply { .. }));

        invoker
            .set_responder(|_| Ok(RpcReply::code(RegistryCode::Error)))
            .await;
        let err = client.unsubscribe(&[key()], &listener()).await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::Rejected {
                code: RegistryCode::Error,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_registry_times_out() {
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.hold();
        let client = RpcRegistryClient::new(invoker.clone(), 20);

        let err = client.query(&[key()]).await.unwrap_err();
        assert!(matches!(err, ListenerError::Timeout { timeout_ms: 20, .. }));
        assert!(err.is_retriable());
        invoker.release();
    }
}
