//! Durable service repository interface
//!
//! TigerStyle: One narrow interface, implemented by the direct backend and by
//! the write-behind decorator that wraps it.

use crate::error::RegistryResult;
use async_trait::async_trait;
use fitreg_core::{Address, FitableKey, ServiceRegistration};

/// CRUD over service registrations in the durable tier
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn start(&self) -> RegistryResult<()>;

    async fn stop(&self) -> RegistryResult<()>;

    async fn save(&self, registration: &ServiceRegistration) -> RegistryResult<()>;

    async fn save_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()>;

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<ServiceRegistration>>;

    /// Remove the registration of `key` served by the worker of `address`
    async fn remove(&self, key: &FitableKey, address: &Address) -> RegistryResult<()>;

    async fn remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()>;

    /// Remove every registration of the worker of `address`; returns the deleted rows
    async fn remove_by_address(&self, address: &Address) -> RegistryResult<Vec<ServiceRegistration>>;

    async fn get_all_services(&self) -> RegistryResult<Vec<ServiceRegistration>>;

    async fn get_services_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<ServiceRegistration>>;
}
