//! Persistent service repository
//!
//! Direct (synchronous-from-the-caller) CRUD of registrations over the worker,
//! address and fitable table ports.
//!
//! TigerStyle: Every store call is awaited and its error propagated.

use crate::error::RegistryResult;
use crate::repository::ServiceRepository;
use crate::store::{AddressTableOperation, FitableRow, FitableTableOperation, WorkerRow, WorkerTableOperation};
use async_trait::async_trait;
use fitreg_core::{Address, FitableKey, ServiceRegistration};
use std::sync::Arc;
use tracing::{debug, info};

/// Service repository backed by the durable table ports
pub struct PersistentServiceRepository {
    workers: Arc<dyn WorkerTableOperation>,
    addresses: Arc<dyn AddressTableOperation>,
    fitables: Arc<dyn FitableTableOperation>,
}

impl PersistentServiceRepository {
    pub fn new(
        workers: Arc<dyn WorkerTableOperation>,
        addresses: Arc<dyn AddressTableOperation>,
        fitables: Arc<dyn FitableTableOperation>,
    ) -> Self {
        Self {
            workers,
            addresses,
            fitables,
        }
    }

    /// Build a repository whose three ports are served by one backend
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: WorkerTableOperation + AddressTableOperation + FitableTableOperation + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    async fn build(&self, rows: Vec<FitableRow>) -> RegistryResult<Vec<ServiceRegistration>> {
        let mut registrations = Vec::with_capacity(rows.len());
        for row in rows {
            let addresses = self.addresses.query(&row.worker_id).await?;
            if addresses.is_empty() {
                debug!(fitable = %row.fitable, worker_id = %row.worker_id, "fitable row without addresses skipped");
                continue;
            }
            // The primary address must carry the registration's worker ID
            let mut addresses = addresses;
            if let Some(pos) = addresses.iter().position(|a| a.id == row.worker_id) {
                addresses.swap(0, pos);
            }
            registrations.push(ServiceRegistration {
                fitable: row.fitable,
                application: row.application,
                addresses,
                timeout_seconds: row.timeout_seconds,
                aliases: row.aliases,
                tags: row.tags,
                extensions: row.extensions,
                sync_count: 0,
            });
        }
        Ok(registrations)
    }

    async fn delete_registration(&self, key: &FitableKey, worker_id: &str) -> RegistryResult<()> {
        self.fitables.delete(key, worker_id).await?;
        if self.fitables.query_by_worker(worker_id).await?.is_empty() {
            self.workers.delete(worker_id).await?;
            self.addresses.delete(worker_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRepository for PersistentServiceRepository {
    async fn start(&self) -> RegistryResult<()> {
        self.workers.init().await?;
        self.addresses.init().await?;
        self.fitables.init().await?;
        info!("persistent service repository started");
        Ok(())
    }

    async fn stop(&self) -> RegistryResult<()> {
        info!("persistent service repository stopped");
        Ok(())
    }

    async fn save(&self, registration: &ServiceRegistration) -> RegistryResult<()> {
        let Some(primary) = registration.primary_address() else {
            return Ok(());
        };
        self.workers
            .save(&WorkerRow {
                worker_id: primary.id.clone(),
                application: registration.application.clone(),
                environment: primary.environment.clone(),
            })
            .await?;
        self.addresses.save(&registration.addresses).await?;
        self.fitables
            .save(&FitableRow {
                fitable: registration.fitable.clone(),
                worker_id: primary.id.clone(),
                application: registration.application.clone(),
                timeout_seconds: registration.timeout_seconds,
                aliases: registration.aliases.clone(),
                tags: registration.tags.clone(),
                extensions: registration.extensions.clone(),
            })
            .await?;
        Ok(())
    }

    async fn save_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
        for registration in registrations {
            self.save(registration).await?;
        }
        Ok(())
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<ServiceRegistration>> {
        let rows = self.fitables.query(key).await?;
        self.build(rows).await
    }

    async fn remove(&self, key: &FitableKey, address: &Address) -> RegistryResult<()> {
        self.delete_registration(key, &address.id).await
    }

    async fn remove_all(&self, registrations: &[ServiceRegistration]) -> RegistryResult<()> {
        for registration in registrations {
            if let Some(worker_id) = registration.worker_id() {
                self.delete_registration(&registration.fitable, worker_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_by_address(&self, address: &Address) -> RegistryResult<Vec<ServiceRegistration>> {
        let rows = self.fitables.query_by_worker(&address.id).await?;
        let removed = self.build(rows.clone()).await?;
        for row in &rows {
            self.fitables.delete(&row.fitable, &row.worker_id).await?;
        }
        self.workers.delete(&address.id).await?;
        self.addresses.delete(&address.id).await?;
        Ok(removed)
    }

    async fn get_all_services(&self) -> RegistryResult<Vec<ServiceRegistration>> {
        let rows = self.fitables.query_all().await?;
        self.build(rows).await
    }

    async fn get_services_by_generic_id(&self, generic_id: &str) -> RegistryResult<Vec<ServiceRegistration>> {
        let rows = self.fitables.query_by_generic_id(generic_id).await?;
        self.build(rows).await
    }
}
