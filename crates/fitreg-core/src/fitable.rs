//! Fitable, address and registration types
//!
//! TigerStyle: Value types with explicit identity and validation.

use crate::constants::{
    FITABLE_ID_LENGTH_BYTES_MAX, REGISTRATION_ADDRESSES_COUNT_MAX,
    REGISTRATION_TIMEOUT_SECONDS_MAX, WORKER_ID_LENGTH_BYTES_MAX,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form string extensions carried on addresses and registrations
pub type Extensions = BTreeMap<String, String>;

// =============================================================================
// FitableKey
// =============================================================================

/// Identifies one callable contract version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FitableKey {
    pub generic_id: String,
    pub generic_version: String,
    pub fitable_id: String,
}

impl FitableKey {
    pub fn new(
        generic_id: impl Into<String>,
        generic_version: impl Into<String>,
        fitable_id: impl Into<String>,
    ) -> Self {
        Self {
            generic_id: generic_id.into(),
            generic_version: generic_version.into(),
            fitable_id: fitable_id.into(),
        }
    }

    /// Validate identifier presence and length
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("generic_id", &self.generic_id),
            ("fitable_id", &self.fitable_id),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidFitableKey {
                    key: self.to_string(),
                    reason: format!("{} cannot be empty", name),
                });
            }
            if value.len() > FITABLE_ID_LENGTH_BYTES_MAX {
                return Err(Error::InvalidFitableKey {
                    key: self.to_string(),
                    reason: format!(
                        "{} length {} exceeds limit {}",
                        name,
                        value.len(),
                        FITABLE_ID_LENGTH_BYTES_MAX
                    ),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for FitableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.generic_id, self.generic_version, self.fitable_id
        )
    }
}

// =============================================================================
// Address
// =============================================================================

/// Transport protocol an address listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    RSocket,
    Socket,
    #[default]
    Http,
    Grpc,
    Uc,
}

/// One network endpoint of one worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Worker ID; several addresses may share it
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub extensions: Extensions,
}

impl Address {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            protocol: Protocol::default(),
            environment: String::new(),
            formats: Vec::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_formats(mut self, formats: Vec<String>) -> Self {
        self.formats = formats;
        self
    }

    /// Dedup identity: one worker listening on one port
    pub fn same_endpoint(&self, other: &Address) -> bool {
        self.id == other.id && self.port == other.port
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidAddress {
                id: self.id.clone(),
                reason: "worker ID cannot be empty".into(),
            });
        }
        if self.id.len() > WORKER_ID_LENGTH_BYTES_MAX {
            return Err(Error::InvalidAddress {
                id: self.id.clone(),
                reason: format!(
                    "worker ID length {} exceeds limit {}",
                    self.id.len(),
                    WORKER_ID_LENGTH_BYTES_MAX
                ),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

// =============================================================================
// Application
// =============================================================================

/// The deployable unit a worker belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub name_version: String,
}

impl Application {
    pub fn new(name: impl Into<String>, name_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_version: name_version.into(),
        }
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.name_version)
    }
}

// =============================================================================
// ServiceRegistration
// =============================================================================

/// Identity of a registration: one fitable served by one worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId {
    pub fitable: FitableKey,
    pub worker_id: String,
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.fitable, self.worker_id)
    }
}

/// A worker's announcement that it implements a fitable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub fitable: FitableKey,
    pub application: Application,
    pub addresses: Vec<Address>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extensions: Extensions,
    /// Reconciliation generation that last confirmed this record
    #[serde(default)]
    pub sync_count: u64,
}

impl ServiceRegistration {
    pub fn new(
        fitable: FitableKey,
        application: Application,
        addresses: Vec<Address>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            fitable,
            application,
            addresses,
            timeout_seconds,
            aliases: Vec::new(),
            tags: Vec::new(),
            extensions: Extensions::new(),
            sync_count: 0,
        }
    }

    /// Worker ID of the primary (first) address
    pub fn worker_id(&self) -> Option<&str> {
        self.addresses.first().map(|a| a.id.as_str())
    }

    /// Primary address, used for shard selection and dedup
    pub fn primary_address(&self) -> Option<&Address> {
        self.addresses.first()
    }

    pub fn id(&self) -> Option<RegistrationId> {
        self.worker_id().map(|worker_id| RegistrationId {
            fitable: self.fitable.clone(),
            worker_id: worker_id.to_string(),
        })
    }

    /// A renewal carrying the same TTL is treated as identical
    pub fn is_same(&self, other: &ServiceRegistration) -> bool {
        self.timeout_seconds == other.timeout_seconds
    }

    pub fn validate(&self) -> Result<()> {
        self.fitable.validate()?;

        if self.addresses.is_empty() {
            return Err(Error::invalid_registration(
                self.fitable.to_string(),
                "address list is empty",
            ));
        }
        if self.addresses.len() > REGISTRATION_ADDRESSES_COUNT_MAX {
            return Err(Error::invalid_registration(
                self.fitable.to_string(),
                format!(
                    "{} addresses exceed limit {}",
                    self.addresses.len(),
                    REGISTRATION_ADDRESSES_COUNT_MAX
                ),
            ));
        }
        for address in &self.addresses {
            address.validate()?;
        }
        if let Some(stray) = self.addresses.iter().find(|a| a.id != self.addresses[0].id) {
            return Err(Error::invalid_registration(
                self.fitable.to_string(),
                format!(
                    "address of worker {} mixed into registration of worker {}",
                    stray.id, self.addresses[0].id
                ),
            ));
        }
        if self.timeout_seconds > REGISTRATION_TIMEOUT_SECONDS_MAX {
            return Err(Error::invalid_registration(
                self.fitable.to_string(),
                format!(
                    "timeout {}s exceeds limit {}s",
                    self.timeout_seconds, REGISTRATION_TIMEOUT_SECONDS_MAX
                ),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Identity of a listener: callback fitable at one worker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId {
    pub address_id: String,
    pub port: u16,
    pub fitable_id: String,
}

/// A subscriber interested in changes to a fitable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    /// Callback fitable invoked on change
    pub fitable_id: String,
    pub address: Address,
    #[serde(default)]
    pub sync_count: u64,
}

impl Listener {
    pub fn new(fitable_id: impl Into<String>, address: Address) -> Self {
        Self {
            fitable_id: fitable_id.into(),
            address,
            sync_count: 0,
        }
    }

    pub fn id(&self) -> ListenerId {
        ListenerId {
            address_id: self.address.id.clone(),
            port: self.address.port,
            fitable_id: self.fitable_id.clone(),
        }
    }

    /// Identity comparison, ignoring the generation marker
    pub fn same_listener(&self, other: &Listener) -> bool {
        self.address.id == other.address.id
            && self.address.port == other.address.port
            && self.fitable_id == other.fitable_id
    }
}

/// One row of the subscription index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub fitable_key: FitableKey,
    pub listener: Listener,
}

impl SubscriptionEntry {
    pub fn new(fitable_key: FitableKey, listener: Listener) -> Self {
        Self {
            fitable_key,
            listener,
        }
    }
}

// =============================================================================
// Discovery projections
// =============================================================================

/// A reachable endpoint of a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// A worker and its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: String,
    pub environment: String,
    pub endpoints: Vec<Endpoint>,
    pub formats: Vec<String>,
}

/// An application and the workers serving a fitable for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInstance {
    pub application: Application,
    pub workers: Vec<WorkerInstance>,
    pub extensions: Extensions,
}

/// Everything a caller needs to reach one fitable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitableInstance {
    pub fitable: FitableKey,
    pub aliases: Vec<String>,
    pub tags: Vec<String>,
    pub application_instances: Vec<ApplicationInstance>,
}

impl FitableInstance {
    /// Build the projection for one key from its registrations
    ///
    /// Registrations for other keys are ignored. Applications and workers are
    /// ordered by first appearance.
    pub fn from_registrations(key: &FitableKey, registrations: &[ServiceRegistration]) -> Self {
        let mut instance = FitableInstance {
            fitable: key.clone(),
            aliases: Vec::new(),
            tags: Vec::new(),
            application_instances: Vec::new(),
        };

        for registration in registrations.iter().filter(|r| &r.fitable == key) {
            for alias in &registration.aliases {
                if !instance.aliases.contains(alias) {
                    instance.aliases.push(alias.clone());
                }
            }
            for tag in &registration.tags {
                if !instance.tags.contains(tag) {
                    instance.tags.push(tag.clone());
                }
            }

            let position = instance
                .application_instances
                .iter()
                .position(|a| a.application == registration.application);
            let app = match position {
                Some(idx) => &mut instance.application_instances[idx],
                None => {
                    instance.application_instances.push(ApplicationInstance {
                        application: registration.application.clone(),
                        workers: Vec::new(),
                        extensions: registration.extensions.clone(),
                    });
                    let last = instance.application_instances.len() - 1;
                    &mut instance.application_instances[last]
                }
            };

            for address in &registration.addresses {
                let endpoint = Endpoint {
                    host: address.ip.clone(),
                    port: address.port,
                    protocol: address.protocol,
                };
                match app.workers.iter_mut().find(|w| w.id == address.id) {
                    Some(worker) => {
                        if !worker.endpoints.contains(&endpoint) {
                            worker.endpoints.push(endpoint);
                        }
                    }
                    None => app.workers.push(WorkerInstance {
                        id: address.id.clone(),
                        environment: address.environment.clone(),
                        endpoints: vec![endpoint],
                        formats: address.formats.clone(),
                    }),
                }
            }
        }

        instance
    }

    /// Total endpoints across all applications
    pub fn endpoint_count(&self) -> usize {
        self.application_instances
            .iter()
            .flat_map(|a| a.workers.iter())
            .map(|w| w.endpoints.len())
            .sum()
    }
}
