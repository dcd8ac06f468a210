//! Configuration for fitreg
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::fitable::{Address, Application};
use serde::{Deserialize, Serialize};

/// Main configuration for a registry node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub node: NodeConfig,

    /// Durable write-behind
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Peer replication
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Memory/durable reconciliation and TTL scanning
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// Client-side listener cache
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl RegistryConfig {
    /// Parse from JSON and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.persistence.validate()?;
        self.replication.validate()?;
        self.reconciliation.validate()?;
        self.subscription.validate()?;
        self.listener.validate()?;
        Ok(())
    }
}

// =============================================================================
// Node
// =============================================================================

/// Identity of the local registry node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Worker ID of this registry node
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub environment: String,

    #[serde(default = "default_application_name")]
    pub application_name: String,

    #[serde(default = "default_application_version")]
    pub application_version: String,
}

fn default_worker_id() -> String {
    "fitreg-0".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8866
}

fn default_application_name() -> String {
    "fit-registry".to_string()
}

fn default_application_version() -> String {
    "1.0.0".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            host: default_host(),
            port: default_port(),
            environment: String::new(),
            application_name: default_application_name(),
            application_version: default_application_version(),
        }
    }
}

impl NodeConfig {
    /// Address this node registers and is reached at
    pub fn local_address(&self) -> Address {
        Address::new(&self.worker_id, &self.host, self.port).with_environment(&self.environment)
    }

    pub fn application(&self) -> Application {
        Application::new(&self.application_name, &self.application_version)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "node.worker_id".into(),
                reason: "cannot be empty".into(),
            });
        }
        if self.worker_id.len() > WORKER_ID_LENGTH_BYTES_MAX {
            return Err(Error::InvalidConfiguration {
                field: "node.worker_id".into(),
                reason: format!(
                    "length {} exceeds limit {}",
                    self.worker_id.len(),
                    WORKER_ID_LENGTH_BYTES_MAX
                ),
            });
        }
        if self.port == 0 {
            return Err(Error::InvalidConfiguration {
                field: "node.port".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Durable write-behind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Shard queues in the service write-behind decorator
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    #[serde(default = "default_write_retry_count")]
    pub write_retry_count_max: u32,

    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
}

fn default_shard_count() -> usize {
    DURABLE_WRITE_SHARD_COUNT_DEFAULT
}

fn default_write_retry_count() -> u32 {
    DURABLE_WRITE_RETRY_COUNT_MAX
}

fn default_write_retry_backoff_ms() -> u64 {
    DURABLE_WRITE_RETRY_BACKOFF_MS
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            write_retry_count_max: default_write_retry_count(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
        }
    }
}

impl PersistenceConfig {
    fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || self.shard_count > DURABLE_WRITE_SHARD_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "persistence.shard_count".into(),
                reason: format!("must be in 1..={}", DURABLE_WRITE_SHARD_COUNT_MAX),
            });
        }
        if self.write_retry_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "persistence.write_retry_count_max".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Replication
// =============================================================================

/// Peer replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Buffered items that trigger an immediate flush
    #[serde(default = "default_batch_count")]
    pub batch_count_max: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Serial executors shared by all peers
    #[serde(default = "default_executor_count")]
    pub executor_count: usize,

    /// Pending batches per executor before new ones are dropped
    #[serde(default = "default_pending_task_count")]
    pub pending_task_count_max: usize,
}

fn default_batch_count() -> usize {
    SYNC_BATCH_COUNT_MAX
}

fn default_flush_interval_ms() -> u64 {
    SYNC_FLUSH_INTERVAL_MS
}

fn default_executor_count() -> usize {
    SYNC_EXECUTOR_COUNT_DEFAULT
}

fn default_pending_task_count() -> usize {
    SYNC_PENDING_TASK_COUNT_MAX
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_count_max: default_batch_count(),
            flush_interval_ms: default_flush_interval_ms(),
            executor_count: default_executor_count(),
            pending_task_count_max: default_pending_task_count(),
        }
    }
}

impl ReplicationConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "replication.batch_count_max".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "replication.flush_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        if self.executor_count == 0 {
            return Err(Error::InvalidConfiguration {
                field: "replication.executor_count".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.pending_task_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "replication.pending_task_count_max".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconciliation and TTL scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,

    #[serde(default = "default_reconcile_first_delay_ms")]
    pub first_delay_ms: u64,

    #[serde(default = "default_reconcile_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_ttl_check_interval_ms")]
    pub ttl_check_interval_ms: u64,
}

fn default_reconcile_enabled() -> bool {
    true
}

fn default_reconcile_first_delay_ms() -> u64 {
    RECONCILE_FIRST_DELAY_MS
}

fn default_reconcile_interval_ms() -> u64 {
    RECONCILE_INTERVAL_MS_DEFAULT
}

fn default_ttl_check_interval_ms() -> u64 {
    TTL_CHECK_INTERVAL_MS_DEFAULT
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            first_delay_ms: default_reconcile_first_delay_ms(),
            interval_ms: default_reconcile_interval_ms(),
            ttl_check_interval_ms: default_ttl_check_interval_ms(),
        }
    }
}

impl ReconciliationConfig {
    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "reconciliation.interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        if self.ttl_check_interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "reconciliation.ttl_check_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Subscription persistence and GC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    #[serde(default = "default_subscription_retry_count")]
    pub write_retry_count_max: u32,

    #[serde(default = "default_subscription_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
}

fn default_gc_interval_ms() -> u64 {
    SUBSCRIPTION_GC_INTERVAL_MS_DEFAULT
}

fn default_subscription_retry_count() -> u32 {
    SUBSCRIPTION_WRITE_RETRY_COUNT_MAX
}

fn default_subscription_retry_backoff_ms() -> u64 {
    SUBSCRIPTION_WRITE_RETRY_BACKOFF_MS
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: default_gc_interval_ms(),
            write_retry_count_max: default_subscription_retry_count(),
            write_retry_backoff_ms: default_subscription_retry_backoff_ms(),
        }
    }
}

impl SubscriptionConfig {
    fn validate(&self) -> Result<()> {
        if self.gc_interval_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "subscription.gc_interval_ms".into(),
                reason: "must be positive".into(),
            });
        }
        if self.write_retry_count_max == 0 {
            return Err(Error::InvalidConfiguration {
                field: "subscription.write_retry_count_max".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Client-side listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_isolation_expire_ms")]
    pub isolation_expire_ms: u64,

    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Callback fitable the registry invokes with changed endpoints
    #[serde(default = "default_callback_fitable_id")]
    pub callback_fitable_id: String,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_isolation_expire_ms() -> u64 {
    ISOLATION_EXPIRE_MS_DEFAULT
}

fn default_refresh_interval_ms() -> u64 {
    LISTENER_REFRESH_INTERVAL_MS_DEFAULT
}

fn default_callback_fitable_id() -> String {
    crate::rpc::GENERIC_ID_NOTIFY_FITABLES.to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    RPC_TIMEOUT_MS_DEFAULT
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            isolation_expire_ms: default_isolation_expire_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            callback_fitable_id: default_callback_fitable_id(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl ListenerConfig {
    fn validate(&self) -> Result<()> {
        if self.callback_fitable_id.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "listener.callback_fitable_id".into(),
                reason: "cannot be empty".into(),
            });
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfiguration {
                field: "listener.rpc_timeout_ms".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
