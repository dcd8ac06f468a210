//! TigerStyle constants for fitreg
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identifier Limits
// =============================================================================

/// Maximum length of a worker (address) ID in bytes
pub const WORKER_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a genericable or fitable ID in bytes
pub const FITABLE_ID_LENGTH_BYTES_MAX: usize = 512;

/// Maximum number of addresses carried by one registration
pub const REGISTRATION_ADDRESSES_COUNT_MAX: usize = 64;

// =============================================================================
// Registration TTL
// =============================================================================

/// Default registration timeout in seconds when a worker does not specify one
pub const REGISTRATION_TIMEOUT_SECONDS_DEFAULT: u64 = 90;

/// Maximum registration timeout in seconds (1 day)
pub const REGISTRATION_TIMEOUT_SECONDS_MAX: u64 = 24 * 60 * 60;

/// Interval between TTL expiry scans in milliseconds
pub const TTL_CHECK_INTERVAL_MS_DEFAULT: u64 = 1000;

// =============================================================================
// Durable Write-Behind
// =============================================================================

/// Number of shard queues in the service write-behind decorator
pub const DURABLE_WRITE_SHARD_COUNT_DEFAULT: usize = 8;

/// Maximum number of shard queues
pub const DURABLE_WRITE_SHARD_COUNT_MAX: usize = 256;

/// Maximum attempts for one durable write before giving up
pub const DURABLE_WRITE_RETRY_COUNT_MAX: u32 = 3;

/// Fixed backoff between durable write attempts in milliseconds
pub const DURABLE_WRITE_RETRY_BACKOFF_MS: u64 = 100;

// =============================================================================
// Replication (Node-Sync)
// =============================================================================

/// Buffered replication items that trigger an immediate flush
pub const SYNC_BATCH_COUNT_MAX: usize = 100;

/// Replication buffer flush interval in milliseconds
pub const SYNC_FLUSH_INTERVAL_MS: u64 = 1000;

/// Number of serial executors used for peer fan-out
pub const SYNC_EXECUTOR_COUNT_DEFAULT: usize = 8;

/// Pending replication batches per executor before new batches are dropped
pub const SYNC_PENDING_TASK_COUNT_MAX: usize = 64;

// =============================================================================
// Reconciliation
// =============================================================================

/// Interval between memory/durable reconciliation passes in milliseconds (5 min)
pub const RECONCILE_INTERVAL_MS_DEFAULT: u64 = 5 * 60 * 1000;

/// Delay before the first reconciliation pass in milliseconds
pub const RECONCILE_FIRST_DELAY_MS: u64 = 1000;

// =============================================================================
// Subscriptions
// =============================================================================

/// Interval between listener garbage-collection cycles in milliseconds
pub const SUBSCRIPTION_GC_INTERVAL_MS_DEFAULT: u64 = 60 * 1000;

/// Maximum attempts for one subscription durable write
pub const SUBSCRIPTION_WRITE_RETRY_COUNT_MAX: u32 = 3;

/// Fixed backoff between subscription write attempts in milliseconds
pub const SUBSCRIPTION_WRITE_RETRY_BACKOFF_MS: u64 = 200;

// =============================================================================
// Client Listener
// =============================================================================

/// How long an isolated endpoint stays excluded in milliseconds
pub const ISOLATION_EXPIRE_MS_DEFAULT: u64 = 30 * 1000;

/// Interval between client-side endpoint refreshes in milliseconds
pub const LISTENER_REFRESH_INTERVAL_MS_DEFAULT: u64 = 60 * 1000;

// =============================================================================
// RPC
// =============================================================================

/// Default timeout for outbound registry RPCs in milliseconds
pub const RPC_TIMEOUT_MS_DEFAULT: u64 = 3 * 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(SYNC_BATCH_COUNT_MAX >= 1);
    assert!(SYNC_PENDING_TASK_COUNT_MAX >= 1);
    assert!(DURABLE_WRITE_SHARD_COUNT_DEFAULT <= DURABLE_WRITE_SHARD_COUNT_MAX);
    assert!(DURABLE_WRITE_RETRY_COUNT_MAX >= 1);
    assert!(SUBSCRIPTION_WRITE_RETRY_COUNT_MAX >= 1);
    assert!(RECONCILE_INTERVAL_MS_DEFAULT > RECONCILE_FIRST_DELAY_MS);
    assert!(REGISTRATION_TIMEOUT_SECONDS_DEFAULT <= REGISTRATION_TIMEOUT_SECONDS_MAX);
};
