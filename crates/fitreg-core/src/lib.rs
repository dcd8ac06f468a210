//! fitreg Core
//!
//! Core types, errors, and constants for the fitreg service registry.
//!
//! # Overview
//!
//! fitreg tracks which workers implement which versioned remote-callable
//! interfaces ("fitables" of "genericables"), keeps the mapping consistent
//! across a memory tier and a durable tier, and replicates changes to peer
//! registry nodes and to subscribers.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `SYNC_BATCH_COUNT_MAX`)
//! - Wire-stable codes kept apart from internal error types

pub mod codes;
pub mod config;
pub mod constants;
pub mod error;
pub mod fitable;
pub mod io;
pub mod rpc;
pub mod telemetry;
pub mod timer;

pub use codes::{FitCode, RegistryCode};
pub use config::{
    ListenerConfig, NodeConfig, PersistenceConfig, ReconciliationConfig, RegistryConfig,
    ReplicationConfig, SubscriptionConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use fitable::{
    Address, Application, ApplicationInstance, Endpoint, Extensions, FitableInstance, FitableKey,
    Listener, ListenerId, Protocol, RegistrationId, ServiceRegistration, SubscriptionEntry,
    WorkerInstance,
};
pub use io::{ManualClock, TimeProvider, WallClockTime};
pub use rpc::{
    GenericInvoker, InvokeRequest, OperateType, RecordedCall, RecordingInvoker, RpcPayload,
    RpcReply, SyncFitableInstance, SyncSubscriptionService,
};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use timer::{Timer, TimerId};
