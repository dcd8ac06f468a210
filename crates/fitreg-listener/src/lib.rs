//! fitreg Listener
//!
//! Caller-side view of the registry.
//!
//! # Overview
//!
//! The listener provides:
//! - A lazily subscribed cache from fitable to live endpoints
//! - Soft isolation of endpoints the caller failed to reach
//! - Push updates through the `notifyFitables` callback, with periodic refresh
//! - Observers for subscription churn
//!
//! # TigerStyle
//! - Registry calls bounded by `rpc_timeout_ms`
//! - Cache and isolation state behind one lock, never held across an RPC

pub mod client;
pub mod error;
pub mod listener;

pub use client::{RegistryClient, RpcRegistryClient};
pub use error::{ListenerError, ListenerResult};
pub use listener::{
    FitableInfo, ListenerEvent, ListenerObserver, RecordingObserver, RegistryListener,
};
