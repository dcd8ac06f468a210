//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.

use fitreg_core::{FitCode, ServiceRegistration};
use thiserror::Error;

/// Registry-specific errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Durable store operation failed
    #[error("storage error in {table}: {reason}")]
    StorageFailed { table: String, reason: String },

    /// Registration rejected before touching any state
    #[error("invalid registration {fitable}: {reason}")]
    InvalidRegistration { fitable: String, reason: String },

    /// Outbound RPC failed
    #[error("rpc {generic_id} to {target} failed: {code}")]
    RpcFailed {
        generic_id: String,
        target: String,
        code: FitCode,
    },

    /// Inbound request this node does not serve
    #[error("unsupported request {generic_id}")]
    UnsupportedRequest { generic_id: String },

    /// A required collaborator is not configured
    #[error("{component} not configured")]
    NotConfigured { component: &'static str },

    /// Component was stopped
    #[error("{component} stopped")]
    Stopped { component: &'static str },

    /// Error from core
    #[error(transparent)]
    Core(#[from] fitreg_core::Error),
}

impl RegistryError {
    /// Create a storage failure
    pub fn storage_failed(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StorageFailed {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid registration error
    pub fn invalid_registration(registration: &ServiceRegistration, reason: impl Into<String>) -> Self {
        Self::InvalidRegistration {
            fitable: registration.fitable.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an RPC failure
    pub fn rpc_failed(generic_id: impl Into<String>, target: impl Into<String>, code: FitCode) -> Self {
        Self::RpcFailed {
            generic_id: generic_id.into(),
            target: target.into(),
            code,
        }
    }

    /// Map onto the wire-stable code family
    pub fn code(&self) -> FitCode {
        match self {
            Self::StorageFailed { .. } => FitCode::ERR_UNAVAILABLE,
            Self::InvalidRegistration { .. } => FitCode::ERR_PARAM,
            Self::RpcFailed { code, .. } => *code,
            Self::UnsupportedRequest { .. } => FitCode::ERR_NOT_FOUND,
            Self::NotConfigured { .. } | Self::Stopped { .. } => FitCode::ERR_FAIL,
            Self::Core(e) => e.code(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::StorageFailed { .. } => true,
            Self::RpcFailed { code, .. } => code.is_transient(),
            Self::Core(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::storage_failed("worker", "connection refused");
        assert!(err.to_string().contains("worker"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_retriable() {
        let storage_err = RegistryError::storage_failed("fitable", "timeout");
        assert!(storage_err.is_retriable());
        assert_eq!(storage_err.code(), FitCode::ERR_UNAVAILABLE);

        let missing = RegistryError::NotConfigured {
            component: "persistence",
        };
        assert!(!missing.is_retriable());

        let core: RegistryError = fitreg_core::Error::rpc_failed("x", "w1", FitCode::ERR_TIMEOUT).into();
        assert!(core.is_retriable());
    }
}
