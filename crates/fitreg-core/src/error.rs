//! Error types for fitreg
//!
//! TigerStyle: Explicit error types with context, using thiserror.

use crate::codes::FitCode;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid fitable key: {key}, reason: {reason}")]
    InvalidFitableKey { key: String, reason: String },

    #[error("Invalid address: {id}, reason: {reason}")]
    InvalidAddress { id: String, reason: String },

    #[error("Invalid registration for {fitable}: {reason}")]
    InvalidRegistration { fitable: String, reason: String },

    // =========================================================================
    // RPC Errors
    // =========================================================================
    #[error("RPC {generic_id} to {target} failed with code {code}")]
    RpcFailed {
        generic_id: String,
        target: String,
        code: FitCode,
    },

    #[error("Unexpected RPC reply for {generic_id}")]
    UnexpectedReply { generic_id: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },
}

impl Error {
    /// Create an invalid registration error
    pub fn invalid_registration(fitable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRegistration {
            fitable: fitable.into(),
            reason: reason.into(),
        }
    }

    /// Create an RPC failed error
    pub fn rpc_failed(generic_id: impl Into<String>, target: impl Into<String>, code: FitCode) -> Self {
        Self::RpcFailed {
            generic_id: generic_id.into(),
            target: target.into(),
            code,
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Map this error onto the wire-stable code family
    pub fn code(&self) -> FitCode {
        match self {
            Self::InvalidFitableKey { .. }
            | Self::InvalidAddress { .. }
            | Self::InvalidRegistration { .. }
            | Self::InvalidConfiguration { .. } => FitCode::ERR_PARAM,
            Self::RpcFailed { code, .. } => *code,
            Self::UnexpectedReply { .. } | Self::SerializationFailed { .. } => FitCode::ERR_SERIALIZE,
            Self::Internal { .. } => FitCode::ERR_FAIL,
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RpcFailed { code, .. } if code.is_transient())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_registration("g1:v1:f1", "no addresses");
        assert!(err.to_string().contains("g1:v1:f1"));
        assert!(err.to_string().contains("no addresses"));
    }

    #[test]
    fn test_error_code_mapping() {
        let err = Error::rpc_failed("notifyFitables", "w1", FitCode::ERR_TIMEOUT);
        assert_eq!(err.code(), FitCode::ERR_TIMEOUT);
        assert!(err.is_retriable());

        let err = Error::internal("boom");
        assert_eq!(err.code(), FitCode::ERR_FAIL);
        assert!(!err.is_retriable());
    }
}
