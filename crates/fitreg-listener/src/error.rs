//! Listener error types
//!
//! TigerStyle: Explicit error variants with context.

use fitreg_core::{FitCode, RegistryCode};
use thiserror::Error;

/// Client-side listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Registry call did not answer within the configured window
    #[error("{generic_id} timed out after {timeout_ms}ms")]
    Timeout { generic_id: String, timeout_ms: u64 },

    /// Registry answered with a reply shape this call does not expect
    #[error("unexpected reply to {generic_id}")]
    UnexpectedReply { generic_id: String },

    /// Registry answered with a failure code
    #[error("registry rejected {generic_id}: {code}")]
    Rejected {
        generic_id: String,
        code: RegistryCode,
    },

    /// Error from core, including transport failures
    #[error(transparent)]
    Core(#[from] fitreg_core::Error),
}

impl ListenerError {
    /// Map onto the wire-stable code family
    pub fn code(&self) -> FitCode {
        match self {
            Self::Timeout { .. } => FitCode::ERR_TIMEOUT,
            Self::UnexpectedReply { .. } => FitCode::ERR_SERIALIZE,
            Self::Rejected { .. } => FitCode::ERR_FAIL,
            Self::Core(e) => e.code(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Core(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Result type for listener operations
pub type ListenerResult<T> = std::result::Result<T, ListenerError>;
