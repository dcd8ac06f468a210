//! Wire-stable result codes
//!
//! TigerStyle: Numeric values are part of the peer protocol and never change.
//!
//! Registry nodes exchange these codes with each other and with workers, so the
//! discriminants are fixed. Adding a code is fine; renumbering one requires a
//! coordinated migration of every node in the deployment.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a registry mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum RegistryCode {
    /// The mutation was applied
    Success = 0,
    /// The mutation failed or a collaborator is missing
    Error = 1,
    /// An identical record is already present; nothing changed
    Exist = 2,
}

impl RegistryCode {
    /// Numeric wire value
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Success or Exist both mean the record is present afterwards
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Exist)
    }

    /// Map onto the generic RPC code family
    pub fn to_fit_code(self) -> FitCode {
        match self {
            Self::Success | Self::Exist => FitCode::OK,
            Self::Error => FitCode::ERR_FAIL,
        }
    }
}

impl From<RegistryCode> for i32 {
    fn from(code: RegistryCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for RegistryCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(RegistryCode::Success),
            1 => Ok(RegistryCode::Error),
            2 => Ok(RegistryCode::Exist),
            other => Err(format!("unknown registry code {}", other)),
        }
    }
}

impl fmt::Display for RegistryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "REGISTRY_SUCCESS"),
            Self::Error => write!(f, "REGISTRY_ERROR"),
            Self::Exist => write!(f, "REGISTRY_EXIST"),
        }
    }
}

/// Result code of a generic RPC invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitCode(pub i32);

impl FitCode {
    pub const OK: FitCode = FitCode(0);
    pub const ERR_FAIL: FitCode = FitCode(0x7F00_0001);
    pub const ERR_PARAM: FitCode = FitCode(0x7F00_0002);
    pub const ERR_NOT_FOUND: FitCode = FitCode(0x7F00_0003);
    pub const ERR_TIMEOUT: FitCode = FitCode(0x7F00_0004);
    pub const ERR_NETWORK: FitCode = FitCode(0x7F00_0005);
    pub const ERR_SERIALIZE: FitCode = FitCode(0x7F00_0006);
    pub const ERR_UNAVAILABLE: FitCode = FitCode(0x7F00_0007);

    /// Check whether the call succeeded
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Codes a caller may reasonably retry later
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ERR_TIMEOUT | Self::ERR_NETWORK | Self::ERR_UNAVAILABLE)
    }
}

impl fmt::Display for FitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => write!(f, "FIT_OK"),
            Self::ERR_FAIL => write!(f, "FIT_ERR_FAIL"),
            Self::ERR_PARAM => write!(f, "FIT_ERR_PARAM"),
            Self::ERR_NOT_FOUND => write!(f, "FIT_ERR_NOT_FOUND"),
            Self::ERR_TIMEOUT => write!(f, "FIT_ERR_TIMEOUT"),
            Self::ERR_NETWORK => write!(f, "FIT_ERR_NETWORK"),
            Self::ERR_SERIALIZE => write!(f, "FIT_ERR_SERIALIZE"),
            Self::ERR_UNAVAILABLE => write!(f, "FIT_ERR_UNAVAILABLE"),
            FitCode(other) => write!(f, "FIT_ERR({:#x})", other),
        }
    }
}
