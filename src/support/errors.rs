//! Error taxonomy of the operation runtime.
//!
//! Transport and persistence faults are recovered internally; protocol-level
//! errors are surfaced to the originating handler. Only configuration and
//! bring-up failures are fatal and require the host to re-initialize.

use serde_json::Value;
use thiserror::Error;

/// RPC error codes defined by OCPP-J.
///
/// `Other` carries codes a peer might send that are not part of the
/// specification; they are preserved verbatim for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcErrorCode {
    NotImplemented,
    NotSupported,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    SecurityError,
    InternalError,
    Other(String),
}

impl RpcErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
            Self::SecurityError => "SecurityError",
            Self::InternalError => "InternalError",
            Self::Other(code) => code,
        }
    }

    pub fn from_wire(code: &str) -> Self {
        match code {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "FormationViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => Self::OccurenceConstraintViolation,
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            "GenericError" => Self::GenericError,
            "SecurityError" => Self::SecurityError,
            "InternalError" => Self::InternalError,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CallError as seen by a request's error callback.
///
/// Also synthesized locally for timeouts (`GenericError`, empty details).
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub description: String,
    pub details: Value,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    /// Synthetic error delivered when a request's timeout policy expires.
    pub fn timeout() -> Self {
        Self::new(RpcErrorCode::GenericError, "Response timeout")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Rejection of an incoming Call by its handler; becomes an outbound
/// CallError with the chosen code.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: RpcErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: RpcErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn formation_violation(description: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::FormationViolation, description)
    }

    pub fn property_constraint(description: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::PropertyConstraintViolation, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Filesystem-level failure. Persistent requests hitting this are demoted to
/// volatile and delivery continues.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("filesystem write failed: {0}")]
    Write(String),

    #[error("filesystem read failed: {0}")]
    Read(String),

    #[error("filesystem remove failed: {0}")]
    Remove(String),

    #[error("record malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("operation number window exhausted")]
    OpNrWindowFull,
}

/// Bring-up failures; fatal for the host.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid client setup: {0}")]
    Invalid(String),

    #[error("persistence unavailable: {0}")]
    Persistence(#[from] PersistError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in [
            "NotImplemented",
            "FormationViolation",
            "PropertyConstraintViolation",
            "OccurenceConstraintViolation",
            "GenericError",
            "SecurityError",
            "InternalError",
        ] {
            assert_eq!(RpcErrorCode::from_wire(code).as_str(), code);
        }
    }

    #[test]
    fn unknown_code_preserved() {
        let code = RpcErrorCode::from_wire("VendorSpecificFailure");
        assert_eq!(code.as_str(), "VendorSpecificFailure");
        assert!(matches!(code, RpcErrorCode::Other(_)));
    }

    #[test]
    fn timeout_is_generic_error() {
        let err = RpcError::timeout();
        assert_eq!(err.code, RpcErrorCode::GenericError);
    }
}
