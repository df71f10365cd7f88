//! Error types for DOSDK core

use dosdk_types::errc;
use thiserror::Error;

/// Errors surfaced by the SDK.
///
/// Every variant maps onto a numeric code through [`DoError::code`], which is
/// what the non-throwing APIs return and what the service speaks on the wire.
#[derive(Debug, Error)]
pub enum DoError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Property not supported by the delivery service: {0}")]
    UnknownProperty(String),

    #[error("Property is read-only: {0}")]
    ReadOnlyProperty(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Delivery service unavailable: {0}")]
    NoService(String),

    #[error("Transfer failed: 0x{code:08x} (extended 0x{extended_code:08x})")]
    Transfer { code: i32, extended_code: i32 },

    #[error("Timed out waiting for the download")]
    Timeout,

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Service error 0x{code:08x}: {message}")]
    Service { code: i32, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DoError {
    /// Numeric code of this error
    pub fn code(&self) -> i32 {
        match self {
            DoError::InvalidArgument(_) => errc::E_INVALIDARG,
            DoError::UnknownProperty(_) => errc::DO_E_UNKNOWN_PROPERTY_ID,
            DoError::ReadOnlyProperty(_) => errc::DO_E_READ_ONLY_PROPERTY,
            DoError::InvalidState(_) => errc::DO_E_INVALID_STATE,
            DoError::NoService(_) => errc::DO_E_NO_SERVICE,
            DoError::Transfer { code, .. } => *code,
            DoError::Timeout => errc::E_TIMEOUT,
            DoError::Cancelled => errc::E_ABORTED,
            DoError::Service { code, .. } => *code,
            DoError::Network(e) if e.is_connect() || e.is_timeout() => {
                errc::DO_E_TRANSIENT_NETWORK
            }
            DoError::Network(_) | DoError::Io(_) | DoError::Serialization(_) => {
                errc::E_UNEXPECTED
            }
        }
    }

    /// Rebuild a structured error from a code the service returned
    pub fn from_code(code: i32, context: impl Into<String>) -> Self {
        let context = context.into();
        match code {
            errc::E_INVALIDARG => DoError::InvalidArgument(context),
            errc::DO_E_UNKNOWN_PROPERTY_ID => DoError::UnknownProperty(context),
            errc::DO_E_READ_ONLY_PROPERTY => DoError::ReadOnlyProperty(context),
            errc::DO_E_INVALID_STATE => DoError::InvalidState(context),
            errc::DO_E_NO_SERVICE => DoError::NoService(context),
            errc::E_TIMEOUT => DoError::Timeout,
            errc::E_ABORTED => DoError::Cancelled,
            _ => DoError::Service {
                code,
                message: context,
            },
        }
    }

    /// Check if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DoError::Network(_) | DoError::Timeout | DoError::NoService(_) => true,
            DoError::Transfer { code, .. } => errc::is_transient(*code),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DoError {
    fn from(error: serde_json::Error) -> Self {
        DoError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_survive_from_code() {
        for code in [
            errc::E_INVALIDARG,
            errc::DO_E_UNKNOWN_PROPERTY_ID,
            errc::DO_E_READ_ONLY_PROPERTY,
            errc::DO_E_INVALID_STATE,
            errc::DO_E_NO_SERVICE,
            errc::E_TIMEOUT,
            errc::E_ABORTED,
            errc::DO_E_HTTP_STATUS,
        ] {
            assert_eq!(DoError::from_code(code, "ctx").code(), code);
        }
    }

    #[test]
    fn test_transfer_error_display() {
        let e = DoError::Transfer {
            code: errc::DO_E_HTTP_STATUS,
            extended_code: 404,
        };
        assert_eq!(e.to_string(), "Transfer failed: 0x80d05002 (extended 0x00000194)");
        assert!(!e.is_retryable());
    }
}
