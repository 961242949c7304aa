//! DPoP infrastructure error types
//!
//! Validation verdicts (bad signature, wrong `ath`, replayed `jti`, ...) are not
//! errors in this crate: they are recorded in
//! [`DpopValidationResult`](crate::DpopValidationResult). The types here cover
//! the faults that prevent a verdict from being reached at all, such as a replay
//! cache backend going away or a request being cancelled mid-validation.

use std::fmt;

use thiserror::Error;

/// Infrastructure errors raised while validating or issuing DPoP artifacts
#[derive(Error, Debug, Clone)]
pub enum DpopError {
    /// The caller cancelled the validation before it completed
    #[error("DPoP validation cancelled")]
    Cancelled,

    /// Replay cache backend failed
    #[error("Replay cache error: {reason}")]
    ReplayCacheError {
        /// Detailed reason for the backend failure
        reason: String,
    },

    /// Protecting or un-protecting a server nonce failed
    #[error("Nonce protection error: {reason}")]
    NonceProtectionError {
        /// Detailed reason for the protection failure
        reason: String,
    },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {reason}")]
    CryptographicError {
        /// Detailed reason for the cryptographic failure
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    ConfigurationError {
        /// Detailed reason for the configuration error
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Detailed reason for the serialization failure
        reason: String,
    },
}

impl DpopError {
    /// Check if this error came from a storage backend and may succeed on a later request
    pub fn is_backend_error(&self) -> bool {
        matches!(self, Self::ReplayCacheError { .. })
    }

    /// Check if this error is a cryptographic failure
    pub fn is_cryptographic_error(&self) -> bool {
        matches!(
            self,
            Self::CryptographicError { .. } | Self::NonceProtectionError { .. }
        )
    }

    /// Get error severity for logging and monitoring
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled => ErrorSeverity::Low,

            // Replay protection is unavailable while the backend is down
            Self::ReplayCacheError { .. } => ErrorSeverity::High,
            Self::NonceProtectionError { .. } => ErrorSeverity::High,
            Self::CryptographicError { .. } => ErrorSeverity::High,

            Self::ConfigurationError { .. } => ErrorSeverity::Medium,
            Self::SerializationError { .. } => ErrorSeverity::Medium,
        }
    }

    /// Get suggested remediation for this error
    pub fn remediation_hint(&self) -> &'static str {
        match self {
            Self::Cancelled => "The request was aborted by the caller; no action required",
            Self::ReplayCacheError { .. } => "Check connectivity and health of the replay cache",
            Self::NonceProtectionError { .. } => {
                "Verify the nonce protection secret is identical on every server instance"
            }
            Self::CryptographicError { .. } => "Verify cryptographic key material and algorithms",
            Self::ConfigurationError { .. } => "Review DPoP validation options",
            _ => "Check logs for detailed error information",
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Low severity - expected operational events
    Low,
    /// Medium severity - misconfigurations
    Medium,
    /// High severity - server-side errors affecting functionality
    High,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

impl From<serde_json::Error> for DpopError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl From<ring::error::Unspecified> for DpopError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::CryptographicError {
            reason: "Ring cryptographic operation failed".to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for DpopError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::CryptographicError {
            reason: format!("JWT error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity_classification() {
        let backend = DpopError::ReplayCacheError {
            reason: "connection refused".to_string(),
        };
        assert_eq!(backend.severity(), ErrorSeverity::High);
        assert!(backend.is_backend_error());
        assert!(!backend.is_cryptographic_error());

        let protection = DpopError::NonceProtectionError {
            reason: "bad key".to_string(),
        };
        assert!(protection.is_cryptographic_error());

        assert_eq!(DpopError::Cancelled.severity(), ErrorSeverity::Low);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
    }

    #[test]
    fn test_remediation_hints() {
        let config_error = DpopError::ConfigurationError {
            reason: "empty algorithm list".to_string(),
        };
        assert_eq!(
            config_error.remediation_hint(),
            "Review DPoP validation options"
        );
        assert_eq!(
            DpopError::Cancelled.to_string(),
            "DPoP validation cancelled"
        );
    }
}
