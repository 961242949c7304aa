//! DPoP validation options

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{errors::DpopError, Result};

/// Default maximum accepted length of a proof token, in bytes
pub const DEFAULT_PROOF_TOKEN_MAX_LENGTH: usize = 4000;

/// Default validity window of a proof (or server nonce) after its creation time
pub const DEFAULT_PROOF_TOKEN_VALIDITY: Duration = Duration::from_secs(1);

/// Default tolerated clock difference (5 minutes)
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound for the validity window and either clock skew (one year)
pub const MAX_TIME_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Signing algorithms accepted when no explicit list is configured
pub const DEFAULT_SIGNING_ALGORITHMS: &[&str] = &[
    "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "EdDSA",
];

/// How the freshness of a proof is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExpirationMode {
    /// Trust the client-supplied `iat` claim, bounded by the client clock skew
    #[default]
    IssuedAt,
    /// Require a server-issued nonce, bounded by the server clock skew
    Nonce,
    /// Require both checks to pass
    Both,
}

impl ExpirationMode {
    /// Whether the `iat` check runs in this mode
    pub fn checks_issued_at(self) -> bool {
        !matches!(self, Self::Nonce)
    }

    /// Whether the server nonce check runs in this mode
    pub fn checks_nonce(self) -> bool {
        !matches!(self, Self::IssuedAt)
    }
}

impl fmt::Display for ExpirationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IssuedAt => write!(f, "IssuedAt"),
            Self::Nonce => write!(f, "Nonce"),
            Self::Both => write!(f, "Both"),
        }
    }
}

/// Options governing DPoP proof validation for one scheme or tenant
///
/// Time windows have whole-second resolution; [`DpopValidationOptions::validate`]
/// rejects fractional values and anything above [`MAX_TIME_WINDOW`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpopValidationOptions {
    /// Maximum length of the raw proof token
    pub proof_token_max_length: usize,
    /// Accepted JWS algorithms (asymmetric only)
    pub allowed_signing_algorithms: Vec<String>,
    /// How long a proof stays valid after its `iat` (or nonce creation time)
    pub proof_token_validity_duration: Duration,
    /// Tolerance applied to client-supplied `iat` values
    pub client_clock_skew: Duration,
    /// Tolerance applied to server-issued nonces
    pub server_clock_skew: Duration,
    /// Freshness strategy
    pub validation_mode: ExpirationMode,
    /// Reject proofs whose `jti` was already seen
    pub replay_detection_enabled: bool,
}

impl Default for DpopValidationOptions {
    fn default() -> Self {
        Self {
            proof_token_max_length: DEFAULT_PROOF_TOKEN_MAX_LENGTH,
            allowed_signing_algorithms: DEFAULT_SIGNING_ALGORITHMS
                .iter()
                .map(|alg| (*alg).to_string())
                .collect(),
            proof_token_validity_duration: DEFAULT_PROOF_TOKEN_VALIDITY,
            client_clock_skew: DEFAULT_CLOCK_SKEW,
            server_clock_skew: DEFAULT_CLOCK_SKEW,
            validation_mode: ExpirationMode::default(),
            replay_detection_enabled: true,
        }
    }
}

impl DpopValidationOptions {
    /// Set the freshness strategy
    pub fn with_validation_mode(mut self, mode: ExpirationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Set the proof validity window
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.proof_token_validity_duration = validity;
        self
    }

    /// Set the client clock skew
    pub fn with_client_clock_skew(mut self, skew: Duration) -> Self {
        self.client_clock_skew = skew;
        self
    }

    /// Set the server clock skew
    pub fn with_server_clock_skew(mut self, skew: Duration) -> Self {
        self.server_clock_skew = skew;
        self
    }

    /// Enable or disable replay detection
    pub fn with_replay_detection(mut self, enabled: bool) -> Self {
        self.replay_detection_enabled = enabled;
        self
    }

    /// Set the maximum proof token length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.proof_token_max_length = max_length;
        self
    }

    /// Replace the accepted signing algorithms
    pub fn with_allowed_signing_algorithms<I, S>(mut self, algorithms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_signing_algorithms = algorithms.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed allow-list; unknown and symmetric entries are dropped
    pub fn allowed_algorithms(&self) -> Vec<Algorithm> {
        self.allowed_signing_algorithms
            .iter()
            .filter_map(|name| Algorithm::from_str(name).ok())
            .filter(|alg| !is_symmetric(*alg))
            .collect()
    }

    /// Whether `alg` may sign a proof under these options
    pub fn is_algorithm_allowed(&self, alg: Algorithm) -> bool {
        self.allowed_algorithms().contains(&alg)
    }

    /// The clock skew governing the shared freshness window for the current mode
    ///
    /// `Both` takes the larger of the two skews.
    pub fn effective_clock_skew(&self) -> Duration {
        match self.validation_mode {
            ExpirationMode::IssuedAt => self.client_clock_skew,
            ExpirationMode::Nonce => self.server_clock_skew,
            ExpirationMode::Both => self.client_clock_skew.max(self.server_clock_skew),
        }
    }

    /// How long a seen `jti` must be remembered: `validity + 2 * skew`
    pub fn replay_cache_ttl(&self) -> Duration {
        self.proof_token_validity_duration
            .saturating_add(self.effective_clock_skew().saturating_mul(2))
    }

    /// Check the options for values the validator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.proof_token_max_length == 0 {
            return Err(DpopError::ConfigurationError {
                reason: "proof_token_max_length must be greater than zero".to_string(),
            });
        }

        if self.proof_token_validity_duration.is_zero() {
            return Err(DpopError::ConfigurationError {
                reason: "proof_token_validity_duration must be greater than zero".to_string(),
            });
        }

        for (name, window) in [
            ("proof_token_validity_duration", self.proof_token_validity_duration),
            ("client_clock_skew", self.client_clock_skew),
            ("server_clock_skew", self.server_clock_skew),
        ] {
            // freshness arithmetic works in whole Unix seconds
            if window.subsec_nanos() != 0 {
                return Err(DpopError::ConfigurationError {
                    reason: format!("{name} must be a whole number of seconds"),
                });
            }
            if window > MAX_TIME_WINDOW {
                return Err(DpopError::ConfigurationError {
                    reason: format!(
                        "{name} must not exceed {} seconds",
                        MAX_TIME_WINDOW.as_secs()
                    ),
                });
            }
        }

        if self.allowed_signing_algorithms.is_empty() {
            return Err(DpopError::ConfigurationError {
                reason: "allowed_signing_algorithms must not be empty".to_string(),
            });
        }

        for name in &self.allowed_signing_algorithms {
            let alg = Algorithm::from_str(name).map_err(|_| DpopError::ConfigurationError {
                reason: format!("Unknown signing algorithm: {name}"),
            })?;
            if is_symmetric(alg) {
                return Err(DpopError::ConfigurationError {
                    reason: format!("Symmetric algorithm {name} cannot sign a DPoP proof"),
                });
            }
        }

        Ok(())
    }
}

fn is_symmetric(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_options_are_valid() {
        let options = DpopValidationOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.validation_mode, ExpirationMode::IssuedAt);
        assert!(options.replay_detection_enabled);
        assert_eq!(options.allowed_algorithms().len(), 9);
    }

    #[test]
    fn test_symmetric_algorithms_rejected() {
        let options =
            DpopValidationOptions::default().with_allowed_signing_algorithms(["ES256", "HS256"]);
        assert!(matches!(
            options.validate(),
            Err(DpopError::ConfigurationError { .. })
        ));
        assert_eq!(options.allowed_algorithms(), vec![Algorithm::ES256]);

        let unknown = DpopValidationOptions::default().with_allowed_signing_algorithms(["XX999"]);
        assert!(unknown.validate().is_err());

        let empty = DpopValidationOptions::default()
            .with_allowed_signing_algorithms(Vec::<String>::new());
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_effective_skew_and_replay_ttl() {
        let options = DpopValidationOptions::default()
            .with_validity(Duration::from_secs(10))
            .with_client_clock_skew(Duration::from_secs(30))
            .with_server_clock_skew(Duration::from_secs(60));

        assert_eq!(options.effective_clock_skew(), Duration::from_secs(30));
        assert_eq!(options.replay_cache_ttl(), Duration::from_secs(70));

        let nonce = options.clone().with_validation_mode(ExpirationMode::Nonce);
        assert_eq!(nonce.replay_cache_ttl(), Duration::from_secs(130));

        let both = options.with_validation_mode(ExpirationMode::Both);
        assert_eq!(both.effective_clock_skew(), Duration::from_secs(60));
        assert_eq!(both.replay_cache_ttl(), Duration::from_secs(130));
    }

    #[test]
    fn test_time_windows_must_be_whole_bounded_seconds() {
        let fractional = DpopValidationOptions::default().with_validity(Duration::from_millis(1500));
        assert!(matches!(
            fractional.validate(),
            Err(DpopError::ConfigurationError { .. })
        ));

        let huge = Duration::from_secs(u64::MAX / 2 + 1);
        let client = DpopValidationOptions::default().with_client_clock_skew(huge);
        assert!(client.validate().is_err());
        let server = DpopValidationOptions::default().with_server_clock_skew(huge);
        assert!(server.validate().is_err());
        let validity = DpopValidationOptions::default().with_validity(Duration::MAX);
        assert!(validity.validate().is_err());

        let edge = DpopValidationOptions::default()
            .with_validity(MAX_TIME_WINDOW)
            .with_client_clock_skew(MAX_TIME_WINDOW);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_replay_ttl_saturates() {
        let options = DpopValidationOptions::default()
            .with_validity(Duration::MAX)
            .with_client_clock_skew(Duration::from_secs(u64::MAX / 2 + 1));
        assert_eq!(options.replay_cache_ttl(), Duration::MAX);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let json = r#"{
            "validation_mode": "Both",
            "replay_detection_enabled": false,
            "client_clock_skew": { "secs": 10, "nanos": 0 }
        }"#;
        let options: DpopValidationOptions = serde_json::from_str(json).unwrap();

        assert_eq!(options.validation_mode, ExpirationMode::Both);
        assert!(!options.replay_detection_enabled);
        assert_eq!(options.client_clock_skew, Duration::from_secs(10));
        assert_eq!(options.server_clock_skew, DEFAULT_CLOCK_SKEW);
        assert_eq!(options.proof_token_max_length, DEFAULT_PROOF_TOKEN_MAX_LENGTH);
    }

    #[test]
    fn test_mode_flags() {
        assert!(ExpirationMode::IssuedAt.checks_issued_at());
        assert!(!ExpirationMode::IssuedAt.checks_nonce());
        assert!(!ExpirationMode::Nonce.checks_issued_at());
        assert!(ExpirationMode::Both.checks_issued_at());
        assert!(ExpirationMode::Both.checks_nonce());
    }
}
