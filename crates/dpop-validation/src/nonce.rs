//! Server-issued nonces
//!
//! A server nonce lets the server, rather than the client clock, decide how
//! fresh a proof is. The default scheme seals the issuing time with a
//! [`DataProtector`]; deployments may plug in any other scheme through the
//! [`NonceValidator`] trait.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::context::DpopValidationContext;
use crate::freshness::is_expired;
use crate::protection::DataProtector;
use crate::Result;

/// Outcome of checking a client-supplied nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceValidationResult {
    /// No nonce, or only whitespace
    Missing,
    /// Unreadable, forged or expired
    Invalid,
    /// Issued by this server and still fresh
    Valid,
}

impl NonceValidationResult {
    /// Whether the nonce was accepted
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Creates and checks server nonces
#[async_trait]
pub trait NonceValidator: Send + Sync + Debug {
    /// Issue a new nonce for the client to embed in its next proof
    async fn create_nonce(&self, ctx: &DpopValidationContext) -> Result<String>;

    /// Judge a nonce presented by the client
    ///
    /// Never fails: unreadable input is [`NonceValidationResult::Invalid`].
    async fn validate_nonce(
        &self,
        ctx: &DpopValidationContext,
        nonce: Option<&str>,
    ) -> NonceValidationResult;
}

/// Timestamp nonce sealed with a [`DataProtector`]
#[derive(Debug, Clone)]
pub struct DefaultNonceValidator {
    protector: Arc<dyn DataProtector>,
    clock: Arc<dyn Clock>,
}

impl DefaultNonceValidator {
    /// Create a validator using the system clock
    pub fn new(protector: Arc<dyn DataProtector>) -> Self {
        Self::with_clock(protector, Arc::new(SystemClock))
    }

    /// Create a validator reading time from `clock`
    pub fn with_clock(protector: Arc<dyn DataProtector>, clock: Arc<dyn Clock>) -> Self {
        Self { protector, clock }
    }

    /// Creation time embedded in `nonce`, or `0` when it cannot be read
    pub fn unix_time_from_nonce(&self, nonce: &str) -> i64 {
        self.read_timestamp(nonce).unwrap_or(0)
    }

    fn read_timestamp(&self, nonce: &str) -> Option<i64> {
        let plaintext = match self.protector.unprotect(nonce) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("Nonce could not be unprotected: {e}");
                return None;
            }
        };

        std::str::from_utf8(&plaintext)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
    }
}

#[async_trait]
impl NonceValidator for DefaultNonceValidator {
    async fn create_nonce(&self, _ctx: &DpopValidationContext) -> Result<String> {
        let now = self.clock.now_unix();
        self.protector
            .protect(now.to_string().as_bytes())
            .inspect_err(|e| error!("Failed to issue server nonce: {e}"))
    }

    async fn validate_nonce(
        &self,
        ctx: &DpopValidationContext,
        nonce: Option<&str>,
    ) -> NonceValidationResult {
        let nonce = match nonce.map(str::trim) {
            Some(nonce) if !nonce.is_empty() => nonce,
            _ => return NonceValidationResult::Missing,
        };

        let Some(created_at) = self.read_timestamp(nonce) else {
            return NonceValidationResult::Invalid;
        };

        let options = ctx.options();
        if is_expired(
            self.clock.now_unix(),
            options.proof_token_validity_duration,
            options.server_clock_skew,
            created_at,
        ) {
            return NonceValidationResult::Invalid;
        }

        NonceValidationResult::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DpopValidationOptions;
    use crate::protection::AesGcmDataProtector;
    use std::time::Duration;

    const T: i64 = 1_700_000_000;

    fn setup() -> (DefaultNonceValidator, Arc<ManualClock>, DpopValidationContext) {
        let clock = Arc::new(ManualClock::new(T));
        let protector = Arc::new(AesGcmDataProtector::new(b"nonce-test-secret-0123456789").unwrap());
        let validator = DefaultNonceValidator::with_clock(protector, clock.clone());
        let options = DpopValidationOptions::default()
            .with_validity(Duration::from_secs(10))
            .with_server_clock_skew(Duration::from_secs(5));
        let ctx = DpopValidationContext::new(
            "GET",
            "https://example.com/",
            "proof",
            "token",
            Arc::new(options),
        );
        (validator, clock, ctx)
    }

    #[tokio::test]
    async fn test_nonce_round_trip_and_expiry() {
        let (validator, clock, ctx) = setup();
        let nonce = validator.create_nonce(&ctx).await.unwrap();

        assert_eq!(validator.unix_time_from_nonce(&nonce), T);
        assert_eq!(
            validator.validate_nonce(&ctx, Some(&nonce)).await,
            NonceValidationResult::Valid
        );

        clock.set(T + 15);
        assert_eq!(
            validator.validate_nonce(&ctx, Some(&nonce)).await,
            NonceValidationResult::Valid
        );

        clock.set(T + 16);
        assert_eq!(
            validator.validate_nonce(&ctx, Some(&nonce)).await,
            NonceValidationResult::Invalid
        );
    }

    #[tokio::test]
    async fn test_missing_and_garbage_nonces() {
        let (validator, _clock, ctx) = setup();

        for missing in [None, Some(""), Some("   ")] {
            assert_eq!(
                validator.validate_nonce(&ctx, missing).await,
                NonceValidationResult::Missing
            );
        }

        for garbage in ["garbage", "!!!", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"] {
            assert_eq!(
                validator.validate_nonce(&ctx, Some(garbage)).await,
                NonceValidationResult::Invalid
            );
            assert_eq!(validator.unix_time_from_nonce(garbage), 0);
        }
    }

    #[tokio::test]
    async fn test_nonce_from_the_future_rejected() {
        let (validator, clock, ctx) = setup();
        let nonce = validator.create_nonce(&ctx).await.unwrap();

        clock.set(T - 5);
        assert!(validator.validate_nonce(&ctx, Some(&nonce)).await.is_valid());
        clock.set(T - 6);
        assert!(!validator.validate_nonce(&ctx, Some(&nonce)).await.is_valid());
    }
}
