//! Tamper-evident protection of small server-side payloads
//!
//! Server nonces embed the issuing time in an opaque string. The string must
//! be impossible to forge or alter without the server secret, so it is sealed
//! with AES-256-GCM: any bit flip in the nonce, ciphertext or tag makes
//! [`DataProtector::unprotect`] fail.

use std::fmt::Debug;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::{errors::DpopError, Result};

/// Minimum accepted secret length in bytes
pub const MIN_SECRET_LENGTH: usize = 16;

/// Purpose string bound into every protected payload as associated data
pub const DEFAULT_PURPOSE: &str = "dpop-validation.server-nonce.v1";

/// Protect/unprotect primitive used by the nonce codec
pub trait DataProtector: Send + Sync + Debug {
    /// Seal `plaintext` into an opaque, URL-safe string
    fn protect(&self, plaintext: &[u8]) -> Result<String>;

    /// Recover the plaintext sealed by [`DataProtector::protect`]
    ///
    /// Fails on any malformed, truncated or altered input.
    fn unprotect(&self, protected: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM protector keyed from a shared secret
///
/// Every server instance that must accept the others' nonces needs the same
/// secret and purpose.
pub struct AesGcmDataProtector {
    key: LessSafeKey,
    purpose: String,
    rng: SystemRandom,
}

impl Debug for AesGcmDataProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not print key material
        f.debug_struct("AesGcmDataProtector")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl AesGcmDataProtector {
    /// Create a protector from a secret using the default purpose
    pub fn new(secret: &[u8]) -> Result<Self> {
        Self::with_purpose(secret, DEFAULT_PURPOSE)
    }

    /// Create a protector whose output is only accepted under the same `purpose`
    pub fn with_purpose(secret: &[u8], purpose: impl Into<String>) -> Result<Self> {
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(DpopError::ConfigurationError {
                reason: format!(
                    "Nonce protection secret must be at least {MIN_SECRET_LENGTH} bytes, got {}",
                    secret.len()
                ),
            });
        }

        let mut key_bytes = Zeroizing::new([0u8; 32]);
        key_bytes.copy_from_slice(digest(&SHA256, secret).as_ref());

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes[..]).map_err(|_| {
            DpopError::NonceProtectionError {
                reason: "Failed to derive AES-256-GCM key".to_string(),
            }
        })?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            purpose: purpose.into(),
            rng: SystemRandom::new(),
        })
    }

    /// Create a protector with a freshly generated random secret
    ///
    /// Nonces issued by it are only accepted by this instance.
    pub fn ephemeral() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut secret = Zeroizing::new([0u8; 32]);
        rng.fill(&mut secret[..])?;
        Self::new(&secret[..])
    }
}

impl DataProtector for AesGcmDataProtector {
    fn protect(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| DpopError::NonceProtectionError {
                reason: "System random source unavailable".to_string(),
            })?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(self.purpose.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| DpopError::NonceProtectionError {
                reason: "Sealing failed".to_string(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    fn unprotect(&self, protected: &str) -> Result<Vec<u8>> {
        let sealed =
            URL_SAFE_NO_PAD
                .decode(protected.trim())
                .map_err(|e| DpopError::NonceProtectionError {
                    reason: format!("Not base64url: {e}"),
                })?;

        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(DpopError::NonceProtectionError {
                reason: "Protected payload too short".to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| {
            DpopError::NonceProtectionError {
                reason: "Invalid AEAD nonce".to_string(),
            }
        })?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(self.purpose.as_bytes()), &mut in_out)
            .map_err(|_| DpopError::NonceProtectionError {
                reason: "Payload failed authentication".to_string(),
            })?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_protect_round_trip_is_opaque() {
        let protector = AesGcmDataProtector::new(SECRET).unwrap();
        let sealed = protector.protect(b"1700000000").unwrap();

        assert!(!sealed.contains("1700000000"));
        assert_eq!(protector.unprotect(&sealed).unwrap(), b"1700000000");

        // fresh AEAD nonce per call
        assert_ne!(sealed, protector.protect(b"1700000000").unwrap());
    }

    #[test]
    fn test_any_bit_flip_is_detected() {
        let protector = AesGcmDataProtector::new(SECRET).unwrap();
        let sealed = URL_SAFE_NO_PAD
            .decode(protector.protect(b"1700000000").unwrap())
            .unwrap();

        for index in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            let tampered = URL_SAFE_NO_PAD.encode(tampered);
            assert!(
                protector.unprotect(&tampered).is_err(),
                "flip at byte {index} went unnoticed"
            );
        }
    }

    #[test]
    fn test_garbage_and_foreign_keys_rejected() {
        let protector = AesGcmDataProtector::new(SECRET).unwrap();
        assert!(protector.unprotect("").is_err());
        assert!(protector.unprotect("not base64 !!").is_err());
        assert!(protector.unprotect("AAAA").is_err());

        let other = AesGcmDataProtector::new(b"another secret of sufficient length").unwrap();
        let sealed = other.protect(b"1700000000").unwrap();
        assert!(protector.unprotect(&sealed).is_err());

        let other_purpose = AesGcmDataProtector::with_purpose(SECRET, "something-else").unwrap();
        let sealed = other_purpose.protect(b"1700000000").unwrap();
        assert!(protector.unprotect(&sealed).is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            AesGcmDataProtector::new(b"short"),
            Err(DpopError::ConfigurationError { .. })
        ));
        assert!(AesGcmDataProtector::ephemeral().is_ok());
    }
}
