//! Client-side DPoP proof construction
//!
//! Clients mint one proof per request. Servers use the builder in tests and
//! health checks to produce proofs the validator accepts.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, KeyAlgorithm, PublicKeyUse, RSAKeyParameters, RSAKeyType,
};
use jsonwebtoken::Algorithm;
use rand::rngs::OsRng;
use rsa::{traits::PublicKeyParts, RsaPrivateKey};
use serde_json::{Map, Value};
use sha2::Sha256;
use signature::{RandomizedSigner, SignatureEncoding, Signer};
use uuid::Uuid;

use crate::jwk::{access_token_hash, jwk_thumbprint};
use crate::{DpopError, Result, DPOP_JWT_TYPE};

/// RSA modulus size used for generated keys
pub const RSA_KEY_BITS: usize = 2048;

/// Private key a client signs proofs with
pub enum DpopSigningKey {
    /// ECDSA P-256 with SHA-256
    Es256(p256::ecdsa::SigningKey),
    /// RSASSA-PKCS1-v1_5 with SHA-256
    Rs256(RsaPrivateKey),
    /// RSASSA-PSS with SHA-256
    Ps256(RsaPrivateKey),
}

impl fmt::Debug for DpopSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not print key material
        f.debug_struct("DpopSigningKey")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl DpopSigningKey {
    /// Generate a fresh P-256 key
    pub fn generate_es256() -> Self {
        Self::Es256(p256::ecdsa::SigningKey::random(&mut OsRng))
    }

    /// Generate a fresh RSA key for RS256
    pub fn generate_rs256() -> Result<Self> {
        Ok(Self::Rs256(generate_rsa_key()?))
    }

    /// Generate a fresh RSA key for PS256
    pub fn generate_ps256() -> Result<Self> {
        Ok(Self::Ps256(generate_rsa_key()?))
    }

    /// JWS algorithm this key signs with
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Es256(_) => Algorithm::ES256,
            Self::Rs256(_) => Algorithm::RS256,
            Self::Ps256(_) => Algorithm::PS256,
        }
    }

    /// Public half of the key as a JWK, ready to embed in a proof header
    pub fn public_jwk(&self) -> Result<Jwk> {
        match self {
            Self::Es256(key) => {
                let point = key.verifying_key().to_encoded_point(false);
                let x = point.x().ok_or_else(|| DpopError::CryptographicError {
                    reason: "Failed to extract X coordinate from P-256 key".to_string(),
                })?;
                let y = point.y().ok_or_else(|| DpopError::CryptographicError {
                    reason: "Failed to extract Y coordinate from P-256 key".to_string(),
                })?;

                Ok(Jwk {
                    common: common_parameters(KeyAlgorithm::ES256),
                    algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                        key_type: EllipticCurveKeyType::EC,
                        curve: EllipticCurve::P256,
                        x: URL_SAFE_NO_PAD.encode(x),
                        y: URL_SAFE_NO_PAD.encode(y),
                    }),
                })
            }
            Self::Rs256(key) | Self::Ps256(key) => {
                let key_algorithm = match self {
                    Self::Ps256(_) => KeyAlgorithm::PS256,
                    _ => KeyAlgorithm::RS256,
                };

                Ok(Jwk {
                    common: common_parameters(key_algorithm),
                    algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
                        key_type: RSAKeyType::RSA,
                        n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
                        e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
                    }),
                })
            }
        }
    }

    /// RFC 7638 thumbprint of the public key, the value of `cnf.jkt`
    pub fn thumbprint(&self) -> Result<String> {
        jwk_thumbprint(&self.public_jwk()?)
    }

    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Es256(key) => {
                let signature = Signer::<p256::ecdsa::Signature>::try_sign(key, signing_input)
                    .map_err(|e| DpopError::CryptographicError {
                        reason: format!("ECDSA signing failed: {e}"),
                    })?;
                Ok(signature.to_bytes().to_vec())
            }
            Self::Rs256(key) => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                let signature = signing_key.try_sign(signing_input).map_err(|e| {
                    DpopError::CryptographicError {
                        reason: format!("RSA signing failed: {e}"),
                    }
                })?;
                Ok(signature.to_vec())
            }
            Self::Ps256(key) => {
                let signing_key = rsa::pss::BlindedSigningKey::<Sha256>::new(key.clone());
                let signature = signing_key
                    .try_sign_with_rng(&mut OsRng, signing_input)
                    .map_err(|e| DpopError::CryptographicError {
                        reason: format!("RSA-PSS signing failed: {e}"),
                    })?;
                Ok(signature.to_vec())
            }
        }
    }
}

fn common_parameters(key_algorithm: KeyAlgorithm) -> CommonParameters {
    CommonParameters {
        public_key_use: Some(PublicKeyUse::Signature),
        key_algorithm: Some(key_algorithm),
        ..Default::default()
    }
}

fn generate_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|e| DpopError::CryptographicError {
        reason: format!("Failed to generate RSA key: {e}"),
    })
}

/// Builder for a single signed DPoP proof
///
/// ```rust,no_run
/// use dpop_validation::{DpopProofBuilder, DpopSigningKey};
///
/// # fn example() -> dpop_validation::Result<()> {
/// let key = DpopSigningKey::generate_es256();
/// let proof = DpopProofBuilder::new("GET", "https://api.example.com/resource")
///     .access_token("eyJhbGciOi...")
///     .sign(&key)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DpopProofBuilder {
    method: String,
    url: String,
    access_token: Option<String>,
    ath: Option<String>,
    jti: Option<String>,
    issued_at: Option<i64>,
    nonce: Option<String>,
    typ: String,
    extra_claims: Map<String, Value>,
    extra_header: Map<String, Value>,
    omitted_claims: Vec<String>,
}

impl DpopProofBuilder {
    /// Start a proof for `method` on `url`
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            access_token: None,
            ath: None,
            jti: None,
            issued_at: None,
            nonce: None,
            typ: DPOP_JWT_TYPE.to_string(),
            extra_claims: Map::new(),
            extra_header: Map::new(),
            omitted_claims: Vec::new(),
        }
    }

    /// Bind the proof to an access token through `ath`
    pub fn access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Use a literal `ath` instead of hashing the access token
    pub fn ath(mut self, ath: impl Into<String>) -> Self {
        self.ath = Some(ath.into());
        self
    }

    /// Use a fixed `jti` instead of a random UUID
    pub fn jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }

    /// Use a fixed `iat` instead of the current time
    pub fn issued_at(mut self, issued_at: i64) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    /// Include a server-issued nonce
    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Override the header `typ`
    pub fn typ(mut self, typ: impl Into<String>) -> Self {
        self.typ = typ.into();
        self
    }

    /// Add or replace a payload claim
    pub fn claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra_claims.insert(name.into(), value);
        self
    }

    /// Add or replace a header parameter, including `jwk`
    pub fn header_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra_header.insert(name.into(), value);
        self
    }

    /// Leave a claim out of the payload entirely
    pub fn without_claim(mut self, name: impl Into<String>) -> Self {
        self.omitted_claims.push(name.into());
        self
    }

    /// Claims the signed payload will carry
    pub fn claims(&self) -> Map<String, Value> {
        let mut claims = Map::new();
        claims.insert(
            "jti".to_string(),
            Value::String(
                self.jti
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        );
        claims.insert("htm".to_string(), Value::String(self.method.clone()));
        claims.insert("htu".to_string(), Value::String(self.url.clone()));
        claims.insert(
            "iat".to_string(),
            Value::from(
                self.issued_at
                    .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            ),
        );

        let ath = self
            .ath
            .clone()
            .or_else(|| self.access_token.as_deref().map(access_token_hash));
        if let Some(ath) = ath {
            claims.insert("ath".to_string(), Value::String(ath));
        }
        if let Some(nonce) = &self.nonce {
            claims.insert("nonce".to_string(), Value::String(nonce.clone()));
        }

        for (name, value) in &self.extra_claims {
            claims.insert(name.clone(), value.clone());
        }
        for name in &self.omitted_claims {
            claims.remove(name);
        }
        claims
    }

    /// Produce the compact JWS for the `DPoP` header
    pub fn sign(&self, key: &DpopSigningKey) -> Result<String> {
        let mut header = Map::new();
        header.insert("typ".to_string(), Value::String(self.typ.clone()));
        header.insert("alg".to_string(), serde_json::to_value(key.algorithm())?);
        header.insert("jwk".to_string(), serde_json::to_value(key.public_jwk()?)?);
        for (name, value) in &self.extra_header {
            header.insert(name.clone(), value.clone());
        }

        let encoded_header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let encoded_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.claims())?);
        let signing_input = format!("{encoded_header}.{encoded_payload}");

        let signature = key.sign(signing_input.as_bytes())?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

    fn verify(token: &str) -> Map<String, Value> {
        let header = decode_header(token).unwrap();
        let jwk = header.jwk.unwrap();
        let key = DecodingKey::from_jwk(&jwk).unwrap();

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        decode::<Map<String, Value>>(token, &key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn test_es256_proof_verifies_with_embedded_jwk() {
        let key = DpopSigningKey::generate_es256();
        let token = DpopProofBuilder::new("POST", "https://api.example.com/token")
            .access_token("access-token")
            .jti("abc")
            .issued_at(1_700_000_000)
            .sign(&key)
            .unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some(DPOP_JWT_TYPE));
        assert_eq!(header.alg, Algorithm::ES256);

        let claims = verify(&token);
        assert_eq!(claims["jti"], "abc");
        assert_eq!(claims["htm"], "POST");
        assert_eq!(claims["htu"], "https://api.example.com/token");
        assert_eq!(claims["iat"], 1_700_000_000);
        assert_eq!(claims["ath"], access_token_hash("access-token"));
    }

    #[test]
    fn test_rsa_proofs_verify() {
        for key in [
            DpopSigningKey::generate_rs256().unwrap(),
            DpopSigningKey::generate_ps256().unwrap(),
        ] {
            let token = DpopProofBuilder::new("GET", "https://api.example.com/")
                .sign(&key)
                .unwrap();
            let claims = verify(&token);
            assert!(claims.contains_key("jti"));
            assert!(!claims.contains_key("ath"));
        }
    }

    #[test]
    fn test_claim_overrides() {
        let builder = DpopProofBuilder::new("GET", "https://api.example.com/")
            .access_token("token")
            .ath("wrong")
            .nonce("n")
            .claim("extra", Value::Bool(true))
            .without_claim("htm");
        let claims = builder.claims();

        assert_eq!(claims["ath"], "wrong");
        assert_eq!(claims["nonce"], "n");
        assert_eq!(claims["extra"], true);
        assert!(!claims.contains_key("htm"));
    }

    #[test]
    fn test_thumbprint_is_stable_and_key_specific() {
        let key = DpopSigningKey::generate_es256();
        let other = DpopSigningKey::generate_es256();
        assert_eq!(key.thumbprint().unwrap(), key.thumbprint().unwrap());
        assert_ne!(key.thumbprint().unwrap(), other.thumbprint().unwrap());
        assert_eq!(format!("{key:?}"), "DpopSigningKey { algorithm: ES256, .. }");
    }
}
