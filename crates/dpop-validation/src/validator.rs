//! DPoP proof validation pipeline
//!
//! [`DpopProofValidator::validate`] runs five stages in order and stops at the
//! first failure:
//!
//! 1. [`validate_jwk`](DpopProofValidator::validate_jwk): single value, size,
//!    header, algorithm, embedded public key and signature
//! 2. [`validate_confirmation`](DpopProofValidator::validate_confirmation):
//!    the signing key matches the access token's `cnf.jkt`
//! 3. [`validate_payload`](DpopProofValidator::validate_payload): `ath`, `jti`,
//!    `htm`, `htu` and `iat` claims
//! 4. [`validate_freshness`](DpopProofValidator::validate_freshness): `iat`
//!    and/or server nonce within the validity window
//! 5. [`validate_replay`](DpopProofValidator::validate_replay): the `jti` has
//!    not been seen before
//!
//! Each stage can also be called on its own. Stages record failures in the
//! shared [`DpopValidationResult`]; only infrastructure faults (cancellation,
//! cache or nonce backend failures) surface as `Err`.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::ExpirationMode;
use crate::context::DpopValidationContext;
use crate::freshness::is_expired;
use crate::jwk::{access_token_hash, constant_time_eq, jwk_thumbprint};
use crate::nonce::{NonceValidationResult, NonceValidator};
use crate::replay::ReplayCache;
use crate::result::{DpopErrorCode, DpopValidationResult};
use crate::{DpopError, Result, DPOP_JWT_TYPE};

/// Description reported when a `jti` was already seen
pub const REPLAY_DETECTED_DESCRIPTION: &str = "Detected DPoP proof token replay.";

/// Description reported when more than one proof accompanies a request
pub const MULTIPLE_PROOFS_DESCRIPTION: &str = "Multiple DPoP proof values.";

/// Description reported when the proof is absent
pub const MISSING_PROOF_DESCRIPTION: &str = "Missing DPoP proof value.";

/// Description reported when the proof exceeds the configured length
pub const PROOF_TOO_LONG_DESCRIPTION: &str = "Invalid DPoP proof token length.";

/// Description reported when the proof is not a compact JWS
pub const MALFORMED_PROOF_DESCRIPTION: &str = "Malformed DPoP proof token.";

/// Description reported when the signature does not verify
pub const INVALID_SIGNATURE_DESCRIPTION: &str = "Invalid signature on DPoP proof token.";

/// Description reported when no payload was decoded
pub const MISSING_PAYLOAD_DESCRIPTION: &str = "Missing DPoP proof payload.";

/// Description reported when a nonce was required but absent
pub const MISSING_NONCE_DESCRIPTION: &str = "Missing 'nonce' value.";

/// The standard description for a missing or wrong claim
pub fn invalid_claim_description(claim: &str) -> String {
    format!("Invalid '{claim}' value.")
}

/// Claims extracted by the payload stage
#[derive(Debug)]
struct ProofClaims {
    jti: String,
    iat: i64,
    nonce: Option<String>,
}

/// Validates DPoP proofs presented with access tokens
#[derive(Debug, Clone)]
pub struct DpopProofValidator {
    nonce_validator: Arc<dyn NonceValidator>,
    replay_cache: Arc<dyn ReplayCache>,
    clock: Arc<dyn Clock>,
}

impl DpopProofValidator {
    /// Create a validator reading time from the system clock
    pub fn new(nonce_validator: Arc<dyn NonceValidator>, replay_cache: Arc<dyn ReplayCache>) -> Self {
        Self {
            nonce_validator,
            replay_cache,
            clock: Arc::new(SystemClock),
        }
    }

    /// Read time from `clock` when checking `iat`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Issue a server nonce, e.g. for an initial `use_dpop_nonce` challenge
    pub async fn create_nonce(&self, ctx: &DpopValidationContext) -> Result<String> {
        self.nonce_validator.create_nonce(ctx).await
    }

    /// Run every stage, stopping at the first failure
    pub async fn validate(
        &self,
        ctx: &DpopValidationContext,
        cancel: &CancellationToken,
    ) -> Result<DpopValidationResult> {
        if cancel.is_cancelled() {
            return Err(DpopError::Cancelled);
        }

        let mut result = DpopValidationResult::new();

        self.validate_jwk(ctx, &mut result);
        if !result.is_error {
            self.validate_confirmation(ctx, &mut result);
        }
        if !result.is_error {
            self.validate_payload(ctx, &mut result);
        }
        if !result.is_error {
            self.validate_freshness(ctx, &mut result, cancel).await?;
        }
        if !result.is_error {
            self.validate_replay(ctx, &mut result, cancel).await?;
        }

        if result.is_error {
            info!(
                error_code = result.error.map(DpopErrorCode::as_str),
                description = result.error_description.as_deref(),
                jti = result.jti.as_deref(),
                method = ctx.method(),
                url = ctx.url(),
                "DPoP proof rejected"
            );
        } else {
            debug!(
                jti = result.jti.as_deref(),
                jkt = result.jkt.as_deref(),
                "DPoP proof accepted"
            );
        }

        Ok(result)
    }

    /// Check the proof's structure, header, embedded key and signature
    ///
    /// On success the decoded payload and the key thumbprint are stored.
    pub fn validate_jwk(&self, ctx: &DpopValidationContext, result: &mut DpopValidationResult) {
        let token = match ctx.proof_token() {
            Some(token) if !token.trim().is_empty() => token,
            _ if ctx.proof_tokens().len() > 1 => {
                result.set_error(DpopErrorCode::InvalidRequest, MULTIPLE_PROOFS_DESCRIPTION);
                return;
            }
            _ => {
                result.set_error(DpopErrorCode::InvalidRequest, MISSING_PROOF_DESCRIPTION);
                return;
            }
        };

        let options = ctx.options();
        if token.len() > options.proof_token_max_length {
            debug!(
                length = token.len(),
                max_length = options.proof_token_max_length,
                "DPoP proof exceeds maximum length"
            );
            result.set_error(DpopErrorCode::InvalidRequest, PROOF_TOO_LONG_DESCRIPTION);
            return;
        }

        let Some(raw_header) = raw_header(token) else {
            result.set_error(DpopErrorCode::InvalidRequest, MALFORMED_PROOF_DESCRIPTION);
            return;
        };

        let typ_ok = raw_header
            .get("typ")
            .and_then(Value::as_str)
            .is_some_and(|typ| typ.eq_ignore_ascii_case(DPOP_JWT_TYPE));
        if !typ_ok {
            result.set_error(
                DpopErrorCode::InvalidDpopProof,
                invalid_claim_description("typ"),
            );
            return;
        }

        let alg = raw_header
            .get("alg")
            .and_then(Value::as_str)
            .and_then(|alg| Algorithm::from_str(alg).ok())
            .filter(|alg| options.is_algorithm_allowed(*alg));
        let Some(alg) = alg else {
            debug!(alg = ?raw_header.get("alg"), "DPoP proof algorithm not allowed");
            result.set_error(
                DpopErrorCode::InvalidDpopProof,
                invalid_claim_description("alg"),
            );
            return;
        };

        // A private key in the header means the client leaked it
        let public_jwk = matches!(
            raw_header.get("jwk"),
            Some(Value::Object(jwk)) if !jwk.contains_key("d")
        );
        if !public_jwk {
            result.set_error(
                DpopErrorCode::InvalidDpopProof,
                invalid_claim_description("jwk"),
            );
            return;
        }

        let jwk = match decode_header(token) {
            Ok(header) => header.jwk,
            Err(e) => {
                debug!("DPoP proof header rejected: {e}");
                None
            }
        };
        let key_material = jwk.as_ref().and_then(|jwk| {
            let thumbprint = jwk_thumbprint(jwk).ok()?;
            let key = DecodingKey::from_jwk(jwk).ok()?;
            Some((thumbprint, key))
        });
        let Some((thumbprint, key)) = key_material else {
            result.set_error(
                DpopErrorCode::InvalidDpopProof,
                invalid_claim_description("jwk"),
            );
            return;
        };

        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        match decode::<Map<String, Value>>(token, &key, &validation) {
            Ok(data) => {
                debug!(alg = ?alg, jkt = %thumbprint, "DPoP proof signature verified");
                result.payload = Some(data.claims);
                result.jkt = Some(thumbprint);
            }
            Err(e) => {
                debug!("DPoP proof failed verification: {e}");
                match e.kind() {
                    ErrorKind::InvalidToken
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => {
                        result.set_error(DpopErrorCode::InvalidRequest, MALFORMED_PROOF_DESCRIPTION);
                    }
                    _ => {
                        result.set_error(
                            DpopErrorCode::InvalidDpopProof,
                            INVALID_SIGNATURE_DESCRIPTION,
                        );
                    }
                }
            }
        }
    }

    /// Check the signing key against the access token's `cnf.jkt`
    ///
    /// Without an expected thumbprint there is nothing to bind to and the
    /// stage passes.
    pub fn validate_confirmation(
        &self,
        ctx: &DpopValidationContext,
        result: &mut DpopValidationResult,
    ) {
        let Some(expected) = ctx.expected_thumbprint() else {
            return;
        };

        match result.jkt.as_deref() {
            Some(jkt) if constant_time_eq(jkt, expected) => {
                debug!(jkt, "DPoP proof key matches access token binding");
            }
            _ => {
                warn!(
                    jkt = result.jkt.as_deref(),
                    "DPoP proof signed by a key other than the access token's"
                );
                result.set_error(
                    DpopErrorCode::InvalidDpopProof,
                    invalid_claim_description("cnf"),
                );
            }
        }
    }

    /// Check the payload claims against the request
    ///
    /// Claims are checked in the order `ath`, `jti`, `htm`, `htu`, `iat`; the
    /// first absent or wrong one is reported. `iat` is only required here,
    /// its value is judged by the freshness stage.
    pub fn validate_payload(&self, ctx: &DpopValidationContext, result: &mut DpopValidationResult) {
        let Some(payload) = result.payload.as_ref() else {
            result.set_error(DpopErrorCode::InvalidRequest, MISSING_PAYLOAD_DESCRIPTION);
            return;
        };

        match check_claims(ctx, payload) {
            Ok(claims) => {
                debug!(jti = %claims.jti, iat = claims.iat, "DPoP proof claims valid");
                result.jti = Some(claims.jti);
                result.iat = Some(claims.iat);
                result.nonce = claims.nonce;
            }
            Err((code, claim)) => {
                result.set_error(code, invalid_claim_description(claim));
            }
        }
    }

    /// Check that the proof is recent enough
    ///
    /// `IssuedAt` judges `iat` with the client clock skew, `Nonce` judges the
    /// server nonce with the server clock skew, `Both` requires both. In the
    /// nonce modes a failure also issues a new server nonce into
    /// [`DpopValidationResult::server_issued_nonce`].
    pub async fn validate_freshness(
        &self,
        ctx: &DpopValidationContext,
        result: &mut DpopValidationResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DpopError::Cancelled);
        }

        let options = ctx.options();
        let mode = options.validation_mode;
        let failure_code = match mode {
            ExpirationMode::IssuedAt => DpopErrorCode::InvalidDpopProof,
            ExpirationMode::Nonce | ExpirationMode::Both => DpopErrorCode::UseDpopNonce,
        };
        let mut fresh = true;

        if mode.checks_issued_at() {
            match result.iat {
                Some(iat) => {
                    if is_expired(
                        self.clock.now_unix(),
                        options.proof_token_validity_duration,
                        options.client_clock_skew,
                        iat,
                    ) {
                        result.set_error(failure_code, invalid_claim_description("iat"));
                        fresh = false;
                    }
                }
                None => {
                    result.set_error(DpopErrorCode::InvalidRequest, invalid_claim_description("iat"));
                    fresh = false;
                }
            }
        }

        if mode.checks_nonce() && fresh {
            let verdict = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DpopError::Cancelled),
                verdict = self.nonce_validator.validate_nonce(ctx, result.nonce.as_deref()) => verdict,
            };

            match verdict {
                NonceValidationResult::Valid => {}
                NonceValidationResult::Missing => {
                    result.set_error(DpopErrorCode::UseDpopNonce, MISSING_NONCE_DESCRIPTION);
                    fresh = false;
                }
                NonceValidationResult::Invalid => {
                    result.set_error(
                        DpopErrorCode::UseDpopNonce,
                        invalid_claim_description("nonce"),
                    );
                    fresh = false;
                }
            }
        }

        if fresh {
            debug!(mode = %mode, "DPoP proof is fresh");
            return Ok(());
        }

        info!(
            mode = %mode,
            jti = result.jti.as_deref(),
            error_code = failure_code.as_str(),
            "DPoP proof failed freshness check"
        );

        if mode.checks_nonce() {
            let nonce = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DpopError::Cancelled),
                nonce = self.nonce_validator.create_nonce(ctx) => nonce?,
            };
            result.server_issued_nonce = Some(nonce);
        }

        Ok(())
    }

    /// Reject a `jti` seen before and remember this one
    ///
    /// Skipped when replay detection is disabled or an earlier stage failed,
    /// so rejected proofs never enter the cache.
    pub async fn validate_replay(
        &self,
        ctx: &DpopValidationContext,
        result: &mut DpopValidationResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let options = ctx.options();
        if !options.replay_detection_enabled || result.is_error {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(DpopError::Cancelled);
        }

        let Some(token_id_hash) = result.token_id_hash().map(str::to_string) else {
            result.set_error(DpopErrorCode::InvalidRequest, invalid_claim_description("jti"));
            return Ok(());
        };

        let seen = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DpopError::Cancelled),
            seen = self.replay_cache.exists(&token_id_hash) => {
                seen.inspect_err(|e| error!("Replay cache lookup failed: {e}"))?
            }
        };

        if seen {
            warn!(jti = result.jti.as_deref(), "DPoP proof replay detected");
            result.set_error(DpopErrorCode::InvalidDpopProof, REPLAY_DETECTED_DESCRIPTION);
            return Ok(());
        }

        let ttl = options.replay_cache_ttl();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DpopError::Cancelled),
            added = self.replay_cache.add(&token_id_hash, ttl) => {
                added.inspect_err(|e| error!("Replay cache write failed: {e}"))?;
            }
        }

        debug!(ttl_secs = ttl.as_secs(), "DPoP proof id recorded");
        Ok(())
    }
}

/// Normalize an `htu` or request URL for comparison
///
/// Scheme and host are lowercased, default ports dropped, query and fragment
/// removed. Returns `None` for anything that is not an absolute URL with a host,
/// and for URLs carrying a username or password.
pub fn normalize_htu(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    if !url.username().is_empty() || url.password().is_some() {
        return None;
    }
    let host = url.host_str()?;

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        let _ = write!(normalized, ":{port}");
    }
    normalized.push_str(url.path());
    Some(normalized)
}

/// Whether `htu` designates the same resource as `expected`
pub fn htu_matches(htu: &str, expected: &str) -> bool {
    match (normalize_htu(htu), normalize_htu(expected)) {
        (Some(htu), Some(expected)) => htu == expected,
        _ => false,
    }
}

fn raw_header(token: &str) -> Option<Map<String, Value>> {
    let mut segments = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let bytes = URL_SAFE_NO_PAD.decode(header).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(header) => Some(header),
        _ => None,
    }
}

fn string_claim<'a>(payload: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn check_claims(
    ctx: &DpopValidationContext,
    payload: &Map<String, Value>,
) -> std::result::Result<ProofClaims, (DpopErrorCode, &'static str)> {
    let missing = |claim| (DpopErrorCode::InvalidRequest, claim);
    let wrong = |claim| (DpopErrorCode::InvalidDpopProof, claim);

    let ath = string_claim(payload, "ath").ok_or_else(|| missing("ath"))?;
    if !constant_time_eq(ath, &access_token_hash(ctx.access_token())) {
        return Err(wrong("ath"));
    }

    let jti = string_claim(payload, "jti").ok_or_else(|| missing("jti"))?;

    let htm = string_claim(payload, "htm").ok_or_else(|| missing("htm"))?;
    if htm != ctx.method() {
        return Err(wrong("htm"));
    }

    let htu = string_claim(payload, "htu").ok_or_else(|| missing("htu"))?;
    if !htu_matches(htu, ctx.url()) {
        return Err(wrong("htu"));
    }

    let iat = payload
        .get("iat")
        .and_then(|iat| {
            iat.as_i64()
                .or_else(|| iat.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        })
        .ok_or_else(|| missing("iat"))?;

    let nonce = string_claim(payload, "nonce")
        .or_else(|| ctx.nonce())
        .map(str::to_string);

    Ok(ProofClaims {
        jti: jti.to_string(),
        iat,
        nonce,
    })
}
