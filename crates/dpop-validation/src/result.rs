//! Validation verdict accumulated across the proof pipeline

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DpopValidationOptions;
use crate::jwk::token_id_hash;

/// OAuth error token reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DpopErrorCode {
    /// Structural problem or missing claim
    InvalidRequest,
    /// The proof is well formed but not acceptable
    InvalidDpopProof,
    /// The client must retry with the server-issued nonce
    UseDpopNonce,
}

impl DpopErrorCode {
    /// Wire form of the error token
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidDpopProof => "invalid_dpop_proof",
            Self::UseDpopNonce => "use_dpop_nonce",
        }
    }
}

impl fmt::Display for DpopErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable accumulator for one validation run
///
/// Once an error is recorded it is never replaced: the first failing stage
/// determines the verdict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DpopValidationResult {
    /// Whether any stage failed
    pub is_error: bool,
    /// Error token of the first failure
    pub error: Option<DpopErrorCode>,
    /// Human readable description of the first failure
    pub error_description: Option<String>,
    /// Decoded proof claims, set once the signature verified
    pub payload: Option<Map<String, Value>>,
    /// The proof's `jti`
    pub jti: Option<String>,
    /// The proof's `iat`
    pub iat: Option<i64>,
    /// Nonce the proof was created with, if any
    pub nonce: Option<String>,
    /// Thumbprint of the key that signed the proof
    pub jkt: Option<String>,
    /// Fresh nonce the client must use on retry
    pub server_issued_nonce: Option<String>,
    token_id_hash: Option<String>,
}

impl DpopValidationResult {
    /// Create an empty, successful result
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure unless one was already recorded
    ///
    /// Returns `true` when this call set the error.
    pub fn set_error(&mut self, code: DpopErrorCode, description: impl Into<String>) -> bool {
        if self.is_error {
            return false;
        }
        self.is_error = true;
        self.error = Some(code);
        self.error_description = Some(description.into());
        true
    }

    /// Whether no stage has failed so far
    pub fn is_success(&self) -> bool {
        !self.is_error
    }

    /// Hash of the `jti` used as the replay cache key
    ///
    /// Computed on first access and cached for the rest of the run.
    pub fn token_id_hash(&mut self) -> Option<&str> {
        let jti = self.jti.as_deref()?;
        Some(
            self.token_id_hash
                .get_or_insert_with(|| token_id_hash(jti))
                .as_str(),
        )
    }

    /// Look up a claim in the decoded payload
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.payload.as_ref()?.get(name)
    }

    /// Render the `WWW-Authenticate` challenge for a failed run
    ///
    /// Returns `None` when validation succeeded.
    pub fn www_authenticate(&self, options: &DpopValidationOptions) -> Option<String> {
        let code = self.error?;
        let description = self
            .error_description
            .as_deref()
            .unwrap_or_default()
            .replace('\\', "\\\\")
            .replace('"', "\\\"");
        let algs = options.allowed_signing_algorithms.join(" ");

        Some(format!(
            "DPoP error=\"{code}\", error_description=\"{description}\", algs=\"{algs}\""
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_failure_wins() {
        let mut result = DpopValidationResult::new();
        assert!(result.is_success());

        assert!(result.set_error(DpopErrorCode::InvalidRequest, "Invalid 'ath' value."));
        assert!(!result.set_error(DpopErrorCode::InvalidDpopProof, "Invalid 'htu' value."));

        assert!(result.is_error);
        assert_eq!(result.error, Some(DpopErrorCode::InvalidRequest));
        assert_eq!(
            result.error_description.as_deref(),
            Some("Invalid 'ath' value.")
        );
    }

    #[test]
    fn test_token_id_hash_requires_jti() {
        let mut result = DpopValidationResult::new();
        assert_eq!(result.token_id_hash(), None);

        result.jti = Some("abc".to_string());
        let first = result.token_id_hash().map(str::to_string);
        assert_eq!(first, Some(token_id_hash("abc")));

        // cached value survives a later jti change within the same run
        result.jti = Some("other".to_string());
        assert_eq!(result.token_id_hash().map(str::to_string), first);
    }

    #[test]
    fn test_www_authenticate() {
        let options = DpopValidationOptions::default()
            .with_allowed_signing_algorithms(["ES256", "RS256"]);

        let mut result = DpopValidationResult::new();
        assert_eq!(result.www_authenticate(&options), None);

        result.set_error(DpopErrorCode::UseDpopNonce, "Invalid 'nonce' value.");
        assert_eq!(
            result.www_authenticate(&options).unwrap(),
            "DPoP error=\"use_dpop_nonce\", error_description=\"Invalid 'nonce' value.\", algs=\"ES256 RS256\""
        );
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(DpopErrorCode::InvalidRequest.as_str(), "invalid_request");
        assert_eq!(DpopErrorCode::InvalidDpopProof.to_string(), "invalid_dpop_proof");
        assert_eq!(
            serde_json::to_string(&DpopErrorCode::UseDpopNonce).unwrap(),
            "\"use_dpop_nonce\""
        );
    }
}
