//! Per-request validation input

use std::sync::Arc;

use crate::config::DpopValidationOptions;

/// Everything the validator needs to know about one request
///
/// Built once by the HTTP layer and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct DpopValidationContext {
    method: String,
    url: String,
    proof_tokens: Vec<String>,
    access_token: String,
    expected_thumbprint: Option<String>,
    nonce: Option<String>,
    options: Arc<DpopValidationOptions>,
}

impl DpopValidationContext {
    /// Create a context for a request carrying a single proof
    ///
    /// `url` is the expected request URL (scheme, host and path).
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        proof_token: impl Into<String>,
        access_token: impl Into<String>,
        options: Arc<DpopValidationOptions>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            proof_tokens: vec![proof_token.into()],
            access_token: access_token.into(),
            expected_thumbprint: None,
            nonce: None,
            options,
        }
    }

    /// Create a context from every proof value found on the request
    ///
    /// More than one value is a validation failure, reported by the validator.
    pub fn from_proof_values<I, S>(
        method: impl Into<String>,
        url: impl Into<String>,
        proof_values: I,
        access_token: impl Into<String>,
        options: Arc<DpopValidationOptions>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method: method.into(),
            url: url.into(),
            proof_tokens: proof_values.into_iter().map(Into::into).collect(),
            access_token: access_token.into(),
            expected_thumbprint: None,
            nonce: None,
            options,
        }
    }

    /// Bind the proof to the key recorded in the access token's `cnf.jkt`
    pub fn with_expected_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.expected_thumbprint = Some(thumbprint.into());
        self
    }

    /// Nonce supplied outside the proof, used when the proof has no `nonce` claim
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// HTTP method of the request
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Expected request URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// All proof values supplied with the request
    pub fn proof_tokens(&self) -> &[String] {
        &self.proof_tokens
    }

    /// The proof, when exactly one was supplied
    pub fn proof_token(&self) -> Option<&str> {
        match self.proof_tokens.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }

    /// The access token the proof must be bound to
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Thumbprint recorded when the access token was issued
    pub fn expected_thumbprint(&self) -> Option<&str> {
        self.expected_thumbprint.as_deref()
    }

    /// Nonce supplied outside the proof
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Options snapshot in effect for this request
    pub fn options(&self) -> &DpopValidationOptions {
        &self.options
    }
}
