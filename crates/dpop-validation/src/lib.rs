//! # DPoP Proof Validation
//!
//! **RFC 9449 Demonstrating Proof-of-Possession (DPoP) proof validation engine**
//!
//! Binds an OAuth access token to a client-held asymmetric key: on every
//! request the client presents a signed proof, and this crate decides whether
//! the proof is acceptable.
//!
//! ## Core Features
//!
//! - ✅ **Signature verification** - ES256/384, RS256/384/512, PS256/384/512 and EdDSA proofs
//!   verified against the embedded public JWK
//! - ✅ **Token binding** - `ath` and `cnf.jkt` tie the proof to one access token and one key
//! - ✅ **Request binding** - `htm`/`htu` with scheme, host and default-port normalization
//! - ✅ **Freshness** - `iat` windows, server-issued nonces, or both
//! - ✅ **Replay protection** - pluggable cache, in-memory or Redis
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dpop_validation::{
//!     AesGcmDataProtector, DefaultNonceValidator, DpopProofValidator,
//!     DpopValidationContext, DpopValidationOptions, MemoryReplayCache,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(proof: &str, access_token: &str) -> dpop_validation::Result<()> {
//! let protector = Arc::new(AesGcmDataProtector::new(b"shared secret for every instance")?);
//! let validator = DpopProofValidator::new(
//!     Arc::new(DefaultNonceValidator::new(protector)),
//!     Arc::new(MemoryReplayCache::new()),
//! );
//!
//! let options = Arc::new(DpopValidationOptions::default());
//! let ctx = DpopValidationContext::new(
//!     "GET",
//!     "https://api.example.com/resource",
//!     proof,
//!     access_token,
//!     options.clone(),
//! );
//!
//! let result = validator.validate(&ctx, &CancellationToken::new()).await?;
//! if let Some(challenge) = result.www_authenticate(&options) {
//!     println!("401 WWW-Authenticate: {challenge}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  proof + token   ┌───────────────────────┐
//! │    HTTP layer    │ ───────────────▶ │  DpopProofValidator   │
//! │ (caller supplied)│ ◀─────────────── │  jwk → cnf → payload  │
//! └──────────────────┘  verdict/nonce   │  → freshness → replay │
//!                                       └─────┬───────────┬─────┘
//!                                             │           │
//!                                ┌────────────▼───┐   ┌───▼────────────┐
//!                                │ NonceValidator │   │  ReplayCache   │
//!                                │ (DataProtector)│   │ (memory/redis) │
//!                                └────────────────┘   └────────────────┘
//! ```
//!
//! ## Errors
//!
//! Rejected proofs are not errors: the verdict, OAuth error token and
//! description live in [`DpopValidationResult`]. [`DpopError`] is reserved for
//! faults that prevent a verdict, such as cancellation or an unreachable cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub use builder::*;
pub use clock::*;
pub use config::*;
pub use context::*;
pub use errors::*;
pub use freshness::*;
pub use jwk::*;
pub use nonce::*;
pub use protection::*;
pub use replay::*;
pub use result::*;
pub use validator::*;

pub mod builder;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod freshness;
pub mod jwk;
pub mod nonce;
pub mod protection;
pub mod replay;
pub mod result;
pub mod validator;

#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
pub mod redis_storage;

#[cfg(feature = "redis-storage")]
pub use redis_storage::RedisReplayCache;

/// DPoP result type
pub type Result<T> = std::result::Result<T, DpopError>;

/// Current crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// DPoP JWT header type as defined in RFC 9449
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Request header carrying the proof
pub const DPOP_HEADER: &str = "DPoP";

/// Response header carrying a server-issued nonce
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
