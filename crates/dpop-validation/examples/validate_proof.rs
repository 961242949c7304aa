//! DPoP Proof Validation Example
//!
//! Walks through the server side of DPoP:
//! - Minting a proof the way a client would
//! - Validating it against the bound access token
//! - Rejecting a replay of the same proof
//! - Issuing a nonce challenge and accepting the retry
//!
//! Run with `RUST_LOG=debug` to see the per-stage traces.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dpop_validation::{
    AesGcmDataProtector, DefaultNonceValidator, DpopProofBuilder, DpopProofValidator,
    DpopSigningKey, DpopValidationContext, DpopValidationOptions, ExpirationMode,
    MemoryReplayCache, Result, DPOP_HEADER, DPOP_NONCE_HEADER,
};

const URL: &str = "https://api.example.com/resource";
const ACCESS_TOKEN: &str = "Kz~8mXK1EalYznwH-LC-1fBAo.4Ljp~zsPE_NeO.gxU";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🚀 DPoP Proof Validation Example");
    println!("================================\n");

    // Step 1: server-side wiring
    let protector = Arc::new(AesGcmDataProtector::ephemeral()?);
    let validator = DpopProofValidator::new(
        Arc::new(DefaultNonceValidator::new(protector)),
        Arc::new(MemoryReplayCache::new()),
    );
    let cancel = CancellationToken::new();

    // Step 2: the client generates a key; its thumbprint was recorded as cnf.jkt
    println!("📋 Step 1: Client key");
    let key = DpopSigningKey::generate_es256();
    let jkt = key.thumbprint()?;
    println!("   Algorithm: {:?}", key.algorithm());
    println!("   cnf.jkt:   {jkt}\n");

    // Step 3: a bound request
    println!("📋 Step 2: Validate a fresh proof");
    let options = Arc::new(DpopValidationOptions::default());
    let proof = DpopProofBuilder::new("GET", URL)
        .access_token(ACCESS_TOKEN)
        .sign(&key)?;
    println!("   {DPOP_HEADER}: {}...", &proof[..48.min(proof.len())]);

    let ctx = DpopValidationContext::new("GET", URL, proof, ACCESS_TOKEN, options.clone())
        .with_expected_thumbprint(jkt.clone());
    let result = validator.validate(&ctx, &cancel).await?;
    println!("   accepted: {} (jti {:?})\n", result.is_success(), result.jti);

    // Step 4: the same proof again
    println!("📋 Step 3: Replay the same proof");
    let replay = validator.validate(&ctx, &cancel).await?;
    println!("   accepted: {}", replay.is_success());
    if let Some(challenge) = replay.www_authenticate(&options) {
        println!("   401 WWW-Authenticate: {challenge}\n");
    }

    // Step 5: nonce mode
    println!("📋 Step 4: Server nonce challenge");
    let nonce_options = Arc::new(
        DpopValidationOptions::default().with_validation_mode(ExpirationMode::Nonce),
    );
    let proof = DpopProofBuilder::new("GET", URL)
        .access_token(ACCESS_TOKEN)
        .sign(&key)?;
    let ctx = DpopValidationContext::new("GET", URL, proof, ACCESS_TOKEN, nonce_options.clone());
    let challenge = validator.validate(&ctx, &cancel).await?;

    if let Some(nonce) = challenge.server_issued_nonce.clone() {
        println!(
            "   401 {}",
            challenge.www_authenticate(&nonce_options).unwrap_or_default()
        );
        println!("   {DPOP_NONCE_HEADER}: {nonce}");

        let proof = DpopProofBuilder::new("GET", URL)
            .access_token(ACCESS_TOKEN)
            .nonce(nonce)
            .sign(&key)?;
        let ctx = DpopValidationContext::new("GET", URL, proof, ACCESS_TOKEN, nonce_options);
        let retry = validator.validate(&ctx, &cancel).await?;
        println!("   retry accepted: {}", retry.is_success());
    }

    println!("\n✅ Done");
    Ok(())
}
