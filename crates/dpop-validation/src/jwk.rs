//! JWK thumbprints (RFC 7638) and the hashes DPoP binds to

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{errors::DpopError, Result};

/// Compute the RFC 7638 SHA-256 thumbprint of a public JWK
///
/// Only the required members of each key type take part, serialized with
/// lexicographically ordered names and no whitespace. Symmetric (`oct`) keys
/// have no business in a DPoP header and are refused.
pub fn jwk_thumbprint(jwk: &Jwk) -> Result<String> {
    // members are inserted in lexicographic order; serde_json preserves it
    let canonical = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => serde_json::json!({
            "crv": curve_name(&params.curve)?,
            "kty": "EC",
            "x": params.x,
            "y": params.y,
        }),
        AlgorithmParameters::RSA(params) => serde_json::json!({
            "e": params.e,
            "kty": "RSA",
            "n": params.n,
        }),
        AlgorithmParameters::OctetKeyPair(params) => serde_json::json!({
            "crv": curve_name(&params.curve)?,
            "kty": "OKP",
            "x": params.x,
        }),
        AlgorithmParameters::OctetKey(_) => {
            return Err(DpopError::CryptographicError {
                reason: "Symmetric JWK has no public thumbprint".to_string(),
            });
        }
    };

    let canonical_json = serde_json::to_string(&canonical)?;
    Ok(sha256_base64url(canonical_json.as_bytes()))
}

/// The `ath` value for an access token: base64url(SHA-256(token))
pub fn access_token_hash(access_token: &str) -> String {
    sha256_base64url(access_token.as_bytes())
}

/// Replay cache key for a proof identifier: base64url(SHA-256(jti))
pub fn token_id_hash(jti: &str) -> String {
    sha256_base64url(jti.as_bytes())
}

/// Compare two strings without leaking the position of the first difference
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn sha256_base64url(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input))
}

fn curve_name(curve: &EllipticCurve) -> Result<&'static str> {
    match curve {
        EllipticCurve::P256 => Ok("P-256"),
        EllipticCurve::P384 => Ok("P-384"),
        EllipticCurve::P521 => Ok("P-521"),
        EllipticCurve::Ed25519 => Ok("Ed25519"),
        #[allow(unreachable_patterns)]
        _ => Err(DpopError::CryptographicError {
            reason: "Unsupported JWK curve".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rfc7638_rsa_example_thumbprint() {
        // RFC 7638 section 3.1
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
            "alg": "RS256",
            "kid": "2011-04-29"
        }))
        .unwrap();

        assert_eq!(
            jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_ec_thumbprint_ignores_optional_members() {
        let bare: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
            "y": "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"
        }))
        .unwrap();
        let decorated: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "kid": "client-key-1",
            "x": "f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
            "y": "x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"
        }))
        .unwrap();

        assert_eq!(
            jwk_thumbprint(&bare).unwrap(),
            jwk_thumbprint(&decorated).unwrap()
        );
    }

    #[test]
    fn test_symmetric_jwk_rejected() {
        let oct: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "oct",
            "k": "c2VjcmV0"
        }))
        .unwrap();
        assert!(jwk_thumbprint(&oct).is_err());
    }

    #[test]
    fn test_access_token_hash() {
        // RFC 9449 section 7.1 example
        assert_eq!(
            access_token_hash("Kz~8mXK1EalYznwH-LC-1fBAo.4Ljp~zsPE_NeO.gxU"),
            "fUHyO2r2Z3DZ53EsNrWBb0xWXoaNy59IiKCAqksmQEo"
        );
        assert_ne!(access_token_hash("a"), access_token_hash("b"));
        assert_eq!(token_id_hash("abc"), token_id_hash("abc"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
