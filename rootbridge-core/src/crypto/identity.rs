//! Client identity: JWK parsing, kid derivation, RSA-PSS challenge verification.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pss::VerifyingKey;
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, Result};

/// An RSA public key in JWK form, as sent by the client in `auth_response.jwk`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    /// base64url, no padding.
    pub n: String,
    /// base64url, no padding.
    pub e: String,
}

/// Canonical JSON encoding used for `kid` derivation: lexicographically
/// ordered keys, no whitespace. `kid = hex(SHA-256(canonical(jwk)))`.
pub fn canonical_json(jwk: &Jwk) -> Vec<u8> {
    let mut map = BTreeMap::new();
    map.insert("e", jwk.e.as_str());
    map.insert("kty", jwk.kty.as_str());
    map.insert("n", jwk.n.as_str());
    // BTreeMap's Serialize impl emits keys in sorted order.
    serde_json::to_vec(&map).expect("canonical JWK map always serializes")
}

pub fn compute_kid(jwk: &Jwk) -> String {
    let digest = Sha256::digest(canonical_json(jwk));
    hex::encode(digest)
}

fn jwk_to_rsa_public_key(jwk: &Jwk) -> Result<RsaPublicKey> {
    if jwk.kty != "RSA" {
        return Err(BridgeError::KeyStore(format!("unsupported kty {:?}", jwk.kty)));
    }
    let n_bytes = URL_SAFE_NO_PAD
        .decode(&jwk.n)
        .map_err(|e| BridgeError::KeyStore(format!("invalid JWK modulus: {e}")))?;
    let e_bytes = URL_SAFE_NO_PAD
        .decode(&jwk.e)
        .map_err(|e| BridgeError::KeyStore(format!("invalid JWK exponent: {e}")))?;
    let n = BigUint::from_bytes_be(&n_bytes);
    let e = BigUint::from_bytes_be(&e_bytes);
    RsaPublicKey::new(n, e).map_err(|e| BridgeError::KeyStore(format!("invalid RSA key: {e}")))
}

/// Verifies `sign(challenge_bytes)` under RSA-PSS/SHA-256, salt length 32.
///
/// `signature_hex` is the hex-encoded signature as sent on the wire; the
/// signed message is the raw 32 challenge bytes, never their hex form.
pub fn verify_challenge_signature(
    jwk: &Jwk,
    challenge: &[u8],
    signature_hex: &str,
) -> Result<()> {
    let public_key = jwk_to_rsa_public_key(jwk)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig_bytes = hex::decode(signature_hex).map_err(|_| BridgeError::SignatureInvalid)?;
    let signature = rsa::pss::Signature::try_from(sig_bytes.as_slice())
        .map_err(|_| BridgeError::SignatureInvalid)?;
    verifying_key
        .verify(challenge, &signature)
        .map_err(|_| BridgeError::SignatureInvalid)
}
