//! Ephemeral ECDH key agreement (NIST P-256) and HKDF-SHA-256 derivation.

use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{BridgeError, Result};

pub const SESSION_KEY_INFO: &[u8] = b"root-operator-e2e-v1";
pub const SALT_LEN: usize = 16;
pub const SESSION_KEY_LEN: usize = 32;

/// One side's ephemeral keypair for a single connection's key agreement.
/// Dropping this wipes the private scalar (`EphemeralSecret` zeroizes on
/// drop internally; we additionally never clone or persist it).
pub struct EphemeralKex {
    secret: EphemeralSecret,
}

impl EphemeralKex {
    pub fn generate() -> Self {
        Self {
            secret: EphemeralSecret::random(&mut OsRng),
        }
    }

    /// Raw uncompressed SEC1 point (`0x04 || X || Y`), as transported base64.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        let encoded = self.secret.public_key().to_encoded_point(false);
        encoded.as_bytes().to_vec()
    }

    /// Computes the shared secret against the peer's raw uncompressed point
    /// and derives the 32-byte session key via HKDF-SHA-256.
    pub fn derive_session_key(
        &self,
        peer_public_key_bytes: &[u8],
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; SESSION_KEY_LEN]>> {
        let peer_public = PublicKey::from_sec1_bytes(peer_public_key_bytes)
            .map_err(|e| BridgeError::KeyAgreement(format!("invalid peer public key: {e}")))?;
        let shared = self.secret.diffie_hellman(&peer_public);
        let shared_bytes = Zeroizing::new(shared.raw_secret_bytes().to_vec());

        let hk = Hkdf::<Sha256>::new(Some(salt), &shared_bytes);
        let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        hk.expand(SESSION_KEY_INFO, okm.as_mut())
            .map_err(|_| BridgeError::KeyAgreement("HKDF expand failed".into()))?;
        Ok(okm)
    }

    /// Exposes the raw shared secret for fingerprint derivation, which needs
    /// `sha256(shared_secret || salt)` directly rather than the HKDF output.
    pub fn shared_secret(&self, peer_public_key_bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let peer_public = PublicKey::from_sec1_bytes(peer_public_key_bytes)
            .map_err(|e| BridgeError::KeyAgreement(format!("invalid peer public key: {e}")))?;
        let shared = self.secret.diffie_hellman(&peer_public);
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    use rand_core::RngCore;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_sides_derive_the_same_session_key() {
        let salt = random_salt();
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();

        let a_pub = a.public_key_bytes();
        let b_pub = b.public_key_bytes();

        let key_a = a.derive_session_key(&b_pub, &salt).unwrap();
        let key_b = b.derive_session_key(&a_pub, &salt).unwrap();

        assert_eq!(*key_a, *key_b);
    }

    #[test]
    fn different_salts_yield_different_keys() {
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();
        let a_pub = a.public_key_bytes();
        let b_pub = b.public_key_bytes();

        let key1 = a.derive_session_key(&b_pub, &random_salt()).unwrap();
        let key2 = a.derive_session_key(&b_pub, &random_salt()).unwrap();
        assert_ne!(*key1, *key2);
    }
}
