//! AES-256-GCM framing: wire-format `{iv, data, tag}`, all base64.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{BridgeError, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// The three base64 fields carried on the wire for an encrypted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedFrame {
    pub iv: String,
    pub data: String,
    pub tag: String,
}

/// A connection's single AEAD key, used for both directions (distinct IVs
/// per message keep nonces unique within a key). Cheaply `Clone`: the
/// daemon keeps one instance on the `Session` for decrypting inbound
/// `e2e_input` and hands an independent clone to the connection's `HubSink`
/// for encrypting outbound PTY output, so both sides can operate without
/// sharing a lock.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedFrame> {
        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut combined = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| BridgeError::AeadFailed)?;
        let tag = combined.split_off(combined.len() - TAG_LEN);

        Ok(EncryptedFrame {
            iv: STANDARD.encode(iv),
            data: STANDARD.encode(combined),
            tag: STANDARD.encode(tag),
        })
    }

    /// Decrypts a frame. On any failure (bad base64, bad tag) returns
    /// `BridgeError::AeadFailed` without revealing which check failed.
    pub fn decrypt(&self, frame: &EncryptedFrame) -> Result<Zeroizing<Vec<u8>>> {
        let iv = STANDARD
            .decode(&frame.iv)
            .map_err(|_| BridgeError::AeadFailed)?;
        let data = STANDARD
            .decode(&frame.data)
            .map_err(|_| BridgeError::AeadFailed)?;
        let tag = STANDARD
            .decode(&frame.tag)
            .map_err(|_| BridgeError::AeadFailed)?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(BridgeError::AeadFailed);
        }

        let mut combined = data;
        combined.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&iv);

        let plaintext = self
            .cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|_| BridgeError::AeadFailed)?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut k = [0u8; 32];
        OsRng.fill_bytes(&mut k);
        k
    }

    #[test]
    fn round_trips_arbitrary_plaintext() {
        let cipher = SessionCipher::new(&key());
        for len in [0usize, 1, 16, 4096] {
            let plaintext = vec![0xAB; len];
            let frame = cipher.encrypt(&plaintext).unwrap();
            let decrypted = cipher.decrypt(&frame).unwrap();
            assert_eq!(&*decrypted, plaintext.as_slice());
        }
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let cipher = SessionCipher::new(&key());
        let mut frame = cipher.encrypt(b"hello").unwrap();
        let mut tag_bytes = STANDARD.decode(&frame.tag).unwrap();
        tag_bytes[0] ^= 0xFF;
        frame.tag = STANDARD.encode(tag_bytes);
        assert!(cipher.decrypt(&frame).is_err());
    }

    #[test]
    fn distinct_ivs_per_message() {
        let cipher = SessionCipher::new(&key());
        let a = cipher.encrypt(b"hello").unwrap();
        let b = cipher.encrypt(b"hello").unwrap();
        assert_ne!(a.iv, b.iv);
    }
}
