//! Crypto primitives: challenge signatures, key agreement, AEAD framing and
//! the out-of-band fingerprint. Each concern gets its own RustCrypto crate
//! rather than a hand-rolled implementation.

pub mod aead;
pub mod fingerprint;
pub mod identity;
pub mod kex;

pub use aead::{EncryptedFrame, SessionCipher};
pub use fingerprint::derive_fingerprint;
pub use identity::{canonical_json, compute_kid, verify_challenge_signature, Jwk};
pub use kex::{random_salt, EphemeralKex};
