//! 12-word human-verifiable fingerprint derived from `sha256(shared_secret || salt)`.

use bip39::Language;
use sha2::{Digest, Sha256};

const WORD_COUNT: usize = 12;
const BITS_PER_WORD: usize = 11;

/// Derives the 12-word fingerprint. Both endpoints compute this from the
/// same `(shared_secret, salt)` pair and must agree byte-for-byte; a
/// mismatch indicates a MITM.
pub fn derive_fingerprint(shared_secret: &[u8], salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(salt);
    let digest = hasher.finalize();

    let wordlist = Language::English.word_list();
    let indices = take_bit_groups(&digest, WORD_COUNT, BITS_PER_WORD);

    indices
        .into_iter()
        .map(|i| wordlist[i])
        .collect::<Vec<_>>()
        .join("-")
}

/// Reads `count` big-endian bit groups of `bits` width from the front of
/// `data`. `count * bits` must not exceed `data.len() * 8`.
fn take_bit_groups(data: &[u8], count: usize, bits: usize) -> Vec<usize> {
    assert!(count * bits <= data.len() * 8, "not enough entropy for fingerprint");
    let mut out = Vec::with_capacity(count);
    let mut bit_offset = 0usize;
    for _ in 0..count {
        let mut value = 0usize;
        for b in 0..bits {
            let absolute_bit = bit_offset + b;
            let byte = data[absolute_bit / 8];
            let bit = (byte >> (7 - (absolute_bit % 8))) & 1;
            value = (value << 1) | (bit as usize);
        }
        out.push(value);
        bit_offset += bits;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_given_same_inputs() {
        let secret = b"shared-secret-bytes";
        let salt = b"0123456789abcdef";
        assert_eq!(
            derive_fingerprint(secret, salt),
            derive_fingerprint(secret, salt)
        );
    }

    #[test]
    fn produces_exactly_twelve_known_words() {
        let fp = derive_fingerprint(b"another-secret", b"another-salt-16!");
        let words: Vec<&str> = fp.split('-').collect();
        assert_eq!(words.len(), 12);
        let wordlist = Language::English.word_list();
        for w in words {
            assert!(wordlist.contains(&w), "{w} not in BIP-39 wordlist");
        }
    }

    #[test]
    fn differs_when_salt_differs() {
        let secret = b"same-secret-bytes!!";
        assert_ne!(
            derive_fingerprint(secret, b"salt-one--------"),
            derive_fingerprint(secret, b"salt-two--------")
        );
    }

    #[test]
    fn bit_groups_all_zero_when_input_is_zero() {
        let data = [0u8; 4];
        let groups = take_bit_groups(&data, 2, 11);
        assert_eq!(groups, vec![0, 0]);
    }

    #[test]
    fn bit_groups_reads_leading_bit_as_high_order() {
        // Top bit of the first byte set: the first 11-bit group becomes
        // 0b10000000000 == 1024, since it's read MSB-first.
        let data = [0x80, 0x00, 0x00];
        let groups = take_bit_groups(&data, 1, 11);
        assert_eq!(groups[0], 1024);
    }
}
