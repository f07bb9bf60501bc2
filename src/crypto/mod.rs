//! Payload cipher
//!
//! DATA payloads are obfuscated with the raw ChaCha20 keystream, keyed from
//! the configured shared secret. Applying the keystream twice restores the
//! input, so the same call serves both directions. Control frames are never
//! encrypted.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};

/// Length of the derived symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the derived nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Symmetric stream cipher keyed by a shared secret string.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
}

impl Cipher {
    /// Derive a cipher from the configured secret. Returns `None` for an
    /// empty secret, which disables payload encryption.
    pub fn new(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }

        let key: [u8; KEY_LEN] = Sha256::digest(secret.as_bytes()).into();
        let digest = Sha256::digest(key);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);

        Some(Self { key, nonce })
    }

    /// Apply the keystream in place. Symmetric: encrypts plaintext and
    /// decrypts ciphertext with the same call.
    pub fn apply(&self, data: &mut [u8]) {
        let mut stream = ChaCha20::new(&self.key.into(), &self.nonce.into());
        stream.apply_keystream(data);
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_disables() {
        assert!(Cipher::new("").is_none());
    }

    #[test]
    fn test_apply_is_symmetric() {
        let cipher = Cipher::new("secret").unwrap();
        let mut data = b"hello world".to_vec();

        cipher.apply(&mut data);
        assert_ne!(&data, b"hello world");

        cipher.apply(&mut data);
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn test_different_secrets_differ() {
        let a = Cipher::new("a").unwrap();
        let b = Cipher::new("b").unwrap();

        let mut da = vec![0u8; 16];
        let mut db = vec![0u8; 16];
        a.apply(&mut da);
        b.apply(&mut db);

        assert_ne!(da, db);
    }
}
