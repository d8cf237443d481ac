//! Symmetric encryption for sponsor keys at rest.
//!
//! AES-256-GCM with the key derived as SHA-256 of the deployment secret.
//! The random nonce is prepended to the ciphertext and the whole blob is
//! base64-encoded.

use crate::error::StorageError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

fn cipher(secret: &str) -> Aes256Gcm {
    let key = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(&key)
}

/// Encrypts a plaintext key with the deployment secret.
pub fn encrypt(plaintext: &str, secret: &str) -> Result<String, StorageError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher(secret)
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|err| StorageError::Crypt(err.to_string()))?;

    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypts a blob produced by [`encrypt`]. Fails on tampering or a wrong
/// secret.
pub fn decrypt(encoded: &str, secret: &str) -> Result<String, StorageError> {
    let blob = BASE64
        .decode(encoded)
        .map_err(|err| StorageError::Crypt(err.to_string()))?;

    if blob.len() < NONCE_LEN {
        return Err(StorageError::Crypt("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    let plaintext = cipher(secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|err| StorageError::Crypt(err.to_string()))?;

    String::from_utf8(plaintext).map_err(|err| StorageError::Crypt(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let encrypted = encrypt("0xdeadbeef", "secret").unwrap();
        assert_ne!(encrypted, "0xdeadbeef");
        assert_eq!(decrypt(&encrypted, "secret").unwrap(), "0xdeadbeef");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let a = encrypt("key", "secret").unwrap();
        let b = encrypt("key", "secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(&a, "secret").unwrap(), decrypt(&b, "secret").unwrap());
    }

    #[test]
    fn rejects_wrong_secret() {
        let encrypted = encrypt("key", "secret").unwrap();
        assert!(decrypt(&encrypted, "other").is_err());
    }

    #[test]
    fn rejects_tampering() {
        let encrypted = encrypt("key", "secret").unwrap();
        let mut blob = BASE64.decode(&encrypted).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(decrypt(&BASE64.encode(blob), "secret").is_err());
    }
}
