//! Encryption manager — AES-256-GCM for metadata at rest.
//!
//! Constructed once at startup from a 32-byte hex master key; there is no
//! lazy global re-initialization. Ciphertexts are self-contained
//! `base64url(nonce || ciphertext)` strings.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;

use crate::{Error, Result};

/// GCM nonce width in bytes.
const NONCE_LEN: usize = 12;

/// AES-256-GCM encryption manager.
pub struct EncryptionManager {
    key: [u8; 32],
}

impl EncryptionManager {
    /// Create from a 64-character hex master key.
    pub fn new(master_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(master_key_hex)
            .map_err(|_| Error::Misconfigured("master key must be hex".to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Misconfigured("master key must be 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext`, returning `base64url(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Internal("invalid key length".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Internal("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(blob)
            .map_err(|_| Error::Malformed("ciphertext is not base64url".to_string()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(Error::Malformed("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Internal("invalid key length".to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Integrity("decryption failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|_| Error::Malformed("plaintext is not UTF-8".to_string()))
    }
}
