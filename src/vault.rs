//! Envelope encryption of TOTP seed material.
//!
//! Uses AES-256-GCM with a process-wide key and a fresh random 96-bit nonce per
//! encryption. The ciphertext, nonce and 128-bit tag are kept apart so they map
//! one-to-one onto the `encrypted_secret`, `iv` and `auth_tag` columns of the store.
//!
//! Any tag mismatch (tampered ciphertext, tampered tag, foreign nonce or wrong key)
//! surfaces as the single [`VaultError::AuthenticationFailure`]; callers can never
//! tell those cases apart.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::KEY_LENGTH;

/// Nonce length in bytes (96 bits for AES-GCM)
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag length in bytes (128 bits)
pub const TAG_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The tag did not verify. Deliberately carries no detail.
    #[error("Decryption failed: authentication failure")]
    AuthenticationFailure,

    /// Stored fields have impossible shapes (wrong nonce or tag length, non UTF-8 plaintext).
    #[error("Malformed sealed seed: {0}")]
    Malformed(&'static str),

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// The (ciphertext, nonce, tag) triple produced by one call to [`SecretVault::encrypt`].
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSeed {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

impl std::fmt::Debug for SealedSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSeed")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .field("auth_tag_len", &self.auth_tag.len())
            .finish()
    }
}

/// Stateless AES-256-GCM sealer for seed material.
#[derive(Clone)]
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt a plaintext seed under a freshly drawn nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedSeed, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, b"", &mut buffer)
            .map_err(|_| VaultError::EncryptionFailed)?;

        Ok(SealedSeed {
            ciphertext: buffer,
            iv: nonce_bytes.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypt a triple previously produced by [`SecretVault::encrypt`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        auth_tag: &[u8],
    ) -> Result<String, VaultError> {
        if iv.len() != NONCE_LENGTH {
            return Err(VaultError::Malformed("nonce must be 12 bytes"));
        }
        if auth_tag.len() != TAG_LENGTH {
            return Err(VaultError::Malformed("auth tag must be 16 bytes"));
        }

        let nonce = Nonce::from_slice(iv);
        let tag = Tag::from_slice(auth_tag);
        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
            .map_err(|_| VaultError::AuthenticationFailure)?;

        String::from_utf8(buffer).map_err(|_| VaultError::Malformed("plaintext is not valid UTF-8"))
    }

    /// Convenience wrapper over [`SecretVault::decrypt`] for a stored triple.
    pub fn open(&self, sealed: &SealedSeed) -> Result<String, VaultError> {
        self.decrypt(&sealed.ciphertext, &sealed.iv, &sealed.auth_tag)
    }
}
