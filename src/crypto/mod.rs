//! AES-256-GCM encryption for sensitive credential fields.
//!
//! Each field is encrypted separately with a unique nonce. Blobs at rest
//! carry an explicit version tag so format detection is a prefix check,
//! not a guess:
//!
//! ```text
//! "v1." || base64(nonce[12] || ciphertext || tag[16])
//! ```
//!
//! [`SecretStore::is_legacy_encoded`] recognizes the pre-encryption
//! format (plain base64 of the secret) and exists only so the migration
//! engine can import pre-existing records; it is a heuristic, never the
//! steady-state format.

mod keys;

pub use keys::{MasterKeyCell, KEY_SIZE};

use crate::error::CryptoError;
use crate::store::{KvStore, MASTER_KEY_KEY};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;

/// Version tag prefixed to every encrypted blob.
const BLOB_VERSION_TAG: &str = "v1.";

/// Size of the nonce in bytes (96 bits, standard for GCM).
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// Authenticated-encryption primitive over strings, plus master-key
/// lifecycle. Constructed once at startup with an explicit store handle
/// and shared by reference.
pub struct SecretStore {
    keys: MasterKeyCell,
}

impl SecretStore {
    /// Creates a secret store using the default master-key location.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self::with_key_location(store, MASTER_KEY_KEY)
    }

    /// Creates a secret store with a custom master-key store key.
    pub fn with_key_location(store: Arc<KvStore>, key_location: &str) -> Self {
        Self {
            keys: MasterKeyCell::new(store, key_location),
        }
    }

    /// Encrypts a plaintext into a versioned blob.
    ///
    /// A fresh random nonce per call guarantees that two encryptions of
    /// the same plaintext never produce the same blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let key = self.keys.obtain()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| CryptoError::KeyUnavailable(e.to_string()))?;

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", BLOB_VERSION_TAG, BASE64.encode(combined)))
    }

    /// Decrypts a versioned blob back to its plaintext.
    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        if blob.is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let encoded = blob.strip_prefix(BLOB_VERSION_TAG).ok_or_else(|| {
            CryptoError::MalformedInput("missing or unknown version tag".into())
        })?;

        let combined = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::MalformedInput("invalid base64".into()))?;
        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MalformedInput(format!(
                "blob is {} bytes, shorter than nonce + tag ({})",
                combined.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);

        let key = self.keys.obtain()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| CryptoError::KeyUnavailable(e.to_string()))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::MalformedInput("plaintext is not valid UTF-8".into()))
    }

    /// Heuristic: does `data` look like a legacy plain-base64 secret?
    ///
    /// True iff the input is non-empty, uses only the base64 charset,
    /// round-trips through decode/encode exactly, and decodes to UTF-8.
    /// Plain words like "test" satisfy the charset check but fail the
    /// round-trip; random binary fails the UTF-8 check. Still a
    /// heuristic: a password that happens to be valid base64 of a UTF-8
    /// string is indistinguishable from an encoded one.
    pub fn is_legacy_encoded(data: &str) -> bool {
        if data.is_empty() || data.len() % 4 != 0 {
            return false;
        }
        if !data
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
        {
            return false;
        }

        let decoded = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        if BASE64.encode(&decoded) != data {
            return false;
        }
        std::str::from_utf8(&decoded).is_ok()
    }

    /// Structural check for the versioned blob format: version tag, valid
    /// base64, and at least nonce + tag bytes. Does not run AEAD
    /// verification; a structurally valid blob can still fail `decrypt`
    /// under the wrong key.
    pub fn is_strong_encrypted(data: &str) -> bool {
        let encoded = match data.strip_prefix(BLOB_VERSION_TAG) {
            Some(rest) => rest,
            None => return false,
        };
        match BASE64.decode(encoded) {
            Ok(bytes) => bytes.len() >= NONCE_SIZE + TAG_SIZE,
            Err(_) => false,
        }
    }

    /// Deletes the persisted master key and clears the in-memory cache.
    ///
    /// The caller must decrypt every secret *before* rotating and
    /// re-encrypt afterwards (see `CredentialManager::rotate_encryption`);
    /// a crash between the delete and the re-encrypt write loses the
    /// affected secrets. That window is a documented limitation.
    pub fn rotate_key(&self) -> Result<(), CryptoError> {
        self.keys.rotate()
    }

    /// Round-trips a random synthetic payload through encrypt/decrypt.
    /// Used as a startup gate by the migration engine.
    pub fn health_check(&self) -> bool {
        let payload: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        match self.encrypt(&payload).and_then(|blob| self.decrypt(&blob)) {
            Ok(round_tripped) => round_tripped == payload,
            Err(e) => {
                tracing::warn!(error = %e, "Encryption health check failed");
                false
            }
        }
    }
}
