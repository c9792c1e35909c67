//! Master-key lifecycle.
//!
//! One 256-bit key per installation: generated on first use, persisted
//! base64-encoded in the durable store, and cached in memory for the
//! process lifetime. The cache zeroizes key bytes on drop.
//!
//! The persisted key lives in the same store as the ciphertext it
//! protects. This mirrors the deployment's storage model (a single local
//! store, no platform keychain) and is a documented threat-model
//! limitation, not a guarantee: anyone with store access gets both.

use crate::error::{CryptoError, StoreError};
use crate::store::KvStore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

/// Size of the master key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Loads, generates, caches, and rotates the master key.
pub struct MasterKeyCell {
    store: Arc<KvStore>,
    store_key: String,
    cached: RwLock<Option<Zeroizing<[u8; KEY_SIZE]>>>,
}

impl MasterKeyCell {
    pub fn new(store: Arc<KvStore>, store_key: impl Into<String>) -> Self {
        Self {
            store,
            store_key: store_key.into(),
            cached: RwLock::new(None),
        }
    }

    /// Returns the master key, loading or generating it as needed.
    ///
    /// A persisted key that fails to decode is an error, not a trigger for
    /// regeneration: silently minting a new key would orphan every
    /// existing ciphertext.
    pub fn obtain(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        if let Some(key) = self.cached.read().unwrap().as_ref() {
            return Ok(key.clone());
        }

        let mut cached = self.cached.write().unwrap();
        // Another caller may have filled the cache while we waited
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.read_persisted()? {
            Some(key) => key,
            None => self.generate_and_persist()?,
        };

        *cached = Some(key.clone());
        Ok(key)
    }

    fn read_persisted(&self) -> Result<Option<Zeroizing<[u8; KEY_SIZE]>>, CryptoError> {
        let encoded = match self.store.get(&self.store_key).map_err(store_err)? {
            Some(encoded) => encoded,
            None => return Ok(None),
        };

        let bytes = Zeroizing::new(
            BASE64
                .decode(&encoded)
                .map_err(|_| CryptoError::KeyUnavailable("persisted key is not valid base64".into()))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::KeyUnavailable(format!(
                "persisted key is {} bytes, expected {}",
                bytes.len(),
                KEY_SIZE
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    fn generate_and_persist(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(key.as_mut());

        self.store
            .put(&self.store_key, &BASE64.encode(key.as_ref()))
            .map_err(store_err)?;

        tracing::info!("Generated new master key");
        Ok(key)
    }

    /// Deletes the persisted key and clears the in-memory cache.
    ///
    /// The caller must re-encrypt all secrets under a fresh key (obtained
    /// lazily on the next `obtain`), or the data they protect is lost.
    pub fn rotate(&self) -> Result<(), CryptoError> {
        self.store.delete(&self.store_key).map_err(store_err)?;
        *self.cached.write().unwrap() = None;
        tracing::info!("Master key rotated: persisted key deleted, cache cleared");
        Ok(())
    }
}

fn store_err(e: StoreError) -> CryptoError {
    CryptoError::KeyUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MASTER_KEY_KEY;

    fn make_cell() -> (Arc<KvStore>, MasterKeyCell) {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let cell = MasterKeyCell::new(Arc::clone(&store), MASTER_KEY_KEY);
        (store, cell)
    }

    #[test]
    fn test_generates_once_and_persists() {
        let (store, cell) = make_cell();

        let key1 = cell.obtain().unwrap();
        let key2 = cell.obtain().unwrap();
        assert_eq!(key1.as_ref(), key2.as_ref());

        // Persisted form decodes to the same 32 bytes
        let encoded = store.get(MASTER_KEY_KEY).unwrap().unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, key1.as_ref());
    }

    #[test]
    fn test_reloads_persisted_key() {
        let (store, cell) = make_cell();
        let key1 = cell.obtain().unwrap();

        // Fresh cell over the same store sees the same key
        let cell2 = MasterKeyCell::new(store, MASTER_KEY_KEY);
        let key2 = cell2.obtain().unwrap();
        assert_eq!(key1.as_ref(), key2.as_ref());
    }

    #[test]
    fn test_rotation_yields_new_key() {
        let (_store, cell) = make_cell();
        let key1 = cell.obtain().unwrap();

        cell.rotate().unwrap();
        let key2 = cell.obtain().unwrap();
        assert_ne!(key1.as_ref(), key2.as_ref());
    }

    #[test]
    fn test_corrupt_persisted_key_is_an_error() {
        let (store, cell) = make_cell();

        store.put(MASTER_KEY_KEY, "not-base64!@#$").unwrap();
        assert!(matches!(
            cell.obtain(),
            Err(CryptoError::KeyUnavailable(_))
        ));

        // Wrong length
        store.put(MASTER_KEY_KEY, &BASE64.encode([0u8; 16])).unwrap();
        assert!(matches!(
            cell.obtain(),
            Err(CryptoError::KeyUnavailable(_))
        ));
    }
}
