//! Credential record persistence and validation.
//!
//! The durable unit of configuration is a single [`CredentialRecord`]
//! stored as JSON under one store key. The sensitive subset
//! (`client_secret`, `password`, `access_token`, `refresh_token`) is
//! encrypted field-by-field through the [`SecretStore`] before the record
//! is written; it never touches disk in cleartext.
//!
//! Concurrency: `update_config` is read-merge-write with last-write-wins
//! and no locking. Writes originate from a single logical session in the
//! intended deployment, so lost updates between concurrent writers are an
//! accepted non-invariant, not a bug the layer defends against.

mod validation;

pub use validation::{TransportPolicy, ValidationReport};

use crate::crypto::SecretStore;
use crate::error::CredentialError;
use crate::store::{KvStore, StoreChange, CREDENTIAL_RECORD_KEY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Tokens within this margin of expiry are treated as already expired, so
/// a token is never used when it would expire mid-request (absorbs clock
/// skew and in-flight latency).
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

/// Server connection settings, OAuth2 client identity, resource-owner
/// credentials, and the derived session tokens.
///
/// Required fields use empty strings for "unset" so a partially filled
/// record round-trips losslessly; `validate_config` is the authority on
/// completeness.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<i64>,
}

/// Change subscription filtered to the credential record's store key.
pub struct CredentialWatcher {
    rx: broadcast::Receiver<StoreChange>,
    key: String,
}

impl CredentialWatcher {
    /// Waits for the next change to the credential record, skipping
    /// changes to unrelated keys (master key, migration marker).
    pub async fn changed(&mut self) -> Result<StoreChange, broadcast::error::RecvError> {
        loop {
            let change = self.rx.recv().await?;
            if change.key == self.key {
                return Ok(change);
            }
        }
    }
}

/// Persists the credential record, encrypting the sensitive subset.
///
/// Constructed once at startup with explicit store and secret-store
/// handles, then shared by reference with the migration engine and the
/// session client.
pub struct CredentialManager {
    store: Arc<KvStore>,
    secrets: Arc<SecretStore>,
    record_key: String,
    transport_policy: TransportPolicy,
}

impl CredentialManager {
    pub fn new(store: Arc<KvStore>, secrets: Arc<SecretStore>) -> Self {
        Self {
            store,
            secrets,
            record_key: CREDENTIAL_RECORD_KEY.to_string(),
            transport_policy: TransportPolicy::default(),
        }
    }

    /// Overrides the transport policy (default: [`TransportPolicy::Hardened`],
    /// which makes non-HTTPS server URLs a hard validation error).
    pub fn with_transport_policy(mut self, policy: TransportPolicy) -> Self {
        self.transport_policy = policy;
        self
    }

    pub(crate) fn record_key(&self) -> &str {
        &self.record_key
    }

    /// Reads the record as persisted, encrypted blobs included. Used by
    /// the migration engine, which must classify raw field values without
    /// triggering the decrypt path.
    pub(crate) fn read_raw(&self) -> Result<Option<CredentialRecord>, CredentialError> {
        let json = match self.store.get(&self.record_key)? {
            Some(json) => json,
            None => return Ok(None),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn write_raw(&self, record: &CredentialRecord) -> Result<(), CredentialError> {
        let json = serde_json::to_string(record)?;
        self.store.put(&self.record_key, &json)?;
        Ok(())
    }

    /// Returns the decrypted credential record.
    ///
    /// Never fails: an absent record or an unreadable store yields an
    /// empty record, and a field that no longer decrypts (rotated or
    /// corrupted key) is blanked with a warning so the user re-enters it.
    /// Handing a caller undecryptable ciphertext as if it were a password
    /// would fail much later and much more confusingly.
    pub fn get_config(&self) -> CredentialRecord {
        let raw = match self.read_raw() {
            Ok(Some(raw)) => raw,
            Ok(None) => return CredentialRecord::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read credential record, returning empty config");
                return CredentialRecord::default();
            }
        };
        self.decrypt_record(raw)
    }

    fn decrypt_record(&self, raw: CredentialRecord) -> CredentialRecord {
        let mut record = raw;

        record.client_secret = self.decrypt_field("client_secret", record.client_secret);
        record.password = self.decrypt_field("password", record.password);
        record.access_token = record
            .access_token
            .map(|v| self.decrypt_field("access_token", v))
            .filter(|v| !v.is_empty());
        record.refresh_token = record
            .refresh_token
            .map(|v| self.decrypt_field("refresh_token", v))
            .filter(|v| !v.is_empty());

        record
    }

    /// Decrypts one sensitive field. Empty stays empty; a decrypt failure
    /// blanks the field (fail safe, force re-entry).
    fn decrypt_field(&self, name: &'static str, value: String) -> String {
        if value.is_empty() {
            return value;
        }
        match self.secrets.decrypt(&value) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(field = name, error = %e, "Sensitive field failed to decrypt, blanking it");
                String::new()
            }
        }
    }

    fn encrypt_record(&self, record: &CredentialRecord) -> Result<CredentialRecord, CredentialError> {
        let mut raw = record.clone();

        raw.client_secret = self.encrypt_field(&raw.client_secret)?;
        raw.password = self.encrypt_field(&raw.password)?;
        raw.access_token = raw
            .access_token
            .as_deref()
            .map(|v| self.encrypt_field(v))
            .transpose()?;
        raw.refresh_token = raw
            .refresh_token
            .as_deref()
            .map(|v| self.encrypt_field(v))
            .transpose()?;

        Ok(raw)
    }

    fn encrypt_field(&self, value: &str) -> Result<String, CredentialError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        Ok(self.secrets.encrypt(value)?)
    }

    /// Encrypts the sensitive subset and persists the full record,
    /// overwriting whatever was stored.
    pub fn set_config(&self, record: &CredentialRecord) -> Result<(), CredentialError> {
        let raw = self.encrypt_record(record)?;
        self.write_raw(&raw)
    }

    /// Read-merge-write: applies `apply` to the current decrypted record
    /// and persists the result. Last-write-wins; see the module docs.
    pub fn update_config(
        &self,
        apply: impl FnOnce(&mut CredentialRecord),
    ) -> Result<(), CredentialError> {
        let mut record = self.get_config();
        apply(&mut record);
        self.set_config(&record)
    }

    /// Deletes the entire credential record.
    pub fn clear_config(&self) -> Result<(), CredentialError> {
        self.store.delete(&self.record_key)?;
        Ok(())
    }

    /// Validates a record against the configured transport policy.
    pub fn validate_config(&self, record: &CredentialRecord) -> ValidationReport {
        validation::validate(record, self.transport_policy)
    }

    /// True iff the stored record passes validation.
    pub fn is_configured(&self) -> bool {
        self.validate_config(&self.get_config()).valid
    }

    /// Presence check on the five required fields, independent of format
    /// validity. A record can have auth credentials and still fail
    /// validation (e.g., malformed server URL).
    pub fn has_auth_credentials(&self) -> bool {
        let record = self.get_config();
        !record.server_url.is_empty()
            && !record.client_id.is_empty()
            && !record.client_secret.is_empty()
            && !record.username.is_empty()
            && !record.password.is_empty()
    }

    /// True iff an access token is present and more than
    /// [`TOKEN_EXPIRY_MARGIN_SECS`] from expiry.
    pub fn is_token_valid(&self) -> bool {
        let record = self.get_config();
        self.is_token_valid_at(&record, chrono::Utc::now().timestamp())
    }

    fn is_token_valid_at(&self, record: &CredentialRecord, now_secs: i64) -> bool {
        let has_token = record
            .access_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        match (has_token, record.token_expires_at) {
            (true, Some(expires_at)) => expires_at - now_secs > TOKEN_EXPIRY_MARGIN_SECS,
            _ => false,
        }
    }

    /// Dedicated token-write path: updates only the token fields,
    /// computing the absolute expiry from `expires_in_secs`. Static
    /// identity fields are carried over untouched at the blob level, so
    /// this never re-encrypts the client secret or password.
    pub fn save_tokens(
        &self,
        access_token: &str,
        expires_in_secs: i64,
        refresh_token: Option<&str>,
    ) -> Result<(), CredentialError> {
        let mut raw = self.read_raw()?.unwrap_or_default();

        raw.access_token = Some(self.encrypt_field(access_token)?).filter(|v| !v.is_empty());
        if let Some(refresh) = refresh_token {
            raw.refresh_token = Some(self.encrypt_field(refresh)?).filter(|v| !v.is_empty());
        }
        raw.token_expires_at = Some(chrono::Utc::now().timestamp() + expires_in_secs);

        self.write_raw(&raw)
    }

    /// Removes the token fields, preserving static identity and
    /// credentials.
    pub fn clear_tokens(&self) -> Result<(), CredentialError> {
        let mut raw = match self.read_raw()? {
            Some(raw) => raw,
            None => return Ok(()),
        };

        raw.access_token = None;
        raw.refresh_token = None;
        raw.token_expires_at = None;

        self.write_raw(&raw)
    }

    /// Subscribes to changes of the credential record, ignoring unrelated
    /// store keys.
    pub fn watch(&self) -> CredentialWatcher {
        CredentialWatcher {
            rx: self.store.subscribe(),
            key: self.record_key.clone(),
        }
    }

    /// Re-encrypts every sensitive field under a fresh master key.
    ///
    /// Sequence: decrypt all fields under the old key, delete the old key,
    /// re-encrypt and persist under the (lazily generated) new key. A
    /// crash between the delete and the final write loses the sensitive
    /// fields; this window is documented rather than papered over.
    pub fn rotate_encryption(&self) -> Result<(), CredentialError> {
        let plaintext = self.get_config();
        self.secrets.rotate_key()?;
        self.set_config(&plaintext)
    }
}
