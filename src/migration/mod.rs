//! Migration of legacy-encoded secrets to authenticated encryption.
//!
//! Early releases persisted sensitive fields as plain base64. This engine
//! detects those fields, decodes them, and rewrites the whole record
//! through the credential manager so every sensitive field ends up
//! uniformly encrypted. A marker record keeps migration from re-running
//! on every startup; an error marker records a failed attempt without
//! touching the original record, so retrying is always safe.

use crate::credentials::{CredentialManager, CredentialRecord};
use crate::crypto::SecretStore;
use crate::error::MigrationError;
use crate::store::{KvStore, MIGRATION_MARKER_KEY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current migration format version. Version 1 was the legacy plain-base64
/// era; records marked with the current version are fully encrypted.
pub const MIGRATION_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Completed,
    Error,
}

/// Persisted migration state, distinct from the credential record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationMarker {
    pub version: u32,
    pub status: MigrationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompatibilityStatus {
    Ready,
    NeedsMigration,
    Error,
}

/// Startup gate: can we migrate, and do we need to?
#[derive(Clone, Debug)]
pub struct CompatibilityReport {
    pub crypto_available: bool,
    pub legacy_detection_available: bool,
    pub encryption_healthy: bool,
    pub status: CompatibilityStatus,
}

/// Outcome of a migration run.
#[derive(Clone, Debug, Default)]
pub struct MigrationOutcome {
    /// Whether the credential record was rewritten.
    pub changed: bool,
    /// Fields imported from the legacy encoding.
    pub migrated_fields: Vec<&'static str>,
    /// Fields that were neither encrypted nor legacy-encoded and were
    /// blanked so they never fail silently later.
    pub blanked_fields: Vec<&'static str>,
}

/// Detects legacy-encoded secrets and converts them to strong encryption.
pub struct MigrationEngine {
    store: Arc<KvStore>,
    secrets: Arc<SecretStore>,
    credentials: Arc<CredentialManager>,
    marker_key: String,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<KvStore>,
        secrets: Arc<SecretStore>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        Self {
            store,
            secrets,
            credentials,
            marker_key: MIGRATION_MARKER_KEY.to_string(),
        }
    }

    fn read_marker(&self) -> Option<MigrationMarker> {
        let json = self.store.get(&self.marker_key).ok().flatten()?;
        match serde_json::from_str(&json) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(error = %e, "Migration marker is unreadable, treating as absent");
                None
            }
        }
    }

    fn write_marker(&self, status: MigrationStatus, error: Option<String>) -> Result<(), MigrationError> {
        let marker = MigrationMarker {
            version: MIGRATION_VERSION,
            status,
            timestamp: Utc::now(),
            error,
        };
        self.store.put(&self.marker_key, &serde_json::to_string(&marker)?)?;
        Ok(())
    }

    /// True when no completed marker for the current version exists. A
    /// marker left by a failed attempt also counts: the record was not
    /// rewritten, so the work is still outstanding.
    pub fn needs_migration(&self) -> bool {
        match self.read_marker() {
            Some(marker) => {
                marker.version != MIGRATION_VERSION || marker.status != MigrationStatus::Completed
            }
            None => true,
        }
    }

    /// Verifies the migration prerequisites: the cipher constructs, legacy
    /// detection recognizes a synthetic sample, and encryption round-trips.
    pub fn compatibility_check(&self) -> CompatibilityReport {
        let crypto_available = self.secrets.encrypt("probe").is_ok();
        let legacy_detection_available = {
            use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
            SecretStore::is_legacy_encoded(&BASE64.encode("synthetic-sample"))
                && !SecretStore::is_legacy_encoded("not base64 at all!")
        };
        let encryption_healthy = self.secrets.health_check();

        let status = if !crypto_available || !legacy_detection_available || !encryption_healthy {
            CompatibilityStatus::Error
        } else if self.needs_migration() {
            CompatibilityStatus::NeedsMigration
        } else {
            CompatibilityStatus::Ready
        };

        CompatibilityReport {
            crypto_available,
            legacy_detection_available,
            encryption_healthy,
            status,
        }
    }

    /// Migrates the credential record to the current format.
    ///
    /// Reads the raw record (bypassing the credential manager's decrypt
    /// path), classifies each sensitive field, stages plaintext for every
    /// recognizable value, blanks anything unrecognizable, and rewrites
    /// the record once through `set_config` so all fields come out
    /// uniformly encrypted. On failure the error marker is written and the
    /// original record is left untouched.
    pub fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        if !self.needs_migration() {
            debug!("Migration marker is current, nothing to do");
            return Ok(MigrationOutcome::default());
        }

        match self.migrate_record() {
            Ok(outcome) => {
                self.write_marker(MigrationStatus::Completed, None)?;
                info!(
                    changed = outcome.changed,
                    migrated = ?outcome.migrated_fields,
                    blanked = ?outcome.blanked_fields,
                    "Credential migration completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "Credential migration failed, original record untouched");
                // Best effort: the migration error is the one worth surfacing
                if let Err(marker_err) = self.write_marker(MigrationStatus::Error, Some(e.to_string())) {
                    warn!(error = %marker_err, "Failed to write error marker");
                }
                Err(e)
            }
        }
    }

    fn migrate_record(&self) -> Result<MigrationOutcome, MigrationError> {
        let raw = match self.credentials.read_raw()? {
            Some(raw) => raw,
            None => {
                debug!("No credential record, marking migration complete");
                return Ok(MigrationOutcome::default());
            }
        };

        let mut staged = raw.clone();
        let mut outcome = MigrationOutcome::default();
        let mut any_present = false;

        let fields: [(&'static str, &mut String); 4] = [
            ("client_secret", &mut staged.client_secret),
            ("password", &mut staged.password),
            ("access_token", staged_option(&mut staged.access_token)),
            ("refresh_token", staged_option(&mut staged.refresh_token)),
        ];

        for (name, value) in fields {
            if value.is_empty() {
                continue;
            }
            any_present = true;

            if SecretStore::is_strong_encrypted(value) {
                match self.secrets.decrypt(value) {
                    Ok(plaintext) => *value = plaintext,
                    Err(e) => {
                        warn!(field = name, error = %e, "Encrypted field failed to decrypt, blanking");
                        value.clear();
                        outcome.blanked_fields.push(name);
                    }
                }
            } else if SecretStore::is_legacy_encoded(value) {
                // Round-trip already verified by the classifier
                use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
                let decoded = BASE64.decode(value.as_bytes()).unwrap_or_default();
                *value = String::from_utf8(decoded).unwrap_or_default();
                outcome.migrated_fields.push(name);
            } else {
                warn!(field = name, "Unrecognized field format, blanking to force re-entry");
                value.clear();
                outcome.blanked_fields.push(name);
            }
        }

        staged.access_token = staged.access_token.take().filter(|v| !v.is_empty());
        staged.refresh_token = staged.refresh_token.take().filter(|v| !v.is_empty());

        if any_present {
            self.credentials.set_config(&staged)?;
            outcome.changed = true;
        }

        Ok(outcome)
    }

    /// Startup entry point. A failed prerequisite logs and returns rather
    /// than erroring: running one more session with legacy-encoded secrets
    /// beats refusing to start at all.
    pub fn auto_migrate(&self) -> Result<(), MigrationError> {
        let report = self.compatibility_check();
        match report.status {
            CompatibilityStatus::Error => {
                warn!(
                    crypto_available = report.crypto_available,
                    legacy_detection_available = report.legacy_detection_available,
                    encryption_healthy = report.encryption_healthy,
                    "Migration prerequisites unmet, skipping migration this session"
                );
                Ok(())
            }
            CompatibilityStatus::NeedsMigration => self.migrate().map(|_| ()),
            CompatibilityStatus::Ready => Ok(()),
        }
    }

    /// Destructive escape hatch: wipes the credential record, the master
    /// key, and the marker, forcing full re-enrollment. Refuses to run
    /// when the encryption layer is unhealthy, because re-enrollment
    /// would be impossible afterwards.
    pub fn force_full_migration(&self) -> Result<(), MigrationError> {
        if !self.secrets.health_check() {
            return Err(MigrationError::Unhealthy);
        }

        warn!("Forcing full migration: wiping credential record, master key, and marker");
        self.credentials.clear_config()?;
        self.secrets
            .rotate_key()
            .map_err(crate::error::CredentialError::from)?;
        self.store.delete(&self.marker_key)?;
        Ok(())
    }
}

/// Treats `None` as an empty staging slot so all four sensitive fields
/// can be classified through the same `&mut String` loop.
fn staged_option(slot: &mut Option<String>) -> &mut String {
    slot.get_or_insert_with(String::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use crate::store::CREDENTIAL_RECORD_KEY;

    struct Harness {
        store: Arc<KvStore>,
        secrets: Arc<SecretStore>,
        credentials: Arc<CredentialManager>,
        engine: MigrationEngine,
    }

    fn make_harness() -> Harness {
        let store = Arc::new(KvStore::open_in_memory().unwrap());
        let secrets = Arc::new(SecretStore::new(Arc::clone(&store)));
        let credentials = Arc::new(CredentialManager::new(
            Arc::clone(&store),
            Arc::clone(&secrets),
        ));
        let engine = MigrationEngine::new(
            Arc::clone(&store),
            Arc::clone(&secrets),
            Arc::clone(&credentials),
        );
        Harness {
            store,
            secrets,
            credentials,
            engine,
        }
    }

    fn legacy_record() -> CredentialRecord {
        CredentialRecord {
            server_url: "https://wallabag.example.org".to_string(),
            client_id: "client_12345678".to_string(),
            client_secret: BASE64.encode("secret_0123456789abcdef"),
            username: "alice".to_string(),
            password: BASE64.encode("s3cret"),
            access_token: Some(BASE64.encode("old-access")),
            refresh_token: Some(BASE64.encode("old-refresh")),
            token_expires_at: Some(1_700_000_000),
        }
    }

    fn write_raw(store: &KvStore, record: &CredentialRecord) {
        store
            .put(
                CREDENTIAL_RECORD_KEY,
                &serde_json::to_string(record).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn test_needs_migration_fresh_store() {
        let h = make_harness();
        assert!(h.engine.needs_migration());
    }

    #[test]
    fn test_compatibility_check_ready_flow() {
        let h = make_harness();

        let report = h.engine.compatibility_check();
        assert!(report.crypto_available);
        assert!(report.legacy_detection_available);
        assert!(report.encryption_healthy);
        assert_eq!(report.status, CompatibilityStatus::NeedsMigration);

        h.engine.migrate().unwrap();
        assert_eq!(
            h.engine.compatibility_check().status,
            CompatibilityStatus::Ready
        );
    }

    #[test]
    fn test_migrates_legacy_fields() {
        let h = make_harness();
        write_raw(&h.store, &legacy_record());

        let outcome = h.engine.migrate().unwrap();
        assert!(outcome.changed);
        assert_eq!(
            outcome.migrated_fields,
            vec!["client_secret", "password", "access_token", "refresh_token"]
        );
        assert!(outcome.blanked_fields.is_empty());

        // Decrypted view shows the original plaintext
        let record = h.credentials.get_config();
        assert_eq!(record.client_secret, "secret_0123456789abcdef");
        assert_eq!(record.password, "s3cret");
        assert_eq!(record.access_token.as_deref(), Some("old-access"));
        assert_eq!(record.refresh_token.as_deref(), Some("old-refresh"));
        // Non-sensitive fields carried over
        assert_eq!(record.username, "alice");
        assert_eq!(record.token_expires_at, Some(1_700_000_000));

        // At rest, everything sensitive is now a versioned blob
        let raw = h.credentials.read_raw().unwrap().unwrap();
        assert!(SecretStore::is_strong_encrypted(&raw.password));
        assert!(SecretStore::is_strong_encrypted(&raw.client_secret));
        assert!(SecretStore::is_strong_encrypted(
            raw.access_token.as_deref().unwrap()
        ));
    }

    #[test]
    fn test_migration_is_idempotent() {
        let h = make_harness();
        write_raw(&h.store, &legacy_record());

        let first = h.engine.migrate().unwrap();
        assert!(first.changed);
        assert!(!h.engine.needs_migration());

        let raw_after_first = h.store.get(CREDENTIAL_RECORD_KEY).unwrap();

        // Second run is a no-op: no rewrite, marker version matches
        let second = h.engine.migrate().unwrap();
        assert!(!second.changed);
        assert!(second.migrated_fields.is_empty());
        assert_eq!(h.store.get(CREDENTIAL_RECORD_KEY).unwrap(), raw_after_first);
    }

    #[test]
    fn test_already_encrypted_record_reencrypted_uniformly() {
        let h = make_harness();

        // A record written through the manager is already fully encrypted
        let mut record = legacy_record();
        record.client_secret = "secret_0123456789abcdef".to_string();
        record.password = "s3cret".to_string();
        record.access_token = None;
        record.refresh_token = None;
        h.credentials.set_config(&record).unwrap();

        let outcome = h.engine.migrate().unwrap();
        assert!(outcome.changed);
        assert!(outcome.migrated_fields.is_empty());
        assert!(outcome.blanked_fields.is_empty());

        let decrypted = h.credentials.get_config();
        assert_eq!(decrypted.password, "s3cret");
    }

    #[test]
    fn test_unrecognized_field_blanked() {
        let h = make_harness();
        let mut record = legacy_record();
        // Not base64, not a versioned blob
        record.password = "garbage!@#$%".to_string();
        write_raw(&h.store, &record);

        let outcome = h.engine.migrate().unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.blanked_fields, vec!["password"]);

        let migrated = h.credentials.get_config();
        assert_eq!(migrated.password, "");
        // Recognizable siblings still imported
        assert_eq!(migrated.client_secret, "secret_0123456789abcdef");
    }

    #[test]
    fn test_empty_record_completes_without_write() {
        let h = make_harness();

        let outcome = h.engine.migrate().unwrap();
        assert!(!outcome.changed);
        assert!(!h.engine.needs_migration());
        assert!(h.store.get(CREDENTIAL_RECORD_KEY).unwrap().is_none());
    }

    #[test]
    fn test_auto_migrate_runs_once() {
        let h = make_harness();
        write_raw(&h.store, &legacy_record());

        h.engine.auto_migrate().unwrap();
        assert!(!h.engine.needs_migration());
        assert_eq!(h.credentials.get_config().password, "s3cret");

        // Second startup: ready, no-op
        h.engine.auto_migrate().unwrap();
    }

    #[test]
    fn test_force_full_migration_wipes_everything() {
        let h = make_harness();
        write_raw(&h.store, &legacy_record());
        h.engine.migrate().unwrap();

        h.engine.force_full_migration().unwrap();

        assert!(h.store.get(CREDENTIAL_RECORD_KEY).unwrap().is_none());
        assert!(h.store.get(crate::store::MASTER_KEY_KEY).unwrap().is_none());
        assert!(h.store.get(MIGRATION_MARKER_KEY).unwrap().is_none());
        assert!(h.engine.needs_migration());

        // Encryption still works for re-enrollment
        assert!(h.secrets.health_check());
    }

    #[test]
    fn test_marker_serialization() {
        let marker = MigrationMarker {
            version: MIGRATION_VERSION,
            status: MigrationStatus::Completed,
            timestamp: Utc::now(),
            error: None,
        };
        let json = serde_json::to_string(&marker).unwrap();
        assert!(json.contains("\"completed\""));
        assert!(!json.contains("error"));

        let parsed: MigrationMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, MIGRATION_VERSION);
        assert_eq!(parsed.status, MigrationStatus::Completed);
    }
}
