//! Error types for the credential, migration, and session layers.
//!
//! Crypto and store failures carry enough structure for callers to decide
//! between recovery (blank a field, return an empty record) and surfacing
//! (a failed write the user must react to). Session errors distinguish
//! credential rejection, terminal API failures, and retryable transport
//! failures.

use std::time::Duration;
use thiserror::Error;

/// Failures of the authenticated-encryption layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Empty plaintext or empty blob.
    #[error("input is empty")]
    EmptyInput,

    /// Input is not a recognizable encrypted blob (bad version tag, bad
    /// base64, or shorter than nonce + tag).
    #[error("malformed encrypted blob: {0}")]
    MalformedInput(String),

    /// AEAD tag verification failed: wrong key or corrupted data.
    #[error("decryption failed: wrong key or corrupted data")]
    AuthenticationFailed,

    /// The master key could not be loaded, generated, or persisted.
    #[error("master key unavailable: {0}")]
    KeyUnavailable(String),
}

/// Failures of the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation failed: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Failures of the credential manager.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The underlying store rejected a write (e.g., disk full).
    #[error("failed to persist credential record: {0}")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("failed to encode credential record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode migration marker: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The encryption layer failed its round-trip health check; migrating
    /// (or wiping for re-enrollment) would destroy data we cannot rewrite.
    #[error("encryption layer failed health check")]
    Unhealthy,
}

/// Failures of the session client.
///
/// The variants separate the causes a caller must report differently:
/// rejected credentials, a terminal API response, an unreachable server,
/// and a malformed server URL.
#[derive(Debug, Error)]
pub enum ApiClientError {
    /// OAuth-level rejection: bad credentials or an invalid/expired token
    /// that could not be recovered by refresh or re-authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Terminal (or retry-exhausted) API failure.
    #[error("API request failed with status {status}: {description}")]
    Api { status: u16, description: String },

    /// Transport-level failure: connection refused, DNS, reset.
    #[error("network error: {0}")]
    Network(String),

    /// The per-request timeout elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The configured server URL does not parse as an absolute URL.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Successful status but a response body we cannot interpret.
    #[error("unexpected response format: {0}")]
    Format(String),

    /// Persisting tokens after a successful grant failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl ApiClientError {
    /// True for failures worth retrying: transport errors and timeouts.
    /// HTTP-level retry decisions are made on the response status before
    /// an error is constructed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiClientError::Network(_) | ApiClientError::Timeout(_))
    }
}
