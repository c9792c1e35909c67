//! Credential record validation.
//!
//! Hard errors block use of the record; warnings flag weak but usable
//! values. Non-HTTPS transport is the one policy-dependent check: the
//! hardened profile (default) rejects it, the permissive profile only
//! warns, for installs that talk to a server on a trusted LAN.

use super::CredentialRecord;
use url::Url;

/// Whether a non-HTTPS server URL is a hard error or a warning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Non-HTTPS server URL is a hard error.
    #[default]
    Hardened,
    /// Non-HTTPS server URL is a warning.
    Permissive,
}

/// Outcome of validating a credential record.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub(super) fn validate(record: &CredentialRecord, policy: TransportPolicy) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (name, value) in [
        ("server_url", &record.server_url),
        ("client_id", &record.client_id),
        ("client_secret", &record.client_secret),
        ("username", &record.username),
        ("password", &record.password),
    ] {
        if value.trim().is_empty() {
            errors.push(format!("{} is required", name));
        }
    }

    if !record.server_url.trim().is_empty() {
        match Url::parse(&record.server_url) {
            Ok(parsed) => {
                if parsed.scheme() != "https" {
                    let msg = format!(
                        "server_url uses '{}' instead of https; credentials would travel unprotected",
                        parsed.scheme()
                    );
                    match policy {
                        TransportPolicy::Hardened => errors.push(msg),
                        TransportPolicy::Permissive => warnings.push(msg),
                    }
                }
            }
            Err(_) => {
                errors.push(format!(
                    "server_url '{}' is not an absolute URL",
                    record.server_url
                ));
            }
        }
    }

    if !record.client_id.is_empty() && record.client_id.len() < 8 {
        warnings.push("client_id looks too short (expected at least 8 characters)".to_string());
    }
    if !record.client_secret.is_empty() && record.client_secret.len() < 16 {
        warnings.push("client_secret looks too short (expected at least 16 characters)".to_string());
    }
    if !record.username.is_empty() && record.username.len() < 3 {
        errors.push("username must be at least 3 characters".to_string());
    }
    if !record.password.is_empty() && record.password.len() < 4 {
        warnings.push("password is shorter than 4 characters".to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
