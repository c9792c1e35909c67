//! OAuth2 session client for the wallabag entries API.
//!
//! Every API call resolves a valid access token first: the cached token
//! if it is not near expiry, otherwise a refresh-token exchange, falling
//! back to a full password grant when the refresh token is rejected. The
//! refresh/re-auth path runs behind a single-flight lock so a burst of
//! concurrent calls hitting an expired token performs one grant request,
//! not one per caller.
//!
//! Endpoints (relative to the configured server URL):
//! - `POST /oauth/v2/token` — form-encoded, grants `password` and
//!   `refresh_token`
//! - `POST/GET /api/entries.json`, `GET /api/entries/{id}.json` — JSON,
//!   bearer authorization

mod retry;

pub use retry::RetryPolicy;

use crate::credentials::{CredentialManager, CredentialRecord};
use crate::error::ApiClientError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful OAuth token response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth/REST error body; servers fill some subset of these.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A saved entry as returned by the server.
#[derive(Clone, Debug, Deserialize)]
pub struct Entry {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Payload for saving a page.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NewEntry {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Comma-separated tag labels, per the wallabag API contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starred: Option<u8>,
}

/// Paging filter for `get_entries`.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntriesQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub archive: Option<bool>,
    pub starred: Option<bool>,
}

impl EntriesQuery {
    fn to_params(self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(page) = self.page {
            params.push(("page", page.to_string()));
        }
        if let Some(per_page) = self.per_page {
            params.push(("perPage", per_page.to_string()));
        }
        if let Some(archive) = self.archive {
            params.push(("archive", u8::from(archive).to_string()));
        }
        if let Some(starred) = self.starred {
            params.push(("starred", u8::from(starred).to_string()));
        }
        params
    }
}

/// One page of entries (the server's HAL envelope, flattened).
#[derive(Clone, Debug, Deserialize)]
pub struct EntriesPage {
    pub page: u32,
    pub pages: u32,
    pub total: u32,
    #[serde(rename = "_embedded")]
    embedded: EmbeddedEntries,
}

#[derive(Clone, Debug, Deserialize)]
struct EmbeddedEntries {
    items: Vec<Entry>,
}

impl EntriesPage {
    pub fn items(&self) -> &[Entry] {
        &self.embedded.items
    }
}

/// Authenticated client for the token endpoint and the entries API.
pub struct SessionClient {
    credentials: Arc<CredentialManager>,
    http: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
    /// Single-flight gate around the refresh/re-auth path. Waiters
    /// re-check token validity after acquiring it, so one grant request
    /// serves a whole burst of expired-token callers.
    refresh_gate: Mutex<()>,
}

impl SessionClient {
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self::with_options(credentials, RetryPolicy::default(), DEFAULT_TIMEOUT)
    }

    /// Creates a client with explicit retry and timeout settings (tests
    /// use a millisecond backoff base).
    pub fn with_options(
        credentials: Arc<CredentialManager>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            credentials,
            http,
            retry,
            timeout,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Normalizes and validates the configured server URL.
    fn base_url(record: &CredentialRecord) -> Result<String, ApiClientError> {
        let parsed = Url::parse(&record.server_url)
            .map_err(|_| ApiClientError::InvalidUrl(record.server_url.clone()))?;
        Ok(parsed.as_str().trim_end_matches('/').to_string())
    }

    fn token_url(record: &CredentialRecord) -> Result<String, ApiClientError> {
        Ok(format!("{}/oauth/v2/token", Self::base_url(record)?))
    }

    /// Sends a request with retry/backoff.
    ///
    /// Retryable: timeout, transport failure, HTTP 5xx, HTTP 429 — up to
    /// `max_attempts` total. Terminal HTTP statuses are returned to the
    /// caller unretried for endpoint-specific wrapping.
    async fn execute(
        &self,
        op: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApiClientError> {
        let mut attempt = 1u32;
        loop {
            let this_attempt = request
                .try_clone()
                .ok_or_else(|| ApiClientError::Format("request body is not replayable".into()))?;

            let failure = match this_attempt.send().await {
                Ok(resp) if retry::is_retryable_status(resp.status()) => {
                    Self::api_error(resp).await
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_timeout() => ApiClientError::Timeout(self.timeout),
                Err(e) => ApiClientError::Network(e.to_string()),
            };

            if attempt >= self.retry.max_attempts {
                return Err(failure);
            }

            let delay = self.retry.backoff_delay(attempt);
            warn!(
                op,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Request failed, backing off before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Builds an [`ApiClientError::Api`] from an error response, pulling
    /// the server's `error_description` (or `message`) when present.
    async fn api_error(resp: reqwest::Response) -> ApiClientError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let description = parsed
            .error_description
            .or(parsed.message)
            .or(parsed.error)
            .unwrap_or_else(|| {
                if body.is_empty() {
                    "no response body".to_string()
                } else {
                    body.chars().take(200).collect()
                }
            });
        ApiClientError::Api { status, description }
    }

    /// Parses a successful JSON response, treating a non-JSON content
    /// type as a format error rather than feeding HTML to the decoder.
    async fn parse_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiClientError> {
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("application/json") {
            return Err(ApiClientError::Format(format!(
                "expected application/json, got '{}'",
                content_type
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ApiClientError::Format(e.to_string()))
    }

    /// OAuth2 password grant using the given record's identity and
    /// resource-owner credentials. Persists tokens on success.
    pub async fn authenticate(
        &self,
        record: &CredentialRecord,
    ) -> Result<TokenResponse, ApiClientError> {
        let token_url = Self::token_url(record)?;
        debug!(url = %token_url, "Requesting password grant");

        let form = [
            ("grant_type", "password"),
            ("client_id", record.client_id.as_str()),
            ("client_secret", record.client_secret.as_str()),
            ("username", record.username.as_str()),
            ("password", record.password.as_str()),
        ];

        let resp = self
            .execute("authenticate", self.http.post(&token_url).form(&form))
            .await?;

        if !resp.status().is_success() {
            let err = Self::api_error(resp).await;
            return Err(auth_rejection(err));
        }

        let token: TokenResponse = Self::parse_json(resp).await?;
        self.persist_tokens(&token)?;
        info!("Authenticated via password grant");
        Ok(token)
    }

    /// OAuth2 refresh-token grant. Persists new tokens on success; on an
    /// HTTP-level rejection clears the stored tokens — a refused refresh
    /// token is dead, keeping it would just repeat the failure.
    pub async fn refresh(
        &self,
        record: &CredentialRecord,
    ) -> Result<TokenResponse, ApiClientError> {
        let token_url = Self::token_url(record)?;
        let refresh_token = record
            .refresh_token
            .as_deref()
            .ok_or_else(|| ApiClientError::Auth("no refresh token stored".into()))?;

        debug!(url = %token_url, "Requesting refresh-token grant");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", record.client_id.as_str()),
            ("client_secret", record.client_secret.as_str()),
        ];

        let resp = self
            .execute("refresh", self.http.post(&token_url).form(&form))
            .await?;

        if !resp.status().is_success() {
            let err = Self::api_error(resp).await;
            warn!(error = %err, "Refresh token rejected, clearing stored tokens");
            self.credentials.clear_tokens()?;
            return Err(auth_rejection(err));
        }

        let token: TokenResponse = Self::parse_json(resp).await?;
        self.persist_tokens(&token)?;
        info!("Access token refreshed");
        Ok(token)
    }

    fn persist_tokens(&self, token: &TokenResponse) -> Result<(), ApiClientError> {
        self.credentials.save_tokens(
            &token.access_token,
            token.expires_in.unwrap_or(3600),
            token.refresh_token.as_deref(),
        )?;
        Ok(())
    }

    /// Returns an access token that is valid for at least the expiry
    /// margin, refreshing or re-authenticating as needed.
    ///
    /// Resolution order: cached token → refresh-token grant → password
    /// grant. A refresh rejection falls through to the password grant;
    /// only when no path is viable does this fail with `Auth`.
    pub async fn get_valid_access_token(&self) -> Result<String, ApiClientError> {
        if let Some(token) = self.cached_valid_token() {
            return Ok(token);
        }

        let _flight = self.refresh_gate.lock().await;

        // A concurrent caller may have refreshed while we waited
        if let Some(token) = self.cached_valid_token() {
            debug!("Token refreshed by a concurrent caller, reusing it");
            return Ok(token);
        }

        let record = self.credentials.get_config();

        let can_refresh = record.refresh_token.is_some()
            && !record.client_id.is_empty()
            && !record.client_secret.is_empty();
        if can_refresh {
            match self.refresh(&record).await {
                Ok(token) => return Ok(token.access_token),
                Err(e) if matches!(e, ApiClientError::Auth(_)) => {
                    warn!(error = %e, "Refresh failed, falling back to password grant");
                }
                // Transport-level failures are not a verdict on the
                // refresh token; surface them instead of burning the
                // user's credentials on an unreachable server.
                Err(e) => return Err(e),
            }
        }

        let can_authenticate = !record.username.is_empty()
            && !record.password.is_empty()
            && !record.client_id.is_empty()
            && !record.client_secret.is_empty();
        if can_authenticate {
            // Tokens may have been cleared by the failed refresh; re-read
            // so the grant sees current state.
            let record = self.credentials.get_config();
            let token = self.authenticate(&record).await?;
            return Ok(token.access_token);
        }

        Err(ApiClientError::Auth(
            "no usable credentials: configure server URL, client identity, username, and password"
                .into(),
        ))
    }

    fn cached_valid_token(&self) -> Option<String> {
        if self.credentials.is_token_valid() {
            self.credentials.get_config().access_token
        } else {
            None
        }
    }

    /// Saves a page to the server.
    pub async fn create_entry(&self, entry: &NewEntry) -> Result<Entry, ApiClientError> {
        let token = self.get_valid_access_token().await?;
        let record = self.credentials.get_config();
        let url = format!("{}/api/entries.json", Self::base_url(&record)?);

        let resp = self
            .execute(
                "create_entry",
                self.http.post(&url).bearer_auth(&token).json(entry),
            )
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        let created: Entry = Self::parse_json(resp).await?;
        info!(id = created.id, url = %entry.url, "Entry created");
        Ok(created)
    }

    /// Lists entries, newest first, with optional paging filters.
    pub async fn get_entries(&self, query: EntriesQuery) -> Result<EntriesPage, ApiClientError> {
        let token = self.get_valid_access_token().await?;
        let record = self.credentials.get_config();
        let url = format!("{}/api/entries.json", Self::base_url(&record)?);

        let resp = self
            .execute(
                "get_entries",
                self.http
                    .get(&url)
                    .bearer_auth(&token)
                    .query(&query.to_params()),
            )
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Self::parse_json(resp).await
    }

    /// Fetches a single entry by id.
    pub async fn get_entry(&self, id: i64) -> Result<Entry, ApiClientError> {
        let token = self.get_valid_access_token().await?;
        let record = self.credentials.get_config();
        let url = format!("{}/api/entries/{}.json", Self::base_url(&record)?, id);

        let resp = self
            .execute("get_entry", self.http.get(&url).bearer_auth(&token))
            .await?;

        if !resp.status().is_success() {
            return Err(Self::api_error(resp).await);
        }
        Self::parse_json(resp).await
    }

    /// Verifies the full chain: URL, credentials, token, and a minimal
    /// authenticated read. The error variant tells the caller whether the
    /// problem is the URL, the credentials, or the network.
    pub async fn test_connection(&self) -> Result<(), ApiClientError> {
        self.get_entries(EntriesQuery {
            per_page: Some(1),
            ..Default::default()
        })
        .await?;
        Ok(())
    }
}

/// A terminal HTTP response from the token endpoint is a credential or
/// token rejection, not a generic API failure.
fn auth_rejection(err: ApiClientError) -> ApiClientError {
    match err {
        ApiClientError::Api { status, description } => {
            ApiClientError::Auth(format!("server rejected the grant ({}): {}", status, description))
        }
        other => other,
    }
}
