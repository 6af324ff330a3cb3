//! OAuth client-credentials HTTP client
//!
//! Wraps a `reqwest::Client` and attaches a bearer token obtained with the
//! client-credentials grant. The token is fetched on first use and kept
//! until it is about to expire.

use crate::error::{OperatorError, Result};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Scope requested from the token endpoint
pub const DEFAULT_SCOPE: &str = "openid api.iam.service_accounts";

/// Default safety margin before token expiry
const DEFAULT_TOKEN_EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// HTTP settings shared by every admin API client
#[derive(Debug, Clone)]
pub struct AdminClientConfig {
    /// Per-request timeout. `None` leaves bounding to the caller.
    pub request_timeout: Option<Duration>,
    /// Refresh the token this long before it expires
    pub token_expiry_leeway: Duration,
    /// OAuth scope
    pub scope: String,
}

impl Default for AdminClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            token_expiry_leeway: DEFAULT_TOKEN_EXPIRY_LEEWAY,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

/// Client-credentials grant parameters
#[derive(Clone)]
pub struct ClientCredentialsConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl std::fmt::Debug for ClientCredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedToken {
    fn is_expired(&self, leeway: Duration) -> bool {
        self.fetched_at.elapsed().saturating_add(leeway) >= self.ttl
    }
}

/// HTTP client that authenticates every request with an OAuth bearer token
pub struct OAuthClient {
    credentials: ClientCredentialsConfig,
    scope: String,
    leeway: Duration,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl OAuthClient {
    /// Build the client. No token is requested until the first call.
    pub fn new(credentials: ClientCredentialsConfig, config: &AdminClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| {
            OperatorError::InvalidConfig(format!("failed to create admin HTTP client: {}", e))
        })?;

        Ok(Self {
            credentials,
            scope: config.scope.clone(),
            leeway: config.token_expiry_leeway,
            http,
            token: Mutex::new(None),
        })
    }

    /// Underlying HTTP client for building requests
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Attach a bearer token and send.
    ///
    /// A 401 answer drops the cached token so the next call fetches a new
    /// one. The request itself is not retried.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!(client_id = %self.credentials.client_id, "Access token rejected, discarding it");
            self.invalidate_token().await;
        }
        Ok(response)
    }

    /// Current access token, fetching a new one when missing or expiring
    pub async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if !cached.is_expired(self.leeway) {
                return Ok(cached.access_token.clone());
            }
            debug!(client_id = %self.credentials.client_id, "Access token expiring, refreshing");
        }

        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    /// Drop the cached token so the next request fetches a fresh one
    pub async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        debug!(token_url = %self.credentials.token_url, "Requesting client-credentials token");

        let response = self
            .http
            .post(&self.credentials.token_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OperatorError::TokenRequest {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        let ttl = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        info!(
            client_id = %self.credentials.client_id,
            expires_in_secs = ttl.as_secs(),
            "Obtained admin API access token"
        );

        Ok(CachedToken {
            access_token: token.access_token,
            fetched_at: Instant::now(),
            ttl,
        })
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("credentials", &self.credentials)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
