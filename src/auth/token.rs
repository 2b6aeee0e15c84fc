//! Outbound credentials: client-credentials tokens from the identity
//! provider, and static bearer tokens.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::normalize_domain;
use crate::clock::{self, SharedClock};
use crate::{Error, Result};

/// Tokens are renewed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Something that yields a bearer token for outbound requests
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token (without the `Bearer ` prefix)
    async fn bearer(&self) -> Result<String>;
}

/// A fixed token
#[derive(Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticCredential(***)")
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn bearer(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Client-credentials grant parameters
#[derive(Clone, Serialize)]
pub struct ClientCredentials {
    /// Token endpoint
    #[serde(skip)]
    pub token_url: String,
    /// Client id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// API audience the token is for
    pub audience: String,
}

impl ClientCredentials {
    /// Credentials for a hosted tenant: token endpoint `https://{domain}/oauth/token`
    pub fn for_domain(
        domain: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            token_url: format!("https://{}/oauth/token", normalize_domain(domain)),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience: audience.into(),
        }
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("audience", &self.audience)
            .finish()
    }
}

#[derive(Serialize)]
struct GrantRequest<'a> {
    grant_type: &'static str,
    #[serde(flatten)]
    credentials: &'a ClientCredentials,
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// The bearer token
    pub access_token: String,
    /// Usually "Bearer"
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    /// Granted scopes
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct GrantError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Fetches and caches client-credentials tokens
pub struct TokenClient {
    http: reqwest::Client,
    credentials: ClientCredentials,
    clock: SharedClock,
    cached: Mutex<Option<(TokenGrant, Option<Instant>)>>,
}

impl TokenClient {
    /// Client for `credentials`
    #[must_use]
    pub fn new(http: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            clock: clock::system(),
            cached: Mutex::new(None),
        }
    }

    /// Use a specific clock for expiry
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The configured credentials
    #[must_use]
    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// Request a fresh token, bypassing the cache
    pub async fn fetch(&self) -> Result<TokenGrant> {
        debug!(
            token_url = %self.credentials.token_url,
            client_id = %self.credentials.client_id,
            "Requesting client-credentials token"
        );
        let response = self
            .http
            .post(&self.credentials.token_url)
            .json(&GrantRequest {
                grant_type: "client_credentials",
                credentials: &self.credentials,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<GrantError>()
                .await
                .ok()
                .and_then(|e| e.error_description.or(e.error))
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Transport(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }

        let grant: TokenGrant = response.json().await?;
        info!(
            client_id = %self.credentials.client_id,
            scopes = grant.scope.as_deref().unwrap_or(""),
            "Obtained access token"
        );
        Ok(grant)
    }

    /// Cached token, renewed shortly before it expires
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some((grant, expires)) = cached.as_ref() {
            let fresh = expires.is_none_or(|at| self.clock.now() + EXPIRY_MARGIN < at);
            if fresh {
                return Ok(grant.access_token.clone());
            }
        }
        let grant = self.fetch().await?;
        let expires = grant
            .expires_in
            .map(|secs| self.clock.now() + Duration::from_secs(secs));
        let token = grant.access_token.clone();
        *cached = Some((grant, expires));
        Ok(token)
    }
}

impl std::fmt::Debug for TokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenClient")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialSource for TokenClient {
    async fn bearer(&self) -> Result<String> {
        self.token().await
    }
}
