//! JWKS cache with an explicit refresh policy.
//!
//! Keys are fetched lazily on the first verification against a JWKS uri and
//! kept according to [`JwksRefresh`]:
//!
//! - `Forever`: one fetch per uri for the life of the process. Key rotation
//!   at the identity provider is not picked up.
//! - `Ttl(d)`: entries older than `d` are refetched, and a token signed with
//!   an unknown `kid` forces one refetch (at most once per cooldown window)
//!   so rotated keys work without waiting out the TTL.
//!
//! Time comes from the injected [`Clock`](crate::clock::Clock).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::{Error, Result};

/// Default lifetime of a fetched key set
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Minimum spacing between forced refetches for unknown key ids
pub const DEFAULT_REFETCH_COOLDOWN: Duration = Duration::from_secs(30);

/// How long fetched keys stay valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwksRefresh {
    /// Fetch once, keep for the process lifetime
    Forever,
    /// Refetch after the duration, and on unknown key ids
    Ttl(Duration),
}

impl Default for JwksRefresh {
    fn default() -> Self {
        Self::Ttl(DEFAULT_TTL)
    }
}

/// Where key sets come from
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the key set published at `jwks_uri`
    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet>;
}

/// Fetches key sets over HTTPS
pub struct HttpKeySource {
    http: reqwest::Client,
}

impl HttpKeySource {
    /// Source with a 10 s request timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpKeySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet> {
        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let keys = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(keys)
    }
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Key sets by uri
pub struct JwksCache {
    source: Arc<dyn KeySource>,
    refresh: JwksRefresh,
    cooldown: Duration,
    clock: SharedClock,
    entries: DashMap<String, CachedJwks>,
}

impl JwksCache {
    /// Cache over `source` with `refresh` policy, on the system clock
    pub fn new(source: Arc<dyn KeySource>, refresh: JwksRefresh) -> Self {
        Self {
            source,
            refresh,
            cooldown: DEFAULT_REFETCH_COOLDOWN,
            clock: clock::system(),
            entries: DashMap::new(),
        }
    }

    /// Use a specific clock
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Change the unknown-kid refetch cooldown
    #[must_use]
    pub fn with_refetch_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// The active policy
    #[must_use]
    pub fn refresh_policy(&self) -> JwksRefresh {
        self.refresh
    }

    /// Drop a cached key set
    pub fn invalidate(&self, jwks_uri: &str) {
        self.entries.remove(jwks_uri);
    }

    /// Key set for `jwks_uri`, fetching if absent or expired
    pub async fn keys(&self, jwks_uri: &str) -> Result<JwkSet> {
        if let Some(entry) = self.entries.get(jwks_uri) {
            if !self.is_expired(&entry) {
                return Ok(entry.keys.clone());
            }
        }
        self.fetch(jwks_uri).await
    }

    /// Decoding key for `kid`, refetching once if the kid is unknown and the
    /// policy allows it
    pub async fn decoding_key(&self, jwks_uri: &str, kid: &str) -> Result<DecodingKey> {
        let keys = self.keys(jwks_uri).await?;
        if let Some(key) = find_key(&keys, kid)? {
            return Ok(key);
        }

        if self.may_refetch(jwks_uri) {
            debug!(kid = %kid, "Unknown key id, refetching JWKS");
            let keys = self.fetch(jwks_uri).await?;
            if let Some(key) = find_key(&keys, kid)? {
                return Ok(key);
            }
        }
        Err(Error::InvalidToken("unknown signing key".into()))
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet> {
        let keys = self.source.fetch(jwks_uri).await?;
        self.entries.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: keys.clone(),
                fetched_at: self.clock.now(),
            },
        );
        Ok(keys)
    }

    fn is_expired(&self, entry: &CachedJwks) -> bool {
        match self.refresh {
            JwksRefresh::Forever => false,
            JwksRefresh::Ttl(ttl) => self.clock.now().duration_since(entry.fetched_at) >= ttl,
        }
    }

    fn may_refetch(&self, jwks_uri: &str) -> bool {
        match self.refresh {
            JwksRefresh::Forever => false,
            JwksRefresh::Ttl(_) => self.entries.get(jwks_uri).is_none_or(|e| {
                self.clock.now().duration_since(e.fetched_at) >= self.cooldown
            }),
        }
    }
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("refresh", &self.refresh)
            .field("cooldown", &self.cooldown)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Find `kid` in `keys`. A matching key of an unsupported type is an error
/// rather than "not found", so it does not trigger refetches.
fn find_key(keys: &JwkSet, kid: &str) -> Result<Option<DecodingKey>> {
    let Some(jwk) = keys.find(kid) else {
        return Ok(None);
    };
    let key = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y),
        _ => return Err(Error::InvalidToken("unsupported signing key type".into())),
    };
    key.map(Some)
        .map_err(|_| Error::InvalidToken("unusable signing key".into()))
}
