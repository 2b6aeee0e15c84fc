//! Auth gate: bearer JWT verification and scope checks.
//!
//! # Flow
//!
//! 1. Take `Bearer <token>` from the `Authorization` header.
//! 2. Read `alg` and `kid` from the unverified JWT header; the algorithm must
//!    be one the policy accepts.
//! 3. Look the key up in the JWKS cache ([`jwks::JwksCache`]).
//! 4. Verify signature, `exp` (60 s leeway), issuer and audience.
//! 5. Collect granted scopes from `scope` (space separated) and `scp`.
//! 6. Compare against the required scopes.
//!
//! Error messages name what failed ("token expired", "audience mismatch")
//! but never echo key material or fetched JWKS documents.

pub mod jwks;
pub mod token;

use std::collections::BTreeSet;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Error, Result};

pub use jwks::{HttpKeySource, JwksCache, JwksRefresh, KeySource};
pub use token::{ClientCredentials, CredentialSource, StaticCredential, TokenClient, TokenGrant};

/// Allowed clock skew when checking `exp`/`nbf`
const LEEWAY_SECS: u64 = 60;

/// Who may call into a service, checked at call time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Expected `iss`
    pub issuer: String,
    /// Expected `aud`
    pub audience: String,
    /// Where the verification keys live
    pub jwks_uri: String,
    /// Scopes every call must carry
    pub required_scopes: BTreeSet<String>,
    /// Accepted signing algorithms
    pub algorithms: Vec<Algorithm>,
}

impl AuthPolicy {
    /// Policy with explicit issuer and JWKS location
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        jwks_uri: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            jwks_uri: jwks_uri.into(),
            required_scopes: BTreeSet::new(),
            algorithms: vec![Algorithm::RS256],
        }
    }

    /// Policy for a hosted identity-provider tenant.
    ///
    /// Accepts a bare domain (`tenant.eu.auth0.com`) or one already written as
    /// a URL; the issuer becomes `https://{domain}/` and keys are read from
    /// `https://{domain}/.well-known/jwks.json`.
    pub fn for_domain(domain: &str, audience: impl Into<String>) -> Self {
        let domain = normalize_domain(domain);
        Self::new(
            format!("https://{domain}/"),
            audience,
            format!("https://{domain}/.well-known/jwks.json"),
        )
    }

    /// Add a required scope
    #[must_use]
    pub fn require(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.insert(scope.into());
        self
    }

    /// Add several required scopes
    #[must_use]
    pub fn require_all<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes
            .extend(scopes.into_iter().map(Into::into));
        self
    }

    /// Replace the accepted algorithms
    #[must_use]
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }
}

/// Strip scheme and trailing slashes from an identity-provider domain
#[must_use]
pub fn normalize_domain(domain: &str) -> &str {
    let d = domain.trim();
    let d = d
        .strip_prefix("https://")
        .or_else(|| d.strip_prefix("http://"))
        .unwrap_or(d);
    d.trim_end_matches('/')
}

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// `sub` claim
    pub subject: Option<String>,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// `exp` claim (Unix seconds)
    pub expires_at: Option<u64>,
}

impl Principal {
    /// Whether a scope was granted
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<Vec<String>>,
}

/// Extract the token from an `Authorization` header value
pub fn parse_bearer(header: Option<&str>) -> Result<&str> {
    let header = header.ok_or_else(|| Error::InvalidToken("missing bearer credential".into()))?;
    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| Error::InvalidToken("malformed authorization header".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(Error::InvalidToken(format!(
            "unsupported authorization scheme '{scheme}'"
        )));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::InvalidToken("empty bearer token".into()));
    }
    Ok(token)
}

/// Verifies credentials against per-service policies
#[derive(Clone)]
pub struct AuthGate {
    jwks: Arc<JwksCache>,
}

impl AuthGate {
    /// Gate backed by `jwks`
    #[must_use]
    pub fn new(jwks: Arc<JwksCache>) -> Self {
        Self { jwks }
    }

    /// The key cache
    #[must_use]
    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Verify `credential` (an `Authorization` header value) under `policy`
    /// and require `policy.required_scopes ∪ extra_scopes`.
    pub async fn authorize(
        &self,
        credential: Option<&str>,
        policy: &AuthPolicy,
        extra_scopes: &BTreeSet<String>,
    ) -> Result<Principal> {
        let token = parse_bearer(credential)?;
        let principal = self.verify(token, policy).await?;

        let missing: Vec<String> = policy
            .required_scopes
            .iter()
            .chain(extra_scopes)
            .filter(|s| !principal.scopes.contains(*s))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            debug!(subject = ?principal.subject, missing = ?missing, "Scope check failed");
            return Err(Error::InsufficientScope { missing });
        }
        Ok(principal)
    }

    /// Verify a raw JWT under `policy` without checking scopes
    pub async fn verify(&self, token: &str, policy: &AuthPolicy) -> Result<Principal> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| Error::InvalidToken("malformed token".into()))?;
        if !policy.algorithms.contains(&header.alg) {
            return Err(Error::InvalidToken(format!(
                "signing algorithm {:?} not accepted",
                header.alg
            )));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::InvalidToken("token header has no key id".into()))?;

        let key = match self.jwks.decoding_key(&policy.jwks_uri, kid).await {
            Ok(key) => key,
            Err(Error::InvalidToken(reason)) => return Err(Error::InvalidToken(reason)),
            Err(e) => {
                warn!(jwks_uri = %policy.jwks_uri, error = %e, "Verification keys unavailable");
                return Err(Error::InvalidToken("unable to verify token".into()));
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[policy.issuer.as_str()]);
        validation.set_audience(&[policy.audience.as_str()]);

        let claims = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(|e| {
                debug!(error = %e, "Token rejected");
                Error::InvalidToken(rejection_reason(e.kind()).into())
            })?
            .claims;

        let mut scopes: BTreeSet<String> = claims
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        scopes.extend(claims.scp.unwrap_or_default());
        if scopes.is_empty() {
            return Err(Error::InvalidToken("token grants no scopes".into()));
        }

        Ok(Principal {
            subject: claims.sub,
            scopes,
            expires_at: claims.exp,
        })
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

fn rejection_reason(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ExpiredSignature => "token expired",
        ErrorKind::ImmatureSignature => "token not yet valid",
        ErrorKind::InvalidIssuer => "issuer mismatch",
        ErrorKind::InvalidAudience => "audience mismatch",
        ErrorKind::InvalidSignature => "signature verification failed",
        ErrorKind::MissingRequiredClaim(_) => "token missing required claim",
        ErrorKind::InvalidAlgorithm => "signing algorithm does not match key",
        _ => "token verification failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parsing() {
        assert_eq!(parse_bearer(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
        assert_eq!(parse_bearer(Some("bearer   tok ")).unwrap(), "tok");
        assert!(matches!(parse_bearer(None), Err(Error::InvalidToken(_))));
        assert!(matches!(
            parse_bearer(Some("Basic dXNlcjpwYXNz")),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(parse_bearer(Some("Bearer")), Err(Error::InvalidToken(_))));
    }

    #[test]
    fn domain_policy_derives_issuer_and_jwks() {
        let p = AuthPolicy::for_domain("https://tenant.us.auth0.com/", "http://localhost:3000/mcp")
            .require("read:add");
        assert_eq!(p.issuer, "https://tenant.us.auth0.com/");
        assert_eq!(p.jwks_uri, "https://tenant.us.auth0.com/.well-known/jwks.json");
        assert_eq!(p.audience, "http://localhost:3000/mcp");
        assert!(p.required_scopes.contains("read:add"));
        assert_eq!(p.algorithms, vec![Algorithm::RS256]);
    }

    #[test]
    fn rejection_reasons_do_not_leak_details() {
        assert_eq!(rejection_reason(&ErrorKind::ExpiredSignature), "token expired");
        assert_eq!(
            rejection_reason(&ErrorKind::InvalidKeyFormat),
            "token verification failed"
        );
    }
}
