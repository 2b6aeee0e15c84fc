//! Configuration management
//!
//! Sources, later overriding earlier: built-in defaults, the YAML file,
//! `TOOLGATE_`-prefixed environment variables (`__` separates nesting, so
//! `TOOLGATE_SERVER__PORT=9000`). After extraction, `env_files` are loaded
//! into the process environment and `${VAR}` / `${VAR:-default}` references
//! in string values are expanded.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::{env, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthPolicy, JwksRefresh, jwks};
use crate::mount::DEFAULT_SEPARATOR;
use crate::services::ServiceKind;
use crate::transport::TransportKind;
use crate::{Error, Result};

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env reference pattern is valid")
});

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Env files loaded into the process environment before expansion.
    /// Missing files are skipped.
    pub env_files: Vec<String>,
    /// HTTP server
    pub server: ServerConfig,
    /// Separator between mount prefix and tool name
    pub separator: String,
    /// Bearer-token verification
    pub auth: AuthConfig,
    /// Built-in services, keyed by mount prefix
    pub services: BTreeMap<String, ServiceConfig>,
    /// Remote servers, keyed by mount prefix
    #[serde(alias = "mcpServers")]
    pub backends: BTreeMap<String, BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let services = ServiceKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), ServiceConfig::default()))
            .collect();
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            separator: DEFAULT_SEPARATOR.to_string(),
            auth: AuthConfig::default(),
            services,
            backends: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files(path.and_then(Path::parent));
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text without the file or environment overlay
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Relative env files resolve against `base` (the config file's directory),
    /// then against the working directory.
    fn load_env_files(&self, base: Option<&Path>) {
        for file in &self.env_files {
            let candidates: Vec<PathBuf> = match base {
                Some(dir) if Path::new(file).is_relative() => {
                    vec![dir.join(file), PathBuf::from(file)]
                }
                _ => vec![PathBuf::from(file)],
            };
            let Some(path) = candidates.into_iter().find(|p| p.exists()) else {
                tracing::debug!(file = %file, "Env file not found (skipped)");
                continue;
            };
            match dotenvy::from_path(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "Loaded env file"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to load env file"),
            }
        }
    }

    fn expand_env_vars(&mut self) {
        expand(&mut self.auth.domain);
        expand(&mut self.auth.audience);
        for backend in self.backends.values_mut() {
            for value in [&mut backend.url, &mut backend.command, &mut backend.cwd]
                .into_iter()
                .flatten()
            {
                expand(value);
            }
            for arg in &mut backend.args {
                expand(arg);
            }
            for value in backend.headers.values_mut().chain(backend.env.values_mut()) {
                expand(value);
            }
            if let Some(ref mut credential) = backend.credential {
                credential.expand();
            }
        }
    }

    /// Reject configurations that cannot start
    pub fn validate(&mut self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(Error::Config("separator must not be empty".into()));
        }
        if self.auth.enabled {
            if self.auth.domain.is_empty() {
                self.auth.domain = env::var("AUTH0_DOMAIN").unwrap_or_default();
            }
            if self.auth.audience.is_empty() {
                self.auth.audience = env::var("API_AUDIENCE").unwrap_or_default();
            }
            if self.auth.domain.is_empty() {
                return Err(Error::Config(
                    "auth is enabled but AUTH0_DOMAIN is not set".into(),
                ));
            }
            if self.auth.audience.is_empty() {
                return Err(Error::Config(
                    "auth is enabled but API_AUDIENCE is not set".into(),
                ));
            }
        }
        for (prefix, service) in &self.services {
            if service.service.is_none() && prefix.parse::<ServiceKind>().is_err() {
                return Err(Error::Config(format!(
                    "service '{prefix}' does not name a built-in service; set `service:`"
                )));
            }
            if service.enabled
                && !service.required_scopes.is_empty()
                && !(self.auth.enabled && service.auth)
            {
                return Err(Error::Config(format!(
                    "service '{prefix}' requires scopes but no token is verified for it; \
                     enable auth or drop required_scopes"
                )));
            }
        }
        for (name, backend) in &self.backends {
            match (&backend.url, &backend.command) {
                (Some(_), Some(_)) => {
                    return Err(Error::Config(format!(
                        "backend '{name}' sets both url and command"
                    )));
                }
                (None, None) => {
                    return Err(Error::Config(format!(
                        "backend '{name}' needs a url or a command"
                    )));
                }
                _ => {}
            }
            if backend.enabled
                && !backend.required_scopes.is_empty()
                && !(self.auth.enabled && backend.auth)
            {
                return Err(Error::Config(format!(
                    "backend '{name}' requires scopes but no token is verified for it; \
                     enable auth or drop required_scopes"
                )));
            }
            if backend.command.is_some() && backend.transport_kind() != TransportKind::Stdio {
                return Err(Error::Config(format!(
                    "backend '{name}' has a command but transport {}",
                    backend.transport_kind()
                )));
            }
        }
        Ok(())
    }

    /// Built-in services that are switched on
    pub fn enabled_services(&self) -> impl Iterator<Item = (&String, &ServiceConfig)> {
        self.services.iter().filter(|(_, s)| s.enabled)
    }

    /// Backends that are switched on
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }

    /// Policy for the service mounted at `prefix`: the base policy plus
    /// its required scopes, or `None` when auth is off for it. A prefix
    /// with no entry gets the defaults.
    #[must_use]
    pub fn service_policy(&self, prefix: &str) -> Option<AuthPolicy> {
        let defaults = ServiceConfig::default();
        let service = self.services.get(prefix).unwrap_or(&defaults);
        if !service.auth {
            return None;
        }
        self.auth
            .policy()
            .map(|p| p.require_all(service.required_scopes.iter().cloned()))
    }

    /// Policy for calls into `backend`
    #[must_use]
    pub fn backend_policy(&self, backend: &BackendConfig) -> Option<AuthPolicy> {
        if !backend.auth {
            return None;
        }
        self.auth
            .policy()
            .map(|p| p.require_all(backend.required_scopes.iter().cloned()))
    }
}

fn expand(value: &mut String) {
    if value.contains("${") {
        *value = expand_str(value);
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values
#[must_use]
pub fn expand_str(value: &str) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures| {
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Never issue session ids; accept tool calls without a handshake
    pub stateless: bool,
    /// Upper bound on one local tool invocation
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,
    /// How long to wait for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Close sessions unused for this long; `0` keeps them until closed
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            stateless: false,
            tool_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            session_idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Bearer-token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Verify tokens on calls into services that opt in
    pub enabled: bool,
    /// Identity-provider domain (falls back to `AUTH0_DOMAIN`)
    pub domain: String,
    /// Expected audience (falls back to `API_AUDIENCE`)
    pub audience: String,
    /// Keep fetched keys forever instead of expiring them
    pub jwks_forever: bool,
    /// How long fetched keys stay valid
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Minimum gap between forced refetches for unknown key ids
    #[serde(with = "humantime_serde")]
    pub jwks_refetch_cooldown: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: String::new(),
            audience: String::new(),
            jwks_forever: false,
            jwks_ttl: jwks::DEFAULT_TTL,
            jwks_refetch_cooldown: jwks::DEFAULT_REFETCH_COOLDOWN,
        }
    }
}

impl AuthConfig {
    /// JWKS cache policy
    #[must_use]
    pub fn jwks_refresh(&self) -> JwksRefresh {
        if self.jwks_forever {
            JwksRefresh::Forever
        } else {
            JwksRefresh::Ttl(self.jwks_ttl)
        }
    }

    /// Base policy for services with `auth: true`, when auth is enabled
    #[must_use]
    pub fn policy(&self) -> Option<AuthPolicy> {
        self.enabled
            .then(|| AuthPolicy::for_domain(&self.domain, self.audience.clone()))
    }
}

/// One built-in service mount
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Which service; defaults to the mount prefix
    pub service: Option<ServiceKind>,
    /// Mount it at all
    pub enabled: bool,
    /// Verify bearer tokens on calls into it (when `auth.enabled`)
    pub auth: bool,
    /// Scopes every call must carry
    pub required_scopes: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: None,
            enabled: true,
            auth: true,
            required_scopes: Vec::new(),
        }
    }
}

/// A remote server reached through the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human description
    pub description: String,
    /// Mount it at all
    pub enabled: bool,
    /// HTTP endpoint (`.../sse` or `.../mcp`)
    pub url: Option<String>,
    /// Program to spawn for stdio backends
    pub command: Option<String>,
    /// Program arguments
    pub args: Vec<String>,
    /// Extra environment for the program
    pub env: HashMap<String, String>,
    /// Working directory for the program
    pub cwd: Option<String>,
    /// Wire flavour; inferred from `url`/`command` when absent
    pub transport: Option<TransportKind>,
    /// Extra HTTP headers
    pub headers: HashMap<String, String>,
    /// Outbound credential
    pub credential: Option<CredentialConfig>,
    /// Per-request deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Connection attempts beyond the first
    pub retries: usize,
    /// Verify bearer tokens on calls into it (when `auth.enabled`)
    pub auth: bool,
    /// Scopes every call must carry
    pub required_scopes: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            transport: None,
            headers: HashMap::new(),
            credential: None,
            timeout: Duration::from_secs(30),
            retries: 2,
            auth: false,
            required_scopes: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Backend at `url`, transport inferred
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Explicit transport, or `stdio` for commands, `sse` for `/sse` URLs,
    /// streamable HTTP otherwise
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        if let Some(kind) = self.transport {
            return kind;
        }
        match (&self.command, &self.url) {
            (Some(_), _) => TransportKind::Stdio,
            (None, Some(url)) if url.trim_end_matches('/').ends_with("/sse") => TransportKind::Sse,
            _ => TransportKind::StreamableHttp,
        }
    }
}

/// Outbound credential for a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialConfig {
    /// Fixed bearer token
    Bearer {
        /// The token
        token: String,
    },
    /// Client-credentials grant against the identity provider
    ClientCredentials {
        /// Tenant domain (falls back to `AUTH0_DOMAIN`)
        #[serde(default = "env_domain")]
        domain: String,
        /// Client id (falls back to `AUTH0_CLIENT_ID`)
        #[serde(default = "env_client_id")]
        client_id: String,
        /// Client secret (falls back to `AUTH0_CLIENT_SECRET`)
        #[serde(default = "env_client_secret")]
        client_secret: String,
        /// Audience (falls back to `API_AUDIENCE`)
        #[serde(default = "env_audience")]
        audience: String,
    },
}

fn env_domain() -> String {
    "${AUTH0_DOMAIN}".into()
}
fn env_client_id() -> String {
    "${AUTH0_CLIENT_ID}".into()
}
fn env_client_secret() -> String {
    "${AUTH0_CLIENT_SECRET}".into()
}
fn env_audience() -> String {
    "${API_AUDIENCE}".into()
}

impl CredentialConfig {
    fn expand(&mut self) {
        match self {
            Self::Bearer { token } => expand(token),
            Self::ClientCredentials {
                domain,
                client_id,
                client_secret,
                audience,
            } => {
                for v in [domain, client_id, client_secret, audience] {
                    expand(v);
                }
            }
        }
    }
}

/// Durations as `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or bare seconds
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as whole milliseconds when sub-second, seconds otherwise
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Deserialize from a suffixed string or an integer number of seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse one duration string
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{s}'"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(n)),
            "" | "s" => Ok(Duration::from_secs(n)),
            "m" => Ok(Duration::from_secs(n * 60)),
            "h" => Ok(Duration::from_secs(n * 3600)),
            other => Err(format!("unknown duration unit '{other}' in '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_mount_every_builtin_service() {
        let config = Config::default();
        assert_eq!(
            config.services.keys().collect::<Vec<_>>(),
            vec!["add", "deleter", "discovery", "subtract"]
        );
        assert_eq!(config.separator, "_");
        assert_eq!(config.server.port, 8000);
        assert!(!config.server.stateless);
        assert_eq!(config.server.session_idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn mcp_servers_map_becomes_backends() {
        let config = Config::from_yaml(
            r#"
mcpServers:
  add:
    url: "http://127.0.0.1:9001/sse"
    transport: sse
  subtract:
    url: "http://127.0.0.1:9002/mcp"
  local:
    command: "toolgate"
    args: ["backend", "add", "--transport", "stdio"]
    timeout: 250ms
"#,
        )
        .unwrap();
        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.backends["add"].transport_kind(), TransportKind::Sse);
        assert_eq!(
            config.backends["subtract"].transport_kind(),
            TransportKind::StreamableHttp
        );
        assert_eq!(config.backends["local"].transport_kind(), TransportKind::Stdio);
        assert_eq!(config.backends["local"].timeout, Duration::from_millis(250));
    }

    #[test]
    fn backend_needs_exactly_one_target() {
        let err = Config::from_yaml("backends:\n  x:\n    retries: 1\n").unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("url or a command")));
    }

    #[test]
    fn unknown_service_needs_explicit_kind() {
        let err = Config::from_yaml("services:\n  math:\n    required_scopes: [x]\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let ok = Config::from_yaml("services:\n  math:\n    service: add\n").unwrap();
        assert_eq!(ok.services["math"].service, Some(ServiceKind::Add));
    }

    #[test]
    fn env_references_expand_with_defaults() {
        let config = Config::from_yaml(
            r#"
auth:
  audience: "${TOOLGATE_TEST_SURELY_UNSET_AUD:-http://localhost:8000/mcp}"
backends:
  remote:
    url: "${TOOLGATE_TEST_SURELY_UNSET_URL:-http://127.0.0.1:9001/sse}"
"#,
        )
        .unwrap();
        assert_eq!(config.auth.audience, "http://localhost:8000/mcp");
        assert_eq!(
            config.backends["remote"].url.as_deref(),
            Some("http://127.0.0.1:9001/sse")
        );
    }

    #[test]
    fn enabled_auth_without_domain_is_fatal() {
        let mut config = Config::default();
        config.auth.enabled = true;
        config.auth.domain = String::new();
        config.auth.audience = "aud".into();
        if env::var("AUTH0_DOMAIN").is_err() {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn required_scopes_need_token_verification() {
        let err = Config::from_yaml("services:\n  add:\n    required_scopes: [read:add]\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("'add' requires scopes")), "{err:?}");

        let err = Config::from_yaml(
            "backends:\n  remote:\n    url: http://127.0.0.1:9001/mcp\n    required_scopes: [x]\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("'remote' requires scopes")), "{err:?}");

        // Disabled entries are never mounted, so their scopes are moot
        Config::from_yaml("services:\n  add:\n    enabled: false\n    required_scopes: [read:add]\n")
            .unwrap();

        let config = Config::from_yaml(
            "auth:\n  enabled: true\n  domain: t.example.com\n  audience: api\n\
             services:\n  add:\n    required_scopes: [read:add]\n",
        )
        .unwrap();
        let policy = config.service_policy("add").unwrap();
        assert!(policy.required_scopes.contains("read:add"));
        // Services without an entry fall back to auth on, no extra scopes
        assert!(config.service_policy("deleter").unwrap().required_scopes.is_empty());
    }

    #[test]
    fn load_reads_file_and_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut env_file = std::fs::File::create(dir.path().join("gw.env")).unwrap();
        writeln!(env_file, "GW_TEST_BACKEND_URL=http://127.0.0.1:9100/mcp").unwrap();
        drop(env_file);

        let path = dir.path().join("toolgate.yaml");
        std::fs::write(
            &path,
            r#"
env_files: ["gw.env"]
separator: "."
server:
  port: 9999
  tool_timeout: 2m
backends:
  remote:
    url: "${GW_TEST_BACKEND_URL}"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.separator, ".");
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.tool_timeout, Duration::from_secs(120));
        assert_eq!(
            config.backends["remote"].url.as_deref(),
            Some("http://127.0.0.1:9100/mcp")
        );
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/toolgate.yaml"))),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn credentials_default_to_env_references() {
        let config = Config::from_yaml(
            r#"
backends:
  secured:
    url: "http://127.0.0.1:9001/mcp"
    credential:
      type: bearer
      token: "${TOOLGATE_TEST_SURELY_UNSET_TOKEN:-abc}"
"#,
        )
        .unwrap();
        match config.backends["secured"].credential.as_ref().unwrap() {
            CredentialConfig::Bearer { token } => assert_eq!(token, "abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duration_parsing() {
        use humantime_serde::parse;
        assert_eq!(parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("12").unwrap(), Duration::from_secs(12));
        assert!(parse("soon").is_err());
        assert!(parse("3d").is_err());
    }
}
