//! Gateway assembly and lifecycle

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{Catalog, Dispatcher};
use super::router::{AppState, create_router};
use super::session::SessionManager;
use crate::auth::{
    AuthGate, ClientCredentials, CredentialSource, HttpKeySource, JwksCache, KeySource,
    StaticCredential, TokenClient,
};
use crate::clock::{self, SharedClock};
use crate::config::{AuthConfig, BackendConfig, Config, CredentialConfig, ServerConfig};
use crate::mount::{MountTable, MountTarget};
use crate::protocol::{JsonRpcMessage, JsonRpcNotification, methods};
use crate::proxy::ProxyBackend;
use crate::registry::ToolRegistry;
use crate::services::ServiceKind;
use crate::{Error, Result};

/// SSE keep-alive interval
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Longest gap between idle-session sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tool gateway server
pub struct Gateway {
    server: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    mounts: Option<Arc<MountTable>>,
    backends: Vec<Arc<ProxyBackend>>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build every enabled service and backend from `config` and mount
    /// them. Backends that cannot be reached yet are mounted with an empty
    /// tool list and connected on first use.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_key_source(config, Arc::new(HttpKeySource::new())).await
    }

    /// [`new`](Self::new), verifying bearer tokens against keys from `keys`
    pub async fn with_key_source(config: Config, keys: Arc<dyn KeySource>) -> Result<Self> {
        let mounts = Arc::new(MountTable::new(config.separator.clone()));

        for (prefix, service) in config.enabled_services() {
            let kind = match service.service {
                Some(kind) => kind,
                None => prefix.parse::<ServiceKind>()?,
            };
            let registry = kind.build()?;
            registry.set_policy(config.service_policy(prefix));
            mounts.mount(prefix.clone(), MountTarget::Local(registry))?;
        }

        let mut backends = Vec::new();
        for (name, backend_config) in config.enabled_backends() {
            let mut backend = ProxyBackend::new(name.clone(), backend_config.clone())
                .with_policy(config.backend_policy(backend_config));
            if let Some(credential) = credential_source(backend_config) {
                backend = backend.with_credential(credential);
            }
            let backend = Arc::new(backend);
            let count = backend.snapshot_tools().await;
            debug!(backend = %name, tools = count, "Backend mounted");
            mounts.mount(name.clone(), MountTarget::Remote(Arc::clone(&backend)))?;
            backends.push(backend);
        }

        let dispatcher = Dispatcher::new(Catalog::Mounted(Arc::clone(&mounts)))
            .with_auth(auth_gate(&config.auth, keys))
            .with_tool_timeout(config.server.tool_timeout);
        Ok(Self::assemble(config.server, dispatcher, Some(mounts), backends))
    }

    /// Serve one built-in service under its own tool names. Auth follows
    /// `config`: the service's entry under `services` (or the defaults)
    /// and the `auth` section.
    pub fn standalone(kind: ServiceKind, config: &Config) -> Result<Self> {
        Self::standalone_with_key_source(kind, config, Arc::new(HttpKeySource::new()))
    }

    /// [`standalone`](Self::standalone), verifying bearer tokens against
    /// keys from `keys`
    pub fn standalone_with_key_source(
        kind: ServiceKind,
        config: &Config,
        keys: Arc<dyn KeySource>,
    ) -> Result<Self> {
        let registry = kind.build()?;
        let policy = config.service_policy(kind.as_str());
        if policy.is_none() && registry.list().iter().any(|d| !d.required_scopes.is_empty()) {
            warn!(service = %kind, "Auth is off; tools that need scopes will refuse every call");
        }
        registry.set_policy(policy);
        let dispatcher = Dispatcher::new(Catalog::Single(MountTarget::Local(registry)))
            .with_auth(auth_gate(&config.auth, keys))
            .with_tool_timeout(config.server.tool_timeout);
        Ok(Self::assemble(config.server.clone(), dispatcher, None, Vec::new()))
    }

    /// Serve one registry under its own tool names
    pub fn single(registry: Arc<ToolRegistry>, server: ServerConfig) -> Self {
        let dispatcher = Dispatcher::new(Catalog::Single(MountTarget::Local(registry)))
            .with_tool_timeout(server.tool_timeout);
        Self::assemble(server, dispatcher, None, Vec::new())
    }

    /// Re-serve one remote server's tools under their own names. Calls,
    /// errors, cancellations and list changes pass straight through.
    pub async fn proxy(backend: Arc<ProxyBackend>, server: ServerConfig) -> Self {
        let count = backend.snapshot_tools().await;
        info!(backend = %backend.name(), tools = count, "Proxying");
        let dispatcher = Dispatcher::new(Catalog::Single(MountTarget::Remote(Arc::clone(&backend))))
            .with_tool_timeout(server.tool_timeout);
        Self::assemble(server, dispatcher, None, vec![backend])
    }

    fn assemble(
        server: ServerConfig,
        dispatcher: Dispatcher,
        mounts: Option<Arc<MountTable>>,
        backends: Vec<Arc<ProxyBackend>>,
    ) -> Self {
        let clock = clock::system();
        let gateway = Self {
            server,
            dispatcher: Arc::new(dispatcher),
            sessions: Arc::new(SessionManager::with_clock(Arc::clone(&clock))),
            mounts,
            backends,
            shutdown: CancellationToken::new(),
        };
        gateway.watch_tool_lists();
        gateway.expire_idle_sessions(clock);
        gateway
    }

    /// The mount table (absent for single-service servers)
    #[must_use]
    pub fn mounts(&self) -> Option<&Arc<MountTable>> {
        self.mounts.as_ref()
    }

    /// Open sessions
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Push `notifications/tools/list_changed` to every session whenever a
    /// mounted registry or backend changes
    fn watch_tool_lists(&self) {
        let receivers = match self.dispatcher.catalog() {
            Catalog::Mounted(table) => table
                .targets()
                .into_iter()
                .map(|(_, target)| target.subscribe())
                .collect::<Vec<_>>(),
            Catalog::Single(target) => vec![target.subscribe()],
        };
        for mut rx in receivers {
            let sessions = Arc::clone(&self.sessions);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let changed = JsonRpcMessage::Notification(JsonRpcNotification::new(
                    methods::TOOLS_LIST_CHANGED,
                    None,
                ));
                loop {
                    let event = tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = rx.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            debug!(?event, "Tool list changed");
                            sessions.broadcast(&changed);
                        }
                        Err(RecvError::Lagged(_)) => sessions.broadcast(&changed),
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    /// Close sessions nobody has used for `server.session_idle_timeout`
    fn expire_idle_sessions(&self, clock: SharedClock) {
        let ttl = self.server.session_idle_timeout;
        if ttl.is_zero() {
            return;
        }
        let every = (ttl / 4).clamp(Duration::from_secs(1), SWEEP_INTERVAL);
        let sessions = Arc::clone(&self.sessions);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = clock.sleep(every) => {
                        let closed = sessions.sweep_idle(ttl);
                        if closed > 0 {
                            info!(closed, ?ttl, "Closed idle sessions");
                        }
                    }
                }
            }
        });
    }

    /// The HTTP router
    pub fn router(&self) -> Router {
        create_router(Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            sessions: Arc::clone(&self.sessions),
            stateless: self.server.stateless,
            keep_alive: KEEP_ALIVE,
        }))
    }

    /// Serve on `listener` until `shutdown` resolves, then close sessions
    /// and backends
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let sessions = Arc::clone(&self.sessions);
        let stop = self.shutdown.clone();
        let grace = self.server.shutdown_timeout;

        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown signal received");
            stop.cancel();
            // Long-lived streams end when their session closes
            sessions.close_all();
        })
        .into_future();

        let stop = self.shutdown.clone();
        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                stop.cancelled().await;
                tokio::time::sleep(grace).await;
            } => warn!(?grace, "Connections still open after shutdown timeout"),
        }

        self.shutdown.cancel();
        self.sessions.close_all();
        for backend in &self.backends {
            backend.close().await;
        }
        info!("Gateway stopped");
        Ok(())
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        info!(version = env!("CARGO_PKG_VERSION"), %addr, "Gateway listening");
        if let Some(mounts) = &self.mounts {
            for (prefix, target) in mounts.targets() {
                info!(prefix = %prefix, kind = target.kind(), tools = target.tools().len(), "Mount");
            }
        }
        info!("  POST http://{addr}/mcp       (streamable HTTP)");
        info!("  GET  http://{addr}/sse       (SSE)");
        if self.server.stateless {
            info!("Stateless mode: no sessions, no server-initiated messages");
        }

        self.serve(listener, shutdown_signal()).await
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("server", &self.server)
            .field("mounts", &self.mounts)
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}

fn auth_gate(auth: &AuthConfig, keys: Arc<dyn KeySource>) -> AuthGate {
    let jwks = JwksCache::new(keys, auth.jwks_refresh())
        .with_refetch_cooldown(auth.jwks_refetch_cooldown);
    AuthGate::new(Arc::new(jwks))
}

fn credential_source(config: &BackendConfig) -> Option<Arc<dyn CredentialSource>> {
    match config.credential.as_ref()? {
        CredentialConfig::Bearer { token } => Some(Arc::new(StaticCredential::new(token.clone()))),
        CredentialConfig::ClientCredentials {
            domain,
            client_id,
            client_secret,
            audience,
        } => Some(Arc::new(TokenClient::new(
            reqwest::Client::new(),
            ClientCredentials::for_domain(
                domain,
                client_id.clone(),
                client_secret.clone(),
                audience.clone(),
            ),
        ))),
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
