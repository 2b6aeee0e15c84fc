//! Proxy forwarder: a remote tool server mounted like a local registry.
//!
//! The backend session is opened lazily on first use and cached. Connection
//! attempts retry with exponential backoff; a failed call drops the cached
//! session so the next one reconnects, and the caller sees
//! [`Error::BackendUnavailable`] instead of a dead gateway.
//!
//! The advertised tool list is a snapshot taken by [`ProxyBackend::snapshot_tools`]
//! and replaced by [`ProxyBackend::refresh_tools`] (also triggered when the
//! backend announces `notifications/tools/list_changed`). Calls are
//! forwarded whether or not the snapshot knows the tool; the backend decides.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthPolicy, CredentialSource};
use crate::config::BackendConfig;
use crate::protocol::{ToolsCallResult, methods};
use crate::registry::{RegistryEvent, ToolDescriptor};
use crate::transport::{
    ClientSession, HttpMode, HttpTransport, StdioTransport, Transport, TransportKind,
};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// A remote server behind a mount prefix
pub struct ProxyBackend {
    name: String,
    config: BackendConfig,
    credential: Option<Arc<dyn CredentialSource>>,
    policy: RwLock<Option<Arc<AuthPolicy>>>,
    session: Mutex<Option<Arc<ClientSession>>>,
    tools: RwLock<Arc<[ToolDescriptor]>>,
    events: broadcast::Sender<RegistryEvent>,
    min_delay: Duration,
}

impl ProxyBackend {
    /// Backend named `name`; nothing connects until first use
    pub fn new(name: impl Into<String>, config: BackendConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            config,
            credential: None,
            policy: RwLock::new(None),
            session: Mutex::new(None),
            tools: RwLock::new(Arc::from(Vec::new())),
            events,
            min_delay: Duration::from_millis(200),
        }
    }

    /// Send `Authorization: Bearer` from `credential` on HTTP transports
    #[must_use]
    pub fn with_credential(mut self, credential: Arc<dyn CredentialSource>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Require callers to satisfy `policy`
    #[must_use]
    pub fn with_policy(self, policy: Option<AuthPolicy>) -> Self {
        self.set_policy(policy);
        self
    }

    /// First delay between connection attempts
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Backend name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend configuration
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Tools from the latest snapshot
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().to_vec()
    }

    /// Snapshot entry for `name`
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().iter().find(|d| d.name == name).cloned()
    }

    /// Auth policy for calls into this backend
    #[must_use]
    pub fn policy(&self) -> Option<Arc<AuthPolicy>> {
        self.policy.read().clone()
    }

    /// Replace the auth policy
    pub fn set_policy(&self, policy: Option<AuthPolicy>) {
        *self.policy.write() = policy.map(Arc::new);
    }

    /// Tool additions and removals seen by refreshes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Whether a session is cached and believed alive
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.transport().is_connected())
    }

    /// The cached session, connecting (with retries) if there is none
    pub async fn session(self: &Arc<Self>) -> Result<Arc<ClientSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.transport().is_connected() {
                return Ok(Arc::clone(session));
            }
            debug!(backend = %self.name, "Cached session is dead, reconnecting");
        }
        *slot = None;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.config.retries);

        let session = (|| self.connect_once())
            .retry(backoff)
            .when(Error::is_retryable)
            .notify(|e: &Error, delay: Duration| {
                warn!(
                    backend = %self.name,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Backend connect failed, retrying"
                );
            })
            .await
            .map_err(|e| self.unavailable(e))?;

        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn connect_once(self: &Arc<Self>) -> Result<Arc<ClientSession>> {
        let timeout = self.config.timeout;
        let transport: Arc<dyn Transport> = match self.config.transport_kind() {
            TransportKind::Stdio => {
                let command = self
                    .config
                    .command
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("backend '{}' has no command", self.name)))?;
                let transport = StdioTransport::new(
                    command,
                    self.config.args.clone(),
                    self.config.env.clone(),
                    self.config.cwd.clone(),
                    timeout,
                );
                transport.start().await?;
                transport
            }
            kind @ (TransportKind::Sse | TransportKind::StreamableHttp) => {
                let url = self
                    .config
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("backend '{}' has no url", self.name)))?;
                let mode = if kind == TransportKind::Sse {
                    HttpMode::Sse
                } else {
                    HttpMode::Streamable
                };
                let mut transport =
                    HttpTransport::new(url, mode, timeout)?.with_headers(&self.config.headers)?;
                if let Some(ref credential) = self.credential {
                    transport = transport.with_credential(Arc::clone(credential));
                }
                let transport = Arc::new(transport);
                transport.connect().await?;
                transport
            }
        };

        let session = Arc::new(ClientSession::new(Arc::clone(&transport)));
        if let Err(e) = session.initialize().await {
            let _ = transport.close().await;
            return Err(e);
        }
        info!(
            backend = %self.name,
            transport = %self.config.transport_kind(),
            session_id = ?transport.session_id(),
            "Backend connected"
        );
        self.watch_list_changes(&session);
        Ok(session)
    }

    /// Refresh the snapshot whenever the backend says its tools changed
    fn watch_list_changes(self: &Arc<Self>, session: &ClientSession) {
        let mut notifications = session.subscribe();
        let backend: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(n) if n.method == methods::TOOLS_LIST_CHANGED => {
                        let Some(backend) = backend.upgrade() else { return };
                        if let Err(e) = backend.refresh_tools().await {
                            warn!(backend = %backend.name, error = %e, "Tool refresh failed");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn drop_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = session.close().await;
        }
    }

    fn unavailable(&self, e: Error) -> Error {
        match e {
            Error::Transport(_)
            | Error::BackendTimeout(_)
            | Error::Http(_)
            | Error::Io(_)
            | Error::Handshake(_)
            | Error::Protocol(_) => Error::BackendUnavailable {
                backend: self.name.clone(),
                reason: e.to_string(),
            },
            other => other,
        }
    }

    /// Take the startup snapshot. Failure leaves the snapshot empty and is
    /// logged, never returned; returns the number of tools seen.
    pub async fn snapshot_tools(self: &Arc<Self>) -> usize {
        match self.refresh_tools().await {
            Ok(tools) => tools.len(),
            Err(e) => {
                warn!(
                    backend = %self.name,
                    error = %e,
                    "Backend unavailable at startup; advertising no tools until refresh"
                );
                0
            }
        }
    }

    /// Re-enumerate the backend's tools and replace the snapshot
    pub async fn refresh_tools(self: &Arc<Self>) -> Result<Vec<ToolDescriptor>> {
        let session = self.session().await?;
        let tools = match session.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let e = self.unavailable(e);
                if matches!(e, Error::BackendUnavailable { .. }) {
                    self.drop_session().await;
                }
                return Err(e);
            }
        };
        let fresh: Vec<ToolDescriptor> = tools.iter().map(ToolDescriptor::from_tool).collect();

        let before: BTreeSet<String> = self.tools.read().iter().map(|d| d.name.clone()).collect();
        let after: BTreeSet<String> = fresh.iter().map(|d| d.name.clone()).collect();
        *self.tools.write() = Arc::from(fresh.clone());

        for name in after.difference(&before) {
            let _ = self.events.send(RegistryEvent::Added(name.clone()));
        }
        for name in before.difference(&after) {
            let _ = self.events.send(RegistryEvent::Removed(name.clone()));
        }
        info!(backend = %self.name, count = fresh.len(), "Tool snapshot refreshed");
        Ok(fresh)
    }

    /// Call `local_name` on the backend and relay its result or JSON-RPC
    /// error. When `cancel` fires first the backend is sent
    /// `notifications/cancelled` and the call ends as [`Error::Cancelled`].
    #[tracing::instrument(skip(self, arguments, cancel), fields(backend = %self.name))]
    pub async fn forward(
        self: &Arc<Self>,
        local_name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        let session = self.session().await?;
        match session.call_tool_until(local_name, arguments, cancel).await {
            Ok(result) => Ok(result),
            Err(e @ (Error::JsonRpc { .. } | Error::Cancelled(_))) => Err(e),
            Err(e) => {
                let e = self.unavailable(e);
                if matches!(e, Error::BackendUnavailable { .. }) {
                    self.drop_session().await;
                }
                Err(e)
            }
        }
    }

    /// Close the cached session, if any
    pub async fn close(&self) {
        self.drop_session().await;
    }
}

impl std::fmt::Debug for ProxyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBackend")
            .field("name", &self.name)
            .field("transport", &self.config.transport_kind())
            .field("tools", &self.tools.read().len())
            .finish_non_exhaustive()
    }
}
