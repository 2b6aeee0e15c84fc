//! Method dispatch shared by every server transport.
//!
//! The dispatcher knows nothing about HTTP or stdio: it takes one decoded
//! JSON-RPC message plus the caller's session and credential, and produces
//! at most one response. Notifications a running tool emits go out through
//! the sender in [`CallContext`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthGate, HttpKeySource, JwksCache, JwksRefresh};
use crate::clock::{self, SharedClock};
use crate::error::rpc_codes;
use crate::mount::{MountTable, MountTarget};
use crate::protocol::{
    CancelledParams, Content, Info, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId, ResourcesCapability, ResourcesListResult,
    ServerCapabilities, ToolsCallParams, ToolsCallResult, ToolsCapability, ToolsListResult,
    methods, negotiate_version,
};
use crate::proxy::ProxyBackend;
use crate::registry::{NotificationSender, ToolContext, ToolDescriptor, ToolRegistry};
use crate::{Error, Result};

use super::session::Session;

/// Default per-call deadline for local tools
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// What `tools/list` enumerates and `tools/call` resolves against
#[derive(Clone)]
pub enum Catalog {
    /// Several services under qualified names
    Mounted(Arc<MountTable>),
    /// One service or remote server exposed under its own tool names
    Single(MountTarget),
}

impl Catalog {
    fn resolve(&self, name: &str) -> Result<(MountTarget, String)> {
        match self {
            Self::Mounted(table) => {
                let resolved = table.resolve(name)?;
                Ok((resolved.target, resolved.local_name))
            }
            Self::Single(target) => Ok((target.clone(), name.to_string())),
        }
    }

    fn list(&self) -> Vec<ToolDescriptor> {
        match self {
            Self::Mounted(table) => table.list_all().collect(),
            Self::Single(target) => target.tools(),
        }
    }
}

/// Per-message caller state
#[derive(Clone, Default)]
pub struct CallContext {
    /// Session the message arrived on; `None` in stateless mode
    pub session: Option<Arc<Session>>,
    /// Raw `Authorization` header value
    pub credential: Option<String>,
    /// Where progress and log notifications from a running tool go
    pub notifier: Option<NotificationSender>,
    /// Extra cancellation source (e.g. the HTTP stream being dropped)
    pub cancel: Option<CancellationToken>,
}

/// Answers JSON-RPC messages against a [`Catalog`]
pub struct Dispatcher {
    catalog: Catalog,
    auth: AuthGate,
    clock: SharedClock,
    tool_timeout: Duration,
    server_info: Info,
    instructions: Option<String>,
}

impl Dispatcher {
    /// Dispatcher over `catalog` verifying tokens against published JWKS
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        let jwks = JwksCache::new(Arc::new(HttpKeySource::new()), JwksRefresh::default());
        Self {
            catalog,
            auth: AuthGate::new(Arc::new(jwks)),
            clock: clock::system(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            server_info: Info::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            instructions: None,
        }
    }

    /// Use a specific auth gate
    #[must_use]
    pub fn with_auth(mut self, auth: AuthGate) -> Self {
        self.auth = auth;
        self
    }

    /// Use a specific clock for handlers and deadlines
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline for local tool calls
    #[must_use]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Identity reported by `initialize`
    #[must_use]
    pub fn with_server_info(mut self, info: Info, instructions: Option<String>) -> Self {
        self.server_info = info;
        self.instructions = instructions;
        self
    }

    /// The catalog
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Handle one message; requests get a response, everything else `None`
    pub async fn handle(&self, message: JsonRpcMessage, ctx: CallContext) -> Option<JsonRpcResponse> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.handle_request(request, ctx).await),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(&notification, &ctx);
                None
            }
            JsonRpcMessage::Response(response) => {
                debug!(id = ?response.id, "Ignoring client response");
                None
            }
        }
    }

    /// [`handle`](Self::handle), relaying the notifications the call
    /// produces to `session`'s outbound stream ahead of the response
    pub async fn handle_relayed(
        &self,
        message: JsonRpcMessage,
        mut ctx: CallContext,
        session: &Session,
    ) -> Option<JsonRpcResponse> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.notifier = Some(tx);
        let call = self.handle(message, ctx);
        tokio::pin!(call);

        let response = loop {
            tokio::select! {
                Some(notification) = rx.recv() => {
                    session.notify(JsonRpcMessage::Notification(notification));
                }
                response = &mut call => break response,
            }
        };
        while let Ok(notification) = rx.try_recv() {
            session.notify(JsonRpcMessage::Notification(notification));
        }
        response
    }

    /// Handle one request
    #[tracing::instrument(skip_all, fields(method = %request.method, id = %request.id))]
    pub async fn handle_request(&self, request: JsonRpcRequest, ctx: CallContext) -> JsonRpcResponse {
        let id = request.id.clone();
        let result = match request.method.as_str() {
            methods::INITIALIZE => self.initialize(request.params.as_ref(), &ctx),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.require_ready(&ctx, methods::TOOLS_LIST).and_then(|()| {
                let tools = self.catalog.list().iter().map(ToolDescriptor::to_tool).collect();
                serde_json::to_value(ToolsListResult {
                    tools,
                    next_cursor: None,
                })
                .map_err(Error::from)
            }),
            methods::TOOLS_CALL => match self.require_ready(&ctx, methods::TOOLS_CALL) {
                Ok(()) => self.call_tool(&id, request.params, &ctx).await,
                Err(e) => Err(e),
            },
            methods::RESOURCES_LIST => {
                serde_json::to_value(ResourcesListResult::default()).map_err(Error::from)
            }
            methods::RESOURCES_READ => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Err(Error::NotFound(format!("resource '{uri}'")))
            }
            other => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                );
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                debug!(error = %e, kind = e.kind(), "Request failed");
                JsonRpcResponse {
                    jsonrpc: "2.0".to_string(),
                    id: Some(id),
                    result: None,
                    error: Some(e.to_rpc_error()),
                }
            }
        }
    }

    fn handle_notification(&self, notification: &JsonRpcNotification, ctx: &CallContext) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                if let Some(ref session) = ctx.session {
                    session.complete_handshake();
                }
            }
            methods::CANCELLED => {
                let params = notification
                    .params
                    .clone()
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
                match (params, &ctx.session) {
                    (Some(params), Some(session)) => {
                        if session.cancel_request(&params.request_id) {
                            debug!(
                                request_id = %params.request_id,
                                reason = params.reason.as_deref().unwrap_or(""),
                                "Request cancelled by client"
                            );
                        }
                    }
                    (None, _) => warn!("Malformed cancellation notification"),
                    (Some(_), None) => {}
                }
            }
            other => debug!(method = %other, "Ignoring notification"),
        }
    }

    fn require_ready(&self, ctx: &CallContext, method: &str) -> Result<()> {
        match ctx.session {
            Some(ref session) => session.require_ready(method),
            None => Ok(()),
        }
    }

    fn initialize(&self, params: Option<&Value>, ctx: &CallContext) -> Result<Value> {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = negotiate_version(requested);
        if let Some(ref session) = ctx.session {
            session.begin_handshake(version)?;
        }
        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                resources: Some(ResourcesCapability::default()),
                logging: Some(json!({})),
            },
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn call_tool(
        &self,
        id: &RequestId,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<Value> {
        let params: ToolsCallParams = params
            .ok_or_else(|| invalid_params("missing params"))
            .and_then(|p| serde_json::from_value(p).map_err(|e| invalid_params(&e.to_string())))?;

        let (target, local_name) = self.catalog.resolve(&params.name)?;
        self.authorize(&target, &local_name, ctx).await?;

        let result = match target {
            MountTarget::Local(registry) => {
                let progress_token = params.meta.and_then(|m| m.progress_token);
                self.invoke_local(&registry, id, &local_name, params.arguments, progress_token, ctx)
                    .await?
            }
            MountTarget::Remote(backend) => {
                self.forward_remote(&backend, id, &local_name, params.arguments, ctx)
                    .await?
            }
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn authorize(
        &self,
        target: &MountTarget,
        local_name: &str,
        ctx: &CallContext,
    ) -> Result<()> {
        let extra: BTreeSet<String> = target
            .descriptor(local_name)
            .map(|d| d.required_scopes)
            .unwrap_or_default();
        match target.policy() {
            Some(policy) => {
                let principal = self
                    .auth
                    .authorize(ctx.credential.as_deref(), &policy, &extra)
                    .await?;
                debug!(subject = ?principal.subject, tool = %local_name, "Authorized");
                Ok(())
            }
            None if extra.is_empty() => Ok(()),
            // A scoped tool on an unauthenticated mount can never be satisfied
            None => Err(Error::InvalidToken(format!(
                "'{local_name}' requires scopes but its service has no auth policy"
            ))),
        }
    }

    async fn invoke_local(
        &self,
        registry: &ToolRegistry,
        id: &RequestId,
        local_name: &str,
        arguments: Value,
        progress_token: Option<RequestId>,
        ctx: &CallContext,
    ) -> Result<ToolsCallResult> {
        let cancel = match ctx.session {
            Some(ref session) => session.track(id),
            None => CancellationToken::new(),
        };
        let outer = ctx.cancel.clone().unwrap_or_default();

        let mut tool_ctx = ToolContext::detached(local_name)
            .with_progress_token(progress_token)
            .with_cancellation(cancel.clone())
            .with_clock(Arc::clone(&self.clock));
        if let Some(ref notifier) = ctx.notifier {
            tool_ctx = tool_ctx.with_notifier(notifier.clone());
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled(format!("call to '{local_name}'"))),
            () = outer.cancelled() => {
                cancel.cancel();
                Err(Error::Cancelled(format!("call to '{local_name}'")))
            }
            result = registry.invoke(local_name, arguments, tool_ctx) => result,
            () = self.clock.sleep(self.tool_timeout) => {
                cancel.cancel();
                Err(Error::tool_execution(
                    local_name,
                    anyhow::anyhow!("timed out after {:?}", self.tool_timeout),
                ))
            }
        };
        if let Some(ref session) = ctx.session {
            session.untrack(id);
        }
        outcome.map(wrap_result)
    }

    /// Forward to a backend under the same cancellation sources as a local
    /// call; either one relays the cancellation upstream
    async fn forward_remote(
        &self,
        backend: &Arc<ProxyBackend>,
        id: &RequestId,
        local_name: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<ToolsCallResult> {
        let cancel = match ctx.session {
            Some(ref session) => session.track(id),
            None => CancellationToken::new(),
        };
        let outer = ctx.cancel.clone().unwrap_or_default();

        let forward = backend.forward(local_name, arguments, &cancel);
        tokio::pin!(forward);
        let outcome = tokio::select! {
            result = &mut forward => result,
            () = outer.cancelled() => {
                cancel.cancel();
                forward.await
            }
        };
        if let Some(ref session) = ctx.session {
            session.untrack(id);
        }
        outcome
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server_info", &self.server_info)
            .field("tool_timeout", &self.tool_timeout)
            .finish_non_exhaustive()
    }
}

fn invalid_params(message: &str) -> Error {
    Error::InvalidParams(message.to_string())
}

/// Render a handler's return value as call content: strings become text,
/// anything else is sent both as JSON text and as structured content.
/// Structured content is always an object, so scalars and arrays are
/// wrapped as `{"result": value}`.
fn wrap_result(value: Value) -> ToolsCallResult {
    match value {
        Value::String(text) => ToolsCallResult {
            content: vec![Content::text(text)],
            structured_content: None,
            is_error: false,
        },
        other => {
            let text = other.to_string();
            let structured = if other.is_object() {
                other
            } else {
                json!({ "result": other })
            };
            ToolsCallResult {
                content: vec![Content::text(text)],
                structured_content: Some(structured),
                is_error: false,
            }
        }
    }
}
