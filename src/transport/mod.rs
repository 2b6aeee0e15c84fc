//! Client-side transports for talking to remote tool servers, and the
//! session type that runs the protocol handshake over any of them.

mod http;
pub mod sse;
mod stdio;

pub use self::http::{HttpMode, HttpTransport, PROTOCOL_HEADER, SESSION_HEADER};
pub use self::stdio::StdioTransport;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::{
    CancelledParams, Info, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId, Tool, ToolsCallParams,
    ToolsCallResult, ToolsListResult, methods,
};
use crate::{Error, Result};

/// Capacity of each transport's notification fan-out
const NOTIFICATION_CAPACITY: usize = 256;

/// A bidirectional JSON-RPC channel to one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fresh id for an outgoing request
    fn next_id(&self) -> RequestId;

    /// Send `request` and wait for the response carrying its id
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a request under a fresh id and wait for its response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        self.send(JsonRpcRequest::new(self.next_id(), method, params))
            .await
    }

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the underlying connection is believed alive
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Server-assigned session id, if any
    fn session_id(&self) -> Option<String>;

    /// Notifications the server pushes outside any request/response pair
    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification>;
}

pub(crate) fn notification_channel() -> broadcast::Sender<JsonRpcNotification> {
    broadcast::channel(NOTIFICATION_CAPACITY).0
}

/// Wire flavour used to reach a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Subprocess speaking newline-delimited JSON
    Stdio,
    /// `GET` event stream plus `POST` message endpoint
    Sse,
    /// `POST` per request, JSON or event-stream responses
    #[default]
    #[serde(alias = "http", alias = "streamable_http")]
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable-http" | "streamable_http" | "http" => Ok(Self::StreamableHttp),
            other => Err(Error::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Turn a response into its `result`, relaying a JSON-RPC error unchanged
pub fn into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(error.into());
    }
    response
        .result
        .ok_or_else(|| Error::Protocol("response carries neither result nor error".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Fresh,
    Ready,
    Closed,
}

/// A transport plus the protocol handshake.
///
/// `initialize` must succeed before `list_tools` or `call_tool`; anything
/// else is refused locally with [`Error::HandshakeRequired`] and never
/// reaches the wire.
pub struct ClientSession {
    transport: Arc<dyn Transport>,
    client_info: Info,
    state: RwLock<HandshakeState>,
    server: RwLock<Option<InitializeResult>>,
}

impl ClientSession {
    /// Session over `transport`, not yet initialized
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            client_info: Info::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            state: RwLock::new(HandshakeState::Fresh),
            server: RwLock::new(None),
        }
    }

    /// Identify as `info` in the handshake
    #[must_use]
    pub fn with_client_info(mut self, info: Info) -> Self {
        self.client_info = info;
        self
    }

    /// Run `initialize` then `notifications/initialized`
    #[tracing::instrument(skip(self), fields(client = %self.client_info.name))]
    pub async fn initialize(&self) -> Result<InitializeResult> {
        match *self.state.read() {
            HandshakeState::Ready => {
                return Err(Error::Handshake("session already initialized".into()));
            }
            HandshakeState::Closed => {
                return Err(Error::Handshake("session closed".into()));
            }
            HandshakeState::Fresh => {}
        }

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: self.client_info.clone(),
        };
        let response = self
            .transport
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result = match into_result(response) {
            Ok(value) => value,
            Err(Error::JsonRpc { message, .. }) => {
                return Err(Error::Handshake(format!("server refused initialize: {message}")));
            }
            Err(e) => return Err(e),
        };
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::Handshake(format!("malformed initialize result: {e}")))?;

        self.transport.notify(methods::INITIALIZED, None).await?;

        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "Handshake complete"
        );
        *self.server.write() = Some(result.clone());
        *self.state.write() = HandshakeState::Ready;
        Ok(result)
    }

    /// Whether the handshake completed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        *self.state.read() == HandshakeState::Ready
    }

    /// What the server reported during the handshake
    #[must_use]
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server.read().clone()
    }

    /// The underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn ensure_ready(&self, method: &str) -> Result<()> {
        match *self.state.read() {
            HandshakeState::Ready => Ok(()),
            HandshakeState::Fresh => Err(Error::HandshakeRequired(method.to_string())),
            HandshakeState::Closed => Err(Error::Transport("session closed".into())),
        }
    }

    /// Enumerate the server's tools
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.ensure_ready(methods::TOOLS_LIST)?;
        let value = into_result(self.transport.request(methods::TOOLS_LIST, None).await?)?;
        let list: ToolsListResult = serde_json::from_value(value)?;
        debug!(count = list.tools.len(), "Listed tools");
        Ok(list.tools)
    }

    /// Call one tool by its name on the server
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolsCallResult> {
        self.call_tool_until(name, arguments, &CancellationToken::new())
            .await
    }

    /// [`call_tool`](Self::call_tool), abandoned when `cancel` fires. The
    /// server is told with `notifications/cancelled` for the request's id.
    pub async fn call_tool_until(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        self.ensure_ready(methods::TOOLS_CALL)?;
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        let request = JsonRpcRequest::new(
            self.transport.next_id(),
            methods::TOOLS_CALL,
            Some(serde_json::to_value(&params)?),
        );
        let id = request.id.clone();

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let notice = CancelledParams {
                    request_id: id,
                    reason: Some("cancelled by client".into()),
                };
                if let Err(e) = self
                    .transport
                    .notify(methods::CANCELLED, Some(serde_json::to_value(&notice)?))
                    .await
                {
                    debug!(error = %e, "Cancellation notice not delivered");
                }
                Err(Error::Cancelled(format!("call to '{name}'")))
            }
            response = self.transport.send(request) => {
                let value = into_result(response?)?;
                Ok(serde_json::from_value(value)?)
            }
        }
    }

    /// Round-trip a `ping`
    pub async fn ping(&self) -> Result<()> {
        into_result(self.transport.request(methods::PING, None).await?).map(|_| ())
    }

    /// Server notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.transport.subscribe()
    }

    /// Close the transport; the session cannot be reused
    pub async fn close(&self) -> Result<()> {
        *self.state.write() = HandshakeState::Closed;
        self.transport.close().await
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &*self.state.read())
            .field("session_id", &self.transport.session_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::{JsonRpcError, ServerCapabilities};

    /// Answers `initialize`, never answers `tools/call`, and counts
    /// everything that reaches the wire
    struct Scripted {
        sent: AtomicUsize,
        ids: AtomicI64,
        refuse: bool,
        notified: Mutex<Vec<(String, Option<Value>)>>,
        notifications: broadcast::Sender<JsonRpcNotification>,
    }

    impl Scripted {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
                ids: AtomicI64::new(1),
                refuse,
                notified: Mutex::new(Vec::new()),
                notifications: notification_channel(),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        fn next_id(&self) -> RequestId {
            RequestId::Number(self.ids.fetch_add(1, Ordering::SeqCst))
        }

        async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let id = request.id;
            Ok(match request.method.as_str() {
                methods::INITIALIZE if self.refuse => {
                    JsonRpcResponse::error(Some(id), -32600, "no thanks")
                }
                methods::INITIALIZE => JsonRpcResponse::success(
                    id,
                    serde_json::to_value(InitializeResult {
                        protocol_version: PROTOCOL_VERSION.into(),
                        capabilities: ServerCapabilities::default(),
                        server_info: Info::new("scripted", "1"),
                        instructions: None,
                    })
                    .unwrap(),
                ),
                methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({"tools": []})),
                methods::TOOLS_CALL => std::future::pending().await,
                _ => JsonRpcResponse::error(Some(id), -32601, "nope"),
            })
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.notified.lock().push((method.to_string(), params));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn session_id(&self) -> Option<String> {
            None
        }

        fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
            self.notifications.subscribe()
        }
    }

    #[tokio::test]
    async fn calls_before_handshake_never_reach_the_wire() {
        let transport = Scripted::new(false);
        let session = ClientSession::new(transport.clone());

        assert!(matches!(
            session.list_tools().await,
            Err(Error::HandshakeRequired(m)) if m == "tools/list"
        ));
        assert!(matches!(
            session.call_tool("add", json!({})).await,
            Err(Error::HandshakeRequired(_))
        ));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);

        session.initialize().await.unwrap();
        // initialize + initialized
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
        assert!(session.is_initialized());
        assert_eq!(session.list_tools().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn abandoned_call_is_announced_to_the_server() {
        let transport = Scripted::new(false);
        let session = Arc::new(ClientSession::new(transport.clone()));
        session.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let call = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { session.call_tool_until("slow", json!({}), &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled(_))));

        // initialize took id 1, the call id 2
        let notified = transport.notified.lock().clone();
        let (method, params) = notified.last().unwrap();
        assert_eq!(method, methods::CANCELLED);
        assert_eq!(params.as_ref().unwrap()["requestId"], 2);
    }

    #[tokio::test]
    async fn refused_initialize_is_a_handshake_error() {
        let session = ClientSession::new(Scripted::new(true));
        assert!(matches!(session.initialize().await, Err(Error::Handshake(_))));
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let session = ClientSession::new(Scripted::new(false));
        session.initialize().await.unwrap();
        assert!(matches!(session.initialize().await, Err(Error::Handshake(_))));
    }

    #[test]
    fn backend_errors_are_relayed_verbatim() {
        let response = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(3)),
            result: None,
            error: Some(JsonRpcError {
                code: -32099,
                message: "custom".into(),
                data: Some(json!({"x": 1})),
            }),
        };
        match into_result(response) {
            Err(Error::JsonRpc { code, message, data }) => {
                assert_eq!(code, -32099);
                assert_eq!(message, "custom");
                assert_eq!(data, Some(json!({"x": 1})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transport_kind_parses_config_spellings() {
        assert_eq!("sse".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert_eq!(
            "streamable-http".parse::<TransportKind>().unwrap(),
            TransportKind::StreamableHttp
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        let kind: TransportKind = serde_json::from_value(json!("stdio")).unwrap();
        assert_eq!(kind, TransportKind::Stdio);
    }
}
