//! HTTP transports: event-stream (`GET` stream + `POST` endpoint) and
//! streamable HTTP (`POST` per request).
//!
//! Event-stream protocol:
//! 1. `GET` the stream URL; the first `endpoint` event names the message URL
//!    (usually `/messages?session_id=...`).
//! 2. `POST` each request to that URL; the server acknowledges with 202.
//! 3. Responses and notifications arrive on the stream and are matched to
//!    waiting requests by id.
//!
//! Streamable HTTP answers each `POST` with JSON or with a short event
//! stream ending in the response. A server that issues `mcp-session-id` on
//! `initialize` gets it echoed on every later request; a server that never
//! issues one is treated as stateless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::SseDecoder;
use super::{Transport, notification_channel};
use crate::auth::CredentialSource;
use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    RequestId,
};
use crate::{Error, Result};

/// Session header used by streamable HTTP
pub const SESSION_HEADER: &str = "mcp-session-id";
/// Header carrying the negotiated protocol revision
pub const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// Which HTTP flavour to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    /// `GET` event stream plus `POST` message endpoint
    Sse,
    /// `POST` per request
    Streamable,
}

/// HTTP transport for remote tool servers
pub struct HttpTransport {
    client: Client,
    url: String,
    mode: HttpMode,
    headers: HeaderMap,
    credential: Option<Arc<dyn CredentialSource>>,
    timeout: Duration,
    message_url: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    pending: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpTransport {
    /// Transport for `url`; call [`connect`](Self::connect) before use
    pub fn new(url: impl Into<String>, mode: HttpMode, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            mode,
            headers: HeaderMap::new(),
            credential: None,
            timeout,
            message_url: RwLock::new(None),
            session_id: RwLock::new(None),
            pending: DashMap::new(),
            notifications: notification_channel(),
            stream_task: Mutex::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    /// Extra headers sent with every request
    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Result<Self> {
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid value for header '{name}': {e}")))?;
            self.headers.insert(name, value);
        }
        Ok(self)
    }

    /// Attach `Authorization: Bearer ...` from `credential` to every request
    #[must_use]
    pub fn with_credential(mut self, credential: Arc<dyn CredentialSource>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Connect: open the event stream (SSE) or just arm the endpoint (streamable)
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.mode {
            HttpMode::Streamable => {
                *self.message_url.write() = Some(self.url.clone());
                self.connected.store(true, Ordering::Relaxed);
                debug!(url = %self.url, "Streamable HTTP transport ready");
                Ok(())
            }
            HttpMode::Sse => self.open_stream().await,
        }
    }

    async fn open_stream(self: &Arc<Self>) -> Result<()> {
        let mut headers = self.base_headers().await?;
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(&self.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("event stream connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let weak = Arc::downgrade(self);
        let mut stream = response.bytes_stream();
        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut endpoint_tx = Some(endpoint_tx);
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                for event in decoder.push_bytes(&chunk) {
                    if event.event == "endpoint" {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(event.data);
                        }
                        continue;
                    }
                    let Some(transport) = weak.upgrade() else { return };
                    transport.dispatch(&event.data);
                }
            }
            if let Some(transport) = weak.upgrade() {
                transport.connected.store(false, Ordering::Relaxed);
                transport.pending.clear();
                debug!(url = %transport.url, "Event stream ended");
            }
        });
        *self.stream_task.lock() = Some(task);

        let endpoint = match tokio::time::timeout(self.timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                return Err(Error::Transport(
                    "event stream ended without an endpoint event".into(),
                ));
            }
            Err(_) => {
                self.abort_stream();
                return Err(Error::BackendTimeout("no endpoint event received".into()));
            }
        };

        let message_url = self.resolve(&endpoint)?;
        if let Some(id) = message_url
            .query_pairs()
            .find(|(k, _)| k == "session_id" || k == "sessionId")
            .map(|(_, v)| v.into_owned())
        {
            *self.session_id.write() = Some(id);
        }
        info!(stream = %self.url, messages = %message_url, "Event stream connected");
        *self.message_url.write() = Some(message_url.into());
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn resolve(&self, endpoint: &str) -> Result<Url> {
        let base = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid URL '{}': {e}", self.url)))?;
        base.join(endpoint)
            .map_err(|e| Error::Protocol(format!("bad endpoint '{endpoint}': {e}")))
    }

    fn abort_stream(&self) {
        if let Some(task) = self.stream_task.lock().take() {
            task.abort();
        }
    }

    fn dispatch(&self, data: &str) {
        match serde_json::from_str::<JsonRpcMessage>(data) {
            Ok(JsonRpcMessage::Response(response)) => {
                if let Some((_, tx)) = response.id.as_ref().and_then(|id| self.pending.remove(id)) {
                    let _ = tx.send(response);
                }
            }
            Ok(JsonRpcMessage::Notification(n)) => {
                let _ = self.notifications.send(n);
            }
            Ok(JsonRpcMessage::Request(r)) => {
                debug!(method = %r.method, "Ignoring server-initiated request");
            }
            Err(e) => warn!(error = %e, "Unparseable event from backend"),
        }
    }

    async fn base_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(PROTOCOL_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
        if let Some(ref credential) = self.credential {
            let token = credential.bearer().await?;
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::Config("bearer token is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        if let Some(ref id) = *self.session_id.read() {
            if self.mode == HttpMode::Streamable {
                let value = HeaderValue::from_str(id)
                    .map_err(|_| Error::Protocol("server issued an unusable session id".into()))?;
                headers.insert(SESSION_HEADER, value);
            }
        }
        Ok(headers)
    }

    fn message_url(&self) -> Result<String> {
        self.message_url
            .read()
            .clone()
            .ok_or_else(|| Error::Transport("not connected".into()))
    }

    async fn post<T: Serialize + Sync>(&self, body: &T) -> Result<reqwest::Response> {
        let url = self.message_url()?;
        let mut headers = self.base_headers().await?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {url} failed: {e}")))?;

        if self.mode == HttpMode::Streamable && self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                info!(session_id = %id, url = %url, "Backend issued session");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id.read().is_some() {
            self.connected.store(false, Ordering::Relaxed);
            return Err(Error::Transport("backend session expired".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    /// Read a streamable-HTTP response body until the response to `id`
    async fn read_response(
        &self,
        response: reqwest::Response,
        id: &RequestId,
    ) -> Result<JsonRpcResponse> {
        let is_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if !is_stream {
            return response
                .json()
                .await
                .map_err(|e| Error::Protocol(format!("malformed response body: {e}")));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(format!("stream read failed: {e}")))?;
            for event in decoder.push_bytes(&chunk) {
                if let Some(response) = self.take_response(&event.data, id) {
                    return Ok(response);
                }
            }
        }
        if let Some(event) = decoder.finish() {
            if let Some(response) = self.take_response(&event.data, id) {
                return Ok(response);
            }
        }
        Err(Error::Protocol("event stream ended without a response".into()))
    }

    fn take_response(&self, data: &str, id: &RequestId) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcMessage>(data) {
            Ok(JsonRpcMessage::Response(r)) if r.id.as_ref() == Some(id) => Some(r),
            Ok(JsonRpcMessage::Notification(n)) => {
                let _ = self.notifications.send(n);
                None
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Unparseable event in response stream");
                None
            }
        }
    }

    async fn exchange(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        match self.mode {
            HttpMode::Streamable => {
                let response = self.post(request).await?;
                self.read_response(response, &request.id).await
            }
            HttpMode::Sse => {
                let (tx, rx) = oneshot::channel();
                self.pending.insert(request.id.clone(), tx);
                if let Err(e) = self.post(request).await {
                    self.pending.remove(&request.id);
                    return Err(e);
                }
                rx.await
                    .map_err(|_| Error::Transport("event stream closed before responding".into()))
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn next_id(&self) -> RequestId {
        RequestId::from(self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    #[tracing::instrument(skip_all, fields(url = %self.url, method = %request.method))]
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&request.id);
                Err(Error::BackendTimeout(format!(
                    "{} exceeded {}ms",
                    request.method,
                    self.timeout.as_millis()
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = tokio::time::timeout(self.timeout, self.post(&notification))
            .await
            .map_err(|_| Error::BackendTimeout(format!("{method} notification timed out")))??;
        debug!(method, status = %response.status(), "Notification delivered");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.abort_stream();
        self.pending.clear();

        if self.mode == HttpMode::Streamable && self.session_id.read().is_some() {
            let headers = self.base_headers().await?;
            let url = self.message_url()?;
            if let Err(e) = self.client.delete(&url).headers(headers).send().await {
                debug!(error = %e, "Session DELETE failed");
            }
        }
        *self.session_id.write() = None;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort_stream();
    }
}
