//! HTTP router and handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use super::dispatch::{CallContext, Dispatcher};
use super::session::{CancelOnDrop, Outbound, Session, SessionGuard, SessionManager};
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, methods};
use crate::transport::SESSION_HEADER;

/// Shared application state
pub struct AppState {
    /// Answers JSON-RPC messages
    pub dispatcher: Arc<Dispatcher>,
    /// Open sessions
    pub sessions: Arc<SessionManager>,
    /// No sessions: every POST stands alone
    pub stateless: bool,
    /// SSE keep-alive comment interval
    pub keep_alive: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_stream_handler)
                .delete(mcp_delete_handler),
        )
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn accepts_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn rpc_error(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(JsonRpcResponse::error(None, code, message)),
    )
        .into_response()
}

fn message_event(message: &JsonRpcMessage) -> Event {
    Event::default()
        .event("message")
        .data(serde_json::to_string(message).unwrap_or_default())
}

/// Look up the session named by the request headers
fn session_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Arc<Session>, Response> {
    let Some(id) = header_str(headers, SESSION_HEADER) else {
        return Err(rpc_error(
            StatusCode::BAD_REQUEST,
            rpc_codes::INVALID_REQUEST,
            "Missing mcp-session-id header",
        ));
    };
    state.sessions.get(&id).ok_or_else(|| {
        debug!(session_id = %id, "Unknown session");
        rpc_error(
            StatusCode::NOT_FOUND,
            rpc_codes::INVALID_REQUEST,
            "Session not found",
        )
    })
}

/// Streamable HTTP (POST /mcp)
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Unparseable request body");
            return rpc_error(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                &format!("Parse error: {e}"),
            );
        }
    };

    // Only an `initialize` request opens a session
    let is_initialize =
        matches!(&message, JsonRpcMessage::Request(r) if r.method == methods::INITIALIZE);
    let session = if state.stateless {
        None
    } else if is_initialize {
        Some(state.sessions.create())
    } else {
        match session_from_headers(&state, &headers) {
            Ok(session) => Some(session),
            Err(response) => return response,
        }
    };

    let ctx = CallContext {
        session: session.clone(),
        credential: header_str(&headers, header::AUTHORIZATION),
        ..Default::default()
    };

    let request = match message {
        JsonRpcMessage::Request(request) => request,
        other => {
            match session {
                Some(ref session) => {
                    state.dispatcher.handle_relayed(other, ctx, session).await;
                }
                None => {
                    state.dispatcher.handle(other, ctx).await;
                }
            }
            return StatusCode::ACCEPTED.into_response();
        }
    };

    if request.method == methods::TOOLS_CALL && accepts_sse(&headers) {
        return stream_call(&state, request, ctx).into_response();
    }

    let response = match session {
        Some(ref session) => {
            state
                .dispatcher
                .handle_relayed(JsonRpcMessage::Request(request), ctx, session)
                .await
        }
        None => state.dispatcher.handle(JsonRpcMessage::Request(request), ctx).await,
    };

    let mut response = Json(response).into_response();
    if let Some(session) = session.filter(|_| is_initialize) {
        if let Ok(value) = HeaderValue::from_str(session.id()) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    response
}

/// Answer a `tools/call` as an SSE stream: the call's notifications in
/// order, then its response. Dropping the stream cancels the call.
fn stream_call(
    state: &AppState,
    request: JsonRpcRequest,
    mut ctx: CallContext,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    ctx.notifier = Some(tx);
    ctx.cancel = Some(cancel.clone());

    let dispatcher = Arc::clone(&state.dispatcher);
    let call = tokio::spawn(async move { dispatcher.handle_request(request, ctx).await });

    let stream = stream! {
        let _guard = CancelOnDrop(cancel);
        while let Some(notification) = rx.recv().await {
            yield Ok(message_event(&JsonRpcMessage::Notification(notification)));
        }
        match call.await {
            Ok(response) => yield Ok(message_event(&JsonRpcMessage::Response(response))),
            Err(e) => error!(error = %e, "Tool call task failed"),
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive))
}

/// Everything sent to a session until it closes
fn session_stream(
    mut outbound: Outbound,
    first: Option<Event>,
    guard: Option<SessionGuard>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        let _guard = guard;
        if let Some(event) = first {
            yield Ok(event);
        }
        while let Some(message) = outbound.next().await {
            yield Ok(message_event(&message));
        }
    }
}

fn stream_in_use() -> Response {
    rpc_error(
        StatusCode::CONFLICT,
        rpc_codes::INVALID_REQUEST,
        "Session already has an open stream",
    )
}

/// Server-to-client stream for a streamable HTTP session (GET /mcp)
async fn mcp_stream_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if state.stateless {
        return rpc_error(
            StatusCode::METHOD_NOT_ALLOWED,
            rpc_codes::INVALID_REQUEST,
            "Server is stateless; there is no session stream",
        );
    }
    if !accepts_sse(&headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"error": "Must accept text/event-stream"})),
        )
            .into_response();
    }
    let session = match session_from_headers(&state, &headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(outbound) = session.attach() else {
        return stream_in_use();
    };
    debug!(session_id = %session.id(), "Session stream opened");
    Sse::new(session_stream(outbound, None, None))
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

/// Session termination (DELETE /mcp)
async fn mcp_delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match header_str(&headers, SESSION_HEADER) {
        Some(id) => {
            if state.sessions.remove(&id).is_some() {
                info!(session_id = %id, "Session terminated by client");
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            }
        }
        None => StatusCode::BAD_REQUEST,
    }
}

/// Legacy SSE transport: open a session (GET /sse).
///
/// The first event names the endpoint to POST messages to; responses and
/// notifications arrive on this stream. Closing it closes the session.
async fn sse_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.sessions.create();
    let guard = SessionGuard::new(Arc::clone(&state.sessions), session.id());
    let Some(outbound) = session.attach() else {
        return stream_in_use();
    };
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={}", session.id()));
    Sse::new(session_stream(outbound, Some(endpoint), Some(guard)))
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    session_id: String,
}

/// Legacy SSE transport: client-to-server messages (POST /messages).
///
/// Notifications take effect before the 202 goes out, so a client may send
/// its next request right away. Requests run in the background and answer
/// on the session stream.
async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session) = state.sessions.get(&query.session_id) else {
        return rpc_error(
            StatusCode::NOT_FOUND,
            rpc_codes::INVALID_REQUEST,
            "Session not found",
        );
    };
    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                &format!("Parse error: {e}"),
            );
        }
    };

    let ctx = CallContext {
        session: Some(Arc::clone(&session)),
        credential: header_str(&headers, header::AUTHORIZATION),
        ..Default::default()
    };
    match message {
        JsonRpcMessage::Request(_) => {
            let dispatcher = Arc::clone(&state.dispatcher);
            tokio::spawn(async move {
                if let Some(response) = dispatcher.handle_relayed(message, ctx, &session).await {
                    session.deliver(JsonRpcMessage::Response(response)).await;
                }
            });
        }
        other => {
            state.dispatcher.handle(other, ctx).await;
        }
    }
    StatusCode::ACCEPTED.into_response()
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "stateless": state.stateless,
        "sessions": state.sessions.len(),
    }))
}
