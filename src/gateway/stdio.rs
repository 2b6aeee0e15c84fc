//! Serve a dispatcher over newline-delimited JSON-RPC on a byte stream
//! (stdin/stdout for a spawned backend).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tracing::debug;

use super::dispatch::{CallContext, Dispatcher};
use super::session::SessionManager;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcMessage, JsonRpcResponse};
use crate::{Error, Result};

/// Answer messages read from `reader` on `writer` until `reader` hits EOF.
///
/// The stream is one session. Requests run concurrently, so a
/// `notifications/cancelled` can reach a call still in flight; other
/// notifications are handled in arrival order.
pub async fn serve_stdio<R, W>(
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = sessions.create();
    let mut outbound = session
        .attach()
        .ok_or_else(|| Error::Internal("stdio session already has a writer".into()))?;

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound.next().await {
            let mut line = serde_json::to_vec(&message)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        Ok::<_, Error>(())
    });

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Unparseable line");
                session
                    .deliver(JsonRpcMessage::Response(JsonRpcResponse::error(
                        None,
                        rpc_codes::PARSE_ERROR,
                        format!("Parse error: {e}"),
                    )))
                    .await;
                continue;
            }
        };
        let ctx = CallContext {
            session: Some(Arc::clone(&session)),
            ..Default::default()
        };
        match message {
            JsonRpcMessage::Request(_) => {
                let dispatcher = Arc::clone(&dispatcher);
                let session = Arc::clone(&session);
                calls.spawn(async move {
                    if let Some(response) = dispatcher.handle_relayed(message, ctx, &session).await {
                        session.deliver(JsonRpcMessage::Response(response)).await;
                    }
                });
            }
            other => {
                dispatcher.handle(other, ctx).await;
            }
        }
    }

    debug!("Input closed; waiting for in-flight calls");
    while calls.join_next().await.is_some() {}
    sessions.remove(session.id());
    writer_task
        .await
        .map_err(|e| Error::Internal(format!("stdio writer task: {e}")))?
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

    use super::*;
    use crate::gateway::dispatch::Catalog;
    use crate::mount::MountTarget;
    use crate::services::ServiceKind;

    async fn send(out: &mut DuplexStream, v: Value) {
        out.write_all(format!("{v}\n").as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn answers_over_a_byte_stream() {
        let dispatcher = Arc::new(Dispatcher::new(Catalog::Single(MountTarget::Local(
            ServiceKind::Add.build().unwrap(),
        ))));
        let (client_in, server_out) = duplex(64 * 1024);
        let (mut client_out, server_in) = duplex(64 * 1024);
        let server = tokio::spawn(serve_stdio(
            dispatcher,
            Arc::new(SessionManager::new()),
            server_in,
            server_out,
        ));
        let mut replies = BufReader::new(client_in).lines();

        send(&mut client_out, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {},
                       "clientInfo": {"name": "t", "version": "0"}}}))
        .await;
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 1);

        send(&mut client_out, json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        send(&mut client_out, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 40, "b": 2}}}))
        .await;
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["content"][0]["text"], "42");

        send(&mut client_out, Value::String("not json".into())).await;
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], rpc_codes::PARSE_ERROR);

        drop(client_out);
        server.await.unwrap().unwrap();
    }
}
