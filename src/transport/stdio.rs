//! Stdio transport: a child process speaking newline-delimited JSON-RPC

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, warn};

use super::{Transport, notification_channel};
use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::{Error, Result};

/// Subprocess transport
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    pending: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl StdioTransport {
    /// Transport for `command args...`; nothing is spawned until [`start`](Self::start)
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: command.into(),
            args,
            env,
            cwd,
            timeout,
            child: Mutex::new(None),
            writer: Mutex::new(None),
            pending: DashMap::new(),
            notifications: notification_channel(),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        })
    }

    /// Spawn the process and start reading its stdout
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("empty command".into()));
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn '{}': {e}", self.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child has no stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "{line}");
                }
            });
        }

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.connected.store(true, Ordering::Relaxed);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                transport.handle_line(&line);
            }
            transport.connected.store(false, Ordering::Relaxed);
            // Dropping the senders fails every waiter
            transport.pending.clear();
            debug!(command = %transport.command, "Stdio reader ended");
        });

        debug!(command = %self.command, args = ?self.args, "Spawned stdio backend");
        Ok(())
    }

    fn handle_line(&self, line: &str) {
        match serde_json::from_str::<JsonRpcMessage>(line) {
            Ok(JsonRpcMessage::Response(response)) => {
                let Some(id) = response.id.clone() else {
                    warn!("Response without id from stdio backend");
                    return;
                };
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let _ = sender.send(response);
                }
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                let _ = self.notifications.send(notification);
            }
            Ok(JsonRpcMessage::Request(request)) => {
                debug!(method = %request.method, "Ignoring server-initiated request");
            }
            Err(e) => warn!(error = %e, "Unparseable line from stdio backend"),
        }
    }

    async fn write_line(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn next_id(&self) -> RequestId {
        RequestId::from(self.request_id.fetch_add(1, Ordering::Relaxed))
    }

    #[tracing::instrument(skip_all, fields(command = %self.command, method = %request.method))]
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_line(&message).await {
            self.pending.remove(&id);
            return Err(Error::Transport(format!("write failed: {e}")));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("backend exited before responding".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::BackendTimeout(format!(
                    "{} exceeded {}ms",
                    request.method,
                    self.timeout.as_millis()
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(&message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_transport_error() {
        let t = StdioTransport::new(
            "definitely-not-a-real-binary-7f3a",
            vec![],
            HashMap::new(),
            None,
            Duration::from_secs(1),
        );
        assert!(matches!(t.start().await, Err(Error::Transport(_))));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn request_without_start_fails_fast() {
        let t = StdioTransport::new("cat", vec![], HashMap::new(), None, Duration::from_secs(1));
        assert!(matches!(
            t.request("ping", None).await,
            Err(Error::Transport(_))
        ));
        assert!(t.pending.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_backend_times_out() {
        // `cat` echoes the request back; a request is not a response, so nothing resolves
        let t = StdioTransport::new("cat", vec![], HashMap::new(), None, Duration::from_millis(200));
        t.start().await.unwrap();
        assert!(matches!(
            t.request("ping", None).await,
            Err(Error::BackendTimeout(_))
        ));
        t.close().await.unwrap();
    }
}
