//! Per-invocation context handed to tool handlers

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, SharedClock};
use crate::protocol::{
    JsonRpcNotification, LoggingLevel, LoggingMessageParams, ProgressParams, ProgressToken,
    methods,
};

/// Ordered stream of notifications produced by one invocation
pub type NotificationSender = mpsc::UnboundedSender<JsonRpcNotification>;

/// What a running handler can see and do besides computing its result.
///
/// Notifications go out through a single ordered channel, so a handler's
/// progress and log messages reach the caller in the order they were sent.
/// Sending never fails from the handler's point of view; if the caller is
/// gone the message is dropped.
#[derive(Clone)]
pub struct ToolContext {
    tool: String,
    progress_token: Option<ProgressToken>,
    notifier: Option<NotificationSender>,
    cancel: CancellationToken,
    clock: SharedClock,
}

impl ToolContext {
    /// Context with no notification sink, never cancelled, on the system clock
    #[must_use]
    pub fn detached(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            progress_token: None,
            notifier: None,
            cancel: CancellationToken::new(),
            clock: clock::system(),
        }
    }

    /// Route notifications into `sender`
    #[must_use]
    pub fn with_notifier(mut self, sender: NotificationSender) -> Self {
        self.notifier = Some(sender);
        self
    }

    /// Tag progress with the caller's token
    #[must_use]
    pub fn with_progress_token(mut self, token: Option<ProgressToken>) -> Self {
        self.progress_token = token;
        self
    }

    /// Tie the invocation to a cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use a specific clock
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Name the tool was invoked under (local name)
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub(crate) fn rename(&mut self, tool: &str) {
        tool.clone_into(&mut self.tool);
    }

    /// The injected clock
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Cancellation token for this invocation
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the caller has gone away
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep on the injected clock, returning early with an error if the
    /// invocation is cancelled first
    pub async fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => anyhow::bail!("cancelled while waiting"),
            () = self.clock.sleep(duration) => Ok(()),
        }
    }

    /// Report progress. Dropped when the caller supplied no progress token.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self, done: u64, total: Option<u64>) {
        let Some(token) = self.progress_token.clone() else {
            return;
        };
        let params = ProgressParams {
            progress_token: token,
            progress: done as f64,
            total: total.map(|t| t as f64),
            message: None,
        };
        self.emit(methods::PROGRESS, serde_json::to_value(params).ok());
    }

    /// Send a log message to the caller
    pub fn log(&self, level: LoggingLevel, message: impl Into<String>) {
        let params = LoggingMessageParams {
            level,
            logger: Some(self.tool.clone()),
            data: json!(message.into()),
        };
        self.emit(methods::MESSAGE, serde_json::to_value(params).ok());
    }

    /// Info-level log message
    pub fn info(&self, message: impl Into<String>) {
        self.log(LoggingLevel::Info, message);
    }

    /// Error-level log message
    pub fn error(&self, message: impl Into<String>) {
        self.log(LoggingLevel::Error, message);
    }

    fn emit(&self, method: &str, params: Option<serde_json::Value>) {
        if let Some(tx) = &self.notifier {
            let _ = tx.send(JsonRpcNotification::new(method, params));
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("tool", &self.tool)
            .field("progress_token", &self.progress_token)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[tokio::test]
    async fn notifications_keep_emission_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::detached("work")
            .with_notifier(tx)
            .with_progress_token(Some(RequestId::from("p1")));

        ctx.info("start");
        for i in 1..=3 {
            ctx.progress(i, Some(3));
        }
        ctx.info("done");
        drop(ctx);

        let mut seen = Vec::new();
        while let Some(n) = rx.recv().await {
            let params = n.params.unwrap_or_default();
            match n.method.as_str() {
                methods::PROGRESS => seen.push(format!("p{}", params["progress"])),
                methods::MESSAGE => seen.push(params["data"].as_str().unwrap_or("").to_string()),
                other => panic!("unexpected {other}"),
            }
        }
        assert_eq!(seen, vec!["start", "p1.0", "p2.0", "p3.0", "done"]);
    }

    #[tokio::test]
    async fn progress_without_token_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::detached("work").with_notifier(tx);
        ctx.progress(1, None);
        drop(ctx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        let ctx = ToolContext::detached("slow").with_cancellation(cancel.clone());
        cancel.cancel();
        assert!(ctx.sleep(Duration::from_secs(3600)).await.is_err());
    }
}
