//! Server-side sessions: handshake state, outbound messages, idle
//! expiry, and cancellation of in-flight calls.
//!
//! Each session has two outbound paths. Responses and the notifications a
//! call emits go through an ordered queue that never drops a response.
//! Gateway-wide announcements such as `notifications/tools/list_changed`
//! go through a lossy fan-out channel. One stream at a time drains both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{self, SharedClock};
use crate::protocol::{JsonRpcMessage, RequestId};
use crate::{Error, Result};

/// Capacity of each session's ordered outbound queue
const OUTBOUND_CAPACITY: usize = 256;

/// Capacity of each session's fan-out channel
const EVENT_CAPACITY: usize = 64;

/// Where a session is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet
    New,
    /// `initialize` answered, waiting for `notifications/initialized`
    Initializing,
    /// Handshake complete
    Ready,
}

/// One connected client
pub struct Session {
    id: String,
    state: RwLock<HandshakeState>,
    protocol_version: RwLock<Option<String>>,
    outbound: mpsc::Sender<JsonRpcMessage>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<JsonRpcMessage>>>,
    events: broadcast::Sender<JsonRpcMessage>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
    inflight: DashMap<RequestId, CancellationToken>,
}

impl Session {
    fn new(id: String, now: Instant) -> Self {
        let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            state: RwLock::new(HandshakeState::New),
            protocol_version: RwLock::new(None),
            outbound,
            queue: Arc::new(tokio::sync::Mutex::new(queue)),
            events,
            last_seen: Mutex::new(now),
            cancel: CancellationToken::new(),
            inflight: DashMap::new(),
        }
    }

    /// Session id (`gw-<uuid>`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handshake state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        *self.state.read()
    }

    /// Negotiated protocol revision
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().clone()
    }

    /// Record an answered `initialize`
    pub fn begin_handshake(&self, version: &str) -> Result<()> {
        let mut state = self.state.write();
        if *state != HandshakeState::New {
            return Err(Error::Handshake("session already initialized".into()));
        }
        *state = HandshakeState::Initializing;
        *self.protocol_version.write() = Some(version.to_string());
        Ok(())
    }

    /// Record `notifications/initialized`
    pub fn complete_handshake(&self) {
        let mut state = self.state.write();
        if *state == HandshakeState::Initializing {
            *state = HandshakeState::Ready;
            debug!(session_id = %self.id, "Handshake complete");
        }
    }

    /// Fail unless the handshake is complete
    pub fn require_ready(&self, method: &str) -> Result<()> {
        if self.state() == HandshakeState::Ready {
            Ok(())
        } else {
            Err(Error::HandshakeRequired(method.to_string()))
        }
    }

    /// Queue a response for this session's stream, waiting for room.
    /// Gives up only if the session closes first.
    pub async fn deliver(&self, message: JsonRpcMessage) {
        tokio::select! {
            biased;
            _ = self.outbound.send(message) => {}
            () = self.cancel.cancelled() => {
                debug!(session_id = %self.id, "Session closed before delivery");
            }
        }
    }

    /// Queue a notification behind everything already queued; dropped
    /// when the queue is full
    pub fn notify(&self, message: JsonRpcMessage) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.outbound.try_send(message) {
            warn!(session_id = %self.id, "Outbound queue full, notification dropped");
        }
    }

    /// Announce `message` to the attached stream, if any. Lossy: a stream
    /// that falls behind skips the oldest announcements.
    pub fn publish(&self, message: JsonRpcMessage) {
        let _ = self.events.send(message);
    }

    /// Take the session's outbound side for one stream; `None` while
    /// another stream holds it
    pub fn attach(&self) -> Option<Outbound> {
        let queue = Arc::clone(&self.queue).try_lock_owned().ok()?;
        Some(Outbound {
            session_id: self.id.clone(),
            queue,
            events: self.events.subscribe(),
            closed: self.cancel.clone(),
        })
    }

    /// Whether a stream currently holds the outbound side
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.queue.try_lock().is_err()
    }

    /// Last time the client used this session
    #[must_use]
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    fn touch(&self, now: Instant) {
        *self.last_seen.lock() = now;
    }

    /// Token for one call; cancelled with the session or by
    /// `notifications/cancelled`
    pub fn track(&self, id: &RequestId) -> CancellationToken {
        let token = self.cancel.child_token();
        self.inflight.insert(id.clone(), token.clone());
        token
    }

    /// Forget a finished call
    pub fn untrack(&self, id: &RequestId) {
        self.inflight.remove(id);
    }

    /// Cancel one in-flight call; false if it is not running
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        match self.inflight.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of calls running
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Session-wide token
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn close(&self) {
        self.cancel.cancel();
        self.inflight.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

/// The receiving end of a session, held by the one stream that writes to
/// the client
pub struct Outbound {
    session_id: String,
    queue: OwnedMutexGuard<mpsc::Receiver<JsonRpcMessage>>,
    events: broadcast::Receiver<JsonRpcMessage>,
    closed: CancellationToken,
}

impl Outbound {
    /// Next message to write; `None` once the session is closed and its
    /// queue is drained
    pub async fn next(&mut self) -> Option<JsonRpcMessage> {
        loop {
            tokio::select! {
                biased;
                Some(message) = self.queue.recv() => return Some(message),
                event = self.events.recv() => match event {
                    Ok(message) => return Some(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %self.session_id, skipped, "Session stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
                () = self.closed.cancelled() => return None,
            }
        }
    }
}

/// Live sessions by id
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    clock: SharedClock,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_clock(clock::system())
    }
}

impl SessionManager {
    /// Empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty manager measuring idleness with `clock`
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Open a session with a fresh id
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(
            format!("gw-{}", Uuid::new_v4()),
            self.clock.now(),
        ));
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, "Session opened");
        session
    }

    /// Session by id; counts as activity on it
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned()?;
        session.touch(self.clock.now());
        Some(session)
    }

    /// Close a session, cancelling its in-flight calls
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(id)?;
        session.close();
        info!(session_id = %id, "Session closed");
        Some(session)
    }

    /// Announce `message` on every session
    pub fn broadcast(&self, message: &JsonRpcMessage) {
        for session in self.sessions.read().values() {
            session.publish(message.clone());
        }
    }

    /// Close sessions unused for at least `ttl`. A session with an open
    /// stream or a call in flight is in use. Returns how many closed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let now = self.clock.now();
        let idle: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                !s.is_attached()
                    && s.inflight() == 0
                    && now.saturating_duration_since(s.last_seen()) >= ttl
            })
            .map(|s| s.id.clone())
            .collect();
        for id in &idle {
            debug!(session_id = %id, ?ttl, "Session idle");
            self.remove(id);
        }
        idle.len()
    }

    /// Calls in flight across every session
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.sessions.read().values().map(|s| s.inflight()).sum()
    }

    /// Number of open sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session
    pub fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (_, session) in drained {
            session.close();
        }
    }
}

/// Closes its session when dropped; travels with a stream whose lifetime
/// is the session's.
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    id: String,
}

impl SessionGuard {
    /// Guard for `id`
    #[must_use]
    pub fn new(manager: Arc<SessionManager>, id: impl Into<String>) -> Self {
        Self {
            manager,
            id: id.into(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(session_id = %self.id, "Stream dropped");
        self.manager.remove(&self.id);
    }
}

/// Cancels a token when dropped
pub struct CancelOnDrop(pub CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{JsonRpcNotification, JsonRpcResponse, methods};

    #[test]
    fn handshake_progression() {
        let session = Session::new("s".into(), Instant::now());
        assert!(matches!(
            session.require_ready("tools/list"),
            Err(Error::HandshakeRequired(_))
        ));
        // initialized before initialize is ignored
        session.complete_handshake();
        assert_eq!(session.state(), HandshakeState::New);

        session.begin_handshake("2025-06-18").unwrap();
        assert!(session.require_ready("tools/list").is_err());
        session.complete_handshake();
        session.require_ready("tools/list").unwrap();
        assert!(matches!(
            session.begin_handshake("2025-06-18"),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn closing_a_session_cancels_its_calls() {
        let manager = SessionManager::new();
        let session = manager.create();
        assert!(session.id().starts_with("gw-"));

        let a = session.track(&RequestId::from(1_i64));
        let b = session.track(&RequestId::from(2_i64));
        assert!(session.cancel_request(&RequestId::from(2_i64)));
        assert!(b.is_cancelled());
        assert!(!a.is_cancelled());
        assert!(!session.cancel_request(&RequestId::from(9_i64)));

        manager.remove(session.id());
        assert!(a.is_cancelled());
        assert!(manager.get(session.id()).is_none());
    }

    #[test]
    fn guard_removes_session_on_drop() {
        let manager = Arc::new(SessionManager::new());
        let session = manager.create();
        let guard = SessionGuard::new(Arc::clone(&manager), session.id());
        assert_eq!(manager.len(), 1);
        drop(guard);
        assert!(manager.is_empty());
        assert!(session.cancellation().is_cancelled());
    }

    fn list_changed() -> JsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None))
    }

    #[tokio::test]
    async fn responses_survive_an_announcement_flood() {
        let manager = SessionManager::new();
        let session = manager.create();
        let mut outbound = session.attach().unwrap();
        assert!(session.attach().is_none());
        assert!(session.is_attached());

        for _ in 0..(EVENT_CAPACITY * 4) {
            manager.broadcast(&list_changed());
        }
        session.notify(JsonRpcMessage::Notification(JsonRpcNotification::new(
            methods::PROGRESS,
            None,
        )));
        session
            .deliver(JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::from(7_i64),
                serde_json::json!({}),
            )))
            .await;

        // Queued messages keep their order and come before announcements
        let Some(JsonRpcMessage::Notification(first)) = outbound.next().await else {
            panic!("expected the progress notification first");
        };
        assert_eq!(first.method, methods::PROGRESS);
        let Some(JsonRpcMessage::Response(response)) = outbound.next().await else {
            panic!("expected the response second");
        };
        assert_eq!(response.id, Some(RequestId::from(7_i64)));
        // The lagged announcements are skipped, not fatal
        assert!(matches!(outbound.next().await, Some(JsonRpcMessage::Notification(_))));

        drop(outbound);
        assert!(!session.is_attached());
        assert!(session.attach().is_some());
    }

    #[tokio::test]
    async fn closing_drains_the_queue_then_ends_the_stream() {
        let manager = SessionManager::new();
        let session = manager.create();
        let mut outbound = session.attach().unwrap();
        session
            .deliver(JsonRpcMessage::Response(JsonRpcResponse::success(
                RequestId::from(1_i64),
                serde_json::json!({}),
            )))
            .await;
        manager.remove(session.id());

        assert!(matches!(outbound.next().await, Some(JsonRpcMessage::Response(_))));
        assert!(outbound.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let clock = Arc::new(ManualClock::new());
        let manager = SessionManager::with_clock(Arc::clone(&clock) as SharedClock);
        let ttl = Duration::from_secs(60);

        let idle = manager.create();
        let busy = manager.create();
        let streaming = manager.create();
        let _outbound = streaming.attach().unwrap();
        let _call = busy.track(&RequestId::from(1_i64));
        let used = manager.create();

        clock.advance(Duration::from_secs(45));
        assert!(manager.get(used.id()).is_some());
        assert_eq!(manager.sweep_idle(ttl), 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(manager.sweep_idle(ttl), 1);
        assert!(manager.get(idle.id()).is_none());
        assert!(idle.cancellation().is_cancelled());
        assert!(manager.get(busy.id()).is_some());
        assert!(manager.get(streaming.id()).is_some());
        assert!(manager.get(used.id()).is_some());
    }
}
