//! Channels: one joined topic on a socket.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─> Connecting ─> Joining ─> Joined ─> Leaving ─> Closed
//!   │          │           │          │
//!   └──────────┴───────────┴──────────┴─────> Errored
//! ```
//!
//! `Connecting` only occurs for channels created by [`Channel::connect_and_join`],
//! which opens a dedicated socket. Channels created with
//! [`Socket::channel`](crate::Socket::channel) reuse an open socket and go from
//! `Idle` straight to `Joining`.
//!
//! A closed or errored channel cannot be rejoined; create a new one.

use crate::config::SocketConfig;
use crate::envelope::{
    self, EVENT_CLOSE, EVENT_ERROR, EVENT_JOIN, EVENT_LEAVE, Envelope, HEARTBEAT_TOPIC,
    ReplyStatus,
};
use crate::error::{ChannelClosed, ChannelError, CloseReason};
use crate::refs::RefAllocator;
use crate::registry::{CallbackRegistry, ReplyHandler};
use crate::socket::Socket;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not joined yet.
    Idle,
    /// Opening the socket.
    Connecting,
    /// Join sent, waiting for the reply.
    Joining,
    /// Join accepted.
    Joined,
    /// Leave in progress.
    Leaving,
    /// Left, or the socket went away.
    Closed,
    /// Connect failed, join rejected, or the server crashed the channel.
    Errored,
}

impl ChannelState {
    /// Returns `true` for states a channel never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Handler for inbound frames that do not answer a pending request.
pub type BroadcastHandler = Arc<dyn Fn(Envelope) + Send + Sync + 'static>;

fn default_broadcast_handler() -> BroadcastHandler {
    Arc::new(|envelope: Envelope| {
        tracing::debug!(
            topic = %envelope.topic,
            event = %envelope.event,
            "unhandled broadcast"
        );
    })
}

/// Channel state shared between the [`Channel`] handles and the dispatch task.
pub(crate) struct ChannelShared {
    topic: String,
    refs: RefAllocator,
    registry: CallbackRegistry,
    state: Mutex<ChannelState>,
    broadcast: RwLock<BroadcastHandler>,
}

impl ChannelShared {
    pub(crate) fn new(topic: impl Into<String>, ref_seed: u64) -> Result<Self, ChannelError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ChannelError::InvalidName("topic must not be empty".into()));
        }
        // Frames on the heartbeat topic never reach a channel.
        if topic == HEARTBEAT_TOPIC {
            return Err(ChannelError::InvalidName(format!(
                "topic {:?} is reserved",
                HEARTBEAT_TOPIC
            )));
        }
        Ok(Self {
            topic,
            refs: RefAllocator::new(ref_seed),
            registry: CallbackRegistry::new(),
            state: Mutex::new(ChannelState::Idle),
            broadcast: RwLock::new(default_broadcast_handler()),
        })
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Move to `to` if currently in one of `from`. Returns the state found.
    fn transition(&self, from: &[ChannelState], to: ChannelState) -> Result<(), ChannelState> {
        let mut state = self.state.lock();
        let current = *state;
        if from.contains(&current) {
            tracing::trace!(topic = %self.topic, from = %current, %to, "channel state");
            *state = to;
            Ok(())
        } else {
            Err(current)
        }
    }

    /// Close the channel and signal every pending handler.
    pub(crate) fn close(&self, reason: CloseReason) {
        let next = match reason {
            CloseReason::ServerError | CloseReason::Rejected(_) => ChannelState::Errored,
            _ => ChannelState::Closed,
        };
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = next;
            }
        }

        let signalled = self.registry.close(reason.clone());
        tracing::debug!(topic = %self.topic, %reason, signalled, "channel closed");
    }

    /// Mark the channel errored after a failed connect.
    fn fail(&self, error: &ChannelError) {
        *self.state.lock() = ChannelState::Errored;
        self.close(CloseReason::TransportError(error.to_string()));
    }

    /// Deliver one inbound envelope.
    ///
    /// A correlated reply goes to its handler; anything else goes to the
    /// broadcast handler. Returns `true` if the server closed the channel.
    pub(crate) fn dispatch(&self, envelope: Envelope) -> bool {
        if let Some(msg_ref) = envelope.msg_ref.as_deref() {
            if let Some(handler) = self.registry.resolve(msg_ref) {
                handler.invoke(Ok(envelope));
                return false;
            }
        }

        let closed_by = match envelope.event.as_str() {
            EVENT_CLOSE => Some(CloseReason::ServerClosed),
            EVENT_ERROR => Some(CloseReason::ServerError),
            _ => None,
        };
        if let Some(reason) = &closed_by {
            tracing::info!(topic = %self.topic, event = %envelope.event, "channel closed by server");
            self.close(reason.clone());
        }

        let handler = self.broadcast.read().clone();
        handler(envelope);

        closed_by.is_some()
    }

    fn not_joined(&self, state: ChannelState) -> ChannelError {
        if state.is_terminal() {
            let reason = self.registry.close_reason().unwrap_or(CloseReason::Left);
            ChannelClosed::new(reason).into()
        } else {
            ChannelError::NotJoined {
                topic: self.topic.clone(),
                state,
            }
        }
    }
}

/// A dedicated socket lost during connect or join is a connection failure.
fn handshake_error(error: ChannelError) -> ChannelError {
    match error {
        ChannelError::Closed(closed) => ChannelError::Connection(closed.to_string()),
        other => other,
    }
}

/// A topic joined over a [`Socket`].
///
/// Cloning is cheap; clones share state, so a reply handler can hold a clone
/// and spawn a task that calls [`Channel::leave`].
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    socket: Socket,
    owns_socket: bool,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, socket: Socket, owns_socket: bool) -> Self {
        Self {
            shared,
            socket,
            owns_socket,
        }
    }

    /// Open a dedicated socket to `address` and join `topic` with `params`.
    ///
    /// Leaving the returned channel also closes its socket. Fails with
    /// [`ChannelError::Connection`] if the socket cannot be opened and with
    /// [`ChannelError::JoinRejected`] if the server declines the join.
    pub async fn connect_and_join<T>(
        address: &str,
        topic: impl Into<String>,
        params: &T,
        config: SocketConfig,
    ) -> Result<Self, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let shared = Arc::new(ChannelShared::new(topic, config.ref_seed)?);
        let payload = envelope::to_payload(params)?;

        shared
            .transition(&[ChannelState::Idle], ChannelState::Connecting)
            .map_err(|state| shared.not_joined(state))?;

        let socket = match Socket::connect(address, config).await {
            Ok(socket) => socket,
            Err(e) => {
                shared.fail(&e);
                return Err(e);
            }
        };
        if let Err(e) = socket.attach(shared.clone()) {
            let e = handshake_error(e);
            shared.fail(&e);
            socket.disconnect().await;
            return Err(e);
        }

        let channel = Self::new(shared, socket, true);
        channel.join_payload(payload).await.map_err(handshake_error)?;
        Ok(channel)
    }

    /// The topic of this channel.
    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Returns `true` while the join is accepted and the channel is open.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// The join ref, fixed for this channel's lifetime.
    pub fn join_ref(&self) -> &str {
        self.shared.refs.join_ref()
    }

    /// Why the channel closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.registry.close_reason()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_replies(&self) -> usize {
        self.shared.registry.len()
    }

    /// The socket this channel runs on.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Replace the handler for frames that do not answer a pending request.
    pub fn set_broadcast_handler<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        *self.shared.broadcast.write() = Arc::new(handler);
    }

    /// Join the topic. Returns the server's join reply.
    pub async fn join<T>(&self, params: &T) -> Result<Envelope, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let payload = envelope::to_payload(params)?;
        self.join_payload(payload).await
    }

    async fn join_payload(&self, payload: serde_json::Value) -> Result<Envelope, ChannelError> {
        self.shared
            .transition(
                &[ChannelState::Idle, ChannelState::Connecting],
                ChannelState::Joining,
            )
            .map_err(|state| match state {
                ChannelState::Joining | ChannelState::Joined | ChannelState::Leaving => {
                    ChannelError::AlreadyJoined(self.topic().to_string())
                }
                other => self.shared.not_joined(other),
            })?;

        let result = self.await_join(payload).await;
        if result.is_err() && self.owns_socket {
            self.socket.disconnect().await;
        }
        result
    }

    async fn await_join(&self, payload: serde_json::Value) -> Result<Envelope, ChannelError> {
        let msg_ref = self.shared.refs.next_message_ref();
        let frame = envelope::encode(
            &Envelope::new(self.topic(), EVENT_JOIN, payload)
                .with_join_ref(self.join_ref())
                .with_msg_ref(&msg_ref),
        )?;

        let (handler, rx) = ReplyHandler::oneshot();
        self.shared.registry.register(msg_ref.as_str(), handler)?;
        self.socket.write(frame).await?;
        tracing::debug!(topic = %self.topic(), join_ref = %self.join_ref(), "join sent");

        let reply = match rx.await {
            Ok(Ok(reply)) => reply,
            Ok(Err(closed)) => return Err(closed.into()),
            Err(_) => return Err(ChannelClosed::new(CloseReason::TransportClosed).into()),
        };

        match reply.reply_status() {
            Some(ReplyStatus::Ok) => {
                self.shared
                    .transition(&[ChannelState::Joining], ChannelState::Joined)
                    .map_err(|state| self.shared.not_joined(state))?;
                tracing::debug!(topic = %self.topic(), "joined channel");
                Ok(reply)
            }
            _ => {
                let reason = reply.rejection_reason();
                tracing::warn!(topic = %self.topic(), %reason, "join rejected");
                self.socket.detach(&self.shared);
                self.shared.close(CloseReason::Rejected(reason.clone()));
                Err(ChannelError::JoinRejected(reason))
            }
        }
    }

    /// Send `event` with `payload`; `on_reply` receives the correlated reply.
    ///
    /// Returns the message ref once the frame is written. `on_reply` is then
    /// invoked exactly once, with the reply or with [`ChannelClosed`] if the
    /// channel closes first. If this returns [`ChannelError::Closed`] the
    /// handler has already been signalled; on any other error it is dropped
    /// without being called.
    pub async fn send<T>(
        &self,
        event: &str,
        payload: &T,
        on_reply: ReplyHandler,
    ) -> Result<String, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let state = self.state();
        if state != ChannelState::Joined {
            let err = self.shared.not_joined(state);
            if let ChannelError::Closed(closed) = &err {
                on_reply.invoke(Err(closed.clone()));
            }
            return Err(err);
        }
        if event.is_empty() {
            return Err(ChannelError::InvalidName("event must not be empty".into()));
        }

        let payload = envelope::to_payload(payload)?;
        let msg_ref = self.shared.refs.next_message_ref();
        let frame = envelope::encode(
            &Envelope::new(self.topic(), event, payload)
                .with_join_ref(self.join_ref())
                .with_msg_ref(&msg_ref),
        )?;

        self.shared.registry.register(msg_ref.as_str(), on_reply)?;
        // On a failed write the dispatch task closes the channel, which
        // signals the handler registered above.
        self.socket.write(frame).await?;

        tracing::trace!(topic = %self.topic(), %event, %msg_ref, "sent");
        Ok(msg_ref)
    }

    /// Send `event` and wait for its reply.
    ///
    /// There is no built-in timeout; wrap in `tokio::time::timeout` if needed.
    pub async fn call<T>(&self, event: &str, payload: &T) -> Result<Envelope, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        let (handler, rx) = ReplyHandler::oneshot();
        self.send(event, payload, handler).await?;
        match rx.await {
            Ok(result) => result.map_err(ChannelError::from),
            Err(_) => Err(ChannelClosed::new(CloseReason::TransportClosed).into()),
        }
    }

    /// Send `event` and ignore any reply.
    pub async fn push<T>(&self, event: &str, payload: &T) -> Result<String, ChannelError>
    where
        T: Serialize + ?Sized,
    {
        self.send(event, payload, ReplyHandler::noop()).await
    }

    /// Leave the topic.
    ///
    /// Returns once the leave is written, every pending reply handler has
    /// been signalled with [`ChannelClosed`], and, for a channel from
    /// [`Channel::connect_and_join`], the socket is closed. Leaving a closed
    /// channel does nothing.
    pub async fn leave(&self) -> Result<(), ChannelError> {
        let from = [
            ChannelState::Idle,
            ChannelState::Connecting,
            ChannelState::Joining,
            ChannelState::Joined,
        ];
        let previous = self.state();
        if self.shared.transition(&from, ChannelState::Leaving).is_err() {
            return Ok(());
        }

        let result = if previous == ChannelState::Idle {
            self.socket.detach(&self.shared);
            Ok(())
        } else {
            self.write_leave().await
        };

        // No-op unless the socket was already gone.
        self.shared.close(CloseReason::Left);

        if self.owns_socket {
            self.socket.disconnect().await;
        }
        tracing::debug!(topic = %self.topic(), "left channel");

        match result {
            Err(ChannelError::Closed(_)) => Ok(()),
            other => other,
        }
    }

    async fn write_leave(&self) -> Result<(), ChannelError> {
        let msg_ref = self.shared.refs.next_message_ref();
        let frame = envelope::encode(
            &Envelope::new(self.topic(), EVENT_LEAVE, json!({}))
                .with_join_ref(self.join_ref())
                .with_msg_ref(&msg_ref),
        )?;
        self.socket.leave(self.shared.clone(), frame).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic())
            .field("state", &self.state())
            .field("join_ref", &self.join_ref())
            .field("refs_issued", &self.shared.refs.issued())
            .field("pending", &self.pending_replies())
            .finish()
    }
}
