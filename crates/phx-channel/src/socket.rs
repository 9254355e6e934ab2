//! The shared WebSocket connection and its dispatch loop.
//!
//! A [`Socket`] owns exactly one WebSocket. Any number of channels, one per
//! topic, are multiplexed over it. A single spawned task owns the stream: it
//! writes frames queued by callers, reads inbound frames and routes them to the
//! channel for their topic, and sends heartbeats.
//!
//! ```text
//!   Channel::send ──┐                       ┌──> registry.resolve(ref) ──> ReplyHandler
//!   Channel::leave ─┼─> commands ─> [dispatch task] ─┤
//!   heartbeat tick ─┘         ▲          │           └──> broadcast handler
//!                             │          ▼
//!                            WebSocket stream
//! ```

use crate::channel::{Channel, ChannelShared};
use crate::config::SocketConfig;
use crate::envelope::{self, EVENT_HEARTBEAT, Envelope, HEARTBEAT_TOPIC};
use crate::error::{ChannelClosed, ChannelError, CloseReason};
use crate::refs::RefAllocator;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Work queued for the dispatch task.
pub(crate) enum Command {
    /// Write one frame.
    Push {
        frame: String,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Write a leave frame and detach the channel.
    Leave {
        channel: Arc<ChannelShared>,
        frame: String,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Close the WebSocket and stop.
    Disconnect { ack: oneshot::Sender<()> },
}

pub(crate) struct SocketShared {
    pub(crate) config: SocketConfig,
    channels: DashMap<String, Arc<ChannelShared>>,
    closed: Mutex<Option<CloseReason>>,
}

impl SocketShared {
    fn new(config: SocketConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            closed: Mutex::new(None),
        }
    }

    fn lookup(&self, topic: &str) -> Option<Arc<ChannelShared>> {
        self.channels.get(topic).map(|entry| entry.value().clone())
    }

    fn detach(&self, channel: &Arc<ChannelShared>) {
        self.channels
            .remove_if(channel.topic(), |_, current| Arc::ptr_eq(current, channel));
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.closed.lock().clone()
    }

    /// Mark the socket closed and close every channel on it.
    fn shutdown(&self, reason: CloseReason) {
        {
            let mut closed = self.closed.lock();
            if closed.is_none() {
                *closed = Some(reason.clone());
            }
        }

        let channels: Vec<Arc<ChannelShared>> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.channels.clear();

        for channel in channels {
            channel.close(reason.clone());
        }
    }
}

/// Handle to a WebSocket connection shared by channels.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
    commands: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Socket {
    /// Connect to a Phoenix endpoint.
    ///
    /// `address` is the socket URL, e.g. `ws://localhost:4000/socket/websocket`.
    /// The configured query parameters and `vsn` are appended.
    pub async fn connect(address: &str, config: SocketConfig) -> Result<Self, ChannelError> {
        let url = config.endpoint_url(address)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                tracing::warn!(%host, error = %e, "WebSocket connect failed");
                ChannelError::from(e)
            })?;

        tracing::info!(%host, path = %url.path(), "WebSocket connected");
        Ok(Self::from_stream(stream, config))
    }

    /// Run the socket over an already established WebSocket stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, config: SocketConfig) -> Self
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let (commands, rx) = mpsc::channel(config.outbound_buffer.max(1));
        let shared = Arc::new(SocketShared::new(config));

        let dispatcher = Dispatcher::new(shared.clone());
        let task = tokio::spawn(dispatcher.run(stream, rx));

        Self {
            shared,
            commands,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Create a channel for `topic` on this socket.
    ///
    /// The channel starts idle; call [`Channel::join`] to join it.
    pub fn channel(&self, topic: impl Into<String>) -> Result<Channel, ChannelError> {
        let shared = Arc::new(ChannelShared::new(topic, self.shared.config.ref_seed)?);
        self.attach(shared.clone())?;
        Ok(Channel::new(shared, self.clone(), false))
    }

    /// Register a channel for inbound routing.
    pub(crate) fn attach(&self, channel: Arc<ChannelShared>) -> Result<(), ChannelError> {
        // Holding `closed` keeps shutdown from missing a channel inserted concurrently.
        let closed = self.shared.closed.lock();
        if let Some(reason) = closed.clone() {
            return Err(ChannelClosed::new(reason).into());
        }

        let topic = channel.topic().to_string();
        if let Some(existing) = self.shared.lookup(&topic) {
            if !existing.state().is_terminal() {
                return Err(ChannelError::AlreadyJoined(topic));
            }
        }
        self.shared.channels.insert(topic, channel);
        Ok(())
    }

    pub(crate) fn detach(&self, channel: &Arc<ChannelShared>) {
        self.shared.detach(channel);
    }

    /// Queue a frame and wait until it has been written.
    pub(crate) async fn write(&self, frame: String) -> Result<(), ChannelError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Push { frame, ack })
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Write a leave frame and detach `channel`; its pending handlers are
    /// signalled on the dispatch task.
    pub(crate) async fn leave(
        &self,
        channel: Arc<ChannelShared>,
        frame: String,
    ) -> Result<(), ChannelError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave { channel, frame, ack })
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Close the connection.
    ///
    /// Every channel on the socket is closed and all pending reply handlers
    /// are signalled before this returns.
    pub async fn disconnect(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { ack }).await.is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "dispatch task failed");
            }
        }
    }

    /// Returns `true` once the connection has stopped.
    pub fn is_closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    /// Why the connection stopped, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Topics with a channel currently attached.
    pub fn topics(&self) -> Vec<String> {
        self.shared
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn closed_error(&self) -> ChannelError {
        let reason = self
            .shared
            .close_reason()
            .unwrap_or(CloseReason::TransportClosed);
        ChannelClosed::new(reason).into()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("topics", &self.topics())
            .field("closed", &self.close_reason())
            .finish()
    }
}

/// Heartbeat bookkeeping for the dispatch task.
struct Heartbeat {
    interval: Option<Interval>,
    refs: RefAllocator,
    pending: Option<String>,
}

impl Heartbeat {
    fn new(period: Option<Duration>, seed: u64) -> Self {
        let interval = period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            interval,
            refs: RefAllocator::new(seed),
            pending: None,
        }
    }

    async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    fn acknowledge(&mut self, envelope: &Envelope) {
        if envelope.msg_ref.is_some() && envelope.msg_ref == self.pending {
            tracing::trace!(msg_ref = ?envelope.msg_ref, "heartbeat acknowledged");
            self.pending = None;
        }
    }

    fn next_frame(&mut self) -> Result<String, ChannelError> {
        let msg_ref = self.refs.next_message_ref();
        let frame = envelope::encode(
            &Envelope::new(HEARTBEAT_TOPIC, EVENT_HEARTBEAT, json!({})).with_msg_ref(&msg_ref),
        )?;
        self.pending = Some(msg_ref);
        Ok(frame)
    }
}

/// The single owner of the WebSocket stream.
struct Dispatcher {
    shared: Arc<SocketShared>,
    heartbeat: Heartbeat,
}

impl Dispatcher {
    fn new(shared: Arc<SocketShared>) -> Self {
        let heartbeat = Heartbeat::new(shared.config.heartbeat_interval, shared.config.ref_seed);
        Self { shared, heartbeat }
    }

    async fn run<S>(mut self, mut stream: S, mut commands: mpsc::Receiver<Command>)
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let mut disconnect_ack = None;

        let reason = loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Push { frame, ack }) => {
                            let result = stream.send(Message::Text(frame.into())).await;
                            match result {
                                Ok(()) => {
                                    let _ = ack.send(Ok(()));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "WebSocket write error");
                                    let reason = CloseReason::TransportError(e.to_string());
                                    let _ = ack.send(Err(e.into()));
                                    break reason;
                                }
                            }
                        }
                        Some(Command::Leave { channel, frame, ack }) => {
                            let result = stream.send(Message::Text(frame.into())).await;
                            self.shared.detach(&channel);
                            channel.close(CloseReason::Left);
                            match result {
                                Ok(()) => {
                                    let _ = ack.send(Ok(()));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "WebSocket write error");
                                    let reason = CloseReason::TransportError(e.to_string());
                                    let _ = ack.send(Err(e.into()));
                                    break reason;
                                }
                            }
                        }
                        Some(Command::Disconnect { ack }) => {
                            if let Err(e) = stream.close().await {
                                tracing::debug!(error = %e, "WebSocket close error");
                            }
                            disconnect_ack = Some(ack);
                            break CloseReason::Disconnected;
                        }
                        // Every handle is gone; nobody can use the socket anymore.
                        None => break CloseReason::Disconnected,
                    }
                }

                frame = stream.next() => {
                    let msg = match frame {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WebSocket read error");
                            break CloseReason::TransportError(e.to_string());
                        }
                        None => break CloseReason::TransportClosed,
                    };

                    match msg {
                        Message::Text(text) => self.route(text.as_str()),
                        Message::Binary(data) => {
                            tracing::warn!(len = data.len(), "ignoring binary frame");
                        }
                        Message::Ping(_) => {
                            // tungstenite queues the pong automatically
                            tracing::trace!("PING");
                        }
                        Message::Pong(_) => tracing::trace!("PONG"),
                        Message::Close(frame) => {
                            tracing::info!(frame = ?frame, "WebSocket closed by server");
                            break CloseReason::TransportClosed;
                        }
                        Message::Frame(_) => {}
                    }
                }

                _ = self.heartbeat.tick() => {
                    if let Some(pending) = self.heartbeat.pending.as_deref() {
                        tracing::warn!(msg_ref = %pending, "heartbeat timeout");
                        break CloseReason::HeartbeatTimeout;
                    }
                    let frame = match self.heartbeat.next_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode heartbeat");
                            continue;
                        }
                    };
                    if let Err(e) = stream.send(Message::Text(frame.into())).await {
                        tracing::warn!(error = %e, "WebSocket write error");
                        break CloseReason::TransportError(e.to_string());
                    }
                }
            }
        };

        self.shared.shutdown(reason.clone());

        // Fail anything still queued behind the shutdown.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            let closed = ChannelClosed::new(reason.clone());
            match command {
                Command::Push { ack, .. } => {
                    let _ = ack.send(Err(closed.into()));
                }
                Command::Leave { ack, .. } => {
                    let _ = ack.send(Ok(()));
                }
                Command::Disconnect { ack } => {
                    let _ = ack.send(());
                }
            }
        }

        if let Some(ack) = disconnect_ack {
            let _ = ack.send(());
        }

        tracing::info!(%reason, "WebSocket disconnected");
    }

    /// Decode one inbound text frame and hand it to its channel.
    fn route(&mut self, text: &str) {
        let envelope = match envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping invalid frame");
                return;
            }
        };

        if envelope.is_heartbeat_topic() {
            self.heartbeat.acknowledge(&envelope);
            return;
        }

        let channel = match self.shared.lookup(&envelope.topic) {
            Some(channel) => channel,
            None => {
                tracing::debug!(
                    topic = %envelope.topic,
                    event = %envelope.event,
                    "frame for topic without a channel"
                );
                return;
            }
        };

        if channel.dispatch(envelope) {
            self.shared.detach(&channel);
        }
    }
}
