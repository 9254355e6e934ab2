//! Pending reply handlers keyed by message ref.

use crate::envelope::Envelope;
use crate::error::{ChannelClosed, ChannelError, CloseReason};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;

/// What a reply handler eventually receives: the correlated reply, or the
/// reason the channel closed first.
pub type ReplyResult = Result<Envelope, ChannelClosed>;

/// One-shot handler for the reply to a single request.
///
/// Invoked on the socket's dispatch task; it must not block.
pub struct ReplyHandler(Box<dyn FnOnce(ReplyResult) + Send + 'static>);

impl ReplyHandler {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// A handler that ignores its outcome.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// A handler that forwards its outcome to the returned receiver.
    pub fn oneshot() -> (Self, oneshot::Receiver<ReplyResult>) {
        let (tx, rx) = oneshot::channel();
        let handler = Self::new(move |result| {
            // Receiver may have given up waiting.
            let _ = tx.send(result);
        });
        (handler, rx)
    }

    /// Consume the handler.
    pub fn invoke(self, result: ReplyResult) {
        (self.0)(result)
    }
}

impl fmt::Debug for ReplyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyHandler")
    }
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<String, ReplyHandler>,
    sealed: Option<CloseReason>,
}

/// Maps message refs to the handler awaiting each reply.
///
/// Callers register; the dispatch loop resolves and drains. Once drained the
/// registry is sealed and later registrations are signalled closed at once.
#[derive(Default)]
pub struct CallbackRegistry {
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `msg_ref`.
    pub fn register(
        &self,
        msg_ref: impl Into<String>,
        handler: ReplyHandler,
    ) -> Result<(), ChannelError> {
        let msg_ref = msg_ref.into();
        let mut state = self.state.lock();

        if let Some(reason) = state.sealed.clone() {
            drop(state);
            let closed = ChannelClosed::new(reason);
            handler.invoke(Err(closed.clone()));
            return Err(ChannelError::Closed(closed));
        }

        if state.pending.contains_key(&msg_ref) {
            tracing::error!(msg_ref = %msg_ref, "message ref registered twice");
            return Err(ChannelError::DuplicateRef(msg_ref));
        }

        state.pending.insert(msg_ref, handler);
        Ok(())
    }

    /// Remove and return the handler for `msg_ref`, if any.
    pub fn resolve(&self, msg_ref: &str) -> Option<ReplyHandler> {
        self.state.lock().pending.remove(msg_ref)
    }

    /// Remove every handler and seal the registry.
    pub fn drain(&self) -> Vec<ReplyHandler> {
        self.seal(CloseReason::TransportClosed)
    }

    fn seal(&self, reason: CloseReason) -> Vec<ReplyHandler> {
        let mut state = self.state.lock();
        state.sealed.get_or_insert(reason);
        state.pending.drain().map(|(_, handler)| handler).collect()
    }

    /// Drain and signal every pending handler with `ChannelClosed`.
    ///
    /// Returns how many handlers were signalled.
    pub fn close(&self, reason: CloseReason) -> usize {
        let handlers = self.seal(reason.clone());
        let count = handlers.len();
        for handler in handlers {
            handler.invoke(Err(ChannelClosed::new(reason.clone())));
        }
        count
    }

    /// Number of pending handlers.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns `true` if no handlers are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The reason the registry was sealed with, if it has been.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().sealed.clone()
    }

    /// Returns `true` once the registry has been drained.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed.is_some()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallbackRegistry")
            .field("pending", &state.pending.len())
            .field("sealed", &state.sealed.is_some())
            .finish()
    }
}
