//! Listener interface and dispatch

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::error::SessionError;
use crate::protocol::FieldValue;
use crate::session::SessionInfo;

/// Receives the events of one session
///
/// Callbacks run on the session's worker task, in the order lines arrived
/// from the server. They must return quickly: while a callback runs, no
/// further lines are consumed. A callback may call
/// [`SessionManager::disconnect`](crate::SessionManager::disconnect).
///
/// Heartbeats are never delivered. After `on_stream_closed` or
/// `on_session_failed` no further callbacks are made for the session.
pub trait SessionListener: Send + Sync {
    /// A row update for `item`; fields follow the subscription schema
    fn on_row_update(&self, item: &str, fields: &[FieldValue]);

    /// A session-level error reported by the server
    fn on_session_error(&self, code: i32, message: &str);

    /// The session was closed, by `disconnect()` or by the server
    fn on_stream_closed(&self);

    /// A rebind completed; updates resume with the same session identifier
    fn on_rebind_succeeded(&self);

    /// The create response was accepted
    fn on_session_created(&self, _session: &SessionInfo) {}

    /// A control acknowledgement arrived on the stream
    fn on_control_acknowledged(&self, _detail: Option<&str>) {}

    /// The session ended with an unrecoverable error
    fn on_session_failed(&self, _error: &SessionError) {}
}

/// Delivers callbacks to one session's listener until the session ends
///
/// The gate is held while a callback runs, so closing it waits for a
/// callback in progress on another thread and nothing is delivered after
/// it. It is reentrant: a callback may close the session it is called for.
pub(crate) struct Dispatcher {
    listener: Arc<dyn SessionListener>,
    open: ReentrantMutex<Cell<bool>>,
}

impl Dispatcher {
    pub(crate) fn new(listener: Arc<dyn SessionListener>) -> Self {
        Self {
            listener,
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Run `f` unless the gate is closed
    pub(crate) fn dispatch(&self, f: impl FnOnce(&dyn SessionListener)) -> bool {
        let open = self.open.lock();
        if !open.get() {
            return false;
        }
        f(self.listener.as_ref());
        true
    }

    /// Close the gate and run `f` as the last callback.
    ///
    /// Returns false (and skips `f`) if the gate was already closed.
    pub(crate) fn finish(&self, f: impl FnOnce(&dyn SessionListener)) -> bool {
        let open = self.open.lock();
        if !open.replace(false) {
            return false;
        }
        f(self.listener.as_ref());
        true
    }
}
