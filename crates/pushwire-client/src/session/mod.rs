//! Session lifecycle
//!
//! The [`SessionManager`] owns the session and drives it through
//! create → stream → (rebind | close). Decoded events reach the application
//! through the [`SessionListener`] passed to `create`.

mod listener;
mod manager;
mod worker;

pub use listener::SessionListener;
pub use manager::SessionManager;

use std::fmt;
use std::time::Duration;

use crate::protocol::SessionHeader;

/// Connection phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// No session yet
    #[default]
    Idle,
    /// Create request sent, waiting for the response header
    Creating,
    /// Bound to a stream connection and delivering events
    Streaming,
    /// Stream lost, opening a new connection for the same session
    Rebinding,
    /// Closed by `disconnect()` or by the server
    Closed,
    /// Ended by an unrecoverable error
    Failed,
}

impl Phase {
    /// `Closed` and `Failed` are terminal: a new session needs a new `create()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Streaming => "streaming",
            Self::Rebinding => "rebinding",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Identifier assigned by the server on create; unchanged by rebinds
    pub session_id: String,
    /// Number of successful rebinds
    pub bind_count: u32,
    pub adapter_set: String,
    /// Keep-alive interval confirmed by the server
    pub keepalive: Option<Duration>,
    /// Content length confirmed for the current connection
    pub content_length: Option<u64>,
    /// Host for control requests, when different from the stream host
    pub control_address: Option<String>,
    /// Maximum length of a control request
    pub request_limit: Option<u64>,
}

impl SessionInfo {
    pub(crate) fn created(header: SessionHeader, adapter_set: &str) -> Self {
        Self {
            session_id: header.session_id,
            bind_count: 0,
            adapter_set: adapter_set.to_string(),
            keepalive: header.keepalive,
            content_length: header.content_length,
            control_address: header.control_address,
            request_limit: header.request_limit,
        }
    }

    /// Record a successful bind. The session identifier is kept.
    pub(crate) fn rebound(&mut self, header: SessionHeader) {
        self.bind_count += 1;
        self.keepalive = header.keepalive.or(self.keepalive);
        self.content_length = header.content_length;
        if header.control_address.is_some() {
            self.control_address = header.control_address;
        }
        if header.request_limit.is_some() {
            self.request_limit = header.request_limit;
        }
    }
}
