//! Create/bind response header and control response parsing

use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use super::decoder::{decode_line, ServerError, UpdateEvent};
use super::{MalformedLine, MalformedReason, OK};

/// Session parameters confirmed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    /// Session identifier, stable across rebinds
    pub session_id: String,
    /// Keep-alive interval the server will honour
    pub keepalive: Option<Duration>,
    /// Bytes the server sends on this connection before asking for a rebind
    pub content_length: Option<u64>,
    /// Host to send control requests to, if not the stream host
    pub control_address: Option<String>,
    /// Maximum length of a control request
    pub request_limit: Option<u64>,
}

/// Why a create/bind response could not be accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("Request rejected: {0}")]
    Rejected(ServerError),

    #[error("Unexpected status line: {0:?}")]
    UnexpectedStatus(String),

    #[error(transparent)]
    Malformed(#[from] MalformedLine),

    #[error("Response header has no SessionId")]
    MissingSessionId,
}

/// Result of feeding one line to a [`SessionHeaderBuilder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStep {
    NeedMore,
    Complete(SessionHeader),
}

/// Incremental parser for the response header
///
/// The header is a status line (`OK` or an error line), then `Key=Value`
/// lines, then an empty line. Lines after the empty line belong to the stream.
#[derive(Debug, Default)]
pub struct SessionHeaderBuilder {
    status_seen: bool,
    session_id: Option<String>,
    keepalive: Option<Duration>,
    content_length: Option<u64>,
    control_address: Option<String>,
    request_limit: Option<u64>,
}

impl SessionHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Result<HeaderStep, HeaderError> {
        if !self.status_seen {
            return self.status_line(line).map(|_| HeaderStep::NeedMore);
        }

        if line.is_empty() {
            return self.finish().map(HeaderStep::Complete);
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| MalformedLine::new(line, MalformedReason::MissingHeaderSeparator))?;
        let number = |value: &str| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| MalformedLine::new(line, MalformedReason::InvalidHeaderValue))
        };

        match key {
            "SessionId" => self.session_id = Some(value.to_string()),
            "KeepaliveMillis" => self.keepalive = Some(Duration::from_millis(number(value)?)),
            "MaxBytes" => self.content_length = Some(number(value)?),
            "ControlAddress" => {
                self.control_address = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            "RequestLimit" => self.request_limit = Some(number(value)?),
            _ => trace!("Ignoring unknown header: {}", key),
        }

        Ok(HeaderStep::NeedMore)
    }

    fn status_line(&mut self, line: &str) -> Result<(), HeaderError> {
        if line == OK {
            self.status_seen = true;
            return Ok(());
        }
        match decode_line(line) {
            Ok(UpdateEvent::Error(error)) => Err(HeaderError::Rejected(error)),
            Ok(UpdateEvent::EndOfStream(cause)) => Err(HeaderError::Rejected(
                cause.unwrap_or_else(|| ServerError::new(0, "session ended")),
            )),
            _ => Err(HeaderError::UnexpectedStatus(line.to_string())),
        }
    }

    fn finish(&mut self) -> Result<SessionHeader, HeaderError> {
        let session_id = self
            .session_id
            .take()
            .filter(|id| !id.is_empty())
            .ok_or(HeaderError::MissingSessionId)?;
        Ok(SessionHeader {
            session_id,
            keepalive: self.keepalive,
            content_length: self.content_length,
            control_address: self.control_address.take(),
            request_limit: self.request_limit,
        })
    }
}

/// Outcome of a control request, as reported in its response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    Rejected(ServerError),
    Unexpected(String),
}

/// Parse the body of a control response.
///
/// Only the first non-empty line matters.
pub fn parse_control_response(body: &str) -> ControlResponse {
    let Some(line) = body
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .find(|l| !l.is_empty())
    else {
        return ControlResponse::Unexpected(String::new());
    };

    if line == OK {
        return ControlResponse::Ok;
    }
    match decode_line(line) {
        Ok(UpdateEvent::Error(error)) => ControlResponse::Rejected(error),
        _ => ControlResponse::Unexpected(line.to_string()),
    }
}
