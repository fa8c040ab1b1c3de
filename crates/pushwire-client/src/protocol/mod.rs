//! Wire protocol
//!
//! Everything that turns text into typed values and back, with no network
//! state:
//!
//! - [`decode_line`] parses one stream line into an [`UpdateEvent`]
//! - [`SessionHeader`] parses the create/bind response header
//! - [`Request`] builds create, bind and control requests
//! - [`escape`] holds the field/query escaping rules shared by both directions

pub mod escape;

mod decoder;
mod request;
mod response;

pub use decoder::{decode_line, encode_row, FieldValue, RowUpdate, ServerError, UpdateEvent};
pub use request::{Params, Request, BIND_SESSION_PATH, CONTROL_PATH, CREATE_SESSION_PATH};
pub use response::{
    parse_control_response, ControlResponse, HeaderError, HeaderStep, SessionHeader,
    SessionHeaderBuilder,
};

use thiserror::Error;

/// Heartbeat sent while the stream is idle
pub const PROBE: &str = "PROBE";
/// Sent before the server closes a connection whose content length is used up
pub const LOOP: &str = "LOOP";
/// The server closed the session
pub const END: &str = "END";
/// Error line prefix
pub const ERROR: &str = "ERROR";
/// Acknowledgement of a control request, delivered on the stream
pub const REQOK: &str = "REQOK";
/// First line of a successful create/bind/control response
pub const OK: &str = "OK";

/// Field marker: value unchanged since the previous update of the item
pub const UNCHANGED_MARKER: &str = "#=";
/// Field marker: value not present in this update
pub const ABSENT_MARKER: &str = "#-";

/// Separates the item identifier from the field list
pub const ITEM_SEPARATOR: char = ',';
/// Separates fields on an update line
pub const FIELD_SEPARATOR: char = '|';

/// Why a line could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// No `,` between item identifier and fields
    MissingItemSeparator,
    /// Item identifier before the `,` is empty
    EmptyItem,
    /// `%` or `\u` escape cut short, or trailing `\`
    TruncatedEscape,
    /// `\u` escape that is not a valid code point (lone surrogate)
    InvalidUnicode,
    /// Percent-decoded bytes are not UTF-8
    InvalidUtf8,
    /// Field starts with the reserved `#` but is not a known marker
    ReservedMarker,
    /// Header line without `=`
    MissingHeaderSeparator,
    /// Header value that should be numeric is not
    InvalidHeaderValue,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::MissingItemSeparator => "missing item separator",
            Self::EmptyItem => "empty item identifier",
            Self::TruncatedEscape => "truncated escape sequence",
            Self::InvalidUnicode => "invalid unicode escape",
            Self::InvalidUtf8 => "escaped bytes are not valid UTF-8",
            Self::ReservedMarker => "unknown reserved marker",
            Self::MissingHeaderSeparator => "header line without '='",
            Self::InvalidHeaderValue => "invalid header value",
        };
        f.write_str(text)
    }
}

/// A line that could not be decoded
///
/// Never fatal: the session logs the line and moves on to the next one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed line ({reason}): {line:?}")]
pub struct MalformedLine {
    pub line: String,
    pub reason: MalformedReason,
}

impl MalformedLine {
    pub fn new(line: impl Into<String>, reason: MalformedReason) -> Self {
        Self {
            line: line.into(),
            reason,
        }
    }
}
