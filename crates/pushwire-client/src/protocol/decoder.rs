//! Stream line decoder
//!
//! Parses one line of the streaming wire format (newline already stripped)
//! into an [`UpdateEvent`].

use tracing::trace;

use super::escape::{escape_field, unescape};
use super::{
    MalformedLine, MalformedReason, ABSENT_MARKER, END, ERROR, FIELD_SEPARATOR, ITEM_SEPARATOR,
    LOOP, PROBE, REQOK, UNCHANGED_MARKER,
};

/// Value of one field in a row update
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    /// A literal value; the empty string is a valid literal
    Value(String),
    /// Same value as the previous update of this item
    Unchanged,
    /// No value (null)
    Absent,
}

impl FieldValue {
    /// The literal value, if this field carries one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(v) => Some(v),
            Self::Unchanged | Self::Absent => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Wire form of the field
    pub fn encode(&self) -> String {
        match self {
            Self::Value(v) => escape_field(v),
            Self::Unchanged => UNCHANGED_MARKER.to_string(),
            Self::Absent => ABSENT_MARKER.to_string(),
        }
    }

    fn decode(raw: &str) -> Result<Self, MalformedReason> {
        match raw {
            UNCHANGED_MARKER => Ok(Self::Unchanged),
            ABSENT_MARKER => Ok(Self::Absent),
            _ if raw.starts_with('#') => Err(MalformedReason::ReservedMarker),
            _ => unescape(raw).map(Self::Value),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

/// One row of item data
///
/// The number of fields is whatever the server sent; matching it against
/// the schema of the subscription is left to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub item: String,
    pub fields: Vec<FieldValue>,
}

impl RowUpdate {
    pub fn new(item: impl Into<String>, fields: Vec<FieldValue>) -> Self {
        Self {
            item: item.into(),
            fields,
        }
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    /// Merge this update into the last known values of the item.
    ///
    /// Literal fields overwrite, unchanged fields keep the previous value and
    /// absent fields clear it. `current` grows to the field count if needed.
    pub fn apply_to(&self, current: &mut Vec<Option<String>>) {
        if current.len() < self.fields.len() {
            current.resize(self.fields.len(), None);
        }
        for (slot, field) in current.iter_mut().zip(&self.fields) {
            match field {
                FieldValue::Value(v) => *slot = Some(v.clone()),
                FieldValue::Unchanged => {}
                FieldValue::Absent => *slot = None,
            }
        }
    }
}

/// Error reported by the server, on the stream or in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
}

impl ServerError {
    /// User/password check failed
    pub const AUTHENTICATION_FAILED: i32 = 1;
    /// Requested adapter set not available
    pub const ADAPTER_SET_UNAVAILABLE: i32 = 2;
    /// Bind request for a session the server does not know
    pub const SESSION_NOT_FOUND: i32 = 20;
    /// Client protocol version not supported
    pub const INCOMPATIBLE_CLIENT: i32 = 60;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Errors after which the session cannot continue, whatever the rebind policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            Self::AUTHENTICATION_FAILED | Self::ADAPTER_SET_UNAVAILABLE | Self::INCOMPATIBLE_CLIENT
        )
    }

    /// Parse what follows the `ERROR`/`END` marker.
    ///
    /// `None` is the bare marker. A non-numeric code downgrades to code 0
    /// with the whole remainder as message.
    pub(crate) fn from_remainder(rest: Option<&str>) -> Self {
        let Some(rest) = rest else {
            return Self::new(0, "");
        };
        let (code, message) = rest.split_once(ITEM_SEPARATOR).unwrap_or((rest, ""));
        match code.trim().parse::<i32>() {
            Ok(code) => Self::new(code, message),
            Err(_) => Self::new(0, rest),
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// One decoded stream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Keep-alive, no payload
    Heartbeat,
    /// Item data
    Row(RowUpdate),
    /// A control request was accepted; carries the detail text if any
    ControlAck(Option<String>),
    /// Session-level error
    Error(ServerError),
    /// The server ended the session, optionally with a cause
    EndOfStream(Option<ServerError>),
}

/// Decode one stream line.
///
/// Pure: decoding the same line twice yields equal events.
pub fn decode_line(line: &str) -> Result<UpdateEvent, MalformedLine> {
    if line == PROBE || marker_remainder(line, LOOP).is_some() {
        trace!("Heartbeat: {}", line);
        return Ok(UpdateEvent::Heartbeat);
    }
    if let Some(rest) = marker_remainder(line, ERROR) {
        return Ok(UpdateEvent::Error(ServerError::from_remainder(rest)));
    }
    if let Some(rest) = marker_remainder(line, END) {
        return Ok(UpdateEvent::EndOfStream(
            rest.map(|r| ServerError::from_remainder(Some(r))),
        ));
    }
    if let Some(rest) = marker_remainder(line, REQOK) {
        return Ok(UpdateEvent::ControlAck(rest.map(str::to_string)));
    }

    decode_row(line).map(UpdateEvent::Row)
}

/// Encode a row update as an update line.
///
/// Inverse of [`decode_line`] for rows whose item identifier is not a
/// reserved marker.
pub fn encode_row(row: &RowUpdate) -> String {
    let mut line = String::with_capacity(row.item.len() + 8 * row.fields.len());
    line.push_str(&row.item);
    line.push(ITEM_SEPARATOR);
    for (index, field) in row.fields.iter().enumerate() {
        if index > 0 {
            line.push(FIELD_SEPARATOR);
        }
        line.push_str(&field.encode());
    }
    line
}

fn decode_row(line: &str) -> Result<RowUpdate, MalformedLine> {
    let malformed = |reason| MalformedLine::new(line, reason);

    let (item, rest) = line
        .split_once(ITEM_SEPARATOR)
        .ok_or_else(|| malformed(MalformedReason::MissingItemSeparator))?;
    if item.is_empty() {
        return Err(malformed(MalformedReason::EmptyItem));
    }

    let fields = rest
        .split(FIELD_SEPARATOR)
        .map(FieldValue::decode)
        .collect::<Result<Vec<_>, _>>()
        .map_err(malformed)?;

    Ok(RowUpdate::new(item, fields))
}

/// `Some(None)` for the bare marker, `Some(Some(rest))` for `MARKER,rest`,
/// `None` when the line is something else.
fn marker_remainder<'a>(line: &'a str, marker: &str) -> Option<Option<&'a str>> {
    let rest = line.strip_prefix(marker)?;
    if rest.is_empty() {
        Some(None)
    } else {
        rest.strip_prefix(ITEM_SEPARATOR).map(Some)
    }
}
