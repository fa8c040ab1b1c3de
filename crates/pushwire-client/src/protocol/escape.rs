//! Field and query escaping
//!
//! Two encodings share one decoder:
//!
//! - Field values on update lines escape the protocol's reserved characters
//!   as `%XX` and non-ASCII text as `\uXXXX` (UTF-16 code units).
//! - Query values in requests percent-encode every byte outside the RFC 3986
//!   unreserved set.
//!
//! [`unescape`] inverts both.

use std::fmt::Write;

use super::MalformedReason;

/// Decode an escaped field or query value.
///
/// `%XX` sequences contribute raw bytes, which together with the literal text
/// must form valid UTF-8. `\uXXXX` sequences are UTF-16 code units; a high
/// surrogate must be followed by a low one. A backslash before any other
/// character yields that character unchanged.
pub fn unescape(raw: &str) -> Result<String, MalformedReason> {
    if !raw.contains(['%', '\\']) {
        return Ok(raw.to_string());
    }

    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '%' => {
                let hex = raw
                    .get(pos + 1..pos + 3)
                    .ok_or(MalformedReason::TruncatedEscape)?;
                out.push(parse_hex_byte(hex)?);
                chars.next();
                chars.next();
            }
            '\\' => match chars.next() {
                None => return Err(MalformedReason::TruncatedEscape),
                Some((upos, 'u')) => {
                    let unit = read_code_unit(raw, upos + 1)?;
                    skip(&mut chars, 4);

                    let code_point = if (0xD800..0xDC00).contains(&unit) {
                        let low_start = upos + 5;
                        if raw.get(low_start..low_start + 2) != Some("\\u") {
                            return Err(MalformedReason::InvalidUnicode);
                        }
                        let low = read_code_unit(raw, low_start + 2)?;
                        if !(0xDC00..0xE000).contains(&low) {
                            return Err(MalformedReason::InvalidUnicode);
                        }
                        skip(&mut chars, 6);
                        0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00)
                    } else {
                        unit
                    };

                    let decoded =
                        char::from_u32(code_point).ok_or(MalformedReason::InvalidUnicode)?;
                    push_char(&mut out, decoded);
                }
                Some((_, other)) => push_char(&mut out, other),
            },
            other => push_char(&mut out, other),
        }
    }

    String::from_utf8(out).map_err(|_| MalformedReason::InvalidUtf8)
}

/// Escape a field value so that [`unescape`] returns it unchanged.
///
/// The output never contains `|`, `#`, raw control characters or non-ASCII
/// text, so it can be placed on an update line as-is.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | '|' | '#' | '\\' => push_percent(&mut out, c as u8),
            c if c.is_ascii_control() => push_percent(&mut out, c as u8),
            c if c.is_ascii() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04X}", unit);
                }
            }
        }
    }
    out
}

/// Percent-encode a request parameter value.
pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            push_percent(&mut out, byte);
        }
    }
    out
}

fn push_percent(out: &mut String, byte: u8) {
    let _ = write!(out, "%{:02X}", byte);
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

fn skip<I: Iterator>(iter: &mut I, n: usize) {
    for _ in 0..n {
        iter.next();
    }
}

fn parse_hex_byte(hex: &str) -> Result<u8, MalformedReason> {
    if hex.len() != 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MalformedReason::TruncatedEscape);
    }
    u8::from_str_radix(hex, 16).map_err(|_| MalformedReason::TruncatedEscape)
}

fn read_code_unit(raw: &str, start: usize) -> Result<u32, MalformedReason> {
    let hex = raw
        .get(start..start + 4)
        .ok_or(MalformedReason::TruncatedEscape)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MalformedReason::TruncatedEscape);
    }
    u32::from_str_radix(hex, 16).map_err(|_| MalformedReason::TruncatedEscape)
}
