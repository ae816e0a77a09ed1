//! Text frame format for FCP.
//!
//! A frame without payload:
//!
//! ```text
//! <Name>\n
//! <key>=<value>\n      (zero or more)
//! EndMessage\n
//! ```
//!
//! A frame with payload:
//!
//! ```text
//! <Name>\n
//! <key>=<value>\n      (zero or more)
//! DataLength=<n>\n
//! Data\n
//! <n raw bytes, no trailing delimiter>
//! ```

use crate::error::ProtocolError;
use crate::message::{Attributes, Message, DATA_LENGTH};
use bytes::{BufMut, BytesMut};

/// Terminator of a header-only frame, including the preceding newline.
pub const END_MESSAGE: &[u8] = b"\nEndMessage\n";

/// Terminator of a header that is followed by a binary body.
pub const DATA: &[u8] = b"\nData\n";

/// Length of the longest terminator.
pub const MAX_TERMINATOR_LEN: usize = END_MESSAGE.len();

/// How a header section ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    EndMessage,
    Data,
}

impl Terminator {
    /// Returns the bytes of this terminator on the wire.
    pub fn marker(&self) -> &'static [u8] {
        match self {
            Terminator::EndMessage => END_MESSAGE,
            Terminator::Data => DATA,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Locates the end of the header section at or after `from`.
///
/// Returns the offset of the terminator and which one it is; the earliest
/// terminator wins.
pub fn find_header_end(buf: &[u8], from: usize) -> Option<(usize, Terminator)> {
    let from = from.min(buf.len());
    let window = &buf[from..];
    let end_message = find(window, END_MESSAGE).map(|i| (i + from, Terminator::EndMessage));
    let data = find(window, DATA).map(|i| (i + from, Terminator::Data));

    match (end_message, data) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parses a header section (everything before the terminator).
pub fn parse_header(header: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(header).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut lines = text.split('\n');
    let name = lines.next().unwrap_or_default();

    let mut attributes = Attributes::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ProtocolError::MalformedFrame(format!("header line without '=': {:?}", line))
        })?;
        attributes.insert(key, value);
    }

    Ok(Message::from_attributes(name, attributes))
}

/// Reads the body length declared by a header that ended with `Data`.
pub fn declared_length(message: &Message) -> Result<usize, ProtocolError> {
    let raw = message.get(DATA_LENGTH).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!(
            "{} has a Data terminator but no {}",
            message.name(),
            DATA_LENGTH
        ))
    })?;
    raw.parse().map_err(|_| {
        ProtocolError::MalformedFrame(format!("invalid {}: {:?}", DATA_LENGTH, raw))
    })
}

/// Returns the exact number of bytes [`write_message`] produces.
pub fn encoded_len(message: &Message) -> usize {
    let mut len = message.name().len() + 1;
    for (key, value) in header_attributes(message) {
        len += key.len() + value.len() + 2;
    }
    match message.body() {
        Some(body) => {
            len + DATA_LENGTH.len() + 1 + body.len().to_string().len() + DATA.len() + body.len()
        }
        None => len + END_MESSAGE.len() - 1,
    }
}

/// Attributes written as header lines. With a body, `DataLength` moves to
/// the trailer.
fn header_attributes(message: &Message) -> impl Iterator<Item = (&str, &str)> {
    let has_body = message.body().is_some();
    message
        .attributes()
        .iter()
        .filter(move |(key, _)| !(has_body && *key == DATA_LENGTH))
}

/// Writes `message` in wire format.
pub fn write_message(message: &Message, buf: &mut BytesMut) {
    buf.put_slice(message.name().as_bytes());
    buf.put_u8(b'\n');

    for (key, value) in header_attributes(message) {
        buf.put_slice(key.as_bytes());
        buf.put_u8(b'=');
        buf.put_slice(value.as_bytes());
        buf.put_u8(b'\n');
    }

    match message.body() {
        Some(body) => {
            buf.put_slice(DATA_LENGTH.as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(body.len().to_string().as_bytes());
            buf.put_slice(DATA);
            buf.put_slice(body);
        }
        None => buf.put_slice(&END_MESSAGE[1..]),
    }
}
