//! Incremental decoder and encoder for FCP frames.

use crate::error::ProtocolError;
use crate::frame::{self, Terminator, MAX_TERMINATOR_LEN};
use crate::message::Message;
use bytes::{Buf, BytesMut};

/// Encodes messages into wire format.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a new buffer.
    pub fn encode(message: &Message) -> BytesMut {
        let mut buf = BytesMut::with_capacity(frame::encoded_len(message));
        frame::write_message(message, &mut buf);
        buf
    }

    /// Appends the encoded message to `buf`.
    pub fn encode_into(message: &Message, buf: &mut BytesMut) {
        buf.reserve(frame::encoded_len(message));
        frame::write_message(message, buf);
    }
}

enum State {
    /// Looking for the end of a header section.
    Header,
    /// Header parsed, waiting for `remaining` body bytes.
    Body { message: Message, length: usize },
    /// A malformed frame was seen; the stream position is lost.
    Poisoned,
}

/// Decodes messages from an append-only byte stream.
///
/// Bytes may be fed in chunks of any size. Each byte is consumed exactly once.
pub struct Decoder {
    buffer: BytesMut,
    state: State,
    /// Offset up to which the buffer is known not to contain a terminator.
    scan_from: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            state: State::Header,
            scan_from: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed. After an error every further
    /// call fails with [`ProtocolError::Poisoned`].
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        let result = self.decode_next();
        if result.is_err() {
            self.state = State::Poisoned;
        }
        result
    }

    fn decode_next(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            match std::mem::replace(&mut self.state, State::Header) {
                State::Poisoned => return Err(ProtocolError::Poisoned),
                State::Body { message, length } => {
                    if self.buffer.len() < length {
                        self.state = State::Body { message, length };
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length).freeze();
                    return Ok(Some(message.with_body(body)));
                }
                State::Header => {
                    let Some((end, terminator)) =
                        frame::find_header_end(&self.buffer, self.scan_from)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(MAX_TERMINATOR_LEN - 1);
                        return Ok(None);
                    };

                    let header = self.buffer.split_to(end);
                    self.buffer.advance(terminator.marker().len());
                    self.scan_from = 0;

                    let message = frame::parse_header(&header)?;
                    match terminator {
                        Terminator::EndMessage => return Ok(Some(message)),
                        Terminator::Data => {
                            let length = frame::declared_length(&message)?;
                            self.state = State::Body { message, length };
                        }
                    }
                }
            }
        }
    }

    /// Returns an iterator over the messages currently decodable.
    ///
    /// The iterator ends when more bytes are needed, or after yielding the
    /// first error.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages {
            decoder: self,
            failed: false,
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether the decoder is between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Header) && self.buffer.is_empty()
    }

    /// Clears the buffer and any partial or poisoned state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Header;
        self.scan_from = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of decoded messages borrowed from a [`Decoder`].
pub struct Messages<'a> {
    decoder: &'a mut Decoder,
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.decoder.decode().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}
