//! # fcp-protocol
//!
//! Wire protocol implementation for the Freenet Client Protocol (FCP 2.0).
//!
//! This crate provides:
//! - Text header framing with optional length-prefixed binary payloads
//! - Incremental decoding across arbitrary I/O chunk boundaries
//! - Message and identified-message value types
//! - The failure-message taxonomy and fetch failure code reference table

pub mod codec;
pub mod codes;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder, Messages};
pub use codes::{fetch_code, FetchCode, FETCH_CODES};
pub use error::{Failure, FailureKind, ProtocolError};
pub use frame::Terminator;
pub use message::{Attributes, IdentifiedMessage, Message, RequestIds};

/// Protocol version announced in `ClientHello`.
pub const EXPECTED_VERSION: &str = "2.0";

/// Default port of an FCP node.
pub const DEFAULT_PORT: u16 = 9481;
