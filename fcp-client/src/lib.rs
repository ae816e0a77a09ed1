//! # fcp-client
//!
//! Async client for the Freenet Client Protocol.
//!
//! This crate provides:
//! - Async TCP connection with the `ClientHello` handshake
//! - Correlation of replies to requests by message name and `Identifier`
//! - Per-session deadlines and typed node failures
//! - High-level get/put/key generation/peer listing operations

pub mod client;
pub mod connection;
pub mod error;
pub mod pending;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use pending::{Delivery, PendingTable};
