//! Protocol error types and the failure-message taxonomy.

use crate::message::{names, Message};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding the inbound byte stream.
///
/// Any of these leaves the connection's decode state unusable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid UTF-8 in message header")]
    InvalidUtf8,

    #[error("decoder stopped after an earlier malformed frame")]
    Poisoned,
}

/// Failure messages a node sends to end a session unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A fetch failed (`GetFailed`).
    Fetch,
    /// An insert failed (`PutFailed`).
    Put,
    /// The node rejected a request (`ProtocolError`).
    Protocol,
    /// The identifier is already in use (`IdentifierCollision`).
    IdentifierCollision,
    /// No such peer (`UnknownNodeIdentifier`).
    UnknownNodeIdentifier,
    /// No such peer note type (`UnknownPeerNoteType`).
    UnknownPeerNoteType,
}

impl FailureKind {
    pub const ALL: [FailureKind; 6] = [
        FailureKind::Fetch,
        FailureKind::Put,
        FailureKind::Protocol,
        FailureKind::IdentifierCollision,
        FailureKind::UnknownNodeIdentifier,
        FailureKind::UnknownPeerNoteType,
    ];

    /// Looks up the failure kind for a message name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            names::GET_FAILED => Some(FailureKind::Fetch),
            names::PUT_FAILED => Some(FailureKind::Put),
            names::PROTOCOL_ERROR => Some(FailureKind::Protocol),
            names::IDENTIFIER_COLLISION => Some(FailureKind::IdentifierCollision),
            names::UNKNOWN_NODE_IDENTIFIER => Some(FailureKind::UnknownNodeIdentifier),
            names::UNKNOWN_PEER_NOTE_TYPE => Some(FailureKind::UnknownPeerNoteType),
            _ => None,
        }
    }

    /// Returns the wire name of the failure message.
    pub fn message_name(&self) -> &'static str {
        match self {
            FailureKind::Fetch => names::GET_FAILED,
            FailureKind::Put => names::PUT_FAILED,
            FailureKind::Protocol => names::PROTOCOL_ERROR,
            FailureKind::IdentifierCollision => names::IDENTIFIER_COLLISION,
            FailureKind::UnknownNodeIdentifier => names::UNKNOWN_NODE_IDENTIFIER,
            FailureKind::UnknownPeerNoteType => names::UNKNOWN_PEER_NOTE_TYPE,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::Fetch => "get failed",
            FailureKind::Put => "put failed",
            FailureKind::Protocol => "protocol error",
            FailureKind::IdentifierCollision => "identifier collision",
            FailureKind::UnknownNodeIdentifier => "unknown node identifier",
            FailureKind::UnknownPeerNoteType => "unknown peer note type",
        };
        f.write_str(text)
    }
}

/// A typed failure built from a failure message.
///
/// The numeric code is forwarded as-is; see [`crate::codes`] for the meaning
/// of fetch codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} with code {code}: {description}")]
pub struct Failure {
    pub kind: FailureKind,
    pub code: i32,
    pub description: String,
    /// Correlation id of the failed session, if present.
    pub identifier: Option<String>,
    /// The failure message as received.
    pub message: Message,
}

impl Failure {
    /// Builds a failure from `message` if its name is a registered failure.
    pub fn from_message(message: &Message) -> Option<Self> {
        let kind = FailureKind::from_name(message.name())?;
        Some(Self::new(kind, message))
    }

    /// Builds a failure of `kind` from the `Code` and `CodeDescription`
    /// attributes of `message`.
    pub fn new(kind: FailureKind, message: &Message) -> Self {
        let code = message
            .get("Code")
            .and_then(|c| c.parse().ok())
            .unwrap_or_else(|| {
                tracing::warn!(
                    name = message.name(),
                    code = ?message.get("Code"),
                    "failure message without a numeric Code"
                );
                0
            });

        Self {
            kind,
            code,
            description: message.get("CodeDescription").unwrap_or_default().to_string(),
            identifier: message.identifier().map(str::to_string),
            message: message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_names_roundtrip() {
        for kind in FailureKind::ALL {
            assert_eq!(FailureKind::from_name(kind.message_name()), Some(kind));
        }
    }

    #[test]
    fn test_unregistered_names() {
        assert_eq!(FailureKind::from_name("AllData"), None);
        assert_eq!(FailureKind::from_name("SimpleProgress"), None);
        assert_eq!(FailureKind::from_name("getfailed"), None);
    }

    #[test]
    fn test_get_failed_to_failure() {
        let msg = Message::new("GetFailed")
            .with("Identifier", "Request3")
            .with("Code", "13")
            .with("CodeDescription", "Data not found");

        let failure = Failure::from_message(&msg).unwrap();
        assert_eq!(failure.kind, FailureKind::Fetch);
        assert_eq!(failure.code, 13);
        assert_eq!(failure.description, "Data not found");
        assert_eq!(failure.identifier.as_deref(), Some("Request3"));
        assert_eq!(
            failure.to_string(),
            "get failed with code 13: Data not found"
        );
    }

    #[test]
    fn test_failure_without_code() {
        let msg = Message::new("ProtocolError").with("CodeDescription", "odd");
        let failure = Failure::from_message(&msg).unwrap();
        assert_eq!(failure.kind, FailureKind::Protocol);
        assert_eq!(failure.code, 0);
        assert_eq!(failure.description, "odd");
        assert!(failure.identifier.is_none());
    }

    #[test]
    fn test_non_failure_message() {
        let msg = Message::new("PutSuccessful").with("Code", "1");
        assert!(Failure::from_message(&msg).is_none());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MalformedFrame("missing '='".into());
        assert!(err.to_string().contains("missing '='"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}
