//! FCP message values.
//!
//! A message is a name, an ordered set of unique `key=value` attributes and an
//! optional binary body. Attribute order is preserved because it is the order
//! in which the encoder writes header lines.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Attribute carrying the correlation id of a session.
pub const IDENTIFIER: &str = "Identifier";

/// Attribute carrying the body length of a message with payload.
pub const DATA_LENGTH: &str = "DataLength";

/// Well-known message names.
pub mod names {
    // Handshake
    pub const CLIENT_HELLO: &str = "ClientHello";
    pub const NODE_HELLO: &str = "NodeHello";

    // Fetch
    pub const CLIENT_GET: &str = "ClientGet";
    pub const ALL_DATA: &str = "AllData";
    pub const GET_FAILED: &str = "GetFailed";

    // Insert
    pub const CLIENT_PUT: &str = "ClientPut";
    pub const PUT_SUCCESSFUL: &str = "PutSuccessful";
    pub const PUT_FAILED: &str = "PutFailed";

    // Keys
    pub const GENERATE_SSK: &str = "GenerateSSK";
    pub const SSK_KEYPAIR: &str = "SSKKeypair";

    // Peers
    pub const LIST_PEERS: &str = "ListPeers";
    pub const PEER: &str = "Peer";
    pub const END_LIST_PEERS: &str = "EndListPeers";

    // Generic failures
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    pub const IDENTIFIER_COLLISION: &str = "IdentifierCollision";
    pub const UNKNOWN_NODE_IDENTIFIER: &str = "UnknownNodeIdentifier";
    pub const UNKNOWN_PEER_NOTE_TYPE: &str = "UnknownPeerNoteType";
}

/// Ordered attribute set with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets `key` to `value`. An existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Iterates over the attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (k, v) in iter {
            attributes.insert(k, v);
        }
        attributes
    }
}

impl IntoIterator for Attributes {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A single FCP message.
///
/// Built with [`Message::new`] and the consuming `with*` methods, so a value
/// never changes once it has been handed to the encoder or a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    name: String,
    attributes: Attributes,
    body: Option<Bytes>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Attributes::new(),
            body: None,
        }
    }

    /// Creates a message from a name and an existing attribute set.
    pub fn from_attributes(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            name: name.into(),
            attributes,
            body: None,
        }
    }

    /// Adds or replaces an attribute.
    ///
    /// Once a body is attached, `DataLength` follows the body and is left
    /// unchanged here.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if self.body.is_some() && key == DATA_LENGTH {
            return self;
        }
        self.attributes.insert(key, value);
        self
    }

    /// Attaches a binary body and sets `DataLength` to match it.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.attributes.insert(DATA_LENGTH, body.len().to_string());
        self.body = Some(body);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains(key)
    }

    /// Returns the correlation id, if the message carries one.
    pub fn identifier(&self) -> Option<&str> {
        self.get(IDENTIFIER)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn into_attributes(self) -> Attributes {
        self.attributes
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn into_body(self) -> Option<Bytes> {
        self.body
    }

    /// Parses the `DataLength` attribute.
    pub fn data_length(&self) -> Option<usize> {
        self.get(DATA_LENGTH).and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(id) = self.identifier() {
            write!(f, " [{}]", id)?;
        }
        if let Some(body) = &self.body {
            write!(f, " ({} bytes)", body.len())?;
        }
        Ok(())
    }
}

/// Generator of request identifiers, scoped to one connection.
///
/// Identifiers are `Request0`, `Request1`, ... and stay unique as long as the
/// counter does not wrap.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh identifier.
    pub fn next_id(&self) -> String {
        format!("Request{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// A message guaranteed to carry an `Identifier` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedMessage {
    id: String,
    message: Message,
}

impl IdentifiedMessage {
    /// Stamps `message` with a fresh identifier from `ids`.
    pub fn new(message: Message, ids: &RequestIds) -> Self {
        Self::with_identifier(message, ids.next_id())
    }

    /// Stamps `message` with a caller-chosen identifier.
    pub fn with_identifier(message: Message, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            message: message.with(IDENTIFIER, id.clone()),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Builds the `ClientHello` handshake message.
pub fn client_hello(client_name: &str) -> Message {
    Message::new(names::CLIENT_HELLO)
        .with("Name", client_name)
        .with("ExpectedVersion", crate::EXPECTED_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_order_preserved() {
        let msg = Message::new("ClientGet")
            .with("URI", "KSK@foo")
            .with("Verbosity", "1")
            .with("ReturnType", "direct");

        let keys: Vec<_> = msg.attributes().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["URI", "Verbosity", "ReturnType"]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let msg = Message::new("X")
            .with("a", "1")
            .with("b", "2")
            .with("a", "3");

        let attrs: Vec<_> = msg.attributes().iter().collect();
        assert_eq!(attrs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_with_body_sets_data_length() {
        let msg = Message::new("ClientPut").with_body(&b"hello"[..]);
        assert_eq!(msg.get(DATA_LENGTH), Some("5"));
        assert_eq!(msg.data_length(), Some(5));
        assert_eq!(msg.body().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_data_length_follows_body() {
        let msg = Message::new("ClientPut")
            .with_body(&b"hello"[..])
            .with(DATA_LENGTH, "99")
            .with("URI", "CHK@");
        assert_eq!(msg.data_length(), Some(5));
        assert_eq!(msg.get("URI"), Some("CHK@"));

        // Without a body the attribute is an ordinary one.
        let header = Message::new("AllData").with(DATA_LENGTH, "12");
        assert_eq!(header.data_length(), Some(12));
        assert_eq!(header.with_body(&b"abc"[..]).data_length(), Some(3));
    }

    #[test]
    fn test_request_ids_are_sequential() {
        let ids = RequestIds::new();
        assert_eq!(ids.next_id(), "Request0");
        assert_eq!(ids.next_id(), "Request1");
        assert_eq!(ids.next_id(), "Request2");
    }

    #[test]
    fn test_request_ids_are_per_instance() {
        let a = RequestIds::new();
        let b = RequestIds::new();
        assert_eq!(a.next_id(), "Request0");
        assert_eq!(b.next_id(), "Request0");
    }

    #[test]
    fn test_identified_message_appends_identifier() {
        let ids = RequestIds::new();
        let msg = IdentifiedMessage::new(Message::new("GenerateSSK").with("x", "y"), &ids);

        assert_eq!(msg.id(), "Request0");
        assert_eq!(msg.message().identifier(), Some("Request0"));
        let last = msg.message().attributes().iter().last().unwrap();
        assert_eq!(last, (IDENTIFIER, "Request0"));
    }

    #[test]
    fn test_client_hello() {
        let hello = client_hello("Epoxy");
        assert_eq!(hello.name(), names::CLIENT_HELLO);
        assert_eq!(hello.get("Name"), Some("Epoxy"));
        assert_eq!(hello.get("ExpectedVersion"), Some("2.0"));
    }

    #[test]
    fn test_display() {
        let msg = Message::new("AllData")
            .with(IDENTIFIER, "Request7")
            .with_body(&b"abc"[..]);
        assert_eq!(msg.to_string(), "AllData [Request7] (3 bytes)");
    }

    #[test]
    fn test_attributes_from_iter() {
        let attrs: Attributes = vec![("identity", "0x0"), ("ip", "1.2.3.4")]
            .into_iter()
            .collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("ip"), Some("1.2.3.4"));
        assert!(!attrs.contains("port"));
    }
}
