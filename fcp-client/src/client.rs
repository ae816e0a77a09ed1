//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use fcp_protocol::message::names;
use fcp_protocol::{Attributes, IdentifiedMessage, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// High-level client for an FCP node.
pub struct Client {
    conn: Arc<Connection>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            read_task: parking_lot::Mutex::new(None),
        }
    }

    /// Connects to the node, sends `ClientHello` and starts the read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;
        self.spawn_read_loop();
        Ok(())
    }

    /// Like [`connect`](Self::connect), over an already established stream.
    pub async fn attach<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.conn.attach(stream).await?;
        self.spawn_read_loop();
        Ok(())
    }

    fn spawn_read_loop(&self) {
        let conn = self.conn.clone();
        let handle = tokio::spawn(async move {
            match conn.read_loop().await {
                Ok(()) | Err(ClientError::ConnectionClosed) => {}
                Err(e) => tracing::warn!("Connection unusable: {}", e),
            }
        });
        if let Some(previous) = self.read_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await?;
        let read_task = self.read_task.lock().take();
        if let Some(handle) = read_task {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Waits for the node's reply to the handshake.
    pub async fn node_hello(&self) -> Result<Message, ClientError> {
        self.conn.node_hello().await
    }

    /// Waits for the next uncorrelated message named `name`.
    pub async fn await_message(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Message, ClientError> {
        let rx = self.conn.await_name(name);
        let timeout = timeout.unwrap_or(self.conn.config().request_timeout);
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn identified(&self, message: Message) -> IdentifiedMessage {
        IdentifiedMessage::new(message, self.conn.request_ids())
    }

    // =========================================================================
    // Data operations
    // =========================================================================

    /// Fetches `uri` with the data returned inline.
    ///
    /// Resolves with the `AllData` message; its body is the data.
    pub async fn get_direct(&self, uri: &str) -> Result<Message, ClientError> {
        let request = self.identified(
            Message::new(names::CLIENT_GET)
                .with("URI", uri)
                .with("Verbosity", "1")
                .with("ReturnType", "direct"),
        );

        self.conn
            .session(request, None, None, |message| {
                (message.name() == names::ALL_DATA).then(|| message.clone())
            })
            .await
    }

    /// Inserts `data` under `uri`.
    ///
    /// Resolves with the `PutSuccessful` message, whose `URI` attribute is the
    /// final key.
    pub async fn put_direct(
        &self,
        uri: &str,
        data: impl Into<Bytes>,
    ) -> Result<Message, ClientError> {
        let request = self.identified(
            Message::new(names::CLIENT_PUT)
                .with("URI", uri)
                .with("Verbosity", "1")
                .with("UploadFrom", "direct"),
        );

        self.conn
            .session(request, Some(data.into()), None, |message| {
                (message.name() == names::PUT_SUCCESSFUL).then(|| message.clone())
            })
            .await
    }

    // =========================================================================
    // Key operations
    // =========================================================================

    /// Asks the node for a fresh SSK keypair.
    ///
    /// Returns `(InsertURI, RequestURI)`.
    pub async fn get_ssk_keypair(&self) -> Result<(String, String), ClientError> {
        let request = self.identified(Message::new(names::GENERATE_SSK));

        let reply = self
            .conn
            .session(request, None, None, |message| {
                (message.name() == names::SSK_KEYPAIR).then(|| message.clone())
            })
            .await?;

        let attribute = |key: &'static str| {
            reply
                .get(key)
                .map(str::to_string)
                .ok_or_else(|| ClientError::MissingAttribute {
                    message: reply.name().to_string(),
                    attribute: key,
                })
        };
        Ok((attribute("InsertURI")?, attribute("RequestURI")?))
    }

    // =========================================================================
    // Peer operations
    // =========================================================================

    /// Lists the node's peers, in the order the node reports them.
    pub async fn list_peers(&self) -> Result<Vec<Attributes>, ClientError> {
        self.conn.list_peers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ConnectionConfig::new("127.0.0.1:9481".parse().unwrap());
        let client = Client::new(config);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = Client::new(ConnectionConfig::default());
        assert!(matches!(
            client.get_direct("KSK@x").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.list_peers().await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.node_hello().await,
            Err(ClientError::NotConnected)
        ));
    }
}
