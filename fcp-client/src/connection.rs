//! Connection management and session correlation.

use crate::error::ClientError;
use crate::pending::{Continuation, Delivery, PendingTable, WaiterId};
use bytes::Bytes;
use fcp_protocol::message::{client_hello, names};
use fcp_protocol::{Attributes, Decoder, Encoder, Failure, IdentifiedMessage, Message, RequestIds};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Client name announced in `ClientHello` unless configured otherwise.
pub const DEFAULT_CLIENT_NAME: &str = "fcp-client";

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Node address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default deadline of a session.
    pub request_timeout: Duration,
    /// Client name for `ClientHello`.
    pub client_name: String,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], fcp_protocol::DEFAULT_PORT)))
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of one attached stream.
struct Inbound {
    reader: BoxedReader,
    /// Attach count at the time the stream was adopted.
    generation: u64,
    /// Set to true to stop the read loop of this stream.
    closing: watch::Receiver<bool>,
}

/// Waiters of one in-flight operation, removed when the operation ends or is
/// dropped.
struct Registration<'a> {
    pending: &'a parking_lot::Mutex<PendingTable>,
    id: Option<String>,
    names: Vec<(String, WaiterId)>,
}

impl<'a> Registration<'a> {
    fn new(pending: &'a parking_lot::Mutex<PendingTable>) -> Self {
        Self {
            pending,
            id: None,
            names: Vec::new(),
        }
    }

    fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn with_name(mut self, name: impl Into<String>, waiter: WaiterId) -> Self {
        self.names.push((name.into(), waiter));
        self
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(id) = &self.id {
            pending.remove_id(id);
        }
        for (name, waiter) in &self.names {
            pending.remove_name_waiter(name, *waiter);
        }
    }
}

/// Progress of the `ClientHello`/`NodeHello` exchange.
enum Hello {
    Idle,
    Waiting(oneshot::Receiver<Message>),
    Received(Message),
}

/// A connection to an FCP node.
///
/// Inbound messages are decoded and dispatched by [`read_loop`](Self::read_loop),
/// which must run in a background task while requests are outstanding.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream. Held for the whole write of one message.
    writer: Mutex<Option<BoxedWriter>>,
    /// Read half, taken by the read loop.
    reader: parking_lot::Mutex<Option<Inbound>>,
    /// Outstanding waiters.
    pending: parking_lot::Mutex<PendingTable>,
    /// Identifier generator for sessions on this connection.
    ids: RequestIds,
    hello: Mutex<Hello>,
    connected: AtomicBool,
    /// Incremented by every attach. A read loop only tears down the table of
    /// the stream it was started for.
    generation: AtomicU64,
    /// Stop signal of the current stream, replaced on every attach.
    closing: parking_lot::Mutex<watch::Sender<bool>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            config,
            writer: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            pending: parking_lot::Mutex::new(PendingTable::new()),
            ids: RequestIds::new(),
            hello: Mutex::new(Hello::Idle),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closing: parking_lot::Mutex::new(closing),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the identifier generator of this connection.
    pub fn request_ids(&self) -> &RequestIds {
        &self.ids
    }

    /// Connects to the node over TCP and sends `ClientHello`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        stream.set_nodelay(true).ok();
        self.attach(stream).await
    }

    /// Adopts an established stream and sends `ClientHello`.
    ///
    /// The `NodeHello` reply is registered for before the hello goes out, so
    /// it cannot be missed; see [`node_hello`](Self::node_hello).
    ///
    /// A read loop still running on a previously attached stream is told to
    /// stop, and waiters registered on that stream observe `ConnectionClosed`.
    pub async fn attach<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closing_tx, closing_rx) = watch::channel(false);
        let previous = std::mem::replace(&mut *self.closing.lock(), closing_tx);
        previous.send_replace(true);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(Box::new(write_half));
        *self.reader.lock() = Some(Inbound {
            reader: Box::new(read_half),
            generation,
            closing: closing_rx,
        });

        let hello_rx = {
            let mut pending = self.pending.lock();
            let abandoned = pending.close();
            if abandoned > 0 {
                tracing::debug!(abandoned, "Released waiters of the previous stream");
            }
            pending.reopen();
            pending.await_name(names::NODE_HELLO)
        };
        *self.hello.lock().await = Hello::Waiting(hello_rx);
        self.connected.store(true, Ordering::SeqCst);

        tracing::debug!(client = %self.config.client_name, "Sending ClientHello");
        self.send(&client_hello(&self.config.client_name)).await
    }

    /// Waits for the node's `NodeHello`. The reply is cached once received.
    pub async fn node_hello(&self) -> Result<Message, ClientError> {
        let mut hello = self.hello.lock().await;
        let rx = match &mut *hello {
            Hello::Received(message) => return Ok(message.clone()),
            Hello::Idle => return Err(ClientError::NotConnected),
            Hello::Waiting(rx) => rx,
        };

        let message = tokio::time::timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)?;
        tracing::info!(
            version = message.get("FCPVersion").unwrap_or("?"),
            node = message.get("Node").unwrap_or("?"),
            "Received NodeHello"
        );
        *hello = Hello::Received(message.clone());
        Ok(message)
    }

    /// Encodes and writes one message.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        write_message(writer, message).await
    }

    /// Returns a receiver for the next message named `name`.
    pub fn await_name(&self, name: &str) -> oneshot::Receiver<Message> {
        self.pending.lock().await_name(name)
    }

    /// Returns a receiver for the next message carrying correlation id `id`.
    pub fn await_id(&self, id: &str) -> oneshot::Receiver<Message> {
        self.pending.lock().await_id(id)
    }

    /// Runs one correlated request/response exchange.
    ///
    /// `handler` sees every message carrying the request's `Identifier`,
    /// except registered failure messages, which end the session with
    /// [`ClientError::Failure`]. Returning `Some` ends the session with that
    /// value; returning `None` keeps waiting. The session ends with
    /// [`ClientError::Timeout`] if nothing terminal arrives before `timeout`
    /// (default: the configured request timeout).
    pub async fn session<T, F>(
        &self,
        request: IdentifiedMessage,
        body: Option<Bytes>,
        timeout: Option<Duration>,
        mut handler: F,
    ) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnMut(&Message) -> Option<T> + Send + 'static,
    {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.config.request_timeout);
        let id = request.id().to_string();

        let (tx, rx) = oneshot::channel::<Result<T, ClientError>>();
        let mut slot = Some(tx);
        let continuation: Continuation = Box::new(move |message: &Message| {
            let Some(tx) = slot.take() else {
                return Delivery::Gone;
            };
            if tx.is_closed() {
                return Delivery::Gone;
            }

            let outcome = match Failure::from_message(message) {
                Some(failure) => Err(ClientError::from(failure)),
                None => match handler(message) {
                    Some(value) => Ok(value),
                    None => {
                        tracing::debug!(msg = %message, "Interim reply");
                        slot = Some(tx);
                        return Delivery::Rearm;
                    }
                },
            };
            let _ = tx.send(outcome);
            Delivery::Resolved
        });

        let mut message = request.into_message();
        if let Some(body) = body {
            message = message.with_body(body);
        }

        // Dropping the exchange, on timeout or with the caller's future,
        // unregisters the session.
        let exchange = async {
            self.pending.lock().register_id(id.clone(), continuation);
            let _registration = Registration::new(&self.pending).with_id(id.clone());
            self.send(&message).await?;
            rx.await.map_err(|_| ClientError::ConnectionClosed)?
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(id = %id, "Session timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends an uncorrelated request and gathers every `item` message until
    /// an `end` message arrives.
    ///
    /// The collector is re-armed inside dispatch after each item, so items
    /// arriving back to back are never lost. Once its `end` message has been
    /// dispatched the collector steps aside, and later items go to the next
    /// collector. Waiters are registered while the request is being written,
    /// so concurrent collections queue in the order their requests reach the
    /// node.
    pub async fn collect(
        &self,
        request: &Message,
        item: &str,
        end: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Message>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.config.request_timeout);
        let finished = Arc::new(AtomicBool::new(false));

        let (item_tx, mut item_rx) = mpsc::unbounded_channel();
        let collector: Continuation = Box::new({
            let finished = finished.clone();
            move |message: &Message| {
                if finished.load(Ordering::SeqCst) {
                    return Delivery::Gone;
                }
                match item_tx.send(message.clone()) {
                    Ok(()) => Delivery::Rearm,
                    Err(_) => Delivery::Gone,
                }
            }
        });

        let (end_tx, end_rx) = oneshot::channel();
        let mut end_slot = Some(end_tx);
        let terminator: Continuation = Box::new(move |message: &Message| {
            finished.store(true, Ordering::SeqCst);
            match end_slot.take().map(|tx| tx.send(message.clone())) {
                Some(Ok(())) => Delivery::Resolved,
                _ => Delivery::Gone,
            }
        });

        let exchange = async {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
            let _registration = {
                let mut pending = self.pending.lock();
                let collector = pending.register_name(item, collector);
                let terminator = pending.register_name(end, terminator);
                Registration::new(&self.pending)
                    .with_name(item, collector)
                    .with_name(end, terminator)
            };
            write_message(writer, request).await?;
            drop(writer_guard);
            end_rx.await.map_err(|_| ClientError::ConnectionClosed)
        };
        tokio::time::timeout_at(deadline, exchange)
            .await
            .unwrap_or(Err(ClientError::Timeout))?;

        let mut items = Vec::new();
        while let Ok(message) = item_rx.try_recv() {
            items.push(message);
        }
        tracing::debug!(count = items.len(), item, "Collected");
        Ok(items)
    }

    /// Sends `ListPeers` and returns the attributes of every `Peer` reply.
    pub async fn list_peers(&self) -> Result<Vec<Attributes>, ClientError> {
        let request = Message::new(names::LIST_PEERS)
            .with("WithMetadata", "true")
            .with("WithVolatile", "false");
        let peers = self
            .collect(&request, names::PEER, names::END_LIST_PEERS, None)
            .await?;
        Ok(peers.into_iter().map(Message::into_attributes).collect())
    }

    /// Reads and dispatches inbound messages (call this in a background task).
    ///
    /// Returns when the node closes the stream (`ConnectionClosed`), on a read
    /// or framing error, or with `Ok(())` after [`close`](Self::close). In
    /// every case all outstanding waiters are released and observe
    /// `ConnectionClosed`.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let inbound = self.reader.lock().take();
        let Some(Inbound {
            mut reader,
            generation,
            closing,
        }) = inbound
        else {
            return Err(ClientError::NotConnected);
        };
        tracing::debug!(generation, "read_loop started");

        let result = self.read_messages(&mut reader, closing).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "read_loop stopped; stream was replaced");
            return result;
        }
        self.connected.store(false, Ordering::SeqCst);
        let abandoned = self.pending.lock().close();
        match &result {
            Ok(()) => tracing::debug!(abandoned, "read_loop stopped"),
            Err(e) => tracing::debug!(abandoned, error = %e, "read_loop stopped"),
        }
        result
    }

    async fn read_messages(
        &self,
        reader: &mut BoxedReader,
        mut closing: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read?,
                _ = closing.wait_for(|closing| *closing) => return Ok(()),
            };

            if n == 0 {
                tracing::debug!("read_loop: connection closed by node");
                return Err(ClientError::ConnectionClosed);
            }
            tracing::trace!("read_loop: received {} bytes", n);

            decoder.extend(&buf[..n]);
            for message in decoder.messages() {
                let message = message?;
                self.dispatch(&message);
            }
        }
    }

    fn dispatch(&self, message: &Message) {
        let hit = self.pending.lock().dispatch(message);
        if hit.by_name || hit.by_id {
            tracing::debug!(msg = %message, "Received");
        } else {
            tracing::debug!(msg = %message, "Received, no waiter; dropped");
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection. Outstanding sessions fail with
    /// `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        self.connected.store(false, Ordering::SeqCst);
        self.closing.lock().send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().take();

        let abandoned = self.pending.lock().close();
        tracing::debug!("Released {} pending waiters", abandoned);
        *self.hello.lock().await = Hello::Idle;

        tracing::debug!("Connection closed");
        Ok(())
    }

    /// Returns the number of registered waiters.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns whether a session with correlation id `id` is outstanding.
    pub fn has_session(&self, id: &str) -> bool {
        self.pending.lock().contains_id(id)
    }
}

async fn write_message(writer: &mut BoxedWriter, message: &Message) -> Result<(), ClientError> {
    let encoded = Encoder::encode(message);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    tracing::debug!(msg = %message, bytes = encoded.len(), "Sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:9481".parse().unwrap());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.client_name, DEFAULT_CLIENT_NAME);
        assert_eq!(ConnectionConfig::default().addr.port(), 9481);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config =
            ConnectionConfig::new("127.0.0.1:9481".parse().unwrap()).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:9481".parse().unwrap())
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    async fn attached() -> (std::sync::Arc<Connection>, DuplexStream) {
        let (client_side, node_side) = duplex(64 * 1024);
        let conn = std::sync::Arc::new(Connection::new(ConnectionConfig::default()));
        conn.attach(client_side).await.unwrap();
        let reader = conn.clone();
        tokio::spawn(async move {
            let _ = reader.read_loop().await;
        });
        (conn, node_side)
    }

    async fn read_message(node: &mut DuplexStream, decoder: &mut Decoder) -> Message {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = decoder.decode().unwrap() {
                return message;
            }
            let n = node.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the stream");
            decoder.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_session_not_connected() {
        let conn = Connection::new(ConnectionConfig::default());
        let request = IdentifiedMessage::new(Message::new("GenerateSSK"), conn.request_ids());
        let result = conn.session(request, None, None, |m| Some(m.clone())).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_hello_is_first_frame() {
        let (_conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        let hello = read_message(&mut node, &mut decoder).await;
        assert_eq!(hello.name(), "ClientHello");
        assert_eq!(hello.get("Name"), Some(DEFAULT_CLIENT_NAME));
        assert_eq!(hello.get("ExpectedVersion"), Some("2.0"));
    }

    #[tokio::test]
    async fn test_interim_then_terminal_resolves_once() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;

        let request = IdentifiedMessage::new(Message::new("ClientGet"), conn.request_ids());
        let session = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.session(request, None, None, |m| {
                    (m.name() == "AllData").then(|| m.clone())
                })
                .await
            }
        });

        let get = read_message(&mut node, &mut decoder).await;
        let id = get.identifier().unwrap().to_string();
        let progress = Message::new("SimpleProgress").with("Identifier", id.clone());
        let done = Message::new("AllData")
            .with("Identifier", id.clone())
            .with_body(&b"payload"[..]);
        node.write_all(&Encoder::encode(&progress)).await.unwrap();
        node.write_all(&Encoder::encode(&done)).await.unwrap();

        let reply = session.await.unwrap().unwrap();
        assert_eq!(reply.name(), "AllData");
        assert_eq!(reply.body().unwrap().as_ref(), b"payload");
        assert!(!conn.has_session(&id));
    }

    #[tokio::test]
    async fn test_zero_timeout_removes_session() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;
        let before = conn.pending_count();

        let request = IdentifiedMessage::new(Message::new("ClientGet"), conn.request_ids());
        let id = request.id().to_string();
        let result = conn
            .session(request, None, Some(Duration::ZERO), |m| Some(m.clone()))
            .await;

        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(!conn.has_session(&id));
        assert_eq!(conn.pending_count(), before);

        // A late reply finds no waiter.
        let late = Message::new("AllData").with("Identifier", id.clone());
        node.write_all(&Encoder::encode(&late)).await.unwrap();
        let hello = Message::new("NodeHello").with("FCPVersion", "2.0");
        node.write_all(&Encoder::encode(&hello)).await.unwrap();
        conn.node_hello().await.unwrap();
        assert!(!conn.has_session(&id));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_sessions() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;

        let request = IdentifiedMessage::new(Message::new("ClientGet"), conn.request_ids());
        let session = tokio::spawn({
            let conn = conn.clone();
            async move { conn.session(request, None, None, |m| Some(m.clone())).await }
        });
        read_message(&mut node, &mut decoder).await;

        conn.close().await.unwrap();
        let result = session.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(!conn.is_connected());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_node_eof_fails_outstanding_sessions() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;

        let request = IdentifiedMessage::new(Message::new("GenerateSSK"), conn.request_ids());
        let session = tokio::spawn({
            let conn = conn.clone();
            async move { conn.session(request, None, None, |m| Some(m.clone())).await }
        });
        read_message(&mut node, &mut decoder).await;
        drop(node);

        let result = session.await.unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            conn.node_hello().await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_stops_read_loop() {
        let (client_side, mut node) = duplex(4096);
        let conn = Connection::new(ConnectionConfig::default());
        conn.attach(client_side).await.unwrap();

        node.write_all(b"NodeHello\nno equals sign\nEndMessage\n")
            .await
            .unwrap();
        let result = conn.read_loop().await;

        assert!(matches!(
            result,
            Err(ClientError::Protocol(
                fcp_protocol::ProtocolError::MalformedFrame(_)
            ))
        ));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_abandoned_session_unregisters() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;
        let before = conn.pending_count();

        let request = IdentifiedMessage::new(Message::new("ClientGet"), conn.request_ids());
        let id = request.id().to_string();
        let session = conn.session(request, None, None, |m| Some(m.clone()));
        let result = tokio::time::timeout(Duration::from_millis(20), session).await;

        assert!(result.is_err());
        assert_eq!(read_message(&mut node, &mut decoder).await.identifier(), Some(id.as_str()));
        assert!(!conn.has_session(&id));
        assert_eq!(conn.pending_count(), before);
    }

    #[tokio::test]
    async fn test_abandoned_collect_unregisters() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;
        let before = conn.pending_count();

        let result = tokio::time::timeout(Duration::from_millis(20), conn.list_peers()).await;

        assert!(result.is_err());
        assert_eq!(read_message(&mut node, &mut decoder).await.name(), "ListPeers");
        assert_eq!(conn.pending_count(), before);
    }

    #[tokio::test]
    async fn test_concurrent_collections_split_at_end() {
        let (conn, mut node) = attached().await;
        let mut decoder = Decoder::new();
        read_message(&mut node, &mut decoder).await;

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.list_peers().await }
        });
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.list_peers().await }
        });
        assert_eq!(read_message(&mut node, &mut decoder).await.name(), "ListPeers");
        assert_eq!(read_message(&mut node, &mut decoder).await.name(), "ListPeers");

        // Both answers in a single write, so they are dispatched back to back.
        let mut batch = bytes::BytesMut::new();
        for round in 0..2 {
            for i in 0..3 {
                let peer = Message::new("Peer").with("identity", format!("{}-{}", round, i));
                Encoder::encode_into(&peer, &mut batch);
            }
            Encoder::encode_into(&Message::new("EndListPeers"), &mut batch);
        }
        node.write_all(&batch).await.unwrap();

        let mut rounds = Vec::new();
        for peers in [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()] {
            assert_eq!(peers.len(), 3);
            let identities: Vec<_> = peers.iter().map(|p| p.get("identity").unwrap()).collect();
            let round = &identities[0][..1];
            let expected: Vec<_> = (0..3).map(|i| format!("{}-{}", round, i)).collect();
            assert_eq!(identities, expected);
            rounds.push(round.to_string());
        }
        rounds.sort();
        assert_eq!(rounds, vec!["0", "1"]);
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reattach_stops_previous_read_loop() {
        let conn = std::sync::Arc::new(Connection::new(ConnectionConfig::default()));
        let (first_side, _first_node) = duplex(4096);
        conn.attach(first_side).await.unwrap();
        let first_loop = tokio::spawn({
            let conn = conn.clone();
            async move { conn.read_loop().await }
        });
        tokio::task::yield_now().await;

        let (second_side, mut node) = duplex(4096);
        conn.attach(second_side).await.unwrap();
        assert!(first_loop.await.unwrap().is_ok());
        assert!(conn.is_connected());

        let reader = conn.clone();
        tokio::spawn(async move {
            let _ = reader.read_loop().await;
        });

        let mut decoder = Decoder::new();
        assert_eq!(read_message(&mut node, &mut decoder).await.name(), "ClientHello");
        let hello = Message::new("NodeHello").with("FCPVersion", "2.0");
        node.write_all(&Encoder::encode(&hello)).await.unwrap();
        let hello = conn.node_hello().await.unwrap();
        assert_eq!(hello.get("FCPVersion"), Some("2.0"));
    }
}
