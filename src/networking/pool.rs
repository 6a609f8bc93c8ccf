use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{event, Level};

use crate::config::PoolConfig;
use crate::error::{DisconnectReason, DispatchError, TransportError};
use crate::networking::connection::{
    Connection, ConnectionId, ConnectionState, DataEvent, DisconnectEvent, OutboundMessage,
    TaskChannels, TaskTimeouts,
};
use crate::networking::frame::{decode_frame, MIN_PAYLOAD_LENGTH};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

///
/// Callbacks driven by the pump. They all run inside
/// `ConnectionPool::handle_messages` (or `handle_disconnect_events`) and get
/// the pool back so they can send, broadcast or disconnect.
///
pub trait PoolHandler {
    fn on_connect(&mut self, _pool: &mut ConnectionPool, _conn: ConnectionId, _solicited: bool) {}

    fn on_disconnect(
        &mut self,
        _pool: &mut ConnectionPool,
        _conn: ConnectionId,
        _addr: &str,
        _reason: DisconnectReason,
    ) {
    }

    /// An error disconnects the connection with `err.disconnect_reason()` and
    /// stops frame extraction for it in the current pass.
    fn on_message(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError>;
}

/// A socket waiting in the connect queue for the pump to adopt it.
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    pub addr: String,
    pub solicited: bool,
}

/// State shared between the pool and its accept loop(s).
struct PoolShared {
    /// The listener slot. Whoever accepts holds this lock for the duration of
    /// the accept call, so `stop_listen` gets the slot only once the accept
    /// loop has let go of it.
    listener: Mutex<Option<TcpListener>>,
    stop_tx: watch::Sender<bool>,
    // keeps the stop channel open while no accept loop is running
    _stop_rx: watch::Receiver<bool>,
    connect_tx: mpsc::UnboundedSender<PendingConnection>,
    /// Accepted sockets sitting in the connect queue. The accept loop drops
    /// new sockets while this is at `max_connections`.
    pending: AtomicUsize,
    max_connections: usize,
}

/// Runs the accept loop for a pool. Cheap to clone; meant to be moved into
/// its own task.
#[derive(Clone)]
pub struct Acceptor {
    shared: Arc<PoolShared>,
}

impl Acceptor {
    /// Accepts until the pool stops listening. Returns immediately when the
    /// pool is not listening at all.
    pub async fn accept_connections(&self) -> Result<(), TransportError> {
        let mut stop_rx = self.shared.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            let accepted = {
                let slot = self.shared.listener.lock().await;
                let listener = match slot.as_ref() {
                    Some(listener) => listener,
                    None => return Ok(()),
                };
                tokio::select! {
                    _ = stop_rx.changed() => return Ok(()),
                    accepted = listener.accept() => accepted,
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    if self.shared.pending.load(Ordering::Acquire) >= self.shared.max_connections {
                        event!(
                            Level::WARN,
                            "dropping connection from {}: {} connections already waiting",
                            addr,
                            self.shared.max_connections
                        );
                        continue;
                    }
                    event!(Level::DEBUG, "accepted connection from {}", addr);
                    self.shared.pending.fetch_add(1, Ordering::AcqRel);
                    let pending = PendingConnection {
                        stream,
                        addr: addr.to_string(),
                        solicited: false,
                    };
                    if self.shared.connect_tx.send(pending).is_err() {
                        // pool dropped
                        return Ok(());
                    }
                }
                Err(error) => {
                    event!(Level::WARN, "accept failed: {}", error);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

///
/// Owns every live connection.
///
/// Connections are stored once, by id, with a derived address index. Both
/// tables are only changed in `insert_connection` and
/// `handle_disconnect_event`, and only from the task driving the pool.
/// Connection tasks talk to the pool exclusively through the connect, data
/// and disconnect queues.
///
pub struct ConnectionPool {
    config: PoolConfig,
    connections: HashMap<ConnectionId, Connection>,
    addresses: HashMap<String, ConnectionId>,
    next_id: u64,
    local_address: Option<SocketAddr>,
    shared: Arc<PoolShared>,
    connect_rx: mpsc::UnboundedReceiver<PendingConnection>,
    connect_events: VecDeque<(ConnectionId, bool)>,
    data_tx: mpsc::Sender<DataEvent>,
    data_rx: mpsc::Receiver<DataEvent>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
    disconnect_rx: mpsc::Receiver<DisconnectEvent>,
    disconnect_backlog: VecDeque<DisconnectEvent>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Result<ConnectionPool, TransportError> {
        config.validate()?;
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(config.event_channel_size);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(config.event_channel_size);
        let (stop_tx, stop_rx) = watch::channel(false);
        let max_connections = config.max_connections;
        Ok(ConnectionPool {
            config,
            connections: HashMap::new(),
            addresses: HashMap::new(),
            next_id: 0,
            local_address: None,
            shared: Arc::new(PoolShared {
                listener: Mutex::new(None),
                stop_tx,
                _stop_rx: stop_rx,
                connect_tx,
                pending: AtomicUsize::new(0),
                max_connections,
            }),
            connect_rx,
            connect_events: VecDeque::new(),
            data_tx,
            data_rx,
            disconnect_tx,
            disconnect_rx,
            disconnect_backlog: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn max_message_length(&self) -> usize {
        self.config.max_message_length
    }

    /// Binds the listener. Accepting starts once `acceptor()` is run.
    pub async fn start_listen(&mut self, address: &str) -> Result<SocketAddr, TransportError> {
        if let Some(local_address) = self.local_address {
            return Err(TransportError::AlreadyListening(local_address));
        }
        let listener = TcpListener::bind(address).await?;
        let local_address = listener.local_addr()?;
        *self.shared.listener.lock().await = Some(listener);
        self.local_address = Some(local_address);
        event!(Level::INFO, "listening on {}", local_address);
        Ok(local_address)
    }

    pub fn acceptor(&self) -> Acceptor {
        Acceptor {
            shared: self.shared.clone(),
        }
    }

    /// Closes the listener. Waits for a running accept loop to release the
    /// listener slot before taking it, then resets the stop signal so the
    /// pool can listen again.
    pub async fn stop_listen(&mut self) {
        let _ = self.shared.stop_tx.send(true);
        let listener = self.shared.listener.lock().await.take();
        let _ = self.shared.stop_tx.send(false);
        if listener.is_some() {
            event!(Level::INFO, "stopped listening on {:?}", self.local_address);
        }
        self.local_address = None;
    }

    /// Dials `address`, or returns the existing connection to it.
    pub async fn connect(&mut self, address: &str) -> Result<ConnectionId, TransportError> {
        if let Some(conn_id) = self.addresses.get(address) {
            return Ok(*conn_id);
        }
        // accepted sockets the pump has not adopted yet count too
        if self.connections.len() + self.pending_connections() >= self.config.max_connections {
            return Err(TransportError::MaxConnectionsReached(
                self.config.max_connections,
            ));
        }
        let stream = match timeout(self.config.dial_timeout(), TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                event!(Level::WARN, "dial to {} failed: {}", address, error);
                return Err(error.into());
            }
            Err(_) => {
                event!(Level::WARN, "dial to {} timed out", address);
                return Err(TransportError::DialTimeout(address.to_string()));
            }
        };
        self.insert_connection(PendingConnection {
            stream,
            addr: address.to_string(),
            solicited: true,
        })
    }

    /// Marks the connection as disconnecting and queues the teardown for the
    /// pump. Unknown ids and connections already on their way out are
    /// ignored.
    pub fn disconnect(&mut self, conn_id: ConnectionId, reason: DisconnectReason) {
        let connection = match self.connections.get_mut(&conn_id) {
            Some(connection) if connection.is_connected() => connection,
            _ => return,
        };
        connection.mark_disconnecting(reason);
        event!(
            Level::INFO,
            "disconnecting {} ({}): {}",
            conn_id,
            connection.addr(),
            reason
        );
        let disconnect_event = DisconnectEvent { conn_id, reason };
        if let Err(error) = self.disconnect_tx.try_send(disconnect_event) {
            self.disconnect_backlog.push_back(error.into_inner());
        }
    }

    /// Removes the connection from both tables, closes it, then tells the
    /// handler. A reason recorded by `disconnect` wins over the event's.
    pub fn handle_disconnect_event<H: PoolHandler + ?Sized>(
        &mut self,
        disconnect_event: DisconnectEvent,
        handler: &mut H,
    ) {
        let connection = match self.connections.remove(&disconnect_event.conn_id) {
            Some(connection) => connection,
            None => return,
        };
        self.addresses.remove(connection.addr());
        let reason = match connection.state() {
            ConnectionState::Disconnecting(reason) => reason,
            ConnectionState::Connected => disconnect_event.reason,
        };
        let addr = connection.addr().to_string();
        drop(connection);
        event!(
            Level::INFO,
            "disconnected {} ({}): {}",
            disconnect_event.conn_id,
            addr,
            reason
        );
        handler.on_disconnect(self, disconnect_event.conn_id, &addr, reason);
    }

    pub fn handle_disconnect_events<H: PoolHandler + ?Sized>(&mut self, handler: &mut H) {
        loop {
            let disconnect_event = match self.disconnect_rx.try_recv() {
                Ok(disconnect_event) => disconnect_event,
                Err(_) => match self.disconnect_backlog.pop_front() {
                    Some(disconnect_event) => disconnect_event,
                    None => break,
                },
            };
            self.handle_disconnect_event(disconnect_event, handler);
        }
    }

    /// Queues a payload on the connection's write queue without waiting. A
    /// full queue gets the connection disconnected with `WriteQueueFull`.
    pub fn send_message(
        &mut self,
        conn_id: ConnectionId,
        channel: u16,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let max_message_length = self.config.max_message_length;
        if payload.len() > max_message_length {
            return Err(TransportError::PayloadTooLarge(
                payload.len(),
                max_message_length,
            ));
        }
        if payload.len() < MIN_PAYLOAD_LENGTH {
            return Err(TransportError::PayloadTooShort(
                payload.len(),
                MIN_PAYLOAD_LENGTH,
            ));
        }
        let connection = self
            .connections
            .get(&conn_id)
            .ok_or(TransportError::ConnectionNotFound(conn_id))?;
        if !connection.is_connected() {
            return Err(TransportError::ConnectionClosed(conn_id));
        }
        match connection.enqueue(OutboundMessage { channel, payload }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                event!(Level::WARN, "write queue full for {}", conn_id);
                self.disconnect(conn_id, DisconnectReason::WriteQueueFull);
                Err(TransportError::WriteQueueFull(conn_id))
            }
            // write task already exited and queued its own disconnect
            Err(TrySendError::Closed(_)) => Err(TransportError::ConnectionClosed(conn_id)),
        }
    }

    /// Sends to every live connection and returns the ids that failed.
    pub fn broadcast_message(&mut self, channel: u16, payload: &[u8]) -> Vec<ConnectionId> {
        let mut failed = vec![];
        for conn_id in self.connection_ids() {
            if let Err(error) = self.send_message(conn_id, channel, payload.to_vec()) {
                event!(Level::DEBUG, "broadcast to {} failed: {}", conn_id, error);
                failed.push(conn_id);
            }
        }
        failed
    }

    ///
    /// The pump. Adopts queued connections and reports them, buffers newly
    /// read bytes, hands every complete frame to `handler.on_message` in
    /// arrival order, then tears down disconnected connections.
    ///
    /// Must be driven from a single task.
    ///
    pub fn handle_messages<H: PoolHandler + ?Sized>(&mut self, handler: &mut H) {
        self.drain_connect_queue();
        while let Some((conn_id, solicited)) = self.connect_events.pop_front() {
            if self.connections.contains_key(&conn_id) {
                handler.on_connect(self, conn_id, solicited);
            }
        }

        while let Ok(data_event) = self.data_rx.try_recv() {
            if let Some(connection) = self.connections.get_mut(&data_event.conn_id) {
                if connection.is_connected() {
                    connection.append_received(&data_event.data);
                }
            }
        }

        let mut conn_ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.is_connected() && connection.buffered_len() > 0)
            .map(|connection| connection.id())
            .collect();
        conn_ids.sort();
        for conn_id in conn_ids {
            self.process_buffer(conn_id, handler);
        }

        self.handle_disconnect_events(handler);
    }

    /// Closes the listener and every connection and empties the queues. No
    /// disconnect callbacks fire. The pool can listen and connect again
    /// afterwards.
    pub async fn shutdown(&mut self) {
        self.stop_listen().await;
        let closed = self.connections.len();
        self.connections.clear();
        self.addresses.clear();
        self.connect_events.clear();
        self.disconnect_backlog.clear();
        while self.connect_rx.try_recv().is_ok() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        while self.data_rx.try_recv().is_ok() {}
        while self.disconnect_rx.try_recv().is_ok() {}
        event!(Level::INFO, "pool shut down, closed {} connections", closed);
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, conn_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    pub fn connection_by_address(&self, addr: &str) -> Option<&Connection> {
        self.addresses
            .get(addr)
            .and_then(|conn_id| self.connections.get(conn_id))
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.addresses.contains_key(addr)
    }

    /// Live connection ids in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut conn_ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        conn_ids.sort();
        conn_ids
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    /// Accepted sockets waiting for the next pump to adopt them.
    pub fn pending_connections(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    fn drain_connect_queue(&mut self) {
        while let Ok(pending) = self.connect_rx.try_recv() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            let addr = pending.addr.clone();
            if let Err(error) = self.insert_connection(pending) {
                event!(Level::WARN, "dropping connection from {}: {}", addr, error);
            }
        }
    }

    /// The one place connections enter the tables. Starts the connection's
    /// tasks and queues its connect event.
    fn insert_connection(&mut self, pending: PendingConnection) -> Result<ConnectionId, TransportError> {
        if self.addresses.contains_key(&pending.addr) {
            return Err(TransportError::AlreadyConnected(pending.addr));
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(TransportError::MaxConnectionsReached(
                self.config.max_connections,
            ));
        }
        self.next_id += 1;
        let conn_id = ConnectionId::new(self.next_id);
        let connection = Connection::spawn(
            conn_id,
            pending.addr.clone(),
            pending.solicited,
            pending.stream,
            self.config.write_queue_size,
            TaskTimeouts {
                read: self.config.read_timeout(),
                write: self.config.write_timeout(),
            },
            TaskChannels {
                data_tx: self.data_tx.clone(),
                disconnect_tx: self.disconnect_tx.clone(),
            },
        );
        event!(
            Level::INFO,
            "connection {} to {} established (solicited: {})",
            conn_id,
            pending.addr,
            pending.solicited
        );
        self.addresses.insert(pending.addr, conn_id);
        self.connections.insert(conn_id, connection);
        self.connect_events.push_back((conn_id, pending.solicited));
        Ok(conn_id)
    }

    fn process_buffer<H: PoolHandler + ?Sized>(&mut self, conn_id: ConnectionId, handler: &mut H) {
        let mut buffer = match self.connections.get_mut(&conn_id) {
            Some(connection) if connection.is_connected() => std::mem::take(&mut connection.buffer),
            _ => return,
        };
        let max_message_length = self.config.max_message_length;
        let mut consumed = 0;
        loop {
            let frame = match decode_frame(&buffer[consumed..], max_message_length) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    event!(Level::WARN, "bad frame from {}: {}", conn_id, error);
                    self.disconnect(conn_id, DisconnectReason::InvalidMessageLength);
                    break;
                }
            };
            consumed += frame.encoded_len();
            if let Err(error) = handler.on_message(self, conn_id, frame.channel, frame.payload) {
                event!(
                    Level::WARN,
                    "message from {} on channel {} failed: {}",
                    conn_id,
                    frame.channel,
                    error
                );
                self.disconnect(conn_id, error.disconnect_reason());
                break;
            }
            match self.connections.get(&conn_id) {
                Some(connection) if connection.is_connected() => {}
                _ => break,
            }
        }
        if let Some(connection) = self.connections.get_mut(&conn_id) {
            buffer.drain(..consumed);
            connection.buffer = buffer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::frame::encode_frame;
    use crate::test_utilities::{listening_pool, test_config, wait_until, RecordingHandler};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut client = ConnectionPool::new(test_config()).unwrap();
        let mut client_handler = RecordingHandler::default();
        let mut server_handler = RecordingHandler::default();

        let address = server_addr.to_string();
        let first = client.connect(&address).await.unwrap();
        let second = client.connect(&address).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.size(), 1);
        assert!(client.is_connected(&address));
        assert!(client.connection(first).unwrap().is_solicited());

        assert!(
            wait_until(|| {
                client.handle_messages(&mut client_handler);
                server.handle_messages(&mut server_handler);
                server_handler.connects.len() == 1
            })
            .await
        );
        assert_eq!(client_handler.connects, vec![(first, true)]);
        assert!(!server_handler.connects[0].1);
    }

    #[tokio::test]
    async fn test_start_listen_twice_fails() {
        let mut pool = ConnectionPool::new(test_config()).unwrap();
        let local_address = pool.start_listen("127.0.0.1:0").await.unwrap();
        assert_eq!(pool.local_address(), Some(local_address));
        assert!(matches!(
            pool.start_listen("127.0.0.1:0").await,
            Err(TransportError::AlreadyListening(_))
        ));
        pool.stop_listen().await;
        assert!(pool.start_listen("127.0.0.1:0").await.is_ok());
    }

    #[tokio::test]
    async fn test_write_queue_full_disconnects() {
        // never reads, so the connection's write queue backs up
        let raw_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.write_queue_size = 1;
        let mut pool = ConnectionPool::new(config).unwrap();
        let mut handler = RecordingHandler::default();

        let conn_id = pool
            .connect(&raw_listener.local_addr().unwrap().to_string())
            .await
            .unwrap();
        // the write task has not been polled yet on this runtime
        pool.send_message(conn_id, 1, b"PINGfirst".to_vec()).unwrap();
        assert!(matches!(
            pool.send_message(conn_id, 1, b"PINGsecond".to_vec()),
            Err(TransportError::WriteQueueFull(_))
        ));
        assert_eq!(
            pool.connection(conn_id).unwrap().state(),
            ConnectionState::Disconnecting(DisconnectReason::WriteQueueFull)
        );
        assert!(matches!(
            pool.send_message(conn_id, 1, b"PINGthird".to_vec()),
            Err(TransportError::ConnectionClosed(_))
        ));

        pool.handle_messages(&mut handler);
        assert_eq!(pool.size(), 0);
        assert_eq!(
            handler.disconnects,
            vec![(conn_id, DisconnectReason::WriteQueueFull)]
        );
    }

    #[tokio::test]
    async fn test_send_message_rejects_bad_payload_sizes() {
        let (_server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut pool = ConnectionPool::new(test_config()).unwrap();
        let conn_id = pool.connect(&server_addr.to_string()).await.unwrap();

        let oversized = vec![b'A'; pool.max_message_length() + 1];
        assert!(matches!(
            pool.send_message(conn_id, 0, oversized),
            Err(TransportError::PayloadTooLarge(..))
        ));
        assert!(matches!(
            pool.send_message(conn_id, 0, b"AB".to_vec()),
            Err(TransportError::PayloadTooShort(..))
        ));
        assert!(matches!(
            pool.send_message(ConnectionId::new(99), 0, b"PING".to_vec()),
            Err(TransportError::ConnectionNotFound(_))
        ));
        assert!(pool.connection(conn_id).unwrap().is_connected());
    }

    async fn expect_invalid_length(header_length: u32) {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut handler = RecordingHandler::default();
        let mut raw = TcpStream::connect(server_addr).await.unwrap();

        let mut bytes = vec![];
        bytes.extend(&header_length.to_be_bytes());
        bytes.extend(&3u16.to_be_bytes());
        bytes.extend(b"AB");
        raw.write_all(&bytes).await.unwrap();

        assert!(
            wait_until(|| {
                server.handle_messages(&mut handler);
                !handler.disconnects.is_empty()
            })
            .await
        );
        assert_eq!(handler.disconnects[0].1, DisconnectReason::InvalidMessageLength);
        assert!(handler.messages.is_empty());
        assert_eq!(server.size(), 0);
    }

    #[tokio::test]
    async fn test_short_frame_disconnects() {
        expect_invalid_length(2).await;
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        expect_invalid_length(test_config().max_message_length as u32 + 1).await;
    }

    #[tokio::test]
    async fn test_handler_error_halts_extraction() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut handler = RecordingHandler::default();
        handler.reject_prefix = Some(b"BAD!".to_vec());
        let mut raw = TcpStream::connect(server_addr).await.unwrap();

        let mut bytes = encode_frame(1, b"GOOD1");
        bytes.extend(encode_frame(1, b"BAD!x"));
        bytes.extend(encode_frame(1, b"GOOD2"));
        raw.write_all(&bytes).await.unwrap();

        assert!(
            wait_until(|| {
                server.handle_messages(&mut handler);
                !handler.disconnects.is_empty()
            })
            .await
        );
        assert_eq!(handler.payloads(), vec![b"GOOD1".to_vec()]);
        assert_eq!(handler.disconnects[0].1, DisconnectReason::UnknownMessageId);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut client = ConnectionPool::new(test_config()).unwrap();
        let mut server_handler = RecordingHandler::default();
        let conn_id = client.connect(&server_addr.to_string()).await.unwrap();

        for i in 0..20u32 {
            let mut payload = b"SEQ0".to_vec();
            payload.extend(&i.to_be_bytes());
            client.send_message(conn_id, 5, payload).unwrap();
        }

        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                server_handler.messages.len() == 20
            })
            .await
        );
        for (i, (_, channel, payload)) in server_handler.messages.iter().enumerate() {
            assert_eq!(*channel, 5);
            assert_eq!(&payload[4..], &(i as u32).to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut server_handler = RecordingHandler::default();
        let mut peer_one = ConnectionPool::new(test_config()).unwrap();
        let mut peer_two = ConnectionPool::new(test_config()).unwrap();
        let mut handler_one = RecordingHandler::default();
        let mut handler_two = RecordingHandler::default();
        peer_one.connect(&server_addr.to_string()).await.unwrap();
        peer_two.connect(&server_addr.to_string()).await.unwrap();

        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                server.size() == 2
            })
            .await
        );
        assert!(server.broadcast_message(7, b"NEWSitem").is_empty());

        assert!(
            wait_until(|| {
                peer_one.handle_messages(&mut handler_one);
                peer_two.handle_messages(&mut handler_two);
                handler_one.messages.len() == 1 && handler_two.messages.len() == 1
            })
            .await
        );
        assert_eq!(handler_one.payloads(), vec![b"NEWSitem".to_vec()]);
        assert_eq!(handler_two.messages[0].1, 7);
    }

    #[tokio::test]
    async fn test_broadcast_skips_failed_connection() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut server_handler = RecordingHandler::default();
        let mut peer_one = ConnectionPool::new(test_config()).unwrap();
        let mut peer_two = ConnectionPool::new(test_config()).unwrap();
        let mut handler_one = RecordingHandler::default();
        let mut handler_two = RecordingHandler::default();
        peer_one.connect(&server_addr.to_string()).await.unwrap();
        peer_two.connect(&server_addr.to_string()).await.unwrap();
        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                server.size() == 2
            })
            .await
        );

        let closing = server.connection_ids()[0];
        server.disconnect(closing, DisconnectReason::UnexpectedError);
        assert_eq!(server.broadcast_message(7, b"NEWSitem"), vec![closing]);

        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                peer_one.handle_messages(&mut handler_one);
                peer_two.handle_messages(&mut handler_two);
                let delivered = handler_one.messages.len() + handler_two.messages.len();
                let dropped = handler_one.disconnects.len() + handler_two.disconnects.len();
                delivered == 1 && dropped == 1
            })
            .await
        );
        // the peer that kept its connection is the one that got the item
        assert_eq!(handler_one.messages.len(), handler_two.disconnects.len());
        assert_eq!(server.size(), 1);
    }

    #[tokio::test]
    async fn test_pending_accepts_count_against_max_connections() {
        let mut config = test_config();
        config.max_connections = 1;
        let (mut pool, pool_addr, _accept) = listening_pool(config).await;
        let mut handler = RecordingHandler::default();
        let other = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let _first = TcpStream::connect(pool_addr).await.unwrap();
        assert!(wait_until(|| pool.pending_connections() == 1).await);

        // the queue is full, so the accept loop closes this one
        let mut second = TcpStream::connect(pool_addr).await.unwrap();
        let mut buf = [0u8; 4];
        let read = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0)));
        assert!(matches!(
            pool.connect(&other.local_addr().unwrap().to_string()).await,
            Err(TransportError::MaxConnectionsReached(1))
        ));

        pool.handle_messages(&mut handler);
        assert_eq!(pool.pending_connections(), 0);
        assert_eq!(pool.size(), 1);
        assert_eq!(handler.connects.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut server, server_addr, _accept) = listening_pool(test_config()).await;
        let mut client = ConnectionPool::new(test_config()).unwrap();
        let mut client_handler = RecordingHandler::default();
        let mut server_handler = RecordingHandler::default();
        let conn_id = client.connect(&server_addr.to_string()).await.unwrap();

        client.disconnect(ConnectionId::new(42), DisconnectReason::UnexpectedError);
        client.disconnect(conn_id, DisconnectReason::UnexpectedError);
        client.disconnect(conn_id, DisconnectReason::ReadFailed);
        client.handle_messages(&mut client_handler);
        client.handle_disconnect_event(
            DisconnectEvent {
                conn_id,
                reason: DisconnectReason::ReadFailed,
            },
            &mut client_handler,
        );
        assert_eq!(
            client_handler.disconnects,
            vec![(conn_id, DisconnectReason::UnexpectedError)]
        );
        assert_eq!(client.size(), 0);
        assert!(!client.is_connected(&server_addr.to_string()));

        // the remote side notices the closed socket
        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                !server_handler.disconnects.is_empty()
            })
            .await
        );
        assert_eq!(server_handler.disconnects[0].1, DisconnectReason::ReadFailed);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_pool_reusable() {
        let (mut server, server_addr, accept) = listening_pool(test_config()).await;
        let mut server_handler = RecordingHandler::default();
        let mut client = ConnectionPool::new(test_config()).unwrap();
        client.connect(&server_addr.to_string()).await.unwrap();
        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                server.size() == 1
            })
            .await
        );

        server.shutdown().await;
        assert!(accept.await.unwrap().is_ok());
        assert_eq!(server.size(), 0);
        assert_eq!(server.local_address(), None);

        let new_addr = server.start_listen("127.0.0.1:0").await.unwrap();
        let acceptor = server.acceptor();
        tokio::spawn(async move { acceptor.accept_connections().await });
        let mut other_client = ConnectionPool::new(test_config()).unwrap();
        other_client.connect(&new_addr.to_string()).await.unwrap();
        assert!(
            wait_until(|| {
                server.handle_messages(&mut server_handler);
                server.size() == 1
            })
            .await
        );
        assert_eq!(server_handler.connects.len(), 2);
    }
}
