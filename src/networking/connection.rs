use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{event, Level};

use crate::error::DisconnectReason;
use crate::networking::frame::encode_frame;
use crate::time::create_timestamp;

pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Pool-local connection id. Ids are handed out in increasing order and are
/// never reused while the pool lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// A disconnect event is queued; only the pump finishes the teardown.
    Disconnecting(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: u16,
    pub payload: Vec<u8>,
}

/// Bytes read off a socket, posted by the read task for the pump to buffer.
#[derive(Debug)]
pub struct DataEvent {
    pub conn_id: ConnectionId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub conn_id: ConnectionId,
    pub reason: DisconnectReason,
}

/// Queues a connection's tasks use to reach the pump.
#[derive(Clone)]
pub(crate) struct TaskChannels {
    pub(crate) data_tx: mpsc::Sender<DataEvent>,
    pub(crate) disconnect_tx: mpsc::Sender<DisconnectEvent>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskTimeouts {
    pub(crate) read: Duration,
    pub(crate) write: Duration,
}

///
/// One live socket. Owned by the `ConnectionPool`; everything else refers to
/// it by `ConnectionId`. Dropping it aborts both tasks, which closes the
/// socket.
///
pub struct Connection {
    id: ConnectionId,
    addr: String,
    solicited: bool,
    state: ConnectionState,
    pub(crate) buffer: Vec<u8>,
    write_queue: mpsc::Sender<OutboundMessage>,
    connected_at: u64,
    last_received: u64,
    last_sent: Arc<AtomicU64>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn spawn(
        id: ConnectionId,
        addr: String,
        solicited: bool,
        stream: TcpStream,
        write_queue_size: usize,
        timeouts: TaskTimeouts,
        channels: TaskChannels,
    ) -> Connection {
        let (reader, writer) = stream.into_split();
        let (write_queue, write_rx) = mpsc::channel(write_queue_size);
        let last_sent = Arc::new(AtomicU64::new(0));

        let read_task = tokio::spawn(read_loop(
            id,
            reader,
            timeouts.read,
            channels.data_tx,
            channels.disconnect_tx.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            id,
            writer,
            timeouts.write,
            write_rx,
            last_sent.clone(),
            channels.disconnect_tx,
        ));

        Connection {
            id,
            addr,
            solicited,
            state: ConnectionState::Connected,
            buffer: vec![],
            write_queue,
            connected_at: create_timestamp(),
            last_received: 0,
            last_sent,
            read_task,
            write_task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True when we dialed the peer, false when it was accepted.
    pub fn is_solicited(&self) -> bool {
        self.solicited
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Relaxed)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn mark_disconnecting(&mut self, reason: DisconnectReason) {
        self.state = ConnectionState::Disconnecting(reason);
    }

    pub(crate) fn append_received(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.last_received = create_timestamp();
    }

    pub(crate) fn enqueue(&self, message: OutboundMessage) -> Result<(), TrySendError<OutboundMessage>> {
        self.write_queue.try_send(message)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("solicited", &self.solicited)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

fn deadline(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

async fn read_loop(
    conn_id: ConnectionId,
    mut reader: OwnedReadHalf,
    read_timeout: Duration,
    data_tx: mpsc::Sender<DataEvent>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let read_deadline = match deadline(read_timeout) {
            Some(read_deadline) => read_deadline,
            None => break DisconnectReason::DeadlineSetFailed,
        };
        match timeout_at(read_deadline, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                event!(Level::DEBUG, "connection {} closed by peer", conn_id);
                break DisconnectReason::ReadFailed;
            }
            Ok(Ok(n)) => {
                let data_event = DataEvent {
                    conn_id,
                    data: buf[..n].to_vec(),
                };
                if data_tx.send(data_event).await.is_err() {
                    // pool is gone
                    return;
                }
            }
            Ok(Err(error)) => {
                event!(Level::DEBUG, "read from connection {} failed: {}", conn_id, error);
                break DisconnectReason::ReadFailed;
            }
            Err(_) => {
                event!(Level::DEBUG, "read from connection {} timed out", conn_id);
                break DisconnectReason::ReadFailed;
            }
        }
    };
    let _ = disconnect_tx.send(DisconnectEvent { conn_id, reason }).await;
}

async fn write_loop(
    conn_id: ConnectionId,
    mut writer: OwnedWriteHalf,
    write_timeout: Duration,
    mut write_rx: mpsc::Receiver<OutboundMessage>,
    last_sent: Arc<AtomicU64>,
    disconnect_tx: mpsc::Sender<DisconnectEvent>,
) {
    while let Some(message) = write_rx.recv().await {
        let frame = encode_frame(message.channel, &message.payload);
        let write_deadline = match deadline(write_timeout) {
            Some(write_deadline) => write_deadline,
            None => {
                let reason = DisconnectReason::DeadlineSetFailed;
                let _ = disconnect_tx.send(DisconnectEvent { conn_id, reason }).await;
                return;
            }
        };
        match timeout_at(write_deadline, writer.write_all(&frame)).await {
            Ok(Ok(())) => {
                last_sent.store(create_timestamp(), Ordering::Relaxed);
            }
            Ok(Err(error)) => {
                event!(Level::DEBUG, "write to connection {} failed: {}", conn_id, error);
                let reason = DisconnectReason::WriteFailed;
                let _ = disconnect_tx.send(DisconnectEvent { conn_id, reason }).await;
                return;
            }
            Err(_) => {
                event!(Level::DEBUG, "write to connection {} timed out", conn_id);
                let reason = DisconnectReason::WriteFailed;
                let _ = disconnect_tx.send(DisconnectEvent { conn_id, reason }).await;
                return;
            }
        }
    }
}
