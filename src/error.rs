use std::net::SocketAddr;

use thiserror::Error;

use crate::networking::connection::ConnectionId;
use crate::networking::message::MessageId;

/// Why a connection was torn down. This is a closed set so application
/// policy (e.g. temporary blacklisting) can match on it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("malformed message")]
    MalformedMessage,
    #[error("unknown message id")]
    UnknownMessageId,
    #[error("write queue full")]
    WriteQueueFull,
    #[error("failed to set io deadline")]
    DeadlineSetFailed,
    #[error("unexpected error")]
    UnexpectedError,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared payload length {length} outside [{min}, {max}]")]
    InvalidLength { length: u32, min: usize, max: usize },
}

/// Errors raised by the connection pool itself. They are always scoped to a
/// single call or a single connection, never to the whole pool.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("pool is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("write queue full for connection {0}")]
    WriteQueueFull(ConnectionId),
    #[error("max connections reached ({0})")]
    MaxConnectionsReached(usize),
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("dial to {0} timed out")]
    DialTimeout(String),
    #[error("payload of {0} bytes exceeds max message length {1}")]
    PayloadTooLarge(usize, usize),
    #[error("payload of {0} bytes is shorter than a message id ({1})")]
    PayloadTooShort(usize, usize),
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mistakes in how message types are wired into a dispatcher. These are
/// same-process configuration errors, not peer misbehaviour.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("message id {0} is already registered")]
    DuplicateId(MessageId),
    #[error("message type {0} is already registered")]
    DuplicateType(&'static str),
    #[error("message id {0} is malformed")]
    InvalidId(MessageId),
    #[error("message type {0} is not registered")]
    Unregistered(&'static str),
    #[error("a dispatcher already exists for channel {0}")]
    DuplicateChannel(u16),
    #[error("dispatcher on channel {0} has a different receiver type")]
    ReceiverMismatch(u16),
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),
}

/// Failures while routing an inbound payload. Everything here is reachable
/// from peer input, so it is always recoverable and maps to a disconnect.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no dispatcher for channel {0}")]
    UnknownChannel(u16),
    #[error("connection has not joined the service on channel {0}")]
    NotJoined(u16),
    #[error("payload of {0} bytes is too short for a message id")]
    Truncated(usize),
    #[error("unknown message id {0}")]
    UnknownMessage(MessageId),
    #[error("malformed message body: {0}")]
    Malformed(bincode::Error),
    #[error("message handler failed: {0}")]
    Handler(#[from] MessageError),
}

impl DispatchError {
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            DispatchError::UnknownMessage(_) => DisconnectReason::UnknownMessageId,
            _ => DisconnectReason::MalformedMessage,
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service id must be 1..={max} bytes, got {len}")]
    InvalidId { len: usize, max: usize },
    #[error("service description must be at most {max} bytes, got {len}")]
    DescriptionTooLong { len: usize, max: usize },
    #[error("a service is already bound to channel {0}")]
    DuplicateChannel(u16),
    #[error("a service with id {0} already exists")]
    DuplicateId(String),
    #[error("no service on channel {0}")]
    UnknownChannel(u16),
    #[error("no service with id {0}")]
    UnknownService(String),
    #[error("connection {conn} is already a member of the service on channel {channel}")]
    AlreadyMember { conn: ConnectionId, channel: u16 },
    #[error("connection {conn} is not a member of the service on channel {channel}")]
    NotMember { conn: ConnectionId, channel: u16 },
    #[error("service membership can only change inside a service")]
    NoServiceScope,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Returned by message handlers and by the send helpers they use.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}
