use std::any::Any;
use std::convert::TryInto;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{event, Level};

use crate::error::{DisconnectReason, MessageError, RegistryError, ServiceError};
use crate::networking::connection::ConnectionId;
use crate::networking::dispatcher::MessageEncoder;
use crate::networking::pool::ConnectionPool;
use crate::service::{ServiceCommand, ServiceScope};

pub const MESSAGE_ID_SIZE: usize = 4;

/// The 4 byte prefix that selects a message type within a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    pub const fn new(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        MessageId(bytes)
    }

    /// Builds an id from a 1 to 4 byte name, zero padding on the right.
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > MESSAGE_ID_SIZE {
            return None;
        }
        let mut id = [0u8; MESSAGE_ID_SIZE];
        id[..bytes.len()].copy_from_slice(bytes);
        Some(MessageId(id))
    }

    /// Reads the id off the front of a payload.
    pub fn from_prefix(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; MESSAGE_ID_SIZE] = payload.get(..MESSAGE_ID_SIZE)?.try_into().ok()?;
        Some(MessageId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }

    /// Non-empty, zero padded only at the tail, alphanumeric otherwise.
    pub fn is_well_formed(&self) -> bool {
        if self.0[0] == 0 {
            return false;
        }
        let mut padding = false;
        for byte in self.0.iter() {
            if *byte == 0 {
                padding = true;
            } else if padding || !byte.is_ascii_alphanumeric() {
                return false;
            }
        }
        true
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.is_well_formed() {
            Ok(())
        } else {
            Err(RegistryError::InvalidId(*self))
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_well_formed() {
            let name: Vec<u8> = self.0.iter().copied().take_while(|byte| *byte != 0).collect();
            write!(f, "{}", String::from_utf8_lossy(&name))
        } else {
            write!(f, "0x{}", hex::encode(self.0))
        }
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

///
/// A value that can travel on a channel. `S` is the receiving object of the
/// dispatcher the message is registered with; every decoded message is handed
/// to it together with a `Context` for the connection it came from.
///
pub trait Message<S>: Serialize + DeserializeOwned + fmt::Debug + 'static {
    fn handle(self, ctx: &mut Context<'_>, state: &mut S) -> Result<(), MessageError>;
}

/// Object safe face of `Message<S>` so a registry can hand back decoded
/// values of any registered type.
pub trait AnyMessage<S>: fmt::Debug {
    fn handle_boxed(self: Box<Self>, ctx: &mut Context<'_>, state: &mut S) -> Result<(), MessageError>;
    fn as_any(&self) -> &dyn Any;
}

impl<S, M: Message<S>> AnyMessage<S> for M {
    fn handle_boxed(self: Box<Self>, ctx: &mut Context<'_>, state: &mut S) -> Result<(), MessageError> {
        (*self).handle(ctx, state)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What a dispatcher needs from its caller to run a handler.
pub(crate) struct Route<'a> {
    pub(crate) pool: &'a mut ConnectionPool,
    pub(crate) service: Option<ServiceScope<'a>>,
}

impl<'a> Route<'a> {
    pub(crate) fn new(pool: &'a mut ConnectionPool) -> Self {
        Route { pool, service: None }
    }

    pub(crate) fn scoped(pool: &'a mut ConnectionPool, scope: ServiceScope<'a>) -> Self {
        Route {
            pool,
            service: Some(scope),
        }
    }
}

///
/// Handed to message handlers and service callbacks. Carries the connection
/// the event is about, the local channel, and access to the pool for replies.
/// Inside a service, sends go to the member's remote channel and are limited
/// to members.
///
pub struct Context<'a> {
    conn: ConnectionId,
    channel: u16,
    pool: &'a mut ConnectionPool,
    encoder: &'a MessageEncoder,
    service: Option<ServiceScope<'a>>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        conn: ConnectionId,
        channel: u16,
        route: Route<'a>,
        encoder: &'a MessageEncoder,
    ) -> Self {
        Context {
            conn,
            channel,
            pool: route.pool,
            encoder,
            service: route.service,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// The local channel this context belongs to.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Remote address of the connection, if it is still in the pool.
    pub fn address(&self) -> Option<&str> {
        self.pool.connection(self.conn).map(|connection| connection.addr())
    }

    pub fn pool(&mut self) -> &mut ConnectionPool {
        &mut *self.pool
    }

    pub fn reply<M: Serialize + 'static>(&mut self, message: &M) -> Result<(), MessageError> {
        self.send(self.conn, message)
    }

    pub fn send<M: Serialize + 'static>(
        &mut self,
        conn: ConnectionId,
        message: &M,
    ) -> Result<(), MessageError> {
        let channel = self.remote_channel(conn)?;
        let payload = self.encoder.encode(message)?;
        self.pool.send_message(conn, channel, payload)?;
        Ok(())
    }

    /// Sends to every member of the current service, or to every connection
    /// in the pool when there is no service layer. Per-connection failures
    /// are handled by the pool and do not stop the broadcast.
    pub fn broadcast<M: Serialize + 'static>(&mut self, message: &M) -> Result<(), MessageError> {
        let payload = self.encoder.encode(message)?;
        match &self.service {
            Some(scope) => {
                for (conn, remote_channel) in scope.members.iter() {
                    if let Err(error) = self.pool.send_message(*conn, *remote_channel, payload.clone()) {
                        event!(Level::DEBUG, "broadcast to {} failed: {}", conn, error);
                    }
                }
            }
            None => {
                self.pool.broadcast_message(self.channel, &payload);
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self, reason: DisconnectReason) {
        self.pool.disconnect(self.conn, reason);
    }

    /// Local channel of the service registered under `service_id`.
    pub fn local_channel(&self, service_id: &str) -> Option<u16> {
        self.service
            .as_ref()
            .and_then(|scope| scope.directory.get(service_id).copied())
    }

    /// Asks the service manager to add this connection to the service on
    /// `channel` once the current callback returns.
    pub fn join_service(&mut self, channel: u16, remote_channel: u16) -> Result<(), MessageError> {
        let conn = self.conn;
        self.push_command(ServiceCommand::Join {
            conn,
            channel,
            remote_channel,
        })
    }

    pub fn leave_service(&mut self, channel: u16) -> Result<(), MessageError> {
        let conn = self.conn;
        self.push_command(ServiceCommand::Leave { conn, channel })
    }

    fn push_command(&mut self, command: ServiceCommand) -> Result<(), MessageError> {
        match self.service.as_mut() {
            Some(scope) => {
                scope.commands.push_back(command);
                Ok(())
            }
            None => Err(ServiceError::NoServiceScope.into()),
        }
    }

    fn remote_channel(&self, conn: ConnectionId) -> Result<u16, MessageError> {
        match &self.service {
            Some(scope) => scope.members.get(&conn).copied().ok_or_else(|| {
                ServiceError::NotMember {
                    conn,
                    channel: self.channel,
                }
                .into()
            }),
            None => Ok(self.channel),
        }
    }
}
