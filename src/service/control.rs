//! Channel 0 protocol that moves connections in and out of services.
//!
//! ```text
//! JOIN  JoinService { service_id, channel }    sender asks to join, channel is its local one
//! JACC  JoinAccepted { service_id, channel }   receiver joined, channel is its local one
//! JREJ  JoinRejected { service_id }            receiver runs no such service
//! LEAV  LeaveService { service_id }            sender left the service
//! ```
//!
//! A join completes on the receiving side before JACC is queued, and on the
//! requesting side when JACC arrives for a join it actually asked for.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::error::{MessageError, RegistryError, ServiceError};
use crate::networking::connection::ConnectionId;
use crate::networking::dispatcher::MessageRegistry;
use crate::networking::message::{Context, Message, MessageId};
use crate::service::{ServiceManager, ServiceServer};

pub const CONTROL_CHANNEL: u16 = 0;
pub const CONTROL_SERVICE_ID: &str = "control";

pub const JOIN_SERVICE_ID: MessageId = MessageId::new(*b"JOIN");
pub const JOIN_ACCEPTED_ID: MessageId = MessageId::new(*b"JACC");
pub const JOIN_REJECTED_ID: MessageId = MessageId::new(*b"JREJ");
pub const LEAVE_SERVICE_ID: MessageId = MessageId::new(*b"LEAV");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JoinService {
    pub service_id: String,
    pub channel: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JoinAccepted {
    pub service_id: String,
    pub channel: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JoinRejected {
    pub service_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LeaveService {
    pub service_id: String,
}

/// Handler of the control channel. Remembers which joins we asked for so an
/// unsolicited JACC can't pull us into a service.
#[derive(Debug, Default)]
pub struct ControlService {
    pending: HashSet<(ConnectionId, String)>,
    rejected: Vec<(ConnectionId, String)>,
}

impl ControlService {
    pub fn new() -> Self {
        ControlService::default()
    }

    pub fn is_pending(&self, conn: ConnectionId, service_id: &str) -> bool {
        self.pending.contains(&(conn, service_id.to_string()))
    }

    /// Joins turned down by peers that are still connected, oldest first.
    pub fn rejected(&self) -> &[(ConnectionId, String)] {
        &self.rejected
    }
}

impl ServiceServer for ControlService {
    fn register_messages(&self, registry: &mut MessageRegistry<Self>) -> Result<(), RegistryError> {
        registry.register::<JoinService>(JOIN_SERVICE_ID)?;
        registry.register::<JoinAccepted>(JOIN_ACCEPTED_ID)?;
        registry.register::<JoinRejected>(JOIN_REJECTED_ID)?;
        registry.register::<LeaveService>(LEAVE_SERVICE_ID)?;
        Ok(())
    }

    fn on_disconnect(&mut self, ctx: &mut Context<'_>) {
        let conn = ctx.conn();
        self.pending.retain(|(pending_conn, _)| *pending_conn != conn);
        self.rejected.retain(|(rejected_conn, _)| *rejected_conn != conn);
    }
}

impl Message<ControlService> for JoinService {
    fn handle(self, ctx: &mut Context<'_>, _state: &mut ControlService) -> Result<(), MessageError> {
        match ctx.local_channel(&self.service_id) {
            Some(local_channel) if local_channel != CONTROL_CHANNEL => {
                ctx.join_service(local_channel, self.channel)?;
                ctx.reply(&JoinAccepted {
                    service_id: self.service_id,
                    channel: local_channel,
                })
            }
            _ => {
                event!(
                    Level::INFO,
                    "{} asked to join unknown service {}",
                    ctx.conn(),
                    self.service_id
                );
                ctx.reply(&JoinRejected {
                    service_id: self.service_id,
                })
            }
        }
    }
}

impl Message<ControlService> for JoinAccepted {
    fn handle(self, ctx: &mut Context<'_>, state: &mut ControlService) -> Result<(), MessageError> {
        if !state.pending.remove(&(ctx.conn(), self.service_id.clone())) {
            event!(
                Level::DEBUG,
                "ignoring unsolicited join of {} from {}",
                self.service_id,
                ctx.conn()
            );
            return Ok(());
        }
        match ctx.local_channel(&self.service_id) {
            Some(local_channel) => ctx.join_service(local_channel, self.channel),
            None => Ok(()),
        }
    }
}

impl Message<ControlService> for JoinRejected {
    fn handle(self, ctx: &mut Context<'_>, state: &mut ControlService) -> Result<(), MessageError> {
        if state.pending.remove(&(ctx.conn(), self.service_id.clone())) {
            event!(
                Level::INFO,
                "{} rejected our join of {}",
                ctx.conn(),
                self.service_id
            );
            state.rejected.push((ctx.conn(), self.service_id));
        }
        Ok(())
    }
}

impl Message<ControlService> for LeaveService {
    fn handle(self, ctx: &mut Context<'_>, _state: &mut ControlService) -> Result<(), MessageError> {
        match ctx.local_channel(&self.service_id) {
            Some(local_channel) if local_channel != CONTROL_CHANNEL => {
                ctx.leave_service(local_channel)
            }
            _ => Ok(()),
        }
    }
}

impl ServiceManager {
    /// Registers a `ControlService` on the control channel.
    pub fn add_control_service(&mut self) -> Result<(), ServiceError> {
        self.add_service(
            CONTROL_SERVICE_ID,
            "joins and leaves services",
            CONTROL_CHANNEL,
            ControlService::new(),
        )
    }

    /// Asks the peer on `conn` to join the service `service_id` with us.
    /// Membership starts when the peer accepts.
    pub fn request_join(&mut self, conn: ConnectionId, service_id: &str) -> Result<(), ServiceError> {
        let service = self
            .service_by_id(service_id)
            .ok_or_else(|| ServiceError::UnknownService(service_id.to_string()))?;
        let channel = service.channel();
        if service.is_member(conn) {
            return Err(ServiceError::AlreadyMember { conn, channel });
        }
        self.handler_mut::<ControlService>(CONTROL_CHANNEL)
            .ok_or(ServiceError::UnknownChannel(CONTROL_CHANNEL))?
            .pending
            .insert((conn, service_id.to_string()));
        let request = JoinService {
            service_id: service_id.to_string(),
            channel,
        };
        self.send(CONTROL_CHANNEL, conn, &request)
    }

    /// Leaves `service_id` on our side and tells the peer to do the same.
    pub fn request_leave(&mut self, conn: ConnectionId, service_id: &str) -> Result<(), ServiceError> {
        let channel = self
            .service_by_id(service_id)
            .map(|service| service.channel())
            .ok_or_else(|| ServiceError::UnknownService(service_id.to_string()))?;
        self.send(
            CONTROL_CHANNEL,
            conn,
            &LeaveService {
                service_id: service_id.to_string(),
            },
        )?;
        self.leave(conn, channel)
    }
}
