/*!

# Services

A service is an application subsystem bound to one channel. It has its own
message registry, its own receiving object (the `ServiceServer`), and its own
membership: the connections that joined it, each with the channel number the
remote side uses for the same service. Peers pick their channel numbers
independently, so a service always sends to a member on that member's remote
channel.

Every new connection joins the control service on channel 0. Joining any other
service goes through the control protocol in `control`.

*/

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{event, Level};

use crate::error::{
    DisconnectReason, DispatchError, MessageError, RegistryError, ServiceError, TransportError,
};
use crate::networking::connection::ConnectionId;
use crate::networking::dispatcher::{Dispatcher, DispatcherManager, Lifecycle, MessageRegistry};
use crate::networking::message::{Context, Route};
use crate::networking::pool::{Acceptor, ConnectionPool, PoolHandler};

pub mod control;
pub mod echo;

pub use control::{ControlService, CONTROL_CHANNEL, CONTROL_SERVICE_ID};

pub const MAX_SERVICE_ID_LENGTH: usize = 20;
pub const MAX_SERVICE_DESCRIPTION_LENGTH: usize = 140;

///
/// The receiving object of a service. Registers the message types the
/// service's channel understands and hears about membership changes.
///
pub trait ServiceServer: Send + Sized + 'static {
    fn register_messages(&self, registry: &mut MessageRegistry<Self>) -> Result<(), RegistryError>;

    /// An error here disconnects the connection.
    fn on_connect(&mut self, _ctx: &mut Context<'_>) -> Result<(), MessageError> {
        Ok(())
    }

    fn on_disconnect(&mut self, _ctx: &mut Context<'_>) {}
}

#[derive(Debug, Clone)]
pub struct Service {
    id: String,
    description: String,
    channel: u16,
    members: HashMap<ConnectionId, u16>,
}

impl Service {
    pub fn new(id: &str, description: &str, channel: u16) -> Result<Service, ServiceError> {
        if id.is_empty() || id.len() > MAX_SERVICE_ID_LENGTH {
            return Err(ServiceError::InvalidId {
                len: id.len(),
                max: MAX_SERVICE_ID_LENGTH,
            });
        }
        if description.len() > MAX_SERVICE_DESCRIPTION_LENGTH {
            return Err(ServiceError::DescriptionTooLong {
                len: description.len(),
                max: MAX_SERVICE_DESCRIPTION_LENGTH,
            });
        }
        Ok(Service {
            id: id.to_string(),
            description: description.to_string(),
            channel,
            members: HashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn is_member(&self, conn: ConnectionId) -> bool {
        self.members.contains_key(&conn)
    }

    pub fn remote_channel(&self, conn: ConnectionId) -> Option<u16> {
        self.members.get(&conn).copied()
    }

    /// Member ids in ascending order.
    pub fn members(&self) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self.members.keys().copied().collect();
        members.sort();
        members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn connection_event(
        &mut self,
        conn: ConnectionId,
        remote_channel: u16,
    ) -> Result<(), ServiceError> {
        if self.members.contains_key(&conn) {
            return Err(ServiceError::AlreadyMember {
                conn,
                channel: self.channel,
            });
        }
        self.members.insert(conn, remote_channel);
        Ok(())
    }

    /// Returns the remote channel the connection was using.
    pub fn disconnect_event(&mut self, conn: ConnectionId) -> Result<u16, ServiceError> {
        self.members.remove(&conn).ok_or(ServiceError::NotMember {
            conn,
            channel: self.channel,
        })
    }
}

/// Membership changes requested from inside a callback, applied once it
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceCommand {
    Join {
        conn: ConnectionId,
        channel: u16,
        remote_channel: u16,
    },
    Leave {
        conn: ConnectionId,
        channel: u16,
    },
}

/// What a handler running inside a service can see of the service layer.
pub(crate) struct ServiceScope<'a> {
    pub(crate) members: &'a HashMap<ConnectionId, u16>,
    pub(crate) directory: &'a HashMap<String, u16>,
    pub(crate) commands: &'a mut VecDeque<ServiceCommand>,
}

/// Pool handler behind a `ServiceManager`.
struct ServiceRouter {
    dispatchers: DispatcherManager,
    services: HashMap<u16, Service>,
    directory: HashMap<String, u16>,
    commands: VecDeque<ServiceCommand>,
}

impl ServiceRouter {
    fn join_service(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        remote_channel: u16,
    ) -> Result<(), ServiceError> {
        match pool.connection(conn) {
            Some(connection) if connection.is_connected() => {}
            _ => return Err(TransportError::ConnectionClosed(conn).into()),
        }
        let service = self
            .services
            .get_mut(&channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        service.connection_event(conn, remote_channel)?;
        event!(
            Level::INFO,
            "{} joined service {} (channel {}, remote channel {})",
            conn,
            service.id,
            channel,
            remote_channel
        );
        let dispatcher = self
            .dispatchers
            .get_mut(channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        let scope = ServiceScope {
            members: &service.members,
            directory: &self.directory,
            commands: &mut self.commands,
        };
        if let Err(error) = dispatcher.connected(Route::scoped(pool, scope), conn) {
            event!(
                Level::WARN,
                "service {} refused {}: {}",
                service.id,
                conn,
                error
            );
            pool.disconnect(conn, DisconnectReason::UnexpectedError);
        }
        Ok(())
    }

    fn leave_service(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
    ) -> Result<(), ServiceError> {
        let service = self
            .services
            .get_mut(&channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        service.disconnect_event(conn)?;
        event!(Level::INFO, "{} left service {}", conn, service.id);
        let dispatcher = self
            .dispatchers
            .get_mut(channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        let scope = ServiceScope {
            members: &service.members,
            directory: &self.directory,
            commands: &mut self.commands,
        };
        dispatcher.disconnected(Route::scoped(pool, scope), conn);
        Ok(())
    }

    /// Applies queued membership changes in the order they were requested,
    /// including any queued by the callbacks they trigger.
    fn run_commands(&mut self, pool: &mut ConnectionPool) {
        while let Some(command) = self.commands.pop_front() {
            let result = match command {
                ServiceCommand::Join {
                    conn,
                    channel,
                    remote_channel,
                } => self.join_service(pool, conn, channel, remote_channel),
                ServiceCommand::Leave { conn, channel } => self.leave_service(pool, conn, channel),
            };
            if let Err(error) = result {
                event!(Level::WARN, "{:?} not applied: {}", command, error);
            }
        }
    }
}

impl PoolHandler for ServiceRouter {
    fn on_connect(&mut self, pool: &mut ConnectionPool, conn: ConnectionId, _solicited: bool) {
        if !self.services.contains_key(&CONTROL_CHANNEL) {
            panic!("no service bound to control channel {}", CONTROL_CHANNEL);
        }
        if let Err(error) = self.join_service(pool, conn, CONTROL_CHANNEL, CONTROL_CHANNEL) {
            event!(Level::WARN, "{} could not join the control service: {}", conn, error);
        }
        self.run_commands(pool);
    }

    fn on_disconnect(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        _addr: &str,
        _reason: DisconnectReason,
    ) {
        let mut channels: Vec<u16> = self
            .services
            .values()
            .filter(|service| service.is_member(conn))
            .map(|service| service.channel)
            .collect();
        // control goes last
        channels.sort_by_key(|channel| (*channel == CONTROL_CHANNEL, *channel));
        for channel in channels {
            if let Err(error) = self.leave_service(pool, conn, channel) {
                event!(Level::WARN, "{} could not leave channel {}: {}", conn, channel, error);
            }
        }
        self.run_commands(pool);
    }

    fn on_message(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        let service = match self.services.get(&channel) {
            Some(service) => service,
            None => {
                return self
                    .dispatchers
                    .route_message(Route::new(pool), conn, channel, payload)
            }
        };
        if !service.is_member(conn) {
            event!(
                Level::WARN,
                "{} sent to service {} without joining it",
                conn,
                service.id
            );
            return Err(DispatchError::NotJoined(channel));
        }
        let scope = ServiceScope {
            members: &service.members,
            directory: &self.directory,
            commands: &mut self.commands,
        };
        let result = self
            .dispatchers
            .route_message(Route::scoped(pool, scope), conn, channel, payload);
        self.run_commands(pool);
        result
    }
}

///
/// Owns a pool and every service running over it, and drives the pool with
/// itself as the handler. Call `handle_messages` regularly from one task.
///
pub struct ServiceManager {
    pool: ConnectionPool,
    router: ServiceRouter,
}

impl ServiceManager {
    pub fn new(pool: ConnectionPool) -> Self {
        let dispatchers = DispatcherManager::new(&pool);
        ServiceManager {
            pool,
            router: ServiceRouter {
                dispatchers,
                services: HashMap::new(),
                directory: HashMap::new(),
                commands: VecDeque::new(),
            },
        }
    }

    /// Binds `handler` to `channel` under `id`. The handler registers its
    /// message types before the service goes live.
    pub fn add_service<S: ServiceServer>(
        &mut self,
        id: &str,
        description: &str,
        channel: u16,
        handler: S,
    ) -> Result<(), ServiceError> {
        let service = Service::new(id, description, channel)?;
        if self.router.services.contains_key(&channel) || self.router.dispatchers.has_channel(channel) {
            return Err(ServiceError::DuplicateChannel(channel));
        }
        if self.router.directory.contains_key(id) {
            return Err(ServiceError::DuplicateId(id.to_string()));
        }

        let mut dispatcher = Dispatcher::new(channel, handler, self.router.dispatchers.max_message_length());
        {
            let (handler, registry) = dispatcher.receiver_and_registry();
            handler.register_messages(registry)?;
        }
        dispatcher.verify_messages()?;
        dispatcher.set_lifecycle(Lifecycle {
            connected: <S as ServiceServer>::on_connect,
            disconnected: <S as ServiceServer>::on_disconnect,
        });
        self.router.dispatchers.add_dispatcher(dispatcher)?;

        event!(
            Level::INFO,
            "service {} added on channel {}",
            service.id,
            channel
        );
        self.router.directory.insert(service.id.clone(), channel);
        self.router.services.insert(channel, service);
        Ok(())
    }

    /// The pump. See `ConnectionPool::handle_messages`.
    pub fn handle_messages(&mut self) {
        self.pool.handle_messages(&mut self.router);
    }

    pub async fn start_listen(&mut self, address: &str) -> Result<SocketAddr, TransportError> {
        self.pool.start_listen(address).await
    }

    pub fn acceptor(&self) -> Acceptor {
        self.pool.acceptor()
    }

    pub async fn connect(&mut self, address: &str) -> Result<ConnectionId, TransportError> {
        self.pool.connect(address).await
    }

    /// Shuts the pool down and forgets every membership. Service callbacks do
    /// not fire.
    pub async fn shutdown(&mut self) {
        self.pool.shutdown().await;
        for service in self.router.services.values_mut() {
            service.members.clear();
        }
        self.router.commands.clear();
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.pool
    }

    pub fn dispatchers(&self) -> &DispatcherManager {
        &self.router.dispatchers
    }

    pub fn service(&self, channel: u16) -> Option<&Service> {
        self.router.services.get(&channel)
    }

    pub fn service_by_id(&self, id: &str) -> Option<&Service> {
        self.router
            .directory
            .get(id)
            .and_then(|channel| self.router.services.get(channel))
    }

    /// The service handler on `channel`, if it is an `S`.
    pub fn handler<S: ServiceServer>(&self, channel: u16) -> Option<&S> {
        self.router
            .dispatchers
            .dispatcher::<S>(channel)
            .map(|dispatcher| dispatcher.receiver())
    }

    pub fn handler_mut<S: ServiceServer>(&mut self, channel: u16) -> Option<&mut S> {
        self.router
            .dispatchers
            .dispatcher_mut::<S>(channel)
            .map(|dispatcher| dispatcher.receiver_mut())
    }

    /// Adds `conn` to the service on `channel` without going through the
    /// control protocol, e.g. when both sides agreed on membership out of
    /// band.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        remote_channel: u16,
    ) -> Result<(), ServiceError> {
        let result = self
            .router
            .join_service(&mut self.pool, conn, channel, remote_channel);
        self.router.run_commands(&mut self.pool);
        result
    }

    pub fn leave(&mut self, conn: ConnectionId, channel: u16) -> Result<(), ServiceError> {
        let result = self.router.leave_service(&mut self.pool, conn, channel);
        self.router.run_commands(&mut self.pool);
        result
    }

    /// Sends to one member of the service on `channel`, on that member's
    /// remote channel.
    pub fn send<M: Serialize + 'static>(
        &mut self,
        channel: u16,
        conn: ConnectionId,
        message: &M,
    ) -> Result<(), ServiceError> {
        let service = self
            .router
            .services
            .get(&channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        let remote_channel = service
            .remote_channel(conn)
            .ok_or(ServiceError::NotMember { conn, channel })?;
        let payload = self.encode(channel, message)?;
        self.pool.send_message(conn, remote_channel, payload)?;
        Ok(())
    }

    /// Sends to every member of the service on `channel` and returns the
    /// members the message could not be queued for.
    pub fn broadcast<M: Serialize + 'static>(
        &mut self,
        channel: u16,
        message: &M,
    ) -> Result<Vec<ConnectionId>, ServiceError> {
        let payload = self.encode(channel, message)?;
        let service = self
            .router
            .services
            .get(&channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        let mut members: Vec<(ConnectionId, u16)> = service
            .members
            .iter()
            .map(|(conn, remote_channel)| (*conn, *remote_channel))
            .collect();
        members.sort();

        let mut failed = vec![];
        for (conn, remote_channel) in members {
            if let Err(error) = self.pool.send_message(conn, remote_channel, payload.clone()) {
                event!(Level::DEBUG, "broadcast to {} failed: {}", conn, error);
                failed.push(conn);
            }
        }
        Ok(failed)
    }

    fn encode<M: Serialize + 'static>(&self, channel: u16, message: &M) -> Result<Vec<u8>, ServiceError> {
        let encoder = self
            .router
            .dispatchers
            .encoder(channel)
            .ok_or(ServiceError::UnknownChannel(channel))?;
        Ok(encoder.encode(message)?)
    }
}
