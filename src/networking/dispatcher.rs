use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use bincode::Options;
use serde::Serialize;
use tracing::{event, Level};

use crate::error::{DispatchError, MessageError, RegistryError};
use crate::networking::connection::ConnectionId;
use crate::networking::message::{AnyMessage, Context, Message, MessageId, Route, MESSAGE_ID_SIZE};
use crate::networking::pool::{ConnectionPool, PoolHandler};

/// Body encoding shared by every channel: fixed width big-endian integers,
/// bounded by the max message length, no trailing bytes.
fn wire_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(limit)
        .reject_trailing_bytes()
}

/// Builds the concrete message registered under an id.
pub type Decoder<S> = fn(&[u8], u64) -> bincode::Result<Box<dyn AnyMessage<S>>>;

fn decode_boxed<S, M: Message<S>>(body: &[u8], limit: u64) -> bincode::Result<Box<dyn AnyMessage<S>>> {
    let message: M = wire_options(limit).deserialize(body)?;
    Ok(Box::new(message))
}

/// Type to id half of a registry. Kept apart from the decoders so handlers
/// can encode replies while the dispatcher's receiving object is borrowed.
#[derive(Debug)]
pub struct MessageEncoder {
    ids: HashMap<TypeId, MessageId>,
    limit: u64,
}

impl MessageEncoder {
    fn new(limit: u64) -> Self {
        MessageEncoder {
            ids: HashMap::new(),
            limit,
        }
    }

    pub fn id_of<M: 'static>(&self) -> Option<MessageId> {
        self.ids.get(&TypeId::of::<M>()).copied()
    }

    /// Message id followed by the bincode body.
    pub fn encode<M: Serialize + 'static>(&self, message: &M) -> Result<Vec<u8>, RegistryError> {
        let id = self
            .id_of::<M>()
            .ok_or_else(|| RegistryError::Unregistered(type_name::<M>()))?;
        let mut payload = id.as_bytes().to_vec();
        wire_options(self.limit).serialize_into(&mut payload, message)?;
        Ok(payload)
    }
}

///
/// Two-way map between 4 byte message ids and the message types of one
/// channel. Filled once at startup and only read afterwards.
///
pub struct MessageRegistry<S> {
    encoder: MessageEncoder,
    decoders: HashMap<MessageId, Decoder<S>>,
    names: HashMap<MessageId, &'static str>,
}

impl<S> MessageRegistry<S> {
    pub fn new(max_message_length: usize) -> Self {
        MessageRegistry {
            encoder: MessageEncoder::new(max_message_length as u64),
            decoders: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn register<M: Message<S>>(&mut self, id: MessageId) -> Result<(), RegistryError> {
        if self.decoders.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let type_id = TypeId::of::<M>();
        if self.encoder.ids.contains_key(&type_id) {
            return Err(RegistryError::DuplicateType(type_name::<M>()));
        }
        self.encoder.ids.insert(type_id, id);
        self.decoders.insert(id, decode_boxed::<S, M>);
        self.names.insert(id, type_name::<M>());
        Ok(())
    }

    /// Checks every registered id is well formed.
    pub fn verify(&self) -> Result<(), RegistryError> {
        let mut ids = self.ids();
        ids.sort();
        for id in ids {
            id.validate()?;
        }
        Ok(())
    }

    pub fn erase(&mut self) {
        self.encoder.ids.clear();
        self.decoders.clear();
        self.names.clear();
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.decoders.keys().copied().collect()
    }

    pub fn type_name_of(&self, id: MessageId) -> Option<&'static str> {
        self.names.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn encoder(&self) -> &MessageEncoder {
        &self.encoder
    }

    pub fn encode<M: Serialize + 'static>(&self, message: &M) -> Result<Vec<u8>, RegistryError> {
        self.encoder.encode(message)
    }

    /// Turns an untrusted payload into a registered message. Every failure is
    /// recoverable and blamed on the peer.
    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn AnyMessage<S>>, DispatchError> {
        let id = MessageId::from_prefix(payload).ok_or(DispatchError::Truncated(payload.len()))?;
        let decoder = self
            .decoders
            .get(&id)
            .ok_or(DispatchError::UnknownMessage(id))?;
        decoder(&payload[MESSAGE_ID_SIZE..], self.encoder.limit).map_err(DispatchError::Malformed)
    }
}

/// Service hooks a dispatcher runs on membership changes.
pub(crate) struct Lifecycle<S> {
    pub(crate) connected: fn(&mut S, &mut Context<'_>) -> Result<(), MessageError>,
    pub(crate) disconnected: fn(&mut S, &mut Context<'_>),
}

///
/// Owns the registry of one channel and the receiving object every decoded
/// message on that channel is handled against.
///
pub struct Dispatcher<S> {
    channel: u16,
    registry: MessageRegistry<S>,
    receiver: S,
    lifecycle: Option<Lifecycle<S>>,
}

impl<S> Dispatcher<S> {
    pub fn new(channel: u16, receiver: S, max_message_length: usize) -> Self {
        Dispatcher {
            channel,
            registry: MessageRegistry::new(max_message_length),
            receiver,
            lifecycle: None,
        }
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn register_message<M: Message<S>>(&mut self, id: MessageId) -> Result<(), RegistryError> {
        self.registry.register::<M>(id)
    }

    pub fn verify_messages(&self) -> Result<(), RegistryError> {
        self.registry.verify()
    }

    pub fn erase_messages(&mut self) {
        self.registry.erase();
    }

    pub fn registry(&self) -> &MessageRegistry<S> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MessageRegistry<S> {
        &mut self.registry
    }

    pub fn encode_message<M: Serialize + 'static>(&self, message: &M) -> Result<Vec<u8>, RegistryError> {
        self.registry.encode(message)
    }

    pub fn decode_message(&self, payload: &[u8]) -> Result<Box<dyn AnyMessage<S>>, DispatchError> {
        self.registry.decode(payload)
    }

    /// Encodes and queues `message` for `conn` on `channel`. The channel is
    /// the remote side's number for this protocol, which may differ from ours.
    pub fn send_message<M: Serialize + 'static>(
        &self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        message: &M,
    ) -> Result<(), MessageError> {
        let payload = self.encode_message(message)?;
        pool.send_message(conn, channel, payload)?;
        Ok(())
    }

    pub fn receiver(&self) -> &S {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut S {
        &mut self.receiver
    }

    /// The receiving object next to its registry, for receivers that
    /// register their own message types.
    pub(crate) fn receiver_and_registry(&mut self) -> (&S, &mut MessageRegistry<S>) {
        (&self.receiver, &mut self.registry)
    }

    pub(crate) fn set_lifecycle(&mut self, lifecycle: Lifecycle<S>) {
        self.lifecycle = Some(lifecycle);
    }
}

/// Type erased view of a `Dispatcher<S>` for the manager's channel table.
pub(crate) trait ChannelDispatcher: Send {
    fn encoder(&self) -> &MessageEncoder;
    fn dispatch(
        &mut self,
        route: Route<'_>,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<(), DispatchError>;
    fn connected(&mut self, route: Route<'_>, conn: ConnectionId) -> Result<(), MessageError>;
    fn disconnected(&mut self, route: Route<'_>, conn: ConnectionId);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S: Send + 'static> ChannelDispatcher for Dispatcher<S> {
    fn encoder(&self) -> &MessageEncoder {
        self.registry.encoder()
    }

    fn dispatch(
        &mut self,
        route: Route<'_>,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        let message = self.registry.decode(payload)?;
        event!(
            Level::TRACE,
            "channel {} message from {}: {:?}",
            self.channel,
            conn,
            message
        );
        let mut ctx = Context::new(conn, self.channel, route, &self.registry.encoder);
        message.handle_boxed(&mut ctx, &mut self.receiver)?;
        Ok(())
    }

    fn connected(&mut self, route: Route<'_>, conn: ConnectionId) -> Result<(), MessageError> {
        match &self.lifecycle {
            Some(lifecycle) => {
                let mut ctx = Context::new(conn, self.channel, route, &self.registry.encoder);
                (lifecycle.connected)(&mut self.receiver, &mut ctx)
            }
            None => Ok(()),
        }
    }

    fn disconnected(&mut self, route: Route<'_>, conn: ConnectionId) {
        if let Some(lifecycle) = &self.lifecycle {
            let mut ctx = Context::new(conn, self.channel, route, &self.registry.encoder);
            (lifecycle.disconnected)(&mut self.receiver, &mut ctx);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

///
/// One dispatcher per channel over a shared pool. Implements `PoolHandler`
/// so it can drive a pool directly when no service layer is needed.
///
pub struct DispatcherManager {
    dispatchers: HashMap<u16, Box<dyn ChannelDispatcher>>,
    max_message_length: usize,
}

impl DispatcherManager {
    pub fn new(pool: &ConnectionPool) -> Self {
        DispatcherManager {
            dispatchers: HashMap::new(),
            max_message_length: pool.max_message_length(),
        }
    }

    pub fn new_dispatcher<S: Send + 'static>(
        &mut self,
        channel: u16,
        receiver: S,
    ) -> Result<&mut Dispatcher<S>, RegistryError> {
        let dispatcher = Dispatcher::new(channel, receiver, self.max_message_length);
        self.add_dispatcher(dispatcher)
    }

    /// Takes over a dispatcher built elsewhere, e.g. one whose registry was
    /// filled before it was bound to a channel.
    pub fn add_dispatcher<S: Send + 'static>(
        &mut self,
        dispatcher: Dispatcher<S>,
    ) -> Result<&mut Dispatcher<S>, RegistryError> {
        let channel = dispatcher.channel();
        if self.dispatchers.contains_key(&channel) {
            return Err(RegistryError::DuplicateChannel(channel));
        }
        self.dispatchers.insert(channel, Box::new(dispatcher));
        event!(Level::DEBUG, "dispatcher added on channel {}", channel);
        self.dispatcher_mut::<S>(channel)
            .ok_or(RegistryError::ReceiverMismatch(channel))
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn has_channel(&self, channel: u16) -> bool {
        self.dispatchers.contains_key(&channel)
    }

    pub fn channels(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.dispatchers.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// `None` when the channel is free or its receiver is not an `S`.
    pub fn dispatcher<S: 'static>(&self, channel: u16) -> Option<&Dispatcher<S>> {
        self.dispatchers
            .get(&channel)
            .and_then(|dispatcher| dispatcher.as_any().downcast_ref::<Dispatcher<S>>())
    }

    pub fn dispatcher_mut<S: 'static>(&mut self, channel: u16) -> Option<&mut Dispatcher<S>> {
        self.dispatchers
            .get_mut(&channel)
            .and_then(|dispatcher| dispatcher.as_any_mut().downcast_mut::<Dispatcher<S>>())
    }

    pub fn encoder(&self, channel: u16) -> Option<&MessageEncoder> {
        self.dispatchers
            .get(&channel)
            .map(|dispatcher| dispatcher.encoder())
    }

    pub(crate) fn get_mut(&mut self, channel: u16) -> Option<&mut (dyn ChannelDispatcher + 'static)> {
        self.dispatchers.get_mut(&channel).map(|dispatcher| &mut **dispatcher)
    }

    /// Routes a payload to the dispatcher owning `channel`. Channels are
    /// agreed on by both sides, but the number still comes off the wire, so
    /// an unknown one is reported, not fatal.
    pub fn on_message(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        self.route_message(Route::new(pool), conn, channel, payload)
    }

    pub(crate) fn route_message(
        &mut self,
        route: Route<'_>,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        match self.dispatchers.get_mut(&channel) {
            Some(dispatcher) => dispatcher.dispatch(route, conn, payload),
            None => {
                event!(
                    Level::ERROR,
                    "no dispatcher for channel {} (message from {})",
                    channel,
                    conn
                );
                Err(DispatchError::UnknownChannel(channel))
            }
        }
    }
}

impl PoolHandler for DispatcherManager {
    fn on_message(
        &mut self,
        pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        DispatcherManager::on_message(self, pool, conn, channel, payload)
    }
}
