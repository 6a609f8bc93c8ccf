use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::PoolConfig;
use crate::error::{DisconnectReason, DispatchError, TransportError};
use crate::networking::connection::ConnectionId;
use crate::networking::message::MessageId;
use crate::networking::pool::{ConnectionPool, PoolHandler};

pub mod test_manager;

pub(crate) const WAIT_ATTEMPTS: usize = 1000;
pub(crate) const WAIT_INTERVAL: Duration = Duration::from_millis(5);

pub fn test_config() -> PoolConfig {
    PoolConfig {
        address: String::from("127.0.0.1"),
        port: 0,
        max_message_length: 1024,
        dial_timeout_ms: 5_000,
        read_timeout_ms: 5_000,
        write_timeout_ms: 5_000,
        ..PoolConfig::default()
    }
}

/// A pool listening on an ephemeral loopback port with its accept loop
/// running on a spawned task.
pub async fn listening_pool(
    config: PoolConfig,
) -> (
    ConnectionPool,
    SocketAddr,
    JoinHandle<Result<(), TransportError>>,
) {
    let mut pool = ConnectionPool::new(config).unwrap();
    let local_address = pool.start_listen("127.0.0.1:0").await.unwrap();
    let acceptor = pool.acceptor();
    let accept = tokio::spawn(async move { acceptor.accept_connections().await });
    (pool, local_address, accept)
}

/// Polls `condition` (which usually pumps one or more pools) until it holds,
/// yielding to the runtime in between. Gives up after roughly five seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..WAIT_ATTEMPTS {
        if condition() {
            return true;
        }
        sleep(WAIT_INTERVAL).await;
    }
    false
}

/// Pool handler that records everything it sees.
#[derive(Default, Debug)]
pub struct RecordingHandler {
    pub connects: Vec<(ConnectionId, bool)>,
    pub disconnects: Vec<(ConnectionId, DisconnectReason)>,
    pub messages: Vec<(ConnectionId, u16, Vec<u8>)>,
    /// Payloads starting with this prefix fail as an unknown message.
    pub reject_prefix: Option<Vec<u8>>,
}

impl RecordingHandler {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages
            .iter()
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

impl PoolHandler for RecordingHandler {
    fn on_connect(&mut self, _pool: &mut ConnectionPool, conn: ConnectionId, solicited: bool) {
        self.connects.push((conn, solicited));
    }

    fn on_disconnect(
        &mut self,
        _pool: &mut ConnectionPool,
        conn: ConnectionId,
        _addr: &str,
        reason: DisconnectReason,
    ) {
        self.disconnects.push((conn, reason));
    }

    fn on_message(
        &mut self,
        _pool: &mut ConnectionPool,
        conn: ConnectionId,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        if let Some(prefix) = &self.reject_prefix {
            if payload.starts_with(prefix) {
                let id = MessageId::from_prefix(payload).unwrap();
                return Err(DispatchError::UnknownMessage(id));
            }
        }
        self.messages.push((conn, channel, payload.to_vec()));
        Ok(())
    }
}
