use std::net::SocketAddr;

use tokio::time::sleep;

use crate::networking::connection::ConnectionId;
use crate::networking::pool::ConnectionPool;
use crate::service::echo::{EchoService, ECHO_SERVICE_ID};
use crate::service::ServiceManager;
use crate::test_utilities::{test_config, WAIT_ATTEMPTS, WAIT_INTERVAL};

const SETTLE_ROUNDS: usize = 20;

/// A handful of service managers on loopback, each with the control service
/// and optionally an echo service, pumped together.
pub struct TestManager {
    nodes: Vec<ServiceManager>,
    addresses: Vec<SocketAddr>,
}

impl TestManager {
    /// One node per entry; `Some(channel)` adds an echo service on that
    /// channel.
    pub async fn new(echo_channels: &[Option<u16>]) -> Self {
        let mut nodes = vec![];
        let mut addresses = vec![];
        for echo_channel in echo_channels {
            let mut pool = ConnectionPool::new(test_config()).unwrap();
            let address = pool.start_listen("127.0.0.1:0").await.unwrap();
            let mut manager = ServiceManager::new(pool);
            manager.add_control_service().unwrap();
            if let Some(channel) = echo_channel {
                manager
                    .add_service(ECHO_SERVICE_ID, "echoes text", *channel, EchoService::default())
                    .unwrap();
            }
            let acceptor = manager.acceptor();
            tokio::spawn(async move { acceptor.accept_connections().await });
            nodes.push(manager);
            addresses.push(address);
        }
        TestManager { nodes, addresses }
    }

    pub fn node(&self, index: usize) -> &ServiceManager {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut ServiceManager {
        &mut self.nodes[index]
    }

    pub fn echo(&self, index: usize, channel: u16) -> &EchoService {
        self.nodes[index].handler::<EchoService>(channel).unwrap()
    }

    pub async fn connect(&mut self, from: usize, to: usize) -> ConnectionId {
        let address = self.addresses[to].to_string();
        self.nodes[from].connect(&address).await.unwrap()
    }

    pub fn pump(&mut self) {
        for node in self.nodes.iter_mut() {
            node.handle_messages();
        }
    }

    /// Pumps every node until `condition` holds or the wait runs out.
    pub async fn wait_for<F: FnMut(&TestManager) -> bool>(&mut self, mut condition: F) -> bool {
        for _ in 0..WAIT_ATTEMPTS {
            self.pump();
            if condition(&*self) {
                return true;
            }
            sleep(WAIT_INTERVAL).await;
        }
        false
    }

    /// Pumps for a short while so in-flight frames get handled.
    pub async fn settle(&mut self) {
        for _ in 0..SETTLE_ROUNDS {
            self.pump();
            sleep(WAIT_INTERVAL).await;
        }
    }
}
