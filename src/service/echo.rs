use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::error::{MessageError, RegistryError};
use crate::networking::connection::ConnectionId;
use crate::networking::dispatcher::MessageRegistry;
use crate::networking::message::{Context, Message, MessageId};
use crate::service::ServiceServer;

pub const ECHO_SERVICE_ID: &str = "echo";

pub const ECHO_REQUEST_ID: MessageId = MessageId::new(*b"ECRQ");
pub const ECHO_REPLY_ID: MessageId = MessageId::new(*b"ECRP");

/// How many entries each log in `EchoService` keeps.
pub const ECHO_HISTORY_LIMIT: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub text: String,
}

///
/// Answers every request with the same text. Keeps the most recent
/// `ECHO_HISTORY_LIMIT` joins, leaves, requests and replies, plus running
/// totals of the requests and replies it handled.
///
#[derive(Debug, Default)]
pub struct EchoService {
    pub connected: VecDeque<ConnectionId>,
    pub disconnected: VecDeque<ConnectionId>,
    pub requests: VecDeque<(ConnectionId, String)>,
    pub replies: VecDeque<(ConnectionId, String)>,
    pub request_count: u64,
    pub reply_count: u64,
}

fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == ECHO_HISTORY_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

impl ServiceServer for EchoService {
    fn register_messages(&self, registry: &mut MessageRegistry<Self>) -> Result<(), RegistryError> {
        registry.register::<EchoRequest>(ECHO_REQUEST_ID)?;
        registry.register::<EchoReply>(ECHO_REPLY_ID)?;
        Ok(())
    }

    fn on_connect(&mut self, ctx: &mut Context<'_>) -> Result<(), MessageError> {
        event!(Level::DEBUG, "echo: {} joined", ctx.conn());
        record(&mut self.connected, ctx.conn());
        Ok(())
    }

    fn on_disconnect(&mut self, ctx: &mut Context<'_>) {
        event!(Level::DEBUG, "echo: {} left", ctx.conn());
        record(&mut self.disconnected, ctx.conn());
    }
}

impl Message<EchoService> for EchoRequest {
    fn handle(self, ctx: &mut Context<'_>, state: &mut EchoService) -> Result<(), MessageError> {
        state.request_count += 1;
        record(&mut state.requests, (ctx.conn(), self.text.clone()));
        ctx.reply(&EchoReply { text: self.text })
    }
}

impl Message<EchoService> for EchoReply {
    fn handle(self, ctx: &mut Context<'_>, state: &mut EchoService) -> Result<(), MessageError> {
        state.reply_count += 1;
        record(&mut state.replies, (ctx.conn(), self.text));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectReason;
    use crate::test_utilities::test_manager::TestManager;

    /// Node 0 hosts, nodes 1 and 2 connect, only node 1 joins echo.
    async fn three_nodes(channels: &[Option<u16>]) -> (TestManager, ConnectionId, ConnectionId) {
        let mut network = TestManager::new(channels).await;
        let conn_1_to_0 = network.connect(1, 0).await;
        let _conn_2_to_0 = network.connect(2, 0).await;
        assert!(network.wait_for(|network| network.node(0).pool().size() == 2).await);

        network.node_mut(1).request_join(conn_1_to_0, ECHO_SERVICE_ID).unwrap();
        let echo_0 = channels[0].unwrap();
        let echo_1 = channels[1].unwrap();
        assert!(
            network
                .wait_for(|network| {
                    network.echo(0, echo_0).connected.len() == 1
                        && network.echo(1, echo_1).connected.len() == 1
                })
                .await
        );
        let conn_0_to_1 = network.echo(0, echo_0).connected[0];
        (network, conn_0_to_1, conn_1_to_0)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_members() {
        let (mut network, conn_0_to_1, conn_1_to_0) = three_nodes(&[Some(1), Some(1), Some(1)]).await;
        assert_eq!(network.node(0).service(1).unwrap().members(), vec![conn_0_to_1]);
        assert_eq!(network.echo(2, 1).connected.len(), 0);

        let failed = network
            .node_mut(0)
            .broadcast(
                1,
                &EchoRequest {
                    text: String::from("hello"),
                },
            )
            .unwrap();
        assert!(failed.is_empty());

        assert!(network.wait_for(|network| network.echo(0, 1).replies.len() == 1).await);
        assert_eq!(
            network.echo(1, 1).requests,
            vec![(conn_1_to_0, String::from("hello"))]
        );
        assert_eq!(
            network.echo(0, 1).replies,
            vec![(conn_0_to_1, String::from("hello"))]
        );
        assert!(network.echo(2, 1).requests.is_empty());

        // each side saw exactly one join
        assert_eq!(network.echo(0, 1).connected, vec![conn_0_to_1]);
        assert_eq!(network.echo(1, 1).connected, vec![conn_1_to_0]);
    }

    #[tokio::test]
    async fn test_echo_across_different_channels() {
        let (mut network, conn_0_to_1, _conn_1_to_0) = three_nodes(&[Some(4), Some(9), Some(4)]).await;
        network
            .node_mut(0)
            .send(
                4,
                conn_0_to_1,
                &EchoRequest {
                    text: String::from("across"),
                },
            )
            .unwrap();
        assert!(network.wait_for(|network| network.echo(0, 4).replies.len() == 1).await);
        assert_eq!(network.echo(1, 9).requests[0].1, "across");
    }

    #[tokio::test]
    async fn test_history_stays_bounded() {
        let (mut network, conn_0_to_1, _conn_1_to_0) = three_nodes(&[Some(1), Some(1), Some(1)]).await;
        let total = ECHO_HISTORY_LIMIT + 36;
        for i in 0..total {
            let request = EchoRequest {
                text: format!("{:03}{}", i, "x".repeat(600)),
            };
            network.node_mut(0).send(1, conn_0_to_1, &request).unwrap();
            // stay under the write queue size
            if i % 16 == 15 {
                assert!(
                    network
                        .wait_for(|network| network.echo(0, 1).reply_count == i as u64 + 1)
                        .await
                );
            }
        }
        assert!(
            network
                .wait_for(|network| network.echo(0, 1).reply_count == total as u64)
                .await
        );

        let echo = network.echo(1, 1);
        assert_eq!(echo.request_count, total as u64);
        assert_eq!(echo.requests.len(), ECHO_HISTORY_LIMIT);
        // the oldest entries were dropped
        assert!(echo.requests[0].1.starts_with(&format!("{:03}", total - ECHO_HISTORY_LIMIT)));
        assert!(echo.requests[ECHO_HISTORY_LIMIT - 1]
            .1
            .starts_with(&format!("{:03}", total - 1)));
        assert_eq!(network.echo(0, 1).replies.len(), ECHO_HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_disconnect_reaches_every_service() {
        let (mut network, conn_0_to_1, conn_1_to_0) = three_nodes(&[Some(1), Some(1), Some(1)]).await;

        network
            .node_mut(1)
            .pool_mut()
            .disconnect(conn_1_to_0, DisconnectReason::UnexpectedError);
        assert!(
            network
                .wait_for(|network| {
                    network.echo(0, 1).disconnected.len() == 1
                        && network.echo(1, 1).disconnected.len() == 1
                })
                .await
        );
        assert_eq!(network.echo(0, 1).disconnected, vec![conn_0_to_1]);
        assert_eq!(network.node(0).service(1).unwrap().member_count(), 0);
        assert!(!network.node(0).service(0).unwrap().is_member(conn_0_to_1));
        assert!(!network.node(1).service(0).unwrap().is_member(conn_1_to_0));
        // node 2 is untouched
        assert_eq!(network.node(0).pool().size(), 1);
        assert_eq!(network.node(2).pool().size(), 1);
    }
}
