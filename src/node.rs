use std::io;
use std::time::Duration;

use clap::{App, Arg};
use tokio::signal;
use tracing::{event, Level};

use crate::config::PoolConfig;
use crate::networking::pool::ConnectionPool;
use crate::service::echo::{EchoService, ECHO_SERVICE_ID};
use crate::service::ServiceManager;

pub const ECHO_CHANNEL: u16 = 1;
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

///
/// The entry point of the node binary: reads the command line and the
/// optional settings file, then runs a node until it is told to stop.
///
pub async fn run() -> crate::Result<()> {
    let matches = App::new("muxwire node")
        .about("Runs a multiplexed transport node with the echo service")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("config file name"),
        )
        .arg(
            Arg::with_name("peer")
                .short("p")
                .long("peer")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("address of a peer to dial on startup"),
        )
        .get_matches();

    let mut settings = config::Config::default();
    match matches.value_of("config") {
        Some(name) => {
            settings.merge(config::File::with_name(name))?;
        }
        None => {
            settings.merge(config::File::with_name("config").required(false))?;
        }
    }
    let pool_config = PoolConfig::from_settings(&settings)?;

    let peers: Vec<String> = matches
        .values_of("peer")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();

    let mut node = Node::new(pool_config)?;
    node.run(peers).await
}

/// Ctrl-C everywhere, plus SIGTERM and SIGQUIT on unix.
#[cfg(unix)]
pub async fn signal_for_shutdown() -> io::Result<()> {
    let mut terminate_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut quit_signal = signal::unix::signal(signal::unix::SignalKind::quit())?;

    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = terminate_signal.recv() => (),
        _ = quit_signal.recv() => (),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn signal_for_shutdown() -> io::Result<()> {
    signal::ctrl_c().await
}

/// A pool with the control service and the echo service on `ECHO_CHANNEL`.
pub struct Node {
    manager: ServiceManager,
}

impl Node {
    pub fn new(pool_config: PoolConfig) -> crate::Result<Node> {
        let pool = ConnectionPool::new(pool_config)?;
        let mut manager = ServiceManager::new(pool);
        manager.add_control_service()?;
        manager.add_service(
            ECHO_SERVICE_ID,
            "answers every request with the same text",
            ECHO_CHANNEL,
            EchoService::default(),
        )?;
        Ok(Node { manager })
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ServiceManager {
        &mut self.manager
    }

    /// Listens, dials `peers` and joins them to the echo service, then pumps
    /// until a shutdown signal arrives.
    pub async fn run(&mut self, peers: Vec<String>) -> crate::Result<()> {
        let listen_address = self.manager.pool().config().listen_address();
        self.manager.start_listen(&listen_address).await?;
        let acceptor = self.manager.acceptor();
        let accept_task = tokio::spawn(async move { acceptor.accept_connections().await });

        let mut dialed = vec![];
        for peer in peers.iter() {
            match self.manager.connect(peer).await {
                Ok(conn) => dialed.push(conn),
                Err(err) => event!(Level::WARN, "could not connect to {}: {}", peer, err),
            }
        }
        // connections only join the control service once the pump adopts them
        self.manager.handle_messages();
        for conn in dialed {
            if let Err(err) = self.manager.request_join(conn, ECHO_SERVICE_ID) {
                event!(Level::WARN, "could not join {} to echo: {}", conn, err);
            }
        }

        let shutdown = signal_for_shutdown();
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(PUMP_INTERVAL);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    if let Err(err) = res {
                        event!(Level::ERROR, "signal handling failed: {}", err);
                    }
                    break;
                }
                _ = interval.tick() => {
                    self.manager.handle_messages();
                }
            }
        }

        event!(Level::INFO, "shutting down");
        self.manager.shutdown().await;
        accept_task.await??;
        Ok(())
    }
}
