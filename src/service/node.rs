//! # Relay Node
//!
//! Single-task event loop that owns every connection and the transaction
//! cache. Socket reads, timer alarms and message handling all run here, one
//! after another, so no two of them ever touch connection state at once.
//!
//! ## Loop
//! - accept inbound sockets (up to `max_connections`)
//! - deliver transport events to their connection
//! - fire due alarms at the nearest deadline
//! - close connections queued by peer de-duplication
//!
//! Shutdown marks every connection for close and waits (bounded) for their
//! transports to report disposal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::constants::ERR_TX_CACHE_LOCK;
use crate::error::{RelayError, Result};
use crate::protocol::connection::{Connection, LocalIdentity, NodeServices};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handlers::default_dispatcher;
use crate::protocol::versioning::ConverterRegistry;
use crate::service::peers::PeerRegistry;
use crate::service::tx_cache::TxCache;
use crate::transport::tcp::TcpTransport;
use crate::transport::{ConnectionId, Direction, NodeEvent, PeerEndpoint};
use crate::utils::metrics::global_metrics;
use crate::utils::scheduler::{AlarmQueue, TimerEvent};
use crate::utils::time::{Clock, SystemClock};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests accepted by a running node.
#[derive(Debug)]
pub enum NodeCommand {
    Connect(SocketAddr),
    Shutdown,
}

/// Cloneable control handle for a running [`RelayNode`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    local_addr: SocketAddr,
    node_id: Uuid,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Open an outbound connection to another relay.
    pub async fn connect(&self, address: SocketAddr) -> Result<()> {
        self.commands
            .send(NodeCommand::Connect(address))
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }
}

pub struct RelayNode {
    config: RelayConfig,
    listener: TcpListener,
    alarms: Arc<AlarmQueue>,
    services: NodeServices,
    connections: HashMap<ConnectionId, Connection>,
    next_conn_id: u64,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    outbound_tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>,
    outbound_rx: mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>,
    commands_rx: mpsc::Receiver<NodeCommand>,
}

impl RelayNode {
    /// Bind the listener with the default handlers.
    pub async fn bind(config: RelayConfig) -> Result<(Self, NodeHandle)> {
        let dispatcher = default_dispatcher()?;
        Self::bind_with_dispatcher(config, dispatcher).await
    }

    #[instrument(skip(config, dispatcher), fields(address = %config.server.address))]
    pub async fn bind_with_dispatcher(
        config: RelayConfig,
        dispatcher: Dispatcher,
    ) -> Result<(Self, NodeHandle)> {
        config.validate_strict()?;

        let listener = TcpListener::bind(&config.server.address).await?;
        let local_addr = listener.local_addr()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let alarms = Arc::new(AlarmQueue::new(clock.clone()));
        let identity = LocalIdentity {
            node_id: config.server.node_id.unwrap_or_else(Uuid::new_v4),
            network_num: config.server.network_num,
        };
        let tx_cache = TxCache::new(
            identity.network_num,
            config.tx_cache.clone(),
            clock,
            alarms.clone(),
        );

        let services = NodeServices {
            identity,
            scheduler: alarms.clone(),
            peers: PeerRegistry::new(),
            tx_cache: Arc::new(Mutex::new(tx_cache)),
            converters: Arc::new(ConverterRegistry::with_defaults()),
            dispatcher,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(32);

        info!(%local_addr, node_id = %identity.node_id, network_num = identity.network_num, "Relay node listening");

        let handle = NodeHandle {
            commands: commands_tx,
            local_addr,
            node_id: identity.node_id,
        };
        let node = Self {
            config,
            listener,
            alarms,
            services,
            connections: HashMap::new(),
            next_conn_id: 0,
            events_tx,
            events_rx,
            outbound_tx,
            outbound_rx,
            commands_rx,
        };
        Ok((node, handle))
    }

    /// Shared transaction cache of this node.
    pub fn tx_cache(&self) -> Arc<Mutex<TxCache>> {
        self.services.tx_cache.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until a shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let next_deadline = self.alarms.next_deadline();
            let alarm = async move {
                match next_deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(NodeCommand::Connect(address)) => self.spawn_connect(address),
                    Some(NodeCommand::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event)?,
                Some((stream, address)) = self.outbound_rx.recv() => {
                    self.add_connection(stream, address, Direction::Outbound)?;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => self.add_connection(stream, address, Direction::Inbound)?,
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                _ = alarm => self.fire_alarms()?,
            }

            self.apply_close_requests()?;
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_connect(&self, address: SocketAddr) {
        let outbound = self.outbound_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => {
                    let _ = outbound.send((stream, address));
                }
                Ok(Err(e)) => warn!(%address, error = %e, "Failed to connect"),
                Err(_) => warn!(%address, "Connection attempt timed out"),
            }
        });
    }

    fn add_connection(
        &mut self,
        stream: TcpStream,
        address: SocketAddr,
        direction: Direction,
    ) -> Result<()> {
        if self.connections.len() >= self.config.server.max_connections {
            warn!(%address, max = self.config.server.max_connections, "Connection limit reached, dropping socket");
            return Ok(());
        }

        self.next_conn_id += 1;
        let conn_id = ConnectionId(self.next_conn_id);
        let transport = TcpTransport::spawn(
            stream,
            conn_id,
            self.events_tx.clone(),
            self.config.connection.outbound_high_water,
        );
        let connection = Connection::new(
            conn_id,
            PeerEndpoint { address, direction },
            transport,
            self.services.clone(),
            self.config.connection.clone(),
        )?;
        self.connections.insert(conn_id, connection);
        Ok(())
    }

    fn handle_event(&mut self, event: NodeEvent) -> Result<()> {
        match event {
            NodeEvent::Received { conn_id, data } => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.process_inbound(&data)?;
                }
            }
            NodeEvent::Writable(conn_id) => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    if let Err(e) = conn.on_writable() {
                        debug!(%conn_id, error = %e, "Flush after writable failed");
                    }
                }
            }
            NodeEvent::PeerClosed(conn_id) => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    debug!(%conn_id, "Peer closed connection");
                    conn.mark_for_close(None);
                }
            }
            NodeEvent::Disposed { conn_id, .. } => {
                if let Some(mut conn) = self.connections.remove(&conn_id) {
                    conn.dispose();
                    if conn.should_retry() {
                        let address = conn.endpoint().address;
                        let retries = self.services.peers.record_retry(address)?;
                        info!(%conn_id, %address, retries, "Outbound connection lost");
                    }
                }
            }
        }
        Ok(())
    }

    fn fire_alarms(&mut self) -> Result<()> {
        for event in self.alarms.fire_due() {
            match event {
                TimerEvent::ExpireShortIds => {
                    self.services
                        .tx_cache
                        .lock()
                        .map_err(|_| RelayError::LockPoisoned(ERR_TX_CACHE_LOCK))?
                        .on_expiration_alarm();
                }
                TimerEvent::SendPing(conn_id) => {
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        if let Err(e) = conn.send_ping() {
                            warn!(%conn_id, error = %e, "Failed to send ping");
                        }
                    }
                }
                TimerEvent::PongTimeout(conn_id) => {
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        conn.on_pong_timeout();
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_close_requests(&mut self) -> Result<()> {
        for conn_id in self.services.peers.take_close_requests()? {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.mark_for_close(Some(false));
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!(connections = self.connections.len(), "Shutting down relay node");
        for conn in self.connections.values_mut() {
            conn.mark_for_close(Some(false));
        }

        let drain = async {
            while !self.connections.is_empty() {
                match self.events_rx.recv().await {
                    Some(NodeEvent::Disposed { conn_id, .. }) => {
                        if let Some(mut conn) = self.connections.remove(&conn_id) {
                            conn.dispose();
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            error!(remaining = self.connections.len(), "Shutdown timeout reached, forcing exit");
            for conn in self.connections.values_mut() {
                conn.dispose();
            }
            self.connections.clear();
        }

        global_metrics().log_metrics();
    }
}
