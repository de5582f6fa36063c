//! The listening side: one socket accepting any number of peers.
//!
//! For TCP this is a regular accept loop. For UDP all peers share the one listening
//!  socket, so a demux task reads it and routes each datagram to its peer's connection
//!  through an injection channel; a datagram from an unknown sender becomes a pending
//!  connection attempt.
//!
//! Attempt, connect and disconnect callbacks are never invoked from the demux tasks -
//!  they fire on the thread that calls [NetworkServer::process_messages], same as
//!  message delivery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::Context;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, TransportLayer};
use crate::connection::{ConnectionState, MessageConnection, MessageHandler};
use crate::endpoint::EndPoint;
use crate::socket::{ConnectionSocket, InjectedUdpSocket, TcpConnectionSocket};

const MAX_PENDING_ATTEMPTS: usize = 64;

/// Server-side lifecycle callbacks. All of them run on the application thread, from
///  inside [NetworkServer::process_messages].
#[cfg_attr(test, automock)]
pub trait ServerListener: Send + Sync + 'static {
    /// Decides whether to accept a new peer. For UDP `datagram` is the peer's initial
    ///  datagram; for TCP it is empty.
    fn new_connection_attempt(&self, endpoint: EndPoint, datagram: &[u8]) -> bool;

    fn client_connected(&self, connection: &Arc<MessageConnection>);

    fn client_disconnected(&self, endpoint: EndPoint);
}

enum PendingAttempt {
    Udp { endpoint: EndPoint, datagram: Vec<u8> },
    Tcp { endpoint: EndPoint, stream: TcpStream },
}

struct ConnectionEntry {
    connection: Arc<MessageConnection>,
    /// UDP only: where the demux task forwards this peer's datagrams.
    inject: Option<mpsc::Sender<Vec<u8>>>,
}

pub struct NetworkServer {
    transport: TransportLayer,
    config: ConnectionConfig,
    listener: Arc<dyn ServerListener>,
    handler: Arc<dyn MessageHandler>,
    connections: StdMutex<FxHashMap<EndPoint, ConnectionEntry>>,
    pending: StdMutex<VecDeque<PendingAttempt>>,
    udp_socket: Option<Arc<UdpSocket>>,
    local_port: u16,
    shutdown_tx: watch::Sender<bool>,
    demux_task: StdMutex<Option<JoinHandle<()>>>,
}

impl NetworkServer {
    /// Binds the listening socket on the given port (0 picks an ephemeral one) and
    ///  starts the demux task.
    pub async fn start(
        port: u16,
        transport: TransportLayer,
        listener: Arc<dyn ServerListener>,
        handler: Arc<dyn MessageHandler>,
        config: ConnectionConfig,
    ) -> anyhow::Result<Arc<NetworkServer>> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (udp_socket, local_port, tcp_listener) = match transport {
            TransportLayer::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", port)).await
                    .with_context(|| format!("binding UDP port {}", port))?;
                let local_port = socket.local_addr()?.port();
                (Some(Arc::new(socket)), local_port, None)
            }
            TransportLayer::Tcp => {
                let tcp = TcpListener::bind(("0.0.0.0", port)).await
                    .with_context(|| format!("binding TCP port {}", port))?;
                let local_port = tcp.local_addr()?.port();
                (None, local_port, Some(tcp))
            }
        };

        let server = Arc::new(NetworkServer {
            transport,
            config,
            listener,
            handler,
            connections: StdMutex::new(FxHashMap::default()),
            pending: StdMutex::new(VecDeque::new()),
            udp_socket: udp_socket.clone(),
            local_port,
            shutdown_tx,
            demux_task: StdMutex::new(None),
        });

        let task = match transport {
            TransportLayer::Udp => {
                let socket = udp_socket.expect("UDP socket was bound just above");
                tokio::spawn(Self::udp_demux_loop(socket, Arc::downgrade(&server), shutdown_rx))
            }
            TransportLayer::Tcp => {
                let tcp = tcp_listener.expect("TCP listener was bound just above");
                tokio::spawn(Self::tcp_accept_loop(tcp, Arc::downgrade(&server), shutdown_rx))
            }
        };
        *server.demux_task.lock().expect("task mutex poisoned") = Some(task);

        info!("{:?} server listening on port {}", transport, server.local_port);
        Ok(server)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn transport(&self) -> TransportLayer {
        self.transport
    }

    async fn udp_demux_loop(
        socket: Arc<UdpSocket>,
        server: Weak<NetworkServer>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => {
                            let Some(server) = server.upgrade() else { return };
                            server.route_udp_datagram(from, buf[..n].to_vec());
                        }
                        Err(e) => warn!("UDP recv error on server socket: {}", e),
                    }
                }
            }
        }
    }

    fn route_udp_datagram(&self, from: std::net::SocketAddr, datagram: Vec<u8>) {
        let endpoint = match EndPoint::try_from_socket_addr(from) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("dropping datagram: {}", e);
                return;
            }
        };

        if let Some(entry) = self.connections.lock().expect("connections mutex poisoned").get(&endpoint) {
            if let Some(inject) = &entry.inject {
                if inject.try_send(datagram).is_err() {
                    warn!("inbound datagram queue for {} is full, dropping", endpoint);
                }
            }
            return;
        }

        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let already_pending = pending.iter().any(|attempt| match attempt {
            PendingAttempt::Udp { endpoint: e, .. } => *e == endpoint,
            PendingAttempt::Tcp { endpoint: e, .. } => *e == endpoint,
        });
        if already_pending {
            return;
        }
        if pending.len() >= MAX_PENDING_ATTEMPTS {
            warn!("too many pending connection attempts, dropping datagram from {}", endpoint);
            return;
        }
        debug!("new connection attempt from {}", endpoint);
        pending.push_back(PendingAttempt::Udp { endpoint, datagram });
    }

    async fn tcp_accept_loop(
        listener: TcpListener,
        server: Weak<NetworkServer>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, from)) => {
                            let Some(server) = server.upgrade() else { return };
                            let endpoint = match EndPoint::try_from_socket_addr(from) {
                                Ok(endpoint) => endpoint,
                                Err(e) => {
                                    warn!("rejecting connection: {}", e);
                                    continue;
                                }
                            };
                            let mut pending = server.pending.lock().expect("pending mutex poisoned");
                            if pending.len() >= MAX_PENDING_ATTEMPTS {
                                warn!("too many pending connection attempts, rejecting {}", endpoint);
                                continue;
                            }
                            debug!("new connection attempt from {}", endpoint);
                            pending.push_back(PendingAttempt::Tcp { endpoint, stream });
                        }
                        Err(e) => warn!("TCP accept error: {}", e),
                    }
                }
            }
        }
    }

    /// Application-thread pump: handles pending connection attempts, delivers inbound
    ///  messages of every connection, and reaps closed connections. Returns the number
    ///  of messages delivered.
    pub fn process_messages(&self) -> usize {
        self.handle_pending_attempts();

        let connections: Vec<(EndPoint, Arc<MessageConnection>)> = {
            let registry = self.connections.lock().expect("connections mutex poisoned");
            registry.iter().map(|(e, entry)| (*e, entry.connection.clone())).collect()
        };

        let mut num_processed = 0;
        for (endpoint, connection) in connections {
            num_processed += connection.process_messages();
            if connection.state() == ConnectionState::Closed {
                info!("reaping closed connection to {}", endpoint);
                self.connections.lock().expect("connections mutex poisoned").remove(&endpoint);
                self.listener.client_disconnected(endpoint);
            }
        }
        num_processed
    }

    fn handle_pending_attempts(&self) {
        loop {
            let attempt = self.pending.lock().expect("pending mutex poisoned").pop_front();
            let Some(attempt) = attempt else { return };

            let result = match attempt {
                PendingAttempt::Udp { endpoint, datagram } => self.handle_udp_attempt(endpoint, datagram),
                PendingAttempt::Tcp { endpoint, stream } => self.handle_tcp_attempt(endpoint, stream),
            };
            if let Err(e) = result {
                warn!("failed to set up accepted connection: {}", e);
            }
        }
    }

    fn handle_udp_attempt(&self, endpoint: EndPoint, datagram: Vec<u8>) -> anyhow::Result<()> {
        if !self.listener.new_connection_attempt(endpoint, &datagram) {
            debug!("connection attempt from {} rejected", endpoint);
            return Ok(());
        }
        let socket = self.udp_socket.as_ref()
            .expect("a UDP server always has its socket").clone();
        let (injected, inject_tx) = InjectedUdpSocket::new(
            socket,
            endpoint.to_socket_addr(),
            self.config.delivery_queue_capacity,
        );
        let connection = MessageConnection::new(
            Arc::new(injected),
            TransportLayer::Udp,
            ConnectionState::Ok,
            self.config.clone(),
            self.handler.clone(),
        )?;
        // hand the first datagram to the connection: a plain connect datagram parses
        //  to nothing, but it still counts as hearing from the peer
        if inject_tx.try_send(datagram).is_err() {
            warn!("could not inject the initial datagram from {}", endpoint);
        }
        self.register(endpoint, connection, Some(inject_tx));
        Ok(())
    }

    fn handle_tcp_attempt(&self, endpoint: EndPoint, stream: TcpStream) -> anyhow::Result<()> {
        if !self.listener.new_connection_attempt(endpoint, &[]) {
            debug!("connection attempt from {} rejected", endpoint);
            return Ok(());
        }
        let socket: Arc<dyn ConnectionSocket> = Arc::new(TcpConnectionSocket::new(stream)?);
        let connection = MessageConnection::new(
            socket,
            TransportLayer::Tcp,
            ConnectionState::Ok,
            self.config.clone(),
            self.handler.clone(),
        )?;
        self.register(endpoint, connection, None);
        Ok(())
    }

    fn register(&self, endpoint: EndPoint, connection: Arc<MessageConnection>, inject: Option<mpsc::Sender<Vec<u8>>>) {
        info!("client {} connected", endpoint);
        self.connections.lock().expect("connections mutex poisoned")
            .insert(endpoint, ConnectionEntry { connection: connection.clone(), inject });
        self.listener.client_connected(&connection);
    }

    pub fn connection(&self, endpoint: EndPoint) -> Option<Arc<MessageConnection>> {
        self.connections.lock().expect("connections mutex poisoned")
            .get(&endpoint)
            .map(|entry| entry.connection.clone())
    }

    pub fn connections(&self) -> Vec<Arc<MessageConnection>> {
        self.connections.lock().expect("connections mutex poisoned")
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().expect("connections mutex poisoned").len()
    }

    /// Gracefully disconnects one peer. The `client_disconnected` callback fires from
    ///  the next `process_messages` call once the connection reaches `Closed`.
    pub async fn close_connection(&self, endpoint: EndPoint) {
        let connection = self.connection(endpoint);
        if let Some(connection) = connection {
            connection.disconnect_and_wait().await;
        }
    }

    /// Logs a condensed status line per connection at debug level.
    pub fn dump_status(&self) {
        debug!("{:?} server on port {} with {} connections", self.transport, self.local_port, self.num_connections());
        for connection in self.connections() {
            connection.dump_status();
        }
    }

    /// Gracefully disconnects every peer, then shuts down. Waits up to the disconnect
    ///  timeout per connection for the peers' acks.
    pub async fn graceful_shutdown(&self) {
        for connection in self.connections() {
            connection.disconnect_and_wait().await;
        }
        self.shutdown().await;
    }

    /// Stops the demux task and closes all connections.
    pub async fn shutdown(&self) {
        info!("shutting down server on port {}", self.local_port);
        self.shutdown_tx.send(true).ok();
        if let Some(task) = self.demux_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }

        let connections: Vec<Arc<MessageConnection>> = self.connections();
        for connection in connections {
            connection.close().await;
        }
        self.connections.lock().expect("connections mutex poisoned").clear();
    }
}
