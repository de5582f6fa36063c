//! Entry points: connect to a peer, or start a server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpStream, UdpSocket};
use tracing::info;

use crate::config::{ConnectionConfig, TransportLayer};
use crate::connection::{ConnectionState, MessageConnection, MessageHandler};
use crate::server::{NetworkServer, ServerListener};
use crate::socket::{TcpConnectionSocket, UdpClientSocket};

/// The initial datagram of a UDP client. All zeroes, so the server's parser sees no
///  valid messages in it; its only job is announcing the client's address.
pub const CONNECT_DATAGRAM_SIZE: usize = 256;

/// Connects to a server with the default configuration.
pub async fn connect(
    addr: SocketAddr,
    transport: TransportLayer,
    handler: Arc<dyn MessageHandler>,
) -> anyhow::Result<Arc<MessageConnection>> {
    connect_with_config(addr, transport, handler, ConnectionConfig::default()).await
}

/// Connects to a server. A UDP connection starts out `Pending` and becomes `Ok` with
///  the first datagram from the server; a TCP connection is `Ok` as soon as the stream
///  is established.
pub async fn connect_with_config(
    addr: SocketAddr,
    transport: TransportLayer,
    handler: Arc<dyn MessageHandler>,
    config: ConnectionConfig,
) -> anyhow::Result<Arc<MessageConnection>> {
    info!("connecting to {} over {:?}", addr, transport);
    match transport {
        TransportLayer::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0").await
                .context("binding client UDP socket")?;
            socket.connect(addr).await
                .with_context(|| format!("connecting UDP socket to {}", addr))?;
            socket.send(&[0u8; CONNECT_DATAGRAM_SIZE]).await
                .with_context(|| format!("sending connect datagram to {}", addr))?;

            MessageConnection::new(
                Arc::new(UdpClientSocket::new(socket, addr)),
                TransportLayer::Udp,
                ConnectionState::Pending,
                config,
                handler,
            )
        }
        TransportLayer::Tcp => {
            let stream = TcpStream::connect(addr).await
                .with_context(|| format!("connecting to {}", addr))?;
            MessageConnection::new(
                Arc::new(TcpConnectionSocket::new(stream)?),
                TransportLayer::Tcp,
                ConnectionState::Ok,
                config,
                handler,
            )
        }
    }
}

/// Starts a server with the default configuration. Port 0 picks an ephemeral port,
///  available afterwards via [NetworkServer::local_port].
pub async fn start_server(
    port: u16,
    transport: TransportLayer,
    listener: Arc<dyn ServerListener>,
    handler: Arc<dyn MessageHandler>,
) -> anyhow::Result<Arc<NetworkServer>> {
    NetworkServer::start(port, transport, listener, handler, ConnectionConfig::default()).await
}

pub async fn start_server_with_config(
    port: u16,
    transport: TransportLayer,
    listener: Arc<dyn ServerListener>,
    handler: Arc<dyn MessageHandler>,
    config: ConnectionConfig,
) -> anyhow::Result<Arc<NetworkServer>> {
    NetworkServer::start(port, transport, listener, handler, config).await
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use rstest::rstest;

    use crate::connection::MockMessageHandler;
    use crate::server::MockServerListener;
    use super::*;

    fn local(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_udp_connect_sends_connect_datagram() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        let conn = connect(addr, TransportLayer::Udp, Arc::new(MockMessageHandler::new())).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Pending);

        let mut buf = vec![0u8; 1024];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, CONNECT_DATAGRAM_SIZE);
        assert!(buf[..n].iter().all(|&b| b == 0));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_tcp_connect_is_immediately_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = connect(addr, TransportLayer::Tcp, Arc::new(MockMessageHandler::new())).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ok);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_tcp_peer_fails() {
        // a freshly bound and dropped listener leaves the port closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, TransportLayer::Tcp, Arc::new(MockMessageHandler::new())).await;
        assert!(result.is_err());
    }

    /// Full loopback round trip through real sockets: client connects, sends a message
    ///  to the server, the server answers, both sides deliver.
    #[rstest]
    #[case::udp(TransportLayer::Udp)]
    #[case::tcp(TransportLayer::Tcp)]
    #[tokio::test]
    async fn test_loopback_round_trip(#[case] transport: TransportLayer) {
        let mut listener = MockServerListener::new();
        listener.expect_new_connection_attempt().return_const(true);
        listener.expect_client_connected().return_const(());
        listener.expect_client_disconnected().return_const(());

        // the server echoes every message back with the id bumped by one
        struct EchoHandler;
        impl MessageHandler for EchoHandler {
            fn handle_message(&self, connection: &MessageConnection, id: u32, payload: &[u8]) {
                connection.send_message(id + 1, true, false, 100, 0, payload).unwrap();
            }
        }

        let server = start_server(0, transport, Arc::new(listener), Arc::new(EchoHandler)).await.unwrap();

        let replies = Arc::new(StdMutex::new(Vec::new()));
        struct RecordingHandler(Arc<StdMutex<Vec<(u32, Vec<u8>)>>>);
        impl MessageHandler for RecordingHandler {
            fn handle_message(&self, _connection: &MessageConnection, id: u32, payload: &[u8]) {
                self.0.lock().unwrap().push((id, payload.to_vec()));
            }
        }

        let conn = connect(
            local(server.local_port()),
            transport,
            Arc::new(RecordingHandler(replies.clone())),
        ).await.unwrap();

        conn.send_message(42, true, false, 100, 0, b"ping me back").unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.process_messages();
            conn.process_messages();
            if !replies.lock().unwrap().is_empty() {
                break;
            }
        }

        assert_eq!(replies.lock().unwrap().as_slice(), &[(43, b"ping me back".to_vec())]);
        if transport == TransportLayer::Udp {
            assert_eq!(conn.state(), ConnectionState::Ok);
        }

        conn.close().await;
        server.shutdown().await;
    }
}
