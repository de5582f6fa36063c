use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::trace;

const RECV_BUF_SIZE: usize = 64 * 1024;

/// Abstraction over one connection's view of its transport: a connected UDP socket, a
///  per-endpoint slice of a server's shared UDP socket, or a TCP stream. Introduced so
///  the connection state machine can be tested against a mock with byte-exact
///  expectations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionSocket: Send + Sync + 'static {
    /// Waits for the next inbound datagram (UDP) or chunk of stream bytes (TCP).
    ///  An error is connection-fatal.
    async fn recv(&self) -> anyhow::Result<Vec<u8>>;

    /// Non-blocking variant: `None` when nothing is buffered right now.
    fn try_recv(&self) -> anyhow::Result<Option<Vec<u8>>>;

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;

    fn peer_addr(&self) -> SocketAddr;
}

/// A UDP socket connected to one peer - the client side of a UDP connection.
pub struct UdpClientSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpClientSocket {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> UdpClientSocket {
        UdpClientSocket { socket, peer }
    }
}

#[async_trait]
impl ConnectionSocket for UdpClientSocket {
    async fn recv(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    fn try_recv(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} byte datagram to {}", buf.len(), self.peer);
        self.socket.send(buf).await?;
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// The server side of a UDP connection. Only the server's recv loop reads the real
///  socket; datagrams for this peer are injected through a channel. Sends go straight
///  out through the shared socket.
pub struct InjectedUdpSocket {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl InjectedUdpSocket {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, capacity: usize) -> (InjectedUdpSocket, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let injected = InjectedUdpSocket {
            socket,
            peer,
            inbound: Mutex::new(rx),
        };
        (injected, tx)
    }
}

#[async_trait]
impl ConnectionSocket for InjectedUdpSocket {
    async fn recv(&self) -> anyhow::Result<Vec<u8>> {
        match self.inbound.lock().await.recv().await {
            Some(datagram) => Ok(datagram),
            None => bail!("server side closed the datagram channel for {}", self.peer),
        }
    }

    fn try_recv(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Ok(mut inbound) = self.inbound.try_lock() else {
            return Ok(None);
        };
        match inbound.try_recv() {
            Ok(datagram) => Ok(Some(datagram)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                bail!("server side closed the datagram channel for {}", self.peer)
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("sending {} byte datagram to {} through the shared server socket", buf.len(), self.peer);
        self.socket.send_to(buf, self.peer).await?;
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// A TCP stream, either from an outbound connect or a server accept.
pub struct TcpConnectionSocket {
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpConnectionSocket {
    pub fn new(stream: TcpStream) -> anyhow::Result<TcpConnectionSocket> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnectionSocket {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            peer,
        })
    }
}

#[async_trait]
impl ConnectionSocket for TcpConnectionSocket {
    async fn recv(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let n = self.read_half.lock().await.read(&mut buf).await?;
        if n == 0 {
            bail!("TCP peer {} closed the connection", self.peer);
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn try_recv(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Ok(read_half) = self.read_half.try_lock() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match read_half.try_read(&mut buf) {
            Ok(0) => bail!("TCP peer {} closed the connection", self.peer),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.write_half.lock().await.write_all(buf).await?;
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}
