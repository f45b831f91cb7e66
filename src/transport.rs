//! The datagram transport seam: `DatagramSocket` plus a concrete
//! `tokio::net::UdpSocket`-backed implementation.
//!
//! Kept as a trait (rather than hard-wiring `Socket` to `tokio::net::UdpSocket`
//! directly) so the integration tests can drive the `Stream`/`Socket` state
//! machines over an in-memory transport instead of real sockets, without the
//! core logic knowing the difference -- the same real-backend/fake-backend
//! split as `aws-s2n-quic`'s `stream::socket::Socket` trait (`tokio.rs` vs.
//! `turmoil.rs`).

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::error::Result;

/// An async datagram endpoint. `Socket` is generic over this so tests can
/// substitute an in-memory transport.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()>;

    /// Receive one datagram, returning its payload and sender address.
    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn enable_broadcast(&self, on: bool) -> Result<()>;
}

/// Default `DatagramSocket`: a thin wrapper over `tokio::net::UdpSocket`.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramSocket for UdpTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send_to(buf, target).await?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        let mut buf = vec![0u8; 65536];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((Bytes::from(buf), from))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn enable_broadcast(&self, on: bool) -> Result<()> {
        self.socket.set_broadcast(on)?;
        Ok(())
    }
}
