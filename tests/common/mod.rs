//! In-memory `DatagramSocket` for loopback two-socket integration tests.
//!
//! Mirrors the role the teacher crate's `transport` seam plays in its own
//! unit tests: the protocol state machines (`Stream`/`Socket`) never know
//! whether they're driven by a real UDP socket or this channel-backed
//! stand-in, so these tests exercise the exact dispatch/retry code paths
//! that run against `UdpTransport` without needing a real network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use relaystream::{DatagramSocket, Result};
use tokio::sync::mpsc;

type Mailbox = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

/// A shared, process-wide registry of `MemoryTransport` inboxes keyed by
/// address, so independently-constructed transports can address each
/// other the way independently-bound UDP sockets would via the kernel.
fn network() -> &'static Mutex<HashMap<SocketAddr, Mailbox>> {
    static NETWORK: OnceLock<Mutex<HashMap<SocketAddr, Mailbox>>> = OnceLock::new();
    NETWORK.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct MemoryTransport {
    local_addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    /// Set once this transport should act as a peer that has vanished:
    /// every outbound datagram is silently dropped (spec §8 scenario 5).
    silent: std::sync::atomic::AtomicBool,
}

impl MemoryTransport {
    pub fn bind(local_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        network().lock().unwrap().insert(local_addr, tx);
        Self {
            local_addr,
            inbox: tokio::sync::Mutex::new(rx),
            silent: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn go_silent(&self) {
        self.silent.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        network().lock().unwrap().remove(&self.local_addr);
    }
}

#[async_trait]
impl DatagramSocket for MemoryTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        if self.silent.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = network().lock().unwrap().get(&target) {
            let _ = tx.send((Bytes::copy_from_slice(buf), self.local_addr));
        }
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        match self.inbox.lock().await.recv().await {
            Some(item) => Ok(item),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn enable_broadcast(&self, _on: bool) -> Result<()> {
        Ok(())
    }
}

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}
