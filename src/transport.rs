//! Datagram transport between group members.
//!
//! Frames travel as raw bytes; encoding happens in [`crate::codec`]. Delivery is
//! best effort: callers must tolerate loss, duplication and reordering.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::codec::MAX_DATAGRAM;
use crate::error::{RaftError, Result};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `target`.
    async fn send(&self, target: SocketAddr, bytes: Vec<u8>) -> Result<()>;

    /// Wait for the next datagram.
    async fn recv(&self) -> Result<(SocketAddr, Vec<u8>)>;

    fn local_addr(&self) -> SocketAddr;
}

/// UDP socket bound to the node's configured address.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| RaftError::Transport(format!("bind {}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RaftError::Transport(e.to_string()))?;
        tracing::info!(addr = %local_addr, "UDP transport bound");
        Ok(Self { socket, local_addr })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, target: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| RaftError::Transport(format!("send to {}: {}", target, e)))?;
        Ok(())
    }

    async fn recv(&self) -> Result<(SocketAddr, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| RaftError::Transport(format!("receive: {}", e)))?;
        buf.truncate(len);
        Ok((from, buf))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Inbox = mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>;

/// In-process transport for tests.
///
/// Links can be cut per destination to simulate partitions; a cut link silently
/// drops datagrams the same way a lossy network would.
pub struct InMemoryTransport {
    local_addr: SocketAddr,
    peers: RwLock<HashMap<SocketAddr, Inbox>>,
    blocked: RwLock<HashSet<SocketAddr>>,
    rx: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>>,
}

impl InMemoryTransport {
    pub fn new(local_addr: SocketAddr) -> (Self, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            local_addr,
            peers: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            rx: Mutex::new(rx),
        };
        (transport, tx)
    }

    pub async fn add_peer(&self, addr: SocketAddr, inbox: Inbox) {
        self.peers.write().await.insert(addr, inbox);
    }

    /// Drop everything sent to `addr` until [`InMemoryTransport::unblock`].
    pub async fn block(&self, addr: SocketAddr) {
        self.blocked.write().await.insert(addr);
    }

    pub async fn unblock(&self, addr: SocketAddr) {
        self.blocked.write().await.remove(&addr);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        if self.blocked.read().await.contains(&target) {
            tracing::trace!(from = %self.local_addr, to = %target, "Link cut, dropping datagram");
            return Ok(());
        }
        let inbox = self
            .peers
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("peer not found: {}", target)))?;
        inbox
            .send((self.local_addr, bytes))
            .map_err(|_| RaftError::Transport(format!("peer {} is gone", target)))
    }

    async fn recv(&self) -> Result<(SocketAddr, Vec<u8>)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RaftError::Transport("receive channel closed".to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connect every address to every other address.
pub async fn create_transport_mesh(
    addrs: &[SocketAddr],
) -> HashMap<SocketAddr, Arc<InMemoryTransport>> {
    let mut transports = HashMap::new();
    let mut inboxes = HashMap::new();

    for addr in addrs {
        let (transport, inbox) = InMemoryTransport::new(*addr);
        transports.insert(*addr, Arc::new(transport));
        inboxes.insert(*addr, inbox);
    }

    for (addr, transport) in &transports {
        for (peer_addr, inbox) in &inboxes {
            if peer_addr != addr {
                transport.add_peer(*peer_addr, inbox.clone()).await;
            }
        }
    }

    transports
}
