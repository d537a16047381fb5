//! Socket abstraction for the datagram protocol.
//!
//! The engine needs one bound endpoint that can send to any address and
//! receive from any address, one datagram per call. [`tokio::net::UdpSocket`]
//! is the production implementation; [`memory::MemoryNetwork`] wires sockets
//! together in-process for tests.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{Result, SyncError};

/// A datagram socket.
///
/// Implementations must be thread-safe (Send + Sync). Sends are
/// fire-and-forget: delivery is never confirmed.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram.
    async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<()>;

    /// Receive one datagram into `buf`, returning its length and sender.
    ///
    /// Returns [`SyncError::TransportClosed`] once the socket is shut down.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// The address this socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for tokio::net::UdpSocket {
    async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
        tokio::net::UdpSocket::send_to(self, bytes, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf)
            .await
            .map_err(SyncError::from)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self).map_err(SyncError::from)
    }
}

/// An in-memory datagram network for testing.
///
/// Uses channels to simulate packet delivery between sockets. Datagrams to
/// unbound or blackholed addresses vanish, as they would on a real network.
pub mod memory {
    use super::*;
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::{mpsc, RwLock};

    /// Packet in flight.
    #[derive(Debug)]
    struct Packet {
        from: SocketAddr,
        bytes: Bytes,
    }

    #[derive(Default)]
    struct Counters {
        /// Datagrams addressed to each destination, delivered or not.
        sent_to: HashMap<SocketAddr, usize>,
        blackholed: HashSet<SocketAddr>,
    }

    /// Shared state for the in-memory network.
    pub struct MemoryNetwork {
        sockets: RwLock<HashMap<SocketAddr, mpsc::Sender<Packet>>>,
        counters: Mutex<Counters>,
        next_port: AtomicU16,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Bind a socket at `addr`.
        pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> MemorySocket {
            let (tx, rx) = mpsc::channel(1024);
            self.sockets.write().await.insert(addr, tx);
            MemorySocket {
                addr,
                network: Arc::clone(self),
                receiver: tokio::sync::Mutex::new(rx),
            }
        }

        /// Bind a socket on a fresh loopback port.
        pub async fn bind_any(self: &Arc<Self>) -> MemorySocket {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
                .await
        }

        /// Unbind `addr`; its socket's receive side reports closure.
        pub async fn close(&self, addr: SocketAddr) {
            self.sockets.write().await.remove(&addr);
        }

        /// Silently drop every datagram sent to `addr` while enabled.
        pub fn set_blackhole(&self, addr: SocketAddr, enabled: bool) {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            if enabled {
                counters.blackholed.insert(addr);
            } else {
                counters.blackholed.remove(&addr);
            }
        }

        /// Number of datagrams sent to `addr` so far.
        pub fn sent_to(&self, addr: SocketAddr) -> usize {
            let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters.sent_to.get(&addr).copied().unwrap_or(0)
        }

        /// Inject raw bytes as if `from` had sent them to `to`.
        pub async fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
            self.deliver(from, to, bytes).await;
        }

        async fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
            {
                let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
                *counters.sent_to.entry(to).or_default() += 1;
                if counters.blackholed.contains(&to) {
                    return;
                }
            }
            let sockets = self.sockets.read().await;
            if let Some(sender) = sockets.get(&to) {
                // A full queue drops the datagram, like a full socket buffer.
                let _ = sender.try_send(Packet {
                    from,
                    bytes: Bytes::copy_from_slice(bytes),
                });
            }
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                sockets: RwLock::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                next_port: AtomicU16::new(40_000),
            }
        }
    }

    /// In-memory socket bound on a [`MemoryNetwork`].
    pub struct MemorySocket {
        addr: SocketAddr,
        network: Arc<MemoryNetwork>,
        receiver: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    }

    impl MemorySocket {
        pub fn network(&self) -> &Arc<MemoryNetwork> {
            &self.network
        }
    }

    #[async_trait]
    impl DatagramSocket for MemorySocket {
        async fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<()> {
            self.network.deliver(self.addr, to, bytes).await;
            Ok(())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(packet) => {
                    // Excess bytes are truncated, as with a short UDP buffer.
                    let len = packet.bytes.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet.bytes[..len]);
                    Ok((len, packet.from))
                }
                None => Err(SyncError::TransportClosed),
            }
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.addr)
        }
    }
}
