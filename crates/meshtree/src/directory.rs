//! Peer directory and the bootstrap collaborator.
//!
//! The directory answers the engine's question "which key must datagrams
//! from this address be signed with". It is filled from a [`Bootstrap`]
//! source: the rendezvous server's addresses and optional key, plus records
//! of named peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use meshtree_core::PublicKey;
use meshtree_sync::{KeyDirectory, PeerKey};
use tracing::debug;

use crate::error::Result;

/// A named peer as published by the bootstrap source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
    /// `None` if the peer publishes no key.
    pub key: Option<PublicKey>,
}

/// Source of rendezvous addresses and peer records.
///
/// The production source speaks HTTP to a bootstrap server; that client is
/// not part of this crate.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Candidate UDP endpoints of the rendezvous server.
    async fn resolve_bootstrap_addresses(&self) -> Result<Vec<SocketAddr>>;

    /// The rendezvous server's key. `None` means it runs unsigned.
    async fn server_key(&self) -> Result<Option<PublicKey>>;

    /// Look up a peer by name.
    async fn lookup_peer(&self, name: &str) -> Result<Option<PeerRecord>>;

    async fn lookup_peer_key(&self, name: &str) -> Result<Option<PublicKey>> {
        Ok(self.lookup_peer(name).await?.and_then(|record| record.key))
    }
}

/// A fixed bootstrap source, for tests and static deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrap {
    pub addresses: Vec<SocketAddr>,
    pub server_key: Option<PublicKey>,
    pub peers: Vec<PeerRecord>,
}

#[async_trait]
impl Bootstrap for StaticBootstrap {
    async fn resolve_bootstrap_addresses(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.addresses.clone())
    }

    async fn server_key(&self) -> Result<Option<PublicKey>> {
        Ok(self.server_key)
    }

    async fn lookup_peer(&self, name: &str) -> Result<Option<PeerRecord>> {
        Ok(self.peers.iter().find(|p| p.name == name).cloned())
    }
}

#[derive(Default)]
struct Inner {
    by_addr: HashMap<SocketAddr, PeerKey>,
    by_name: HashMap<String, PeerRecord>,
}

/// Keys of every address this node knows about.
#[derive(Default)]
pub struct PeerDirectory {
    inner: RwLock<Inner>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rendezvous server's addresses. Without a key they are
    /// accepted unsigned.
    pub fn set_bootstrap(&self, addresses: &[SocketAddr], key: Option<PublicKey>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let peer_key = key.map_or(PeerKey::Unsigned, PeerKey::Known);
        for addr in addresses {
            inner.by_addr.insert(*addr, peer_key);
        }
        debug!(count = addresses.len(), signed = key.is_some(), "bootstrap addresses registered");
    }

    /// Add or replace a named peer.
    pub fn add_peer(&self, record: PeerRecord) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = inner.by_name.remove(&record.name) {
            for addr in &old.addresses {
                inner.by_addr.remove(addr);
            }
        }
        let peer_key = record.key.map_or(PeerKey::Unsigned, PeerKey::Known);
        for addr in &record.addresses {
            inner.by_addr.insert(*addr, peer_key);
        }
        inner.by_name.insert(record.name.clone(), record);
    }

    pub fn peer(&self, name: &str) -> Option<PeerRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.get(name).cloned()
    }

    pub fn lookup_peer_key(&self, name: &str) -> Option<PublicKey> {
        self.peer(name).and_then(|record| record.key)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyDirectory for PeerDirectory {
    fn key_for(&self, addr: &SocketAddr) -> PeerKey {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_addr.get(addr).copied().unwrap_or(PeerKey::Unknown)
    }
}
