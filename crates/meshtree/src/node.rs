//! The Node: one identity, one store, one socket.
//!
//! A node builds its tree from the stored messages when it is created and
//! serves that tree for as long as it runs. Messages posted while running
//! are persisted and become part of the tree on the next start.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use meshtree_core::{
    Keypair, LocalTree, Message, PublicKey, Sha256Hash, TreeArena, DEFAULT_MAX_ARITY,
};
use meshtree_store::NodeStore;
use meshtree_sync::{DatagramSocket, EngineConfig, ReconcileReport, SyncEngine};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::directory::{Bootstrap, PeerDirectory, PeerRecord};
use crate::error::{NodeError, Result};

/// Configuration for the local tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Children per internal node.
    pub max_arity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_arity: DEFAULT_MAX_ARITY,
        }
    }
}

/// Configuration for a [`Node`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub engine: EngineConfig,
    pub tree: TreeConfig,
}

impl NodeConfig {
    /// Parse a JSON configuration. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.engine = self.engine.with_name(name);
        self
    }
}

/// Outcome of a handshake fan-out.
#[derive(Debug, Default)]
pub struct HandshakeReport {
    /// Addresses that answered, with the name they announced.
    pub answered: Vec<(SocketAddr, String)>,
    pub failed: Vec<(SocketAddr, NodeError)>,
}

/// A running meshtree node.
pub struct Node<S: NodeStore + 'static, T: DatagramSocket + 'static> {
    engine: Arc<SyncEngine<S, T>>,
    directory: Arc<PeerDirectory>,
    receiver: Mutex<Option<JoinHandle<meshtree_sync::Result<()>>>>,
}

impl<S: NodeStore + 'static, T: DatagramSocket + 'static> Node<S, T> {
    /// Create a node, building its tree from the messages in `store`.
    pub async fn new(socket: T, identity: Keypair, store: S, config: NodeConfig) -> Result<Self> {
        let store = Arc::new(store);
        let messages = store.list_messages().await?;
        let tree = LocalTree::build(&messages, config.tree.max_arity)?;
        info!(
            name = %config.engine.local_name,
            messages = messages.len(),
            root = %tree.root_hash(),
            "local tree built"
        );

        let directory = Arc::new(PeerDirectory::new());
        let engine = SyncEngine::new(
            socket,
            identity,
            Arc::new(tree),
            store,
            Arc::clone(&directory) as Arc<dyn meshtree_sync::KeyDirectory>,
            config.engine,
        );
        Ok(Self {
            engine: Arc::new(engine),
            directory,
            receiver: Mutex::new(None),
        })
    }

    /// Spawn the receive loop. Calling this on a running node does nothing.
    pub fn start(&self) {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if receiver.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        *receiver = Some(tokio::spawn(Arc::clone(&self.engine).run()));
    }

    /// Stop the receive loop.
    pub fn stop(&self) {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = receiver.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn engine(&self) -> &Arc<SyncEngine<S, T>> {
        &self.engine
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn public_key(&self) -> PublicKey {
        self.engine.public_key()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.engine.local_addr()?)
    }

    /// Root hash of the tree this node serves.
    pub fn root_hash(&self) -> Sha256Hash {
        self.engine.tree().root_hash()
    }

    /// Messages in the tree this node serves, in tree order.
    pub fn messages(&self) -> Vec<Message> {
        self.engine.tree().messages()
    }

    /// Persist a new message. It is served after the next restart.
    pub async fn post_message(&self, body: &str, in_reply_to: Option<Sha256Hash>) -> Result<Sha256Hash> {
        let message = Message::new(body, in_reply_to)?;
        self.engine.store().insert_message(&message).await?;
        let hash = message.hash();
        debug!(%hash, "message stored");
        Ok(hash)
    }

    /// Register the rendezvous server and greet every candidate address.
    pub async fn bootstrap(&self, source: &dyn Bootstrap) -> Result<HandshakeReport> {
        let addresses = source.resolve_bootstrap_addresses().await?;
        let key = source.server_key().await?;
        self.directory.set_bootstrap(&addresses, key);
        Ok(self.handshake_all(&addresses).await)
    }

    /// Fetch `name`'s record from `source` and remember it.
    pub async fn learn_peer(&self, source: &dyn Bootstrap, name: &str) -> Result<PeerRecord> {
        let record = source
            .lookup_peer(name)
            .await?
            .ok_or_else(|| NodeError::UnknownPeer(name.to_string()))?;
        self.directory.add_peer(record.clone());
        Ok(record)
    }

    /// Send `Hello` to every address concurrently.
    pub async fn handshake_all(&self, addresses: &[SocketAddr]) -> HandshakeReport {
        let mut tasks = JoinSet::new();
        for &addr in addresses {
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move { (addr, engine.hello(addr).await) });
        }

        let mut report = HandshakeReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((addr, Ok(name))) => report.answered.push((addr, name)),
                Ok((addr, Err(e))) => {
                    debug!(peer = %addr, error = %e, "handshake failed");
                    report.failed.push((addr, e.into()));
                }
                Err(e) => warn!(error = %e, "handshake task failed"),
            }
        }
        report.answered.sort_by_key(|(addr, _)| *addr);
        info!(
            answered = report.answered.len(),
            failed = report.failed.len(),
            "handshake fan-out finished"
        );
        report
    }

    /// Reconcile with the peer at `addr`.
    pub async fn sync_with(&self, addr: SocketAddr) -> Result<ReconcileReport> {
        Ok(self.engine.reconcile(addr).await?)
    }

    /// Reconcile with a named peer, trying its addresses in order.
    pub async fn sync_with_peer(&self, name: &str) -> Result<ReconcileReport> {
        let record = self
            .directory
            .peer(name)
            .ok_or_else(|| NodeError::UnknownPeer(name.to_string()))?;

        for addr in &record.addresses {
            match self.engine.reconcile(*addr).await {
                Ok(report) => return Ok(report),
                Err(e) => warn!(peer = %addr, %name, error = %e, "reconciliation failed"),
            }
        }
        Err(NodeError::Unreachable {
            name: name.to_string(),
            attempted: record.addresses.len(),
        })
    }

    /// Messages mirrored from the peer at `addr` so far.
    pub fn remote_messages(&self, addr: SocketAddr) -> Option<Vec<Message>> {
        self.engine.outbound().with_view(addr, |view| view.leaves())
    }
}

impl<S: NodeStore + 'static, T: DatagramSocket + 'static> Drop for Node<S, T> {
    fn drop(&mut self) {
        self.stop();
    }
}
