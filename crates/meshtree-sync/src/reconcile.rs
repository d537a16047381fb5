//! Pull reconciliation.
//!
//! Reconciling with a peer mirrors its tree into the outbound session's
//! [`RemoteTreeView`](meshtree_core::RemoteTreeView): ask for the root, then
//! fetch every node the view is missing, depth first. Nodes are verified
//! before they enter the view and persisted once they do, so a later pass
//! (or a restart) picks up where an interrupted one stopped.

use std::net::SocketAddr;

use bytes::Bytes;
use meshtree_core::{AddOutcome, CoreError, RemoteTreeView, Sha256Hash};
use meshtree_store::NodeStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{DatumReply, SyncEngine};
use crate::error::{Result, SyncError};
use crate::transport::DatagramSocket;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Root the peer announced for this pass.
    pub root: Sha256Hash,
    /// Nodes fetched over the network.
    pub fetched: usize,
    /// Nodes taken from the local store instead of the network.
    pub from_store: usize,
    /// Hashes the peer said it does not have.
    pub unavailable: Vec<Sha256Hash>,
    /// Hashes whose content failed verification or was not referenced.
    pub rejected: Vec<Sha256Hash>,
    /// Whether the view now holds the whole announced tree.
    pub complete: bool,
}

/// What to do with a hash popped off the fetch queue.
enum Step {
    Skip,
    /// Already held below the old root; install the held copy as the root.
    Promote(Bytes),
    Fetch,
}

fn next_step(view: &RemoteTreeView, hash: Sha256Hash, root: Sha256Hash) -> Step {
    if view.is_unavailable(&hash) {
        return Step::Skip;
    }
    match view.get(&hash) {
        Some(node) if hash == root && view.root_hash() != Some(root) => {
            Step::Promote(node.raw.clone())
        }
        Some(_) => Step::Skip,
        None => Step::Fetch,
    }
}

impl<S: NodeStore, T: DatagramSocket> SyncEngine<S, T> {
    /// Pull `peer`'s current tree into its session view.
    ///
    /// Transport failures end the pass with an error. Nodes verified before
    /// the failure stay in the view and the store. A node that fails
    /// verification, or a reply about the wrong hash, rejects only its own
    /// branch.
    pub async fn reconcile(&self, peer: SocketAddr) -> Result<ReconcileReport> {
        self.ensure_session(peer).await?;
        let root = self.request_root(peer).await?;
        let source = peer.to_string();
        let stored_root = self.store.get_remote_root(&source).await?;
        if stored_root != Some(root) {
            debug!(peer = %peer, %root, previous = ?stored_root, "recording peer root");
            self.store.set_remote_root(&source, &root).await?;
        }

        let mut report = ReconcileReport {
            root,
            ..Default::default()
        };

        if let Some(announced) = self.outbound.take_announced_root(peer) {
            debug!(peer = %peer, root = %announced, "peer announced a new root");
        }
        // With the root installed, carry on from wherever the last pass
        // stopped; otherwise start from the top.
        let mut queue: Vec<Sha256Hash> = self.with_view(peer, |view| {
            if view.root_hash() == Some(root) {
                let mut missing = view.missing_children();
                missing.reverse();
                missing
            } else {
                vec![root]
            }
        })?;

        while let Some(hash) = queue.pop() {
            let step = self.with_view(peer, |view| next_step(view, hash, root))?;
            let (raw, fetched) = match step {
                Step::Skip => continue,
                Step::Promote(raw) => (raw, false),
                Step::Fetch => match self.store.get_node(&hash).await? {
                    Some(stored) => {
                        report.from_store += 1;
                        (stored.raw, false)
                    }
                    None => match self.get_datum(peer, hash).await {
                        Ok(DatumReply::Found(payload)) => (payload, true),
                        Ok(DatumReply::Missing) => {
                            self.with_view(peer, |view| view.mark_unavailable(hash))?;
                            debug!(peer = %peer, %hash, "peer does not have node");
                            report.unavailable.push(hash);
                            continue;
                        }
                        Err(SyncError::ContentIntegrity { reason, .. }) => {
                            warn!(peer = %peer, %hash, %reason, "rejected reply");
                            report.rejected.push(hash);
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                },
            };

            match self.admit(peer, hash, &raw)? {
                Ok(next) => {
                    if fetched {
                        self.store.insert_node(&hash, &raw, &source).await?;
                        report.fetched += 1;
                    }
                    queue.extend(next.into_iter().rev());
                }
                Err(e) => {
                    warn!(peer = %peer, %hash, error = %e, "rejected node");
                    report.rejected.push(hash);
                }
            }
        }

        report.complete = self.with_view(peer, |view| view.is_complete())?;
        info!(
            peer = %peer,
            root = %root,
            fetched = report.fetched,
            from_store = report.from_store,
            unavailable = report.unavailable.len(),
            rejected = report.rejected.len(),
            complete = report.complete,
            "reconciliation pass finished"
        );
        Ok(report)
    }

    /// Insert a node into `peer`'s view. On success returns the hashes to
    /// fetch next, in pre-order.
    fn admit(
        &self,
        peer: SocketAddr,
        hash: Sha256Hash,
        raw: &Bytes,
    ) -> Result<std::result::Result<Vec<Sha256Hash>, CoreError>> {
        self.with_view(peer, |view| -> std::result::Result<Vec<Sha256Hash>, CoreError> {
            let outcome = view.add_node(hash, raw)?;
            let next = match outcome {
                AddOutcome::NewRoot { pruned, .. } => {
                    if pruned > 0 {
                        debug!(peer = %peer, pruned, "dropped nodes of the previous root");
                    }
                    view.missing_children()
                }
                AddOutcome::Attached { .. } | AddOutcome::AlreadyPresent => view
                    .get(&hash)
                    .map(|node| {
                        node.payload
                            .child_hashes()
                            .iter()
                            .filter(|c| !view.contains(c) && !view.is_unavailable(c))
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            Ok(next)
        })
    }

    fn with_view<R>(
        &self,
        peer: SocketAddr,
        f: impl FnOnce(&mut RemoteTreeView) -> R,
    ) -> Result<R> {
        self.outbound
            .with_view(peer, f)
            .ok_or(SyncError::NoSession(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::NoDirectory;
    use crate::transport::memory::{MemoryNetwork, MemorySocket};
    use meshtree_core::{sample_messages, Keypair, LocalTree, TreeArena};
    use meshtree_store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    type Engine = SyncEngine<MemoryStore, MemorySocket>;

    fn engine_on(socket: MemorySocket, messages: usize, arity: usize) -> Arc<Engine> {
        let tree = LocalTree::build(&sample_messages(messages), arity).unwrap();
        Arc::new(SyncEngine::new(
            socket,
            Keypair::generate(),
            Arc::new(tree),
            Arc::new(MemoryStore::new()),
            Arc::new(NoDirectory),
            EngineConfig::default(),
        ))
    }

    async fn spawn(network: &Arc<MemoryNetwork>, messages: usize, arity: usize) -> Arc<Engine> {
        let engine = engine_on(network.bind_any().await, messages, arity);
        tokio::spawn(Arc::clone(&engine).run());
        engine
    }

    /// An engine that handles every datagram `delay` after it arrives.
    async fn spawn_slow(
        network: &Arc<MemoryNetwork>,
        messages: usize,
        arity: usize,
        delay: Duration,
    ) -> Arc<Engine> {
        let engine = engine_on(network.bind_any().await, messages, arity);
        let server = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut buf = vec![0u8; server.config().recv_buffer_size];
            while let Ok((len, from)) = server.socket.recv_from(&mut buf).await {
                let bytes = buf[..len].to_vec();
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    server.handle_datagram(from, &bytes).await;
                });
            }
        });
        engine
    }

    #[tokio::test]
    async fn test_pull_whole_tree() {
        let network = MemoryNetwork::new();
        let alice = spawn(&network, 0, 2).await;
        let bob = spawn(&network, 9, 2).await;
        let bob_addr = bob.local_addr().unwrap();

        let report = alice.reconcile(bob_addr).await.unwrap();
        assert!(report.complete);
        assert_eq!(report.root, bob.tree().root_hash());
        assert_eq!(report.fetched, bob.tree().len());
        assert!(report.unavailable.is_empty());
        assert!(report.rejected.is_empty());

        let leaves = alice.outbound().with_view(bob_addr, |v| v.leaves()).unwrap();
        assert_eq!(leaves, bob.tree().messages());
        assert_eq!(alice.store().node_count().await.unwrap(), bob.tree().len());
        assert_eq!(
            alice.store().get_remote_root(&bob_addr.to_string()).await.unwrap(),
            Some(bob.tree().root_hash())
        );
    }

    #[tokio::test]
    async fn test_second_pass_fetches_nothing() {
        let network = MemoryNetwork::new();
        let alice = spawn(&network, 0, 2).await;
        let bob = spawn(&network, 4, 2).await;
        let bob_addr = bob.local_addr().unwrap();

        alice.reconcile(bob_addr).await.unwrap();
        let again = alice.reconcile(bob_addr).await.unwrap();
        assert!(again.complete);
        assert_eq!(again.fetched, 0);
        assert_eq!(again.from_store, 0);
    }

    #[tokio::test]
    async fn test_empty_peer_tree() {
        let network = MemoryNetwork::new();
        let alice = spawn(&network, 0, 2).await;
        let bob = spawn(&network, 0, 2).await;

        let report = alice.reconcile(bob.local_addr().unwrap()).await.unwrap();
        assert!(report.complete);
        assert_eq!(report.fetched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_peer_late_copies_do_not_break_pass() {
        let network = MemoryNetwork::new();
        let alice = spawn(&network, 0, 2).await;
        // Slower than the first backoff, so every request goes out twice and
        // every request is answered twice.
        let bob = spawn_slow(&network, 9, 2, Duration::from_millis(2500)).await;
        let bob_addr = bob.local_addr().unwrap();

        let report = alice.reconcile(bob_addr).await.unwrap();
        assert!(report.complete);
        assert!(report.rejected.is_empty());
        assert_eq!(report.fetched, bob.tree().len());
        // Hello, RootRequest and one GetDatum per node, each sent twice.
        assert_eq!(network.sent_to(bob_addr), 2 * (bob.tree().len() + 2));
        assert!(alice.registry().is_empty());

        let leaves = alice.outbound().with_view(bob_addr, |v| v.leaves()).unwrap();
        assert_eq!(leaves, bob.tree().messages());
    }

    #[tokio::test]
    async fn test_new_root_held_below_old_root_is_installed() {
        let network = MemoryNetwork::new();
        let alice = spawn(&network, 0, 2).await;
        // root(I(m1, m2), m3)
        let bob_v1 = spawn(&network, 3, 2).await;
        let bob_addr = bob_v1.local_addr().unwrap();
        assert!(alice.reconcile(bob_addr).await.unwrap().complete);

        // Bob restarts at the same address serving only I(m1, m2).
        network.close(bob_addr).await;
        let bob_v2 = engine_on(network.bind(bob_addr).await, 2, 2);
        tokio::spawn(Arc::clone(&bob_v2).run());
        alice.hello(bob_addr).await.unwrap();

        let report = alice.reconcile(bob_addr).await.unwrap();
        assert_eq!(report.root, bob_v2.tree().root_hash());
        assert!(report.complete);
        assert_eq!(report.fetched, 0);
        assert_eq!(
            alice.outbound().with_view(bob_addr, |v| v.root_hash()).unwrap(),
            Some(bob_v2.tree().root_hash())
        );
        let leaves = alice.outbound().with_view(bob_addr, |v| v.leaves()).unwrap();
        assert_eq!(leaves, sample_messages(2));

        assert!(alice.reconcile(bob_addr).await.unwrap().complete);
    }
}
