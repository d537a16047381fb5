//! The protocol engine.
//!
//! [`SyncEngine`] owns the socket, the identity, the local tree and the three
//! lock-guarded tables (pending responses, inbound sessions, outbound
//! sessions). It is shared behind an `Arc` between the receive loop and any
//! number of callers of [`SyncEngine::send`].
//!
//! # Send
//!
//! A datagram whose kind expects a reply is transmitted up to
//! `max_attempts` times. After transmission `i` the sender waits up to
//! `initial_backoff * backoff_factor^i` for the receive loop to hand it a
//! matching reply. The wait ends early when the reply arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use meshtree_core::{Keypair, LocalTree, PublicKey, Sha256Hash};
use meshtree_store::NodeStore;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::datagram::{Body, Datagram, DatagramId, HelloBody};
use crate::error::{Result, SyncError};
use crate::registry::PendingRegistry;
use crate::session::{FetchBuffer, InboundSessions, OutboundSessions, SessionState};
use crate::signing;
use crate::transport::DatagramSocket;

/// Key status of a remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKey {
    /// Not in any directory.
    Unknown,
    /// Known, but publishes no key (e.g. a rendezvous server in unsigned mode).
    Unsigned,
    Known(PublicKey),
}

/// Maps remote addresses to the keys their datagrams must be signed with.
pub trait KeyDirectory: Send + Sync {
    fn key_for(&self, addr: &SocketAddr) -> PeerKey;
}

/// A directory that knows nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectory;

impl KeyDirectory for NoDirectory {
    fn key_for(&self, _addr: &SocketAddr) -> PeerKey {
        PeerKey::Unknown
    }
}

/// Answer to a `GetDatum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatumReply {
    /// The encoded node payload, not yet verified.
    Found(Bytes),
    Missing,
}

/// Protocol engine shared by the receive loop and all senders.
pub struct SyncEngine<S: NodeStore, T: DatagramSocket> {
    pub(crate) socket: T,
    pub(crate) identity: Keypair,
    pub(crate) config: EngineConfig,
    pub(crate) tree: Arc<LocalTree>,
    pub(crate) directory: Arc<dyn KeyDirectory>,
    pub(crate) registry: PendingRegistry,
    pub(crate) inbound: InboundSessions,
    pub(crate) outbound: OutboundSessions,
    pub(crate) store: Arc<S>,
}

impl<S: NodeStore, T: DatagramSocket> SyncEngine<S, T> {
    pub fn new(
        socket: T,
        identity: Keypair,
        tree: Arc<LocalTree>,
        store: Arc<S>,
        directory: Arc<dyn KeyDirectory>,
        mut config: EngineConfig,
    ) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        Self {
            socket,
            identity,
            inbound: InboundSessions::new(config.session_validity),
            outbound: OutboundSessions::new(config.session_validity),
            registry: PendingRegistry::new(),
            config,
            tree,
            directory,
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<LocalTree> {
        &self.tree
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn inbound(&self) -> &InboundSessions {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundSessions {
        &self.outbound
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Seal and transmit one datagram.
    pub(crate) async fn transmit(&self, to: SocketAddr, datagram: &Datagram) -> Result<()> {
        let bytes = signing::seal(datagram, &self.identity)?;
        debug!(
            peer = %to,
            kind = %datagram.kind(),
            id = %datagram.id,
            len = bytes.len(),
            "sending datagram"
        );
        trace!(peer = %to, "{}", datagram);
        self.socket.send_to(&bytes, to).await
    }

    /// Send a datagram with `body` to `to`.
    ///
    /// Kinds that expect no reply are sent once and return `Ok(None)`.
    /// Otherwise this retries until a matching reply arrives, which is
    /// returned, or the attempts run out, which is [`SyncError::Timeout`].
    pub async fn send(&self, to: SocketAddr, body: Body) -> Result<Option<Datagram>> {
        let datagram = Datagram::new(DatagramId::random(), body);
        let kind = datagram.kind();
        let expected = kind.expected_replies();

        if expected.is_empty() {
            self.transmit(to, &datagram).await?;
            return Ok(None);
        }

        let (ticket, mut reply) = self.registry.register(to, &datagram);
        for attempt in 0..self.config.max_attempts {
            if let Err(e) = self.transmit(to, &datagram).await {
                self.registry.cancel(to, ticket);
                return Err(e);
            }
            match timeout(self.config.backoff(attempt), &mut reply).await {
                Ok(Ok(datagram)) => return Ok(Some(datagram)),
                Ok(Err(_)) => {
                    return Err(SyncError::ProtocolState(format!(
                        "wait for {} reply from {} was dropped",
                        kind, to
                    )))
                }
                Err(_) => {
                    debug!(peer = %to, %kind, attempt, "no reply yet");
                }
            }
        }

        self.registry.cancel(to, ticket);
        // A reply may have landed between the last timeout and the cancel.
        if let Ok(datagram) = reply.try_recv() {
            return Ok(Some(datagram));
        }
        Err(SyncError::Timeout {
            peer: to,
            kind,
            attempts: self.config.max_attempts,
        })
    }

    /// Answer request `id` from `to` with `body`. Sent once.
    pub(crate) async fn reply(&self, to: SocketAddr, id: DatagramId, body: Body) -> Result<()> {
        self.transmit(to, &Datagram::new(id, body)).await
    }

    /// Handshake with `to`. Returns the name the peer announced.
    ///
    /// On success the receive loop has opened or refreshed the outbound
    /// session before this returns.
    pub async fn hello(&self, to: SocketAddr) -> Result<String> {
        let body = Body::Hello(HelloBody::new(self.config.local_name.clone()));
        match self.send(to, body).await? {
            Some(Datagram {
                body: Body::HelloReply(hello),
                ..
            }) => Ok(hello.name),
            other => Err(unexpected("HelloReply", to, other)),
        }
    }

    /// Ask `to` for its current root hash.
    pub async fn request_root(&self, to: SocketAddr) -> Result<Sha256Hash> {
        match self.send(to, Body::RootRequest).await? {
            Some(Datagram {
                body: Body::Root(hash),
                ..
            }) => Ok(hash),
            other => Err(unexpected("Root", to, other)),
        }
    }

    /// Ask `to` for the node with `hash`.
    ///
    /// The receive loop buffers the answer in the outbound session before
    /// waking this call, which then consumes it from there. A reply about a
    /// different hash, or a buffer that disagrees with the delivered reply,
    /// is [`SyncError::ContentIntegrity`].
    pub async fn get_datum(&self, to: SocketAddr, hash: Sha256Hash) -> Result<DatumReply> {
        let reply = self.send(to, Body::GetDatum(hash)).await?;
        if let Some(got) = reply.as_ref().and_then(|r| r.body.node_hash()) {
            if got != hash {
                self.outbound.take_buffer(to, &got);
                return Err(SyncError::ContentIntegrity {
                    hash,
                    reason: format!("peer answered about node {}", got),
                });
            }
        }

        match (reply, self.outbound.take_buffer(to, &hash)) {
            (
                Some(Datagram {
                    body: Body::Datum { payload, .. },
                    ..
                }),
                Some(FetchBuffer::Datum {
                    payload: buffered, ..
                }),
            ) if buffered == payload => Ok(DatumReply::Found(buffered)),
            (
                Some(Datagram {
                    body: Body::NoDatum(_),
                    ..
                }),
                Some(FetchBuffer::NoDatum(_)),
            ) => Ok(DatumReply::Missing),
            (Some(_), Some(_)) => Err(SyncError::ContentIntegrity {
                hash,
                reason: "buffered reply differs from the one delivered".to_string(),
            }),
            (Some(_), None) => Err(SyncError::NoSession(to)),
            (None, _) => Err(unexpected("Datum or NoDatum", to, None)),
        }
    }

    /// Make sure an outbound session with `to` is active, handshaking if it
    /// is missing or idle past its validity. A session whose re-handshake
    /// fails is dropped.
    pub async fn ensure_session(&self, to: SocketAddr) -> Result<()> {
        match self.outbound.state(to) {
            SessionState::Active => Ok(()),
            state => match self.hello(to).await {
                Ok(name) => {
                    debug!(peer = %to, %name, ?state, "handshake complete");
                    Ok(())
                }
                Err(e) => {
                    if state == SessionState::Expired {
                        self.outbound.drop_session(to);
                        debug!(peer = %to, error = %e, "re-handshake failed, session dropped");
                    }
                    Err(e)
                }
            },
        }
    }
}

fn unexpected(wanted: &str, peer: SocketAddr, got: Option<Datagram>) -> SyncError {
    let got = got.map_or_else(|| "nothing".to_string(), |d| d.kind().to_string());
    SyncError::ProtocolState(format!("expected {} from {}, got {}", wanted, peer, got))
}
