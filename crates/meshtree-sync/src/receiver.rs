//! The receive loop.
//!
//! One task reads datagrams off the socket and handles them in order:
//! decode, authenticate, then either route a reply to its waiting sender or
//! answer a request from the local tree.

use std::net::SocketAddr;
use std::sync::Arc;

use meshtree_core::TreeArena;
use meshtree_store::NodeStore;
use tracing::{debug, info, warn};

use crate::config::UnknownPeerPolicy;
use crate::datagram::{Body, Datagram, DatagramKind, HelloBody};
use crate::engine::{PeerKey, SyncEngine};
use crate::error::{Result, SyncError};
use crate::registry::Routing;
use crate::session::FetchBuffer;
use crate::signing;
use crate::transport::DatagramSocket;

/// Why a datagram was dropped without an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Framing,
    Authentication,
    /// Signed kind from an address with no key, refused by policy.
    UnknownPeer,
}

/// What the receive loop did with one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Dropped(DropReason),
    /// A request was answered with a datagram of this kind.
    Replied(DatagramKind),
    /// A reply was handed to the sender waiting for it.
    Satisfied(DatagramKind),
    /// An `Error` datagram carrying this reason was sent back.
    Rejected(String),
    /// Nothing to do, e.g. an `Error` from the peer.
    Ignored,
}

impl<S: NodeStore, T: DatagramSocket> SyncEngine<S, T> {
    /// Receive and handle datagrams until the socket closes.
    ///
    /// Per-datagram failures are logged and never end the loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        let local = self.socket.local_addr()?;
        info!(addr = %local, name = %self.config.local_name, "receive loop started");

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(SyncError::TransportClosed) => {
                    info!(addr = %local, "receive loop stopped");
                    return Ok(());
                }
                Err(e) => {
                    warn!(addr = %local, error = %e, "receive failed");
                    continue;
                }
            };
            self.handle_datagram(from, &buf[..len]).await;
        }
    }

    /// Handle one received datagram.
    pub async fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Disposition {
        let datagram = match Datagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!(peer = %from, reason = "framing", error = %e, "dropping datagram");
                return Disposition::Dropped(DropReason::Framing);
            }
        };
        let kind = datagram.kind();

        if kind.requires_signature() {
            if let Err(reason) = self.authenticate(from, kind, bytes) {
                return Disposition::Dropped(reason);
            }
        }

        debug!(peer = %from, %kind, id = %datagram.id, "received datagram");

        match kind {
            DatagramKind::Error => {
                if let Body::Error(reason) = &datagram.body {
                    warn!(peer = %from, id = %datagram.id, %reason, "peer reported an error");
                }
                Disposition::Ignored
            }
            kind if kind.is_reply() => self.route_reply(from, datagram).await,
            _ => self.answer_request(from, datagram).await,
        }
    }

    fn authenticate(
        &self,
        from: SocketAddr,
        kind: DatagramKind,
        bytes: &[u8],
    ) -> std::result::Result<(), DropReason> {
        match self.directory.key_for(&from) {
            PeerKey::Known(key) => signing::verify(bytes, &key, from).map_err(|e| {
                warn!(peer = %from, %kind, reason = "authentication", error = %e, "dropping datagram");
                DropReason::Authentication
            }),
            PeerKey::Unsigned => Ok(()),
            PeerKey::Unknown => match self.config.unknown_peer_policy {
                UnknownPeerPolicy::AcceptUnverified => {
                    debug!(peer = %from, %kind, unverified = true, "no key for peer");
                    Ok(())
                }
                UnknownPeerPolicy::HandshakeOnly
                    if matches!(kind, DatagramKind::Hello | DatagramKind::HelloReply) =>
                {
                    debug!(peer = %from, %kind, unverified = true, "no key for peer");
                    Ok(())
                }
                _ => {
                    warn!(peer = %from, %kind, reason = "unknown peer", "dropping datagram");
                    Err(DropReason::UnknownPeer)
                }
            },
        }
    }

    async fn route_reply(&self, from: SocketAddr, datagram: Datagram) -> Disposition {
        let kind = datagram.kind();
        let routing = self.registry.satisfy(from, &datagram, |reply| match &reply.body {
            Body::HelloReply(_) => self.outbound.open_or_refresh(from),
            Body::Root(hash) => {
                self.outbound.record_root(from, *hash);
            }
            Body::Datum { hash, payload } => {
                let contents = FetchBuffer::Datum {
                    hash: *hash,
                    payload: payload.clone(),
                };
                if !self.outbound.buffer(from, contents) {
                    debug!(peer = %from, %hash, "no session to buffer datum in");
                }
            }
            Body::NoDatum(hash) => {
                if !self.outbound.buffer(from, FetchBuffer::NoDatum(*hash)) {
                    debug!(peer = %from, %hash, "no session to buffer denial in");
                }
            }
            _ => {}
        });

        match routing {
            Routing::Delivered => Disposition::Satisfied(kind),
            Routing::Duplicate => {
                debug!(peer = %from, %kind, id = %datagram.id, "dropping duplicate reply");
                Disposition::Ignored
            }
            Routing::Unsolicited => {
                debug!(
                    peer = %from,
                    %kind,
                    expected = ?self.registry.expected_kinds(from),
                    "reply matches no pending request"
                );
                self.reject(from, &datagram, format!("unsolicited {}", kind))
                    .await
            }
        }
    }

    async fn answer_request(&self, from: SocketAddr, datagram: Datagram) -> Disposition {
        let kind = datagram.kind();
        let body = match &datagram.body {
            Body::Hello(hello) => {
                self.inbound.refresh(from);
                info!(peer = %from, name = %hello.name, "handshake from peer");
                Body::HelloReply(HelloBody::new(self.config.local_name.clone()))
            }
            _ if !self.inbound.is_valid(from) => {
                return self.reject(from, &datagram, "no handshake".to_string()).await;
            }
            Body::RootRequest => Body::Root(self.tree.root_hash()),
            Body::GetDatum(hash) => match self.tree.find(hash) {
                Some(node) => Body::Datum {
                    hash: *hash,
                    payload: node.raw.clone(),
                },
                None => Body::NoDatum(*hash),
            },
            _ => return Disposition::Ignored,
        };

        let reply_kind = body.kind();
        match self.reply(from, datagram.id, body).await {
            Ok(()) => Disposition::Replied(reply_kind),
            Err(SyncError::Framing(e)) => {
                warn!(peer = %from, %kind, error = %e, "reply does not fit in a datagram");
                self.reject(from, &datagram, format!("cannot encode {}: {}", reply_kind, e))
                    .await
            }
            Err(e) => {
                warn!(peer = %from, %kind, error = %e, "failed to send reply");
                Disposition::Ignored
            }
        }
    }

    /// Answer `datagram` with an `Error` carrying `reason`.
    async fn reject(&self, from: SocketAddr, datagram: &Datagram, reason: String) -> Disposition {
        debug!(peer = %from, kind = %datagram.kind(), %reason, "rejecting datagram");
        if let Err(e) = self
            .reply(from, datagram.id, Body::Error(reason.clone()))
            .await
        {
            warn!(peer = %from, error = %e, "failed to send error");
        }
        Disposition::Rejected(reason)
    }
}
