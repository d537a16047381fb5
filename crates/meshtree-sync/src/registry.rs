//! Pending-response registry.
//!
//! Every reply-expecting send registers a wait for the reply kinds it
//! accepts. Waits for the same address are merged into one entry, so two
//! concurrent requests to a peer for different kinds are both satisfied.
//! A reply is routed to the wait that sent the request with the same id.
//! Failing that it goes to the oldest wait that accepts its kind and, for
//! node replies, asked about the same hash. Only that wait is removed; the
//! entry disappears once it has no waits left.
//!
//! Retransmissions reuse the request id, so a slow peer may answer the same
//! request more than once. Recently answered ids are remembered per address
//! and their late copies are reported as duplicates instead of being handed
//! to an unrelated wait.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use meshtree_core::Sha256Hash;
use tokio::sync::oneshot;

use crate::datagram::{Datagram, DatagramId, DatagramKind};

/// Answered ids remembered per address.
pub const ANSWERED_HISTORY: usize = 64;

/// Handle for one registered wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// What [`PendingRegistry::satisfy`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Handed to a waiting sender.
    Delivered,
    /// A late copy of a reply that was already delivered.
    Duplicate,
    /// No wait accepts it.
    Unsolicited,
}

struct PendingWait {
    ticket: Ticket,
    id: DatagramId,
    kinds: &'static [DatagramKind],
    /// Hash the request asked about, for `GetDatum`.
    node_hash: Option<Sha256Hash>,
    reply: oneshot::Sender<Datagram>,
}

impl PendingWait {
    /// Whether a reply with a foreign id may stand in for this wait's own.
    fn accepts_stray(&self, reply: &Datagram) -> bool {
        self.kinds.contains(&reply.kind()) && self.node_hash == reply.body.node_hash()
    }
}

#[derive(Default)]
struct Tables {
    pending: HashMap<SocketAddr, Vec<PendingWait>>,
    answered: HashMap<SocketAddr, VecDeque<DatagramId>>,
}

impl Tables {
    fn remember(&mut self, addr: SocketAddr, id: DatagramId) {
        let ids = self.answered.entry(addr).or_default();
        if ids.len() == ANSWERED_HISTORY {
            ids.pop_front();
        }
        ids.push_back(id);
    }

    fn was_answered(&self, addr: SocketAddr, id: DatagramId) -> bool {
        self.answered.get(&addr).map_or(false, |ids| ids.contains(&id))
    }
}

/// Lock-guarded table of pending requests keyed by remote address.
#[derive(Default)]
pub struct PendingRegistry {
    tables: Mutex<Tables>,
    next_ticket: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for the replies to `request`, sent to `addr`.
    pub fn register(
        &self,
        addr: SocketAddr,
        request: &Datagram,
    ) -> (Ticket, oneshot::Receiver<Datagram>) {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.pending.entry(addr).or_default().push(PendingWait {
            ticket,
            id: request.id,
            kinds: request.kind().expected_replies(),
            node_hash: request.body.node_hash(),
            reply: tx,
        });
        (ticket, rx)
    }

    /// Route `reply` from `addr` to a matching wait.
    ///
    /// `on_match` runs while the registry lock is held, before the waiter is
    /// woken, so state it updates is visible to the waiter. It runs only for
    /// [`Routing::Delivered`].
    pub fn satisfy<F>(&self, addr: SocketAddr, reply: &Datagram, on_match: F) -> Routing
    where
        F: FnOnce(&Datagram),
    {
        let kind = reply.kind();
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        let waits = tables.pending.get(&addr).map(Vec::as_slice).unwrap_or_default();
        let position = match waits
            .iter()
            .position(|w| w.id == reply.id && w.kinds.contains(&kind))
        {
            Some(position) => Some(position),
            None if tables.was_answered(addr, reply.id) => return Routing::Duplicate,
            None => waits.iter().position(|w| w.accepts_stray(reply)),
        };
        let Some(position) = position else {
            return Routing::Unsolicited;
        };

        let wait = match tables.pending.get_mut(&addr) {
            Some(waits) => {
                let wait = waits.remove(position);
                if waits.is_empty() {
                    tables.pending.remove(&addr);
                }
                wait
            }
            None => return Routing::Unsolicited,
        };
        tables.remember(addr, wait.id);
        if reply.id != wait.id {
            tables.remember(addr, reply.id);
        }

        on_match(reply);
        // The sender may have given up already; the reply still counts as solicited.
        let _ = wait.reply.send(reply.clone());
        Routing::Delivered
    }

    /// Withdraw a wait, e.g. after its retries ran out.
    pub fn cancel(&self, addr: SocketAddr, ticket: Ticket) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waits) = tables.pending.get_mut(&addr) {
            waits.retain(|w| w.ticket != ticket);
            if waits.is_empty() {
                tables.pending.remove(&addr);
            }
        }
    }

    /// Union of the reply kinds expected from `addr`.
    pub fn expected_kinds(&self, addr: SocketAddr) -> Vec<DatagramKind> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<DatagramKind> = Vec::new();
        if let Some(waits) = tables.pending.get(&addr) {
            for kind in waits.iter().flat_map(|w| w.kinds.iter()) {
                if !kinds.contains(kind) {
                    kinds.push(*kind);
                }
            }
        }
        kinds
    }

    /// Number of addresses with outstanding waits.
    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{Body, HelloBody};

    fn addr() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn reply(id: DatagramId, body: Body) -> Datagram {
        Datagram::new(id, body)
    }

    fn request(id: DatagramId, body: Body) -> Datagram {
        Datagram::new(id, body)
    }

    fn hello(id: DatagramId) -> Datagram {
        request(id, Body::Hello(HelloBody::new("me")))
    }

    #[test]
    fn test_merge_and_partial_clear() {
        let registry = PendingRegistry::new();
        let hello_id = DatagramId([1; 4]);
        let root_id = DatagramId([2; 4]);

        let (_t1, mut hello_rx) = registry.register(addr(), &hello(hello_id));
        let (_t2, mut root_rx) = registry.register(addr(), &request(root_id, Body::RootRequest));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.expected_kinds(addr()),
            vec![DatagramKind::HelloReply, DatagramKind::Root]
        );

        let root = reply(root_id, Body::Root(Sha256Hash::ZERO));
        assert_eq!(registry.satisfy(addr(), &root, |_| {}), Routing::Delivered);
        assert_eq!(root_rx.try_recv().unwrap(), root);
        assert!(hello_rx.try_recv().is_err());

        // Still pending for the handshake.
        assert_eq!(registry.expected_kinds(addr()), vec![DatagramKind::HelloReply]);

        let hello = reply(hello_id, Body::HelloReply(HelloBody::new("p")));
        assert_eq!(registry.satisfy(addr(), &hello, |_| {}), Routing::Delivered);
        assert_eq!(hello_rx.try_recv().unwrap(), hello);
        assert!(registry.expected_kinds(addr()).is_empty());
    }

    #[test]
    fn test_unsolicited_reply() {
        let registry = PendingRegistry::new();
        let dg = reply(DatagramId::random(), Body::Root(Sha256Hash::ZERO));
        assert_eq!(
            registry.satisfy(addr(), &dg, |_| panic!("must not run")),
            Routing::Unsolicited
        );

        let (_t, _rx) = registry.register(addr(), &hello(DatagramId::random()));
        assert_eq!(
            registry.satisfy(addr(), &dg, |_| panic!("must not run")),
            Routing::Unsolicited
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_id_match_preferred() {
        let registry = PendingRegistry::new();
        let first = DatagramId([1; 4]);
        let second = DatagramId([2; 4]);
        let wanted = Sha256Hash::hash(b"wanted");

        let (_t1, mut rx1) = registry.register(addr(), &request(first, Body::GetDatum(wanted)));
        let (_t2, mut rx2) = registry.register(addr(), &request(second, Body::GetDatum(wanted)));

        let dg = reply(second, Body::NoDatum(wanted));
        assert_eq!(registry.satisfy(addr(), &dg, |_| {}), Routing::Delivered);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().id, second);

        // An unknown id about the same hash falls back to the oldest wait.
        let stray = reply(DatagramId([9; 4]), Body::NoDatum(wanted));
        assert_eq!(registry.satisfy(addr(), &stray, |_| {}), Routing::Delivered);
        assert_eq!(rx1.try_recv().unwrap().id, DatagramId([9; 4]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stray_node_reply_needs_same_hash() {
        let registry = PendingRegistry::new();
        let child = Sha256Hash::hash(b"child");
        let other = Sha256Hash::hash(b"other");
        let (_t, mut rx) =
            registry.register(addr(), &request(DatagramId([1; 4]), Body::GetDatum(child)));

        let stray = reply(
            DatagramId([7; 4]),
            Body::Datum {
                hash: other,
                payload: bytes::Bytes::from_static(b"\x01"),
            },
        );
        assert_eq!(registry.satisfy(addr(), &stray, |_| {}), Routing::Unsolicited);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_late_copy_is_duplicate() {
        let registry = PendingRegistry::new();
        let parent = Sha256Hash::hash(b"parent");
        let child = Sha256Hash::hash(b"child");
        let first = DatagramId([1; 4]);

        let (_t1, mut rx1) = registry.register(addr(), &request(first, Body::GetDatum(parent)));
        let answer = reply(first, Body::NoDatum(parent));
        assert_eq!(registry.satisfy(addr(), &answer, |_| {}), Routing::Delivered);
        assert!(rx1.try_recv().is_ok());

        // The answer to a retransmission arrives while the next request waits.
        let (_t2, mut rx2) =
            registry.register(addr(), &request(DatagramId([2; 4]), Body::GetDatum(child)));
        assert_eq!(
            registry.satisfy(addr(), &answer, |_| panic!("must not run")),
            Routing::Duplicate
        );
        assert!(rx2.try_recv().is_err());
        assert_eq!(registry.expected_kinds(addr()).len(), 2);
    }

    #[test]
    fn test_answered_history_is_bounded() {
        let registry = PendingRegistry::new();
        for i in 0..=ANSWERED_HISTORY as u32 {
            let id = DatagramId(i.to_be_bytes());
            let (_t, _rx) = registry.register(addr(), &request(id, Body::RootRequest));
            registry.satisfy(addr(), &reply(id, Body::Root(Sha256Hash::ZERO)), |_| {});
        }

        // The oldest id has been forgotten; its late copy is now unsolicited.
        let oldest = reply(DatagramId(0u32.to_be_bytes()), Body::Root(Sha256Hash::ZERO));
        assert_eq!(registry.satisfy(addr(), &oldest, |_| {}), Routing::Unsolicited);
        let newest = reply(
            DatagramId((ANSWERED_HISTORY as u32).to_be_bytes()),
            Body::Root(Sha256Hash::ZERO),
        );
        assert_eq!(registry.satisfy(addr(), &newest, |_| {}), Routing::Duplicate);
    }

    #[test]
    fn test_hook_runs_before_wake() {
        let registry = PendingRegistry::new();
        let id = DatagramId::random();
        let (_t, mut rx) = registry.register(addr(), &hello(id));

        let mut seen = false;
        let dg = reply(id, Body::HelloReply(HelloBody::new("x")));
        registry.satisfy(addr(), &dg, |_| seen = true);
        assert!(seen);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancel() {
        let registry = PendingRegistry::new();
        let (ticket, _rx) = registry.register(addr(), &hello(DatagramId::random()));
        registry.cancel(addr(), ticket);
        assert!(registry.is_empty());
        assert!(registry.expected_kinds(addr()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_merge() {
        use std::sync::Arc;

        let registry = Arc::new(PendingRegistry::new());
        let mut handles = Vec::new();
        for body in [
            Body::Hello(HelloBody::new("me")),
            Body::RootRequest,
            Body::GetDatum(Sha256Hash::ZERO),
        ] {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.register(addr(), &Datagram::new(DatagramId::random(), body))
            }));
        }
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.expected_kinds(addr()).len(), 4);
    }
}
