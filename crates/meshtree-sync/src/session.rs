//! Session tables.
//!
//! Inbound sessions record that a peer said Hello to us; they gate which
//! requests we answer. Outbound sessions record that a peer answered our
//! Hello, and carry our partial view of that peer's tree together with the
//! replies the receive loop buffered for the fetcher to consume.
//!
//! Both tables expire entries after a validity window measured from the
//! last activity. Expired entries are evicted lazily on lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use meshtree_core::{RemoteTreeView, Sha256Hash};
use tokio::time::Instant;

/// Peers that completed a handshake towards us.
pub struct InboundSessions {
    validity: Duration,
    sessions: Mutex<HashMap<SocketAddr, Instant>>,
}

impl InboundSessions {
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create or refresh the session for `addr`.
    pub fn refresh(&self, addr: SocketAddr) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(addr, Instant::now());
    }

    /// Whether `addr` has an unexpired session. Evicts it if expired.
    pub fn is_valid(&self, addr: SocketAddr) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&addr) {
            Some(at) if at.elapsed() < self.validity => true,
            Some(_) => {
                sessions.remove(&addr);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A node reply waiting for the fetcher to consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBuffer {
    /// A node, not yet verified.
    Datum { hash: Sha256Hash, payload: Bytes },
    /// The peer does not have this hash.
    NoDatum(Sha256Hash),
}

impl FetchBuffer {
    pub fn hash(&self) -> Sha256Hash {
        match self {
            FetchBuffer::Datum { hash, .. } | FetchBuffer::NoDatum(hash) => *hash,
        }
    }
}

/// State kept for a peer we handshook with.
#[derive(Debug)]
pub struct OutboundSession {
    pub last_activity: Instant,
    pub view: RemoteTreeView,
    /// A changed root the next reconciliation pass has not yet seen.
    pub announced_root: Option<Sha256Hash>,
    /// Buffered node replies keyed by the hash they are about.
    pub fetch_buffer: HashMap<Sha256Hash, FetchBuffer>,
}

/// Status of an outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Missing,
    Active,
    /// Present but idle past the validity window; must re-handshake.
    Expired,
}

/// Result of recording a root announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootUpdate {
    NoSession,
    Unchanged,
    /// The root differs from the last announcement and was buffered.
    Changed,
}

/// Peers that answered our handshake.
pub struct OutboundSessions {
    validity: Duration,
    sessions: Mutex<HashMap<SocketAddr, OutboundSession>>,
}

impl OutboundSessions {
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create the session for `addr`, or refresh its activity time.
    /// An existing view is kept.
    pub fn open_or_refresh(&self, addr: SocketAddr) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(addr)
            .and_modify(|s| s.last_activity = Instant::now())
            .or_insert_with(|| OutboundSession {
                last_activity: Instant::now(),
                view: RemoteTreeView::new(),
                announced_root: None,
                fetch_buffer: HashMap::new(),
            });
    }

    pub fn state(&self, addr: SocketAddr) -> SessionState {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&addr) {
            None => SessionState::Missing,
            Some(s) if s.last_activity.elapsed() < self.validity => SessionState::Active,
            Some(_) => SessionState::Expired,
        }
    }

    /// Record a root announced by `addr`.
    ///
    /// A changed root is announced to the view and kept for the next
    /// reconciliation pass.
    pub fn record_root(&self, addr: SocketAddr, root: Sha256Hash) -> RootUpdate {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = sessions.get_mut(&addr) else {
            return RootUpdate::NoSession;
        };
        session.last_activity = Instant::now();
        if session.view.announce_root(root) {
            session.announced_root = Some(root);
            RootUpdate::Changed
        } else {
            RootUpdate::Unchanged
        }
    }

    /// Buffer a reply for the fetcher. Returns `false` without a session.
    pub fn buffer(&self, addr: SocketAddr, contents: FetchBuffer) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(&addr) {
            Some(session) => {
                session.last_activity = Instant::now();
                session.fetch_buffer.insert(contents.hash(), contents);
                true
            }
            None => false,
        }
    }

    /// Take the changed root recorded since the last call, if any.
    pub fn take_announced_root(&self, addr: SocketAddr) -> Option<Sha256Hash> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get_mut(&addr).and_then(|s| s.announced_root.take())
    }

    /// Take the node reply buffered for `hash`.
    pub fn take_buffer(&self, addr: SocketAddr, hash: &Sha256Hash) -> Option<FetchBuffer> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get_mut(&addr)
            .and_then(|s| s.fetch_buffer.remove(hash))
    }

    /// Run `f` on the view of `addr`'s tree.
    pub fn with_view<R>(&self, addr: SocketAddr, f: impl FnOnce(&mut RemoteTreeView) -> R) -> Option<R> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get_mut(&addr).map(|s| f(&mut s.view))
    }

    pub fn drop_session(&self, addr: SocketAddr) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(55 * 60);

    fn addr() -> SocketAddr {
        "192.168.1.2:7000".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_expiry() {
        let sessions = InboundSessions::new(WINDOW);
        assert!(!sessions.is_valid(addr()));

        sessions.refresh(addr());
        tokio::time::advance(WINDOW - Duration::from_secs(1)).await;
        assert!(sessions.is_valid(addr()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!sessions.is_valid(addr()));
        // Lazily evicted.
        assert!(sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_refresh_extends() {
        let sessions = InboundSessions::new(WINDOW);
        sessions.refresh(addr());
        tokio::time::advance(Duration::from_secs(50 * 60)).await;
        sessions.refresh(addr());
        tokio::time::advance(Duration::from_secs(50 * 60)).await;
        assert!(sessions.is_valid(addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_states() {
        let sessions = OutboundSessions::new(WINDOW);
        assert_eq!(sessions.state(addr()), SessionState::Missing);

        sessions.open_or_refresh(addr());
        assert_eq!(sessions.state(addr()), SessionState::Active);

        tokio::time::advance(WINDOW).await;
        assert_eq!(sessions.state(addr()), SessionState::Expired);

        sessions.open_or_refresh(addr());
        assert_eq!(sessions.state(addr()), SessionState::Active);

        assert!(sessions.drop_session(addr()));
        assert_eq!(sessions.state(addr()), SessionState::Missing);
    }

    #[tokio::test]
    async fn test_record_root() {
        let sessions = OutboundSessions::new(WINDOW);
        let root = Sha256Hash::hash(b"root");
        assert_eq!(sessions.record_root(addr(), root), RootUpdate::NoSession);

        sessions.open_or_refresh(addr());
        assert_eq!(sessions.record_root(addr(), root), RootUpdate::Changed);
        assert_eq!(sessions.take_announced_root(addr()), Some(root));
        assert_eq!(sessions.take_announced_root(addr()), None);

        assert_eq!(sessions.record_root(addr(), root), RootUpdate::Unchanged);
        assert_eq!(sessions.take_announced_root(addr()), None);
        assert_eq!(
            sessions.with_view(addr(), |v| v.announced_root()),
            Some(Some(root))
        );
    }

    #[tokio::test]
    async fn test_refresh_keeps_view() {
        let sessions = OutboundSessions::new(WINDOW);
        sessions.open_or_refresh(addr());
        sessions.record_root(addr(), Sha256Hash::hash(b"r"));
        sessions.open_or_refresh(addr());
        assert_eq!(
            sessions.with_view(addr(), |v| v.announced_root()),
            Some(Some(Sha256Hash::hash(b"r")))
        );
    }

    #[tokio::test]
    async fn test_buffer_requires_session() {
        let sessions = OutboundSessions::new(WINDOW);
        let nd = FetchBuffer::NoDatum(Sha256Hash::ZERO);
        assert!(!sessions.buffer(addr(), nd.clone()));
        sessions.open_or_refresh(addr());
        assert!(sessions.buffer(addr(), nd.clone()));
        assert_eq!(sessions.take_buffer(addr(), &Sha256Hash::ZERO), Some(nd));
    }

    #[tokio::test]
    async fn test_buffer_keyed_by_hash() {
        let sessions = OutboundSessions::new(WINDOW);
        sessions.open_or_refresh(addr());
        let a = Sha256Hash::hash(b"a");
        let b = Sha256Hash::hash(b"b");
        sessions.buffer(
            addr(),
            FetchBuffer::Datum {
                hash: a,
                payload: Bytes::from_static(b"\x01"),
            },
        );
        sessions.buffer(addr(), FetchBuffer::NoDatum(b));

        assert_eq!(sessions.take_buffer(addr(), &b), Some(FetchBuffer::NoDatum(b)));
        assert!(matches!(
            sessions.take_buffer(addr(), &a),
            Some(FetchBuffer::Datum { hash, .. }) if hash == a
        ));
    }

    #[tokio::test]
    async fn test_root_and_node_buffers_are_separate() {
        let sessions = OutboundSessions::new(WINDOW);
        sessions.open_or_refresh(addr());
        let root = Sha256Hash::hash(b"root");
        sessions.buffer(addr(), FetchBuffer::NoDatum(root));
        sessions.record_root(addr(), Sha256Hash::hash(b"older"));
        sessions.record_root(addr(), root);

        assert_eq!(sessions.take_announced_root(addr()), Some(root));
        assert_eq!(sessions.take_buffer(addr(), &root), Some(FetchBuffer::NoDatum(root)));
    }
}
