//! NodeStore trait: the abstract interface for content persistence.
//!
//! Two kinds of data are kept:
//!
//! - local messages, from which the node's own tree is rebuilt at startup
//! - verified nodes fetched from peers, so reconciliation can resume after a
//!   restart without fetching them again

use async_trait::async_trait;
use bytes::Bytes;
use meshtree_core::{Message, Sha256Hash};

use crate::error::Result;

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The row was new.
    Inserted,
    /// An identical row already exists (idempotent - not an error).
    AlreadyExists,
}

/// A verified node as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNode {
    pub hash: Sha256Hash,
    /// Encoded payload, type byte included.
    pub raw: Bytes,
    /// Address of the peer the node was fetched from.
    pub source: String,
    /// Local time of insertion (Unix ms).
    pub fetched_at: i64,
}

/// The NodeStore trait: async interface for message and node persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Idempotent inserts**: inserting the same message or node twice returns `AlreadyExists`.
/// - **Verified nodes only**: `insert_node` recomputes the hash and refuses a
///   payload that does not match, so nothing unverified is ever persisted.
#[async_trait]
pub trait NodeStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Local messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a message to the local set.
    async fn insert_message(&self, message: &Message) -> Result<InsertResult>;

    /// All local messages, in insertion order.
    async fn list_messages(&self) -> Result<Vec<Message>>;

    /// Number of local messages.
    async fn message_count(&self) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Remote nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify `raw` against `hash` and persist it.
    async fn insert_node(&self, hash: &Sha256Hash, raw: &[u8], source: &str)
        -> Result<InsertResult>;

    /// Fetch a node's encoded payload.
    async fn get_node(&self, hash: &Sha256Hash) -> Result<Option<StoredNode>>;

    /// Number of persisted remote nodes.
    async fn node_count(&self) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Reconciliation progress
    // ─────────────────────────────────────────────────────────────────────────

    /// Remember the last root a peer announced.
    async fn set_remote_root(&self, peer: &str, root: &Sha256Hash) -> Result<()>;

    /// The last root recorded for a peer.
    async fn get_remote_root(&self, peer: &str) -> Result<Option<Sha256Hash>>;
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
