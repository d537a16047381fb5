//! Error types for the node facade.

use meshtree_core::CoreError;
use meshtree_store::StoreError;
use meshtree_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core primitive failed (hashing, signing, tree building).
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The bootstrap collaborator failed.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// No directory record for a peer name.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// None of a peer's addresses could be reached.
    #[error("peer {name} unreachable at {attempted} address(es)")]
    Unreachable { name: String, attempted: usize },
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
