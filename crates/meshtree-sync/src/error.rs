//! Error types for the sync module.
//!
//! Variants follow how a problem is handled: framing and authentication
//! failures drop a datagram, protocol-state failures are answered with an
//! `Error` datagram, integrity failures abort one fetch branch, and timeouts
//! are returned to whoever asked.

use std::net::SocketAddr;

use meshtree_core::{CoreError, Sha256Hash};
use thiserror::Error;

use crate::datagram::DatagramKind;

/// Malformed wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram too short: {len} bytes, need {needed}")]
    TooShort { len: usize, needed: usize },

    #[error("unknown datagram type {0}")]
    UnknownKind(u8),

    #[error("malformed {kind:?} body: {reason}")]
    BadBody { kind: DatagramKind, reason: String },

    #[error("{what} of {len} bytes exceeds the wire limit of {max}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The bytes could not be parsed as a datagram.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// A signature was missing or did not verify.
    #[error("authentication failed for {peer}: {reason}")]
    Authentication { peer: SocketAddr, reason: String },

    /// A datagram arrived that the protocol state does not allow.
    #[error("protocol state error: {0}")]
    ProtocolState(String),

    /// No outbound session with a peer.
    #[error("no session with {0}")]
    NoSession(SocketAddr),

    /// Fetched content did not match its hash.
    #[error("content integrity error for {hash}: {reason}")]
    ContentIntegrity { hash: Sha256Hash, reason: String },

    /// A request got no matching reply within the retry budget.
    #[error("no {kind:?} reply from {peer} after {attempts} attempts")]
    Timeout {
        peer: SocketAddr,
        kind: DatagramKind,
        attempts: u32,
    },

    /// Socket-level error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The socket was shut down.
    #[error("transport closed")]
    TransportClosed,

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] meshtree_store::StoreError),

    /// Core primitive failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
