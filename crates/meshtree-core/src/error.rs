//! Error types for meshtree core.

use thiserror::Error;

use crate::crypto::Sha256Hash;

/// Core errors that can occur while handling keys, messages and tree nodes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: Sha256Hash,
        actual: Sha256Hash,
    },

    #[error("malformed node: {0}")]
    MalformedNode(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("maximum arity must be between 2 and 2043, got {0}")]
    InvalidArity(usize),

    #[error("node {0} is not referenced by any known node and is not the announced root")]
    Unreferenced(Sha256Hash),
}
