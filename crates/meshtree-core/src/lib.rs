//! # Meshtree Core
//!
//! Pure primitives for meshtree: hashes, keys, messages, and content trees.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over hash-addressed data structures.
//!
//! ## Key Types
//!
//! - [`Message`] - A dated UTF-8 post, the payload of a leaf
//! - [`NodePayload`] - Leaf or internal node payload; its SHA-256 is the node's identity
//! - [`LocalTree`] - A node's own tree, built bottom-up with a bounded arity
//! - [`RemoteTreeView`] - A partial, verified mirror of a peer's tree
//! - [`Keypair`] - ECDSA P-256 identity used to sign datagrams

pub mod crypto;
pub mod error;
pub mod message;
pub mod node;
pub mod remote;
pub mod tree;

pub use crypto::{Keypair, PublicKey, Sha256Hash, Signature, HASH_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
pub use error::CoreError;
pub use message::{
    current_date, sample_messages, Message, DATE_EPOCH_UNIX, LEAF_TYPE, MAX_MESSAGE_BODY_LEN,
};
pub use node::{
    verify_node, ContentNode, NodeIndex, NodeKind, NodePayload, VerifiedNode, INTERNAL_TYPE,
    MAX_PAYLOAD_LEN, MAX_UDP_PAYLOAD,
};
pub use remote::{AddOutcome, RemoteTreeView};
pub use tree::{LocalTree, TreeArena, DEFAULT_MAX_ARITY, MAX_ARITY};
