//! Content-tree nodes and their hash-verified payloads.
//!
//! Every node is identified by `SHA-256(type_byte || fields)`:
//!
//! - leaf (`type = 0`): the encoded [`Message`] fields
//! - internal (`type = 1`): the concatenation of the children's hashes
//!
//! A node whose stored hash differs from the recomputed hash of its payload
//! is never constructed by this module.

use bytes::Bytes;
use std::fmt::Write as _;

use crate::crypto::{Sha256Hash, HASH_LEN};
use crate::error::CoreError;
use crate::message::{Message, LEAF_TYPE};

/// Type byte of an internal node payload.
pub const INTERNAL_TYPE: u8 = 1;

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Datagram header plus signature trailer.
const DATAGRAM_OVERHEAD: usize = 7 + 64;

/// Largest encoded node that fits in a `Datum` next to its hash, within
/// one IPv4 UDP datagram.
pub const MAX_PAYLOAD_LEN: usize = MAX_UDP_PAYLOAD - DATAGRAM_OVERHEAD - HASH_LEN;

/// Index of a node inside a tree arena.
pub type NodeIndex = usize;

/// Discriminator for node payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    /// The wire type byte.
    pub const fn type_byte(self) -> u8 {
        match self {
            NodeKind::Leaf => LEAF_TYPE,
            NodeKind::Internal => INTERNAL_TYPE,
        }
    }
}

/// Decoded payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload {
    /// A message.
    Leaf(Message),
    /// Ordered child hashes.
    Internal(Vec<Sha256Hash>),
}

impl NodePayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Leaf(_) => NodeKind::Leaf,
            NodePayload::Internal(_) => NodeKind::Internal,
        }
    }

    /// Encode including the leading type byte.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            NodePayload::Leaf(message) => message.encode(),
            NodePayload::Internal(children) => {
                let mut buf = Vec::with_capacity(1 + children.len() * HASH_LEN);
                buf.push(INTERNAL_TYPE);
                for child in children {
                    buf.extend_from_slice(child.as_bytes());
                }
                buf
            }
        }
    }

    /// Decode a payload (type byte + fields).
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        match bytes.first() {
            None => Err(CoreError::MalformedNode("empty payload".into())),
            Some(&LEAF_TYPE) => Ok(NodePayload::Leaf(Message::decode(bytes)?)),
            Some(&INTERNAL_TYPE) => {
                let hashes = &bytes[1..];
                if hashes.len() % HASH_LEN != 0 {
                    return Err(CoreError::MalformedNode(format!(
                        "internal payload of {} bytes is not a multiple of {}",
                        hashes.len(),
                        HASH_LEN
                    )));
                }
                let children = hashes
                    .chunks_exact(HASH_LEN)
                    .map(|chunk| {
                        let mut arr = [0u8; HASH_LEN];
                        arr.copy_from_slice(chunk);
                        Sha256Hash(arr)
                    })
                    .collect();
                Ok(NodePayload::Internal(children))
            }
            Some(other) => Err(CoreError::MalformedNode(format!(
                "unknown node type {}",
                other
            ))),
        }
    }

    /// Hash of the encoded payload.
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::hash(&self.encode())
    }

    /// Declared child hashes (empty for a leaf).
    pub fn child_hashes(&self) -> &[Sha256Hash] {
        match self {
            NodePayload::Leaf(_) => &[],
            NodePayload::Internal(children) => children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodePayload::Leaf(_))
    }

    /// Human-readable rendering, one field per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        match self {
            NodePayload::Leaf(msg) => {
                let _ = writeln!(out, "node type: {}", LEAF_TYPE);
                let _ = writeln!(out, "date: {} (unix {})", msg.date, msg.unix_time());
                match msg.in_reply_to {
                    Some(parent) => {
                        let _ = writeln!(out, "in reply to: {}", parent.to_hex());
                    }
                    None => {
                        let _ = writeln!(out, "in reply to: -");
                    }
                }
                let _ = writeln!(out, "length: {}", msg.body.len());
                let _ = writeln!(out, "body: {}", msg.body);
            }
            NodePayload::Internal(children) => {
                let _ = writeln!(out, "node type: {}", INTERNAL_TYPE);
                for (i, child) in children.iter().enumerate() {
                    let _ = writeln!(out, "hash {}: {}", i + 1, child.to_hex());
                }
            }
        }
        out
    }
}

/// A payload whose hash has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedNode {
    pub hash: Sha256Hash,
    pub raw: Bytes,
    pub payload: NodePayload,
}

/// Check that `raw` hashes to `expected` and decode it.
pub fn verify_node(expected: &Sha256Hash, raw: &[u8]) -> Result<VerifiedNode, CoreError> {
    let actual = Sha256Hash::hash(raw);
    if &actual != expected {
        return Err(CoreError::HashMismatch {
            expected: *expected,
            actual,
        });
    }
    let payload = NodePayload::decode(raw)?;
    Ok(VerifiedNode {
        hash: actual,
        raw: Bytes::copy_from_slice(raw),
        payload,
    })
}

/// A node stored in a tree arena.
#[derive(Debug, Clone)]
pub struct ContentNode {
    pub hash: Sha256Hash,
    /// Encoded payload, exactly what a `Datum` carries after the hash.
    pub raw: Bytes,
    pub payload: NodePayload,
    pub parent: Option<NodeIndex>,
    /// Arena indices of attached children, in child-list order.
    pub children: Vec<NodeIndex>,
}

impl ContentNode {
    pub(crate) fn from_verified(node: VerifiedNode, parent: Option<NodeIndex>) -> Self {
        Self {
            hash: node.hash,
            raw: node.raw,
            payload: node.payload,
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.payload.is_leaf()
    }

    pub fn kind(&self) -> NodeKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_internal_roundtrip() {
        let payload = NodePayload::Internal(vec![
            Sha256Hash::hash(b"a"),
            Sha256Hash::hash(b"b"),
        ]);
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 1 + 2 * HASH_LEN);
        assert_eq!(bytes[0], INTERNAL_TYPE);
        assert_eq!(NodePayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_internal_hash_covers_type_byte() {
        let children = vec![Sha256Hash::hash(b"a")];
        let payload = NodePayload::Internal(children.clone());
        let expected = Sha256Hash::hash_parts(&[&[INTERNAL_TYPE], children[0].as_bytes()]);
        assert_eq!(payload.hash(), expected);
    }

    #[test]
    fn test_ragged_internal_rejected() {
        let mut bytes = vec![INTERNAL_TYPE];
        bytes.extend_from_slice(&[0u8; HASH_LEN + 1]);
        assert!(NodePayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(NodePayload::decode(&[7, 1, 2]).is_err());
        assert!(NodePayload::decode(&[]).is_err());
    }

    #[test]
    fn test_verify_node_mismatch() {
        let raw = Message::with_date(1, "x", None).unwrap().encode();
        let wrong = Sha256Hash::hash(b"something else");
        assert!(matches!(
            verify_node(&wrong, &raw),
            Err(CoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_describe_leaf() {
        let payload = NodePayload::Leaf(Message::with_date(5, "hello", None).unwrap());
        let text = payload.describe();
        assert!(text.contains("body: hello"));
        assert!(text.contains("in reply to: -"));
    }

    proptest! {
        #[test]
        fn prop_leaf_hash_integrity(body in "[a-zA-Z0-9 ]{0,200}", date: u32, flip in 0usize..4096) {
            let raw = Message::with_date(date, body, None).unwrap().encode();
            let hash = Sha256Hash::hash(&raw);

            let node = verify_node(&hash, &raw).unwrap();
            prop_assert_eq!(node.hash, hash);

            let mut tampered = raw.clone();
            let bit = flip % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(verify_node(&hash, &tampered).is_err());
        }

        #[test]
        fn prop_internal_hash_integrity(children in prop::collection::vec(any::<[u8; 32]>(), 0..16), flip in 0usize..4096) {
            let payload = NodePayload::Internal(children.into_iter().map(Sha256Hash).collect());
            let raw = payload.encode();
            let hash = payload.hash();

            prop_assert_eq!(verify_node(&hash, &raw).unwrap().payload, payload);

            let mut tampered = raw.clone();
            let bit = flip % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(verify_node(&hash, &tampered).is_err());
        }
    }
}
