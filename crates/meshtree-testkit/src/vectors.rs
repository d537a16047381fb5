//! Golden vectors for the wire format and content hashes.
//!
//! Any implementation that wants to talk to meshtree peers must produce
//! exactly these bytes and hashes.

use meshtree_core::{LocalTree, Message, Sha256Hash, DEFAULT_MAX_ARITY};
use meshtree_sync::{Body, Datagram, DatagramId, HelloBody};

/// An unsigned datagram and its expected encoding.
#[derive(Debug, Clone)]
pub struct WireVector {
    pub name: &'static str,
    pub datagram: Datagram,
    /// Header and body, hex. The 64-byte zero trailer follows.
    pub expected_hex: String,
}

impl WireVector {
    /// Full expected encoding including the zero trailer.
    pub fn expected_bytes(&self) -> Vec<u8> {
        let mut bytes = hex::decode(&self.expected_hex).unwrap_or_default();
        bytes.resize(bytes.len() + 64, 0);
        bytes
    }
}

/// A message set and the root hash its tree must have.
#[derive(Debug, Clone)]
pub struct TreeVector {
    pub name: &'static str,
    pub messages: Vec<Message>,
    pub max_arity: usize,
    pub expected_root: &'static str,
}

/// First leaf of the tree vectors: "hi" at date 100.
pub const LEAF_HI_HEX: &str =
    "0000000064000000000000000000000000000000000000000000000000000000000000000000026869";
pub const LEAF_HI_HASH: &str = "aaa0a32cd5de249e98f058d1e395b939879cc1a8f407e1707edbee72ca6fe368";
/// "there" at date 200, replying to [`LEAF_HI_HASH`].
pub const LEAF_THERE_HASH: &str =
    "87bca1f2464e5ed30d1e9c6ec8c5f966f5a3709181eb7fb8c5f4327a76b51dca";

fn hash(byte: u8) -> Sha256Hash {
    Sha256Hash([byte; 32])
}

fn leaf_hi() -> Message {
    Message {
        date: 100,
        in_reply_to: None,
        body: "hi".into(),
    }
}

fn leaf_there() -> Message {
    Message {
        date: 200,
        in_reply_to: Sha256Hash::from_hex(LEAF_HI_HASH).ok(),
        body: "there".into(),
    }
}

/// All wire vectors.
pub fn wire_vectors() -> Vec<WireVector> {
    vec![
        WireVector {
            name: "RootRequest has an empty body",
            datagram: Datagram::new(DatagramId([1, 2, 3, 4]), Body::RootRequest),
            expected_hex: "01020304010000".into(),
        },
        WireVector {
            name: "GetDatum carries one hash",
            datagram: Datagram::new(DatagramId([0x0a, 0x0b, 0x0c, 0x0d]), Body::GetDatum(hash(0xaa))),
            expected_hex: format!("0a0b0c0d020020{}", "aa".repeat(32)),
        },
        WireVector {
            name: "Hello with name alice",
            datagram: Datagram::new(DatagramId([0, 0, 0, 1]), Body::Hello(HelloBody::new("alice"))),
            expected_hex: "0000000100000a0000000005616c696365".into(),
        },
        WireVector {
            name: "NoDatum echoes the hash",
            datagram: Datagram::new(DatagramId([0xff; 4]), Body::NoDatum(hash(0xbb))),
            expected_hex: format!("ffffffff830020{}", "bb".repeat(32)),
        },
        WireVector {
            name: "Error carries UTF-8 text",
            datagram: Datagram::new(DatagramId([9, 9, 9, 9]), Body::Error("no handshake".into())),
            expected_hex: "09090909fe000c6e6f2068616e647368616b65".into(),
        },
        WireVector {
            name: "Datum with a leaf payload",
            datagram: Datagram::new(
                DatagramId([0, 0, 0, 7]),
                Body::Datum {
                    hash: Sha256Hash::from_hex(LEAF_HI_HASH).unwrap_or(Sha256Hash::ZERO),
                    payload: leaf_hi().encode().into(),
                },
            ),
            expected_hex: format!("00000007820049{}{}", LEAF_HI_HASH, LEAF_HI_HEX),
        },
    ]
}

/// All tree vectors.
pub fn tree_vectors() -> Vec<TreeVector> {
    vec![
        TreeVector {
            name: "empty tree",
            messages: vec![],
            max_arity: DEFAULT_MAX_ARITY,
            expected_root: "4bf5122f344554c53bde2ebb8cd2b7e3d1600ad631c385a5d7cce23c7785459a",
        },
        TreeVector {
            name: "single leaf is the root",
            messages: vec![leaf_hi()],
            max_arity: DEFAULT_MAX_ARITY,
            expected_root: LEAF_HI_HASH,
        },
        TreeVector {
            name: "two leaves under one parent",
            messages: vec![leaf_hi(), leaf_there()],
            max_arity: DEFAULT_MAX_ARITY,
            expected_root: "de411ab1283e57d390c8ea9b8aeb64b0e3591a06cdc2ade9612da93d4d105674",
        },
    ]
}

/// Check every vector. Returns `(name, matches, actual_hex)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    let wire = wire_vectors().into_iter().map(|v| match v.datagram.encode() {
        Ok(bytes) => (v.name.to_string(), bytes == v.expected_bytes(), hex::encode(bytes)),
        Err(e) => (v.name.to_string(), false, e.to_string()),
    });
    let trees = tree_vectors().into_iter().map(|v| {
        match LocalTree::build(&v.messages, v.max_arity) {
            Ok(tree) => {
                let actual = tree.root_hash().to_hex();
                (v.name.to_string(), actual == v.expected_root, actual)
            }
            Err(e) => (v.name.to_string(), false, e.to_string()),
        }
    });
    wire.chain(trees).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_match() {
        for (name, matches, actual) in verify_all_vectors() {
            assert!(matches, "vector '{}' produced {}", name, actual);
        }
    }

    #[test]
    fn test_wire_vectors_decode() {
        for vector in wire_vectors() {
            let decoded = Datagram::decode(&vector.expected_bytes()).unwrap();
            assert_eq!(decoded, vector.datagram, "vector '{}'", vector.name);
        }
    }

    #[test]
    fn test_leaf_vector() {
        assert_eq!(hex::encode(leaf_hi().encode()), LEAF_HI_HEX);
        assert_eq!(leaf_hi().hash().to_hex(), LEAF_HI_HASH);
        assert_eq!(leaf_there().hash().to_hex(), LEAF_THERE_HASH);
    }
}
