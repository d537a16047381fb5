//! In-memory implementation of the NodeStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use meshtree_core::{verify_node, Message, Sha256Hash};

use crate::error::Result;
use crate::traits::{now_millis, InsertResult, NodeStore, StoredNode};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Messages in insertion order.
    messages: Vec<Message>,

    /// Hashes of `messages`, for idempotent inserts.
    message_hashes: HashMap<Sha256Hash, usize>,

    /// Verified remote nodes.
    nodes: HashMap<Sha256Hash, StoredNode>,

    /// Last announced root per peer.
    remote_roots: HashMap<String, Sha256Hash>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_message(&self, message: &Message) -> Result<InsertResult> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let hash = message.hash();
        if inner.message_hashes.contains_key(&hash) {
            return Ok(InsertResult::AlreadyExists);
        }
        let position = inner.messages.len();
        inner.messages.push(message.clone());
        inner.message_hashes.insert(hash, position);
        Ok(InsertResult::Inserted)
    }

    async fn list_messages(&self) -> Result<Vec<Message>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.messages.clone())
    }

    async fn message_count(&self) -> Result<usize> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.messages.len())
    }

    async fn insert_node(
        &self,
        hash: &Sha256Hash,
        raw: &[u8],
        source: &str,
    ) -> Result<InsertResult> {
        let node = verify_node(hash, raw)?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.nodes.contains_key(hash) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.nodes.insert(
            *hash,
            StoredNode {
                hash: node.hash,
                raw: Bytes::copy_from_slice(raw),
                source: source.to_owned(),
                fetched_at: now_millis(),
            },
        );
        Ok(InsertResult::Inserted)
    }

    async fn get_node(&self, hash: &Sha256Hash) -> Result<Option<StoredNode>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.nodes.get(hash).cloned())
    }

    async fn node_count(&self) -> Result<usize> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.nodes.len())
    }

    async fn set_remote_root(&self, peer: &str, root: &Sha256Hash) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remote_roots.insert(peer.to_owned(), *root);
        Ok(())
    }

    async fn get_remote_root(&self, peer: &str) -> Result<Option<Sha256Hash>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.remote_roots.get(peer).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use meshtree_core::{sample_messages, NodePayload};
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_message_order_and_dedup() {
        let store = MemoryStore::new();
        let msgs = sample_messages(4);
        for msg in &msgs {
            store.insert_message(msg).await.unwrap();
        }
        assert_eq!(
            store.insert_message(&msgs[2]).await.unwrap(),
            InsertResult::AlreadyExists
        );
        assert_eq!(store.list_messages().await.unwrap(), msgs);
    }

    #[tokio::test]
    async fn test_node_roundtrip() {
        let store = MemoryStore::new();
        let msg = Message::with_date(3, "leaf", None).unwrap();
        let raw = msg.encode();

        store.insert_node(&msg.hash(), &raw, "peer").await.unwrap();
        let stored = store.get_node(&msg.hash()).await.unwrap().unwrap();
        assert_eq!(stored.raw.as_ref(), raw.as_slice());
        assert_eq!(
            NodePayload::decode(&stored.raw).unwrap(),
            NodePayload::Leaf(msg)
        );
    }

    #[tokio::test]
    async fn test_rejects_unverified_node() {
        let store = MemoryStore::new();
        let err = store
            .insert_node(&Sha256Hash::ZERO, b"\x01", "peer")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert_eq!(store.node_count().await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_only_matching_nodes_stored(children in prop::collection::vec(any::<[u8; 32]>(), 0..8), flip in 0usize..2048) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let payload = NodePayload::Internal(children.into_iter().map(Sha256Hash).collect());
            let raw = payload.encode();
            let hash = payload.hash();

            let mut tampered = raw.clone();
            let bit = flip % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);

            rt.block_on(async {
                let store = MemoryStore::new();
                assert!(store.insert_node(&hash, &tampered, "p").await.is_err());
                assert!(store.get_node(&hash).await.unwrap().is_none());
                store.insert_node(&hash, &raw, "p").await.unwrap();
                assert!(store.get_node(&hash).await.unwrap().is_some());
            });
        }
    }
}
