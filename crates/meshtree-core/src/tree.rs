//! Local content trees.
//!
//! A [`LocalTree`] is built bottom-up from a message set: every message
//! becomes a leaf, then each level is cut into chunks of at most `max_arity`
//! nodes and every chunk of two or more nodes gets an internal parent. A
//! single leftover node at the end of a level is carried up unchanged. The
//! reduction repeats until one node remains, which is the root.
//!
//! Nodes live in an arena and refer to each other by [`NodeIndex`].

use bytes::Bytes;
use std::fmt::Write as _;

use crate::crypto::{Sha256Hash, HASH_LEN};
use crate::error::CoreError;
use crate::message::Message;
use crate::node::{ContentNode, NodeIndex, NodePayload, MAX_PAYLOAD_LEN};

/// Default fan-out of internal nodes.
pub const DEFAULT_MAX_ARITY: usize = 32;

/// Largest fan-out whose internal nodes still fit in one datagram.
pub const MAX_ARITY: usize = (MAX_PAYLOAD_LEN - 1) / HASH_LEN;

/// Read access shared by local trees and remote views.
///
/// Search is depth-first and pre-order, visiting children in child-list
/// order, so results are reproducible for a given tree.
pub trait TreeArena {
    /// The node stored at `index`, if it is live.
    fn node(&self, index: NodeIndex) -> Option<&ContentNode>;

    /// Arena index of the root, if the tree has one.
    fn root_index(&self) -> Option<NodeIndex>;

    /// Return the first node, in pre-order, for which `predicate(depth, node)`
    /// holds.
    fn depth_first_search<F>(&self, mut predicate: F) -> Option<&ContentNode>
    where
        F: FnMut(usize, &ContentNode) -> bool,
    {
        let root = self.root_index()?;
        search_from(self, root, 0, &mut predicate)
    }

    /// Find a node by hash.
    fn find(&self, hash: &Sha256Hash) -> Option<&ContentNode> {
        self.depth_first_search(|_, node| node.hash == *hash)
    }

    /// Visit every node in pre-order.
    fn for_each_node<F>(&self, mut visit: F)
    where
        F: FnMut(usize, &ContentNode),
    {
        self.depth_first_search(|depth, node| {
            visit(depth, node);
            false
        });
    }

    /// Leaf messages in pre-order.
    fn messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        self.for_each_node(|_, node| {
            if let NodePayload::Leaf(message) = &node.payload {
                out.push(message.clone());
            }
        });
        out
    }

    /// Indented outline of the tree, one node hash per line.
    fn describe(&self) -> String {
        let mut out = String::new();
        self.for_each_node(|depth, node| {
            let kind = if node.is_leaf() { "leaf" } else { "node" };
            let _ = writeln!(
                out,
                "{}{} {} ({} children)",
                "  ".repeat(depth),
                kind,
                node.hash.to_hex(),
                node.payload.child_hashes().len()
            );
        });
        out
    }
}

fn search_from<'a, A, F>(
    arena: &'a A,
    index: NodeIndex,
    depth: usize,
    predicate: &mut F,
) -> Option<&'a ContentNode>
where
    A: TreeArena + ?Sized,
    F: FnMut(usize, &ContentNode) -> bool,
{
    let node = arena.node(index)?;
    if predicate(depth, node) {
        return Some(node);
    }
    for &child in &node.children {
        if let Some(found) = search_from(arena, child, depth + 1, predicate) {
            return Some(found);
        }
    }
    None
}

/// A node's own content tree. Immutable once built.
#[derive(Debug, Clone)]
pub struct LocalTree {
    nodes: Vec<ContentNode>,
    root: NodeIndex,
    max_arity: usize,
    message_count: usize,
}

impl LocalTree {
    /// Build a tree over `messages`.
    ///
    /// An empty message set yields a root that is an internal node with no
    /// children, so a peer always has a hash to announce.
    pub fn build(messages: &[Message], max_arity: usize) -> Result<Self, CoreError> {
        if !(2..=MAX_ARITY).contains(&max_arity) {
            return Err(CoreError::InvalidArity(max_arity));
        }
        for message in messages {
            message.check_size()?;
        }

        let mut nodes: Vec<ContentNode> = Vec::with_capacity(messages.len() * 2 + 1);
        let mut level: Vec<NodeIndex> = messages
            .iter()
            .map(|message| {
                let raw = message.encode();
                nodes.push(ContentNode {
                    hash: Sha256Hash::hash(&raw),
                    raw: Bytes::from(raw),
                    payload: NodePayload::Leaf(message.clone()),
                    parent: None,
                    children: Vec::new(),
                });
                nodes.len() - 1
            })
            .collect();

        if level.is_empty() {
            level.push(push_internal(&mut nodes, &[]));
        }

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / max_arity + 1);
            for chunk in level.chunks(max_arity) {
                if let [single] = chunk {
                    next.push(*single);
                } else {
                    next.push(push_internal(&mut nodes, chunk));
                }
            }
            level = next;
        }

        Ok(Self {
            nodes,
            root: level[0],
            max_arity,
            message_count: messages.len(),
        })
    }

    pub fn root(&self) -> &ContentNode {
        &self.nodes[self.root]
    }

    pub fn root_hash(&self) -> Sha256Hash {
        self.nodes[self.root].hash
    }

    pub fn max_arity(&self) -> usize {
        self.max_arity
    }

    /// Number of messages the tree was built from.
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Total number of nodes, leaves included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    /// Number of edges on the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        let mut height = 0;
        self.for_each_node(|depth, _| height = height.max(depth));
        height
    }
}

impl TreeArena for LocalTree {
    fn node(&self, index: NodeIndex) -> Option<&ContentNode> {
        self.nodes.get(index)
    }

    fn root_index(&self) -> Option<NodeIndex> {
        Some(self.root)
    }
}

fn push_internal(nodes: &mut Vec<ContentNode>, children: &[NodeIndex]) -> NodeIndex {
    let payload = NodePayload::Internal(children.iter().map(|&c| nodes[c].hash).collect());
    let raw = payload.encode();
    let index = nodes.len();
    nodes.push(ContentNode {
        hash: Sha256Hash::hash(&raw),
        raw: Bytes::from(raw),
        payload,
        parent: None,
        children: children.to_vec(),
    });
    for &child in children {
        nodes[child].parent = Some(index);
    }
    index
}
