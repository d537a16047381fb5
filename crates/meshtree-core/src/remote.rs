//! Partial mirrors of a peer's content tree.
//!
//! A [`RemoteTreeView`] is filled one verified node at a time. A node is
//! accepted only if its hash matches its payload and either some internal
//! node already in the view lists it as a child, or it is the root the peer
//! most recently announced. When a new root arrives, subtrees of the old
//! tree that the new root still lists are kept and everything else is freed.

use std::collections::{HashMap, HashSet};

use crate::crypto::Sha256Hash;
use crate::error::CoreError;
use crate::message::Message;
use crate::node::{verify_node, ContentNode, NodeIndex, NodeKind};
use crate::tree::TreeArena;

/// What [`RemoteTreeView::add_node`] did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Attached under a parent that lists it.
    Attached { kind: NodeKind },
    /// Installed as the root; `pruned` nodes of the previous tree were freed.
    NewRoot { kind: NodeKind, pruned: usize },
    /// A node with this hash was already in the view.
    AlreadyPresent,
}

/// A peer's tree as discovered so far.
#[derive(Debug, Clone, Default)]
pub struct RemoteTreeView {
    slots: Vec<Option<ContentNode>>,
    free: Vec<NodeIndex>,
    index: HashMap<Sha256Hash, NodeIndex>,
    /// Child hash -> internal node that lists it but does not hold it yet.
    wanted: HashMap<Sha256Hash, NodeIndex>,
    root: Option<NodeIndex>,
    announced_root: Option<Sha256Hash>,
    unavailable: HashSet<Sha256Hash>,
}

impl RemoteTreeView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the root hash the peer most recently announced.
    ///
    /// Returns `true` if it differs from the previous announcement.
    pub fn announce_root(&mut self, hash: Sha256Hash) -> bool {
        self.announced_root.replace(hash) != Some(hash)
    }

    pub fn announced_root(&self) -> Option<Sha256Hash> {
        self.announced_root
    }

    /// Hash of the root currently installed in the view.
    pub fn root_hash(&self) -> Option<Sha256Hash> {
        self.root.and_then(|r| self.node(r)).map(|n| n.hash)
    }

    /// Verify `raw` against `hash` and insert it.
    ///
    /// A node that fails verification, or that is neither listed by a known
    /// parent nor the announced root, leaves the view untouched.
    pub fn add_node(&mut self, hash: Sha256Hash, raw: &[u8]) -> Result<AddOutcome, CoreError> {
        let verified = verify_node(&hash, raw)?;
        let kind = verified.payload.kind();

        if let Some(&existing) = self.index.get(&hash) {
            // A subtree we already hold may become the whole tree.
            if self.announced_root == Some(hash) && self.root != Some(existing) {
                self.detach(existing);
                let pruned = self.install_root(existing);
                return Ok(AddOutcome::NewRoot { kind, pruned });
            }
            return Ok(AddOutcome::AlreadyPresent);
        }

        // The announced root wins even if the old tree lists it as a child.
        if self.announced_root == Some(hash) {
            let index = self.alloc(ContentNode::from_verified(verified, None));
            let pruned = self.install_root(index);
            return Ok(AddOutcome::NewRoot { kind, pruned });
        }

        let Some(&parent) = self.wanted.get(&hash) else {
            return Err(CoreError::Unreferenced(hash));
        };
        let index = self.alloc(ContentNode::from_verified(verified, Some(parent)));
        self.wanted.remove(&hash);
        self.link_child(parent, index);
        self.register_wanted(index);
        Ok(AddOutcome::Attached { kind })
    }

    /// Mark a hash the peer reported it does not have.
    pub fn mark_unavailable(&mut self, hash: Sha256Hash) {
        self.unavailable.insert(hash);
    }

    pub fn is_unavailable(&self, hash: &Sha256Hash) -> bool {
        self.unavailable.contains(hash)
    }

    pub fn unavailable(&self) -> impl Iterator<Item = &Sha256Hash> {
        self.unavailable.iter()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<&ContentNode> {
        self.index.get(hash).and_then(|&i| self.node(i))
    }

    /// Number of nodes held.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Child hashes listed by held nodes but not yet held, in pre-order.
    /// Hashes marked unavailable are skipped.
    pub fn missing_children(&self) -> Vec<Sha256Hash> {
        let mut missing = Vec::new();
        self.for_each_node(|_, node| {
            for child in node.payload.child_hashes() {
                if !self.index.contains_key(child) && !self.unavailable.contains(child) {
                    missing.push(*child);
                }
            }
        });
        missing
    }

    /// Whether the announced root and everything below it is held, apart
    /// from branches the peer reported unavailable.
    pub fn is_complete(&self) -> bool {
        match self.announced_root {
            Some(root) => self.root_hash() == Some(root) && self.missing_children().is_empty(),
            None => false,
        }
    }

    /// Leaf messages held, in pre-order.
    pub fn leaves(&self) -> Vec<Message> {
        self.messages()
    }

    fn alloc(&mut self, node: ContentNode) -> NodeIndex {
        let hash = node.hash;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                index
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(hash, index);
        index
    }

    /// Insert `child` into `parent`'s children, keeping payload order.
    fn link_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        let position_of = |view: &Self, idx: NodeIndex| -> usize {
            let (Some(p), Some(c)) = (view.node(parent), view.node(idx)) else {
                return usize::MAX;
            };
            p.payload
                .child_hashes()
                .iter()
                .position(|h| *h == c.hash)
                .unwrap_or(usize::MAX)
        };

        let target = position_of(self, child);
        let at = match self.node(parent) {
            Some(p) => p
                .children
                .iter()
                .take_while(|&&existing| position_of(self, existing) < target)
                .count(),
            None => return,
        };

        if let Some(Some(node)) = self.slots.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(Some(p)) = self.slots.get_mut(parent) {
            p.children.insert(at, child);
        }
    }

    fn detach(&mut self, child: NodeIndex) {
        let parent = match self.slots.get_mut(child) {
            Some(Some(node)) => node.parent.take(),
            _ => None,
        };
        if let Some(parent) = parent {
            if let Some(Some(p)) = self.slots.get_mut(parent) {
                p.children.retain(|&c| c != child);
            }
        }
    }

    fn register_wanted(&mut self, index: NodeIndex) {
        let Some(node) = self.node(index) else {
            return;
        };
        let missing: Vec<Sha256Hash> = node
            .payload
            .child_hashes()
            .iter()
            .filter(|h| !self.index.contains_key(h))
            .copied()
            .collect();
        for hash in missing {
            self.wanted.entry(hash).or_insert(index);
        }
    }

    fn install_root(&mut self, new_root: NodeIndex) -> usize {
        let old_root = self.root.replace(new_root);

        let listed: Vec<Sha256Hash> = self
            .node(new_root)
            .map(|n| n.payload.child_hashes().to_vec())
            .unwrap_or_default();

        for hash in &listed {
            if let Some(&existing) = self.index.get(hash) {
                if existing == new_root {
                    continue;
                }
                self.detach(existing);
                self.link_child(new_root, existing);
            }
        }

        let pruned = match old_root {
            Some(old) if self.node(old).map_or(false, |n| n.parent.is_none()) => {
                self.free_subtree(old)
            }
            _ => 0,
        };

        self.rebuild_wanted();
        pruned
    }

    fn free_subtree(&mut self, start: NodeIndex) -> usize {
        let mut stack = vec![start];
        let mut freed = 0;
        while let Some(index) = stack.pop() {
            if let Some(node) = self.slots.get_mut(index).and_then(Option::take) {
                self.index.remove(&node.hash);
                stack.extend(node.children);
                self.free.push(index);
                freed += 1;
            }
        }
        freed
    }

    fn rebuild_wanted(&mut self) {
        self.wanted.clear();
        let live: Vec<NodeIndex> = self.index.values().copied().collect();
        for index in live {
            self.register_wanted(index);
        }
    }
}

impl TreeArena for RemoteTreeView {
    fn node(&self, index: NodeIndex) -> Option<&ContentNode> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn root_index(&self) -> Option<NodeIndex> {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::sample_messages;
    use crate::tree::LocalTree;
    use crate::node::NodePayload;
    use proptest::prelude::*;

    fn add_payload(view: &mut RemoteTreeView, payload: &NodePayload) -> Result<AddOutcome, CoreError> {
        view.add_node(payload.hash(), &payload.encode())
    }

    fn mirror(tree: &LocalTree) -> RemoteTreeView {
        let mut view = RemoteTreeView::new();
        view.announce_root(tree.root_hash());
        view.add_node(tree.root_hash(), &tree.root().raw).unwrap();
        loop {
            let missing = view.missing_children();
            if missing.is_empty() {
                break;
            }
            for hash in missing {
                let node = tree.find(&hash).unwrap();
                view.add_node(hash, &node.raw).unwrap();
            }
        }
        view
    }

    #[test]
    fn test_root_with_two_leaves() {
        let msgs = sample_messages(2);
        let tree = LocalTree::build(&msgs, 32).unwrap();

        let mut view = RemoteTreeView::new();
        view.announce_root(tree.root_hash());
        let outcome = view.add_node(tree.root_hash(), &tree.root().raw).unwrap();
        assert_eq!(
            outcome,
            AddOutcome::NewRoot {
                kind: NodeKind::Internal,
                pruned: 0
            }
        );
        assert_eq!(view.missing_children(), vec![msgs[0].hash(), msgs[1].hash()]);

        // Fetch out of order; children still end up in payload order.
        for msg in msgs.iter().rev() {
            let outcome = view.add_node(msg.hash(), &msg.encode()).unwrap();
            assert_eq!(outcome, AddOutcome::Attached { kind: NodeKind::Leaf });
        }

        assert!(view.is_complete());
        let root = view.node(view.root_index().unwrap()).unwrap();
        let children: Vec<_> = root
            .children
            .iter()
            .map(|&c| view.node(c).unwrap().hash)
            .collect();
        assert_eq!(children, vec![msgs[0].hash(), msgs[1].hash()]);
        assert_eq!(view.leaves(), msgs);
    }

    #[test]
    fn test_unreferenced_rejected() {
        let msgs = sample_messages(3);
        let mut view = RemoteTreeView::new();
        let err = view.add_node(msgs[0].hash(), &msgs[0].encode()).unwrap_err();
        assert!(matches!(err, CoreError::Unreferenced(_)));
        assert!(view.is_empty());
    }

    #[test]
    fn test_mismatch_leaves_view_untouched() {
        let tree = LocalTree::build(&sample_messages(4), 2).unwrap();
        let mut view = RemoteTreeView::new();
        view.announce_root(tree.root_hash());
        view.add_node(tree.root_hash(), &tree.root().raw).unwrap();

        let wanted = view.missing_children()[0];
        let before = view.len();
        assert!(view.add_node(wanted, b"\x01forged").is_err());
        assert_eq!(view.len(), before);
        assert_eq!(view.missing_children()[0], wanted);
    }

    #[test]
    fn test_full_mirror() {
        let msgs = sample_messages(20);
        let tree = LocalTree::build(&msgs, 3).unwrap();
        let view = mirror(&tree);
        assert_eq!(view.len(), tree.len());
        assert_eq!(view.leaves(), msgs);
        assert_eq!(view.describe(), tree.describe());
    }

    #[test]
    fn test_unavailable_branch_skipped() {
        let tree = LocalTree::build(&sample_messages(3), 4).unwrap();
        let mut view = RemoteTreeView::new();
        view.announce_root(tree.root_hash());
        view.add_node(tree.root_hash(), &tree.root().raw).unwrap();

        let missing = view.missing_children();
        view.mark_unavailable(missing[1]);
        assert_eq!(view.missing_children(), vec![missing[0], missing[2]]);
        assert!(view.is_unavailable(&missing[1]));
    }

    #[test]
    fn test_root_change_keeps_shared_subtrees() {
        // Old tree: root(a, b). New tree: root'(a, c).
        let msgs = sample_messages(3);
        let old = LocalTree::build(&msgs[..2], 4).unwrap();
        let mut view = mirror(&old);
        assert_eq!(view.len(), 3);

        let new_root = NodePayload::Internal(vec![msgs[0].hash(), msgs[2].hash()]);
        assert!(view.announce_root(new_root.hash()));
        let outcome = add_payload(&mut view, &new_root).unwrap();

        // Old root and leaf b are freed, leaf a is re-parented.
        assert_eq!(
            outcome,
            AddOutcome::NewRoot {
                kind: NodeKind::Internal,
                pruned: 2
            }
        );
        assert!(view.contains(&msgs[0].hash()));
        assert!(!view.contains(&msgs[1].hash()));
        assert!(!view.contains(&old.root_hash()));
        assert_eq!(view.missing_children(), vec![msgs[2].hash()]);

        view.add_node(msgs[2].hash(), &msgs[2].encode()).unwrap();
        assert!(view.is_complete());
        assert_eq!(view.leaves(), vec![msgs[0].clone(), msgs[2].clone()]);
    }

    #[test]
    fn test_root_change_keeps_old_root_as_child() {
        let msgs = sample_messages(3);
        let old = LocalTree::build(&msgs[..2], 4).unwrap();
        let mut view = mirror(&old);

        let new_root = NodePayload::Internal(vec![old.root_hash(), msgs[2].hash()]);
        view.announce_root(new_root.hash());
        let outcome = add_payload(&mut view, &new_root).unwrap();
        assert_eq!(
            outcome,
            AddOutcome::NewRoot {
                kind: NodeKind::Internal,
                pruned: 0
            }
        );
        assert_eq!(view.len(), 4);
        assert_eq!(view.missing_children(), vec![msgs[2].hash()]);
    }

    #[test]
    fn test_held_subtree_promoted_to_root() {
        // Old tree: root(I(a, b), c). New tree: I(a, b).
        let msgs = sample_messages(3);
        let old = LocalTree::build(&msgs, 2).unwrap();
        let mut view = mirror(&old);
        assert_eq!(view.len(), 5);

        let subtree = LocalTree::build(&msgs[..2], 2).unwrap();
        assert!(view.contains(&subtree.root_hash()));
        view.announce_root(subtree.root_hash());
        let outcome = view
            .add_node(subtree.root_hash(), &subtree.root().raw)
            .unwrap();

        assert_eq!(
            outcome,
            AddOutcome::NewRoot {
                kind: NodeKind::Internal,
                pruned: 2
            }
        );
        assert_eq!(view.root_hash(), Some(subtree.root_hash()));
        assert!(view.is_complete());
        assert_eq!(view.leaves(), msgs[..2].to_vec());
    }

    #[test]
    fn test_announced_root_wanted_by_old_tree_becomes_root() {
        // Old root lists I(a, b) but the view has not fetched it yet when the
        // peer starts announcing I(a, b) itself.
        let msgs = sample_messages(3);
        let old = LocalTree::build(&msgs, 2).unwrap();
        let subtree = LocalTree::build(&msgs[..2], 2).unwrap();

        let mut view = RemoteTreeView::new();
        view.announce_root(old.root_hash());
        view.add_node(old.root_hash(), &old.root().raw).unwrap();
        assert!(view.missing_children().contains(&subtree.root_hash()));

        view.announce_root(subtree.root_hash());
        let outcome = view
            .add_node(subtree.root_hash(), &subtree.root().raw)
            .unwrap();
        assert_eq!(
            outcome,
            AddOutcome::NewRoot {
                kind: NodeKind::Internal,
                pruned: 1
            }
        );
        assert_eq!(view.root_hash(), Some(subtree.root_hash()));
        assert_eq!(view.missing_children(), vec![msgs[0].hash(), msgs[1].hash()]);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let tree = LocalTree::build(&sample_messages(2), 4).unwrap();
        let mut view = mirror(&tree);
        assert_eq!(
            view.add_node(tree.root_hash(), &tree.root().raw).unwrap(),
            AddOutcome::AlreadyPresent
        );
    }

    proptest! {
        #[test]
        fn prop_root_leaf_integrity(body in "[ -~]{0,300}", date: u32, flip in 0usize..8192) {
            let msg = Message::with_date(date, body, None).unwrap();
            let raw = msg.encode();
            let hash = Sha256Hash::hash(&raw);

            let mut tampered = raw.clone();
            let bit = flip % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);

            let mut view = RemoteTreeView::new();
            view.announce_root(hash);
            prop_assert!(view.add_node(hash, &tampered).is_err());
            prop_assert!(view.is_empty());

            view.add_node(hash, &raw).unwrap();
            prop_assert_eq!(view.root_hash(), Some(hash));
        }
    }
}
