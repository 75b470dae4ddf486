// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tree topology over a [`Roster`].
//!
//! A [`Tree`] is an arena of [`TreeNode`]s addressed by [`TreeNodeIndex`].
//! Nodes only refer to each other by index, so the tree has no reference
//! cycles and can be shared read-only between any number of instances.
//!
//! Trees are built deterministically: the root is placed at position 0,
//! the remaining peers follow in roster order, and position `i > 0` has
//! parent `(i - 1) / branching`. Any peer can therefore rebuild the exact
//! same tree from a [`TreeDescriptor`].

use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Roster;
use crate::types::{PeerId, TreeId};

/// Position of a node within its [`Tree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TreeNodeIndex(u32);

impl TreeNodeIndex {
    /// Index of the root in every tree.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the inner index as `usize`.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TreeNodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors that can occur when building a [`Tree`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("root {0} is not a member of the roster")]
    RootNotInRoster(PeerId),
    #[error("peer {0} appears more than once in the roster")]
    DuplicatePeer(PeerId),
    #[error("branching factor must be positive")]
    ZeroBranching,
}

/// Single position in a [`Tree`].
#[derive(Clone, Debug)]
pub struct TreeNode {
    index: TreeNodeIndex,
    peer: PeerId,
    parent: Option<TreeNodeIndex>,
    children: Vec<TreeNodeIndex>,
    subtree_size: usize,
}

impl TreeNode {
    #[must_use]
    pub const fn index(&self) -> TreeNodeIndex {
        self.index
    }

    #[must_use]
    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    /// Returns `None` iff this is the root.
    #[must_use]
    pub const fn parent(&self) -> Option<TreeNodeIndex> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[TreeNodeIndex] {
        &self.children
    }

    /// Number of nodes in the subtree rooted here, including this node.
    #[must_use]
    pub const fn subtree_size(&self) -> usize {
        self.subtree_size
    }

    /// Number of nodes strictly below this node.
    #[must_use]
    pub const fn descendants(&self) -> usize {
        self.subtree_size - 1
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Everything needed to rebuild a [`Tree`] on another peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub peers: Vec<PeerId>,
    pub root: PeerId,
    pub branching: u32,
}

/// Rooted spanning tree over a [`Roster`].
#[derive(Debug)]
pub struct Tree {
    id: TreeId,
    roster: Arc<Roster>,
    branching: usize,
    nodes: Vec<TreeNode>,
    positions: HashMap<PeerId, TreeNodeIndex>,
}

impl Tree {
    /// Builds an n-ary tree over `roster`, rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::RootNotInRoster`] if `root` is not in `roster`,
    /// [`TreeError::DuplicatePeer`] if a peer is listed twice, and
    /// [`TreeError::ZeroBranching`] if `branching` is zero.
    pub fn new_nary(
        roster: Arc<Roster>,
        branching: usize,
        root: PeerId,
    ) -> Result<Self, TreeError> {
        if branching == 0 {
            return Err(TreeError::ZeroBranching);
        }
        if !roster.contains(root) {
            return Err(TreeError::RootNotInRoster(root));
        }

        // root first, everyone else in roster order
        let order: Vec<PeerId> = std::iter::once(root)
            .chain(roster.peers().iter().copied().filter(|p| *p != root))
            .collect();

        let mut positions = HashMap::with_capacity(order.len());
        let mut nodes = Vec::with_capacity(order.len());
        for (pos, peer) in order.iter().enumerate() {
            let index = TreeNodeIndex(pos as u32);
            if positions.insert(*peer, index).is_some() {
                return Err(TreeError::DuplicatePeer(*peer));
            }
            let parent = match pos {
                0 => None,
                _ => Some(TreeNodeIndex(((pos - 1) / branching) as u32)),
            };
            let first_child = pos.saturating_mul(branching).saturating_add(1);
            let children = (first_child..order.len())
                .take(branching)
                .map(|c| TreeNodeIndex(c as u32))
                .collect();
            nodes.push(TreeNode {
                index,
                peer: *peer,
                parent,
                children,
                subtree_size: 1,
            });
        }

        // parents always sit at lower positions than their children
        for pos in (1..nodes.len()).rev() {
            let size = nodes[pos].subtree_size;
            if let Some(parent) = nodes[pos].parent {
                nodes[parent.get()].subtree_size += size;
            }
        }

        Ok(Self {
            id: TreeId::derive(&roster.id(), root, branching),
            roster,
            branching,
            nodes,
            positions,
        })
    }

    /// Rebuilds a tree announced by another peer.
    ///
    /// # Errors
    ///
    /// Same as [`Tree::new_nary`].
    pub fn from_descriptor(descriptor: &TreeDescriptor) -> Result<Self, TreeError> {
        let roster = Arc::new(Roster::new(descriptor.peers.clone()));
        Self::new_nary(roster, descriptor.branching as usize, descriptor.root)
    }

    /// Returns the descriptor from which [`Tree::from_descriptor`] rebuilds this tree.
    #[must_use]
    pub fn descriptor(&self) -> TreeDescriptor {
        TreeDescriptor {
            peers: self.roster.peers().to_vec(),
            root: self.root().peer,
            branching: self.branching as u32,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TreeId {
        self.id
    }

    #[must_use]
    pub const fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    #[must_use]
    pub const fn branching(&self) -> usize {
        self.branching
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Gives the root node.
    ///
    /// # Panics
    ///
    /// Never panics for trees built by [`Tree::new_nary`], which requires a root.
    #[must_use]
    pub fn root(&self) -> &TreeNode {
        &self.nodes[TreeNodeIndex::ROOT.get()]
    }

    #[must_use]
    pub fn node(&self, index: TreeNodeIndex) -> Option<&TreeNode> {
        self.nodes.get(index.get())
    }

    /// Finds the node the given peer occupies in this tree.
    #[must_use]
    pub fn find(&self, peer: PeerId) -> Option<&TreeNode> {
        self.positions.get(&peer).and_then(|i| self.node(*i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn parent_of(&self, index: TreeNodeIndex) -> Option<TreeNodeIndex> {
        self.node(index).and_then(TreeNode::parent)
    }

    #[must_use]
    pub fn children_of(&self, index: TreeNodeIndex) -> &[TreeNodeIndex] {
        match self.node(index) {
            Some(node) => node.children(),
            None => &[],
        }
    }

    #[must_use]
    pub fn subtree_size_of(&self, index: TreeNodeIndex) -> usize {
        self.node(index).map_or(0, TreeNode::subtree_size)
    }

    #[must_use]
    pub fn is_root(&self, index: TreeNodeIndex) -> bool {
        index == TreeNodeIndex::ROOT
    }

    #[must_use]
    pub fn is_leaf(&self, index: TreeNodeIndex) -> bool {
        self.children_of(index).is_empty()
    }
}

impl Index<TreeNodeIndex> for Tree {
    type Output = TreeNode;

    /// # Panics
    ///
    /// Panics if `index` is not a position in this tree.
    fn index(&self, index: TreeNodeIndex) -> &TreeNode {
        &self.nodes[index.get()]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn roster(n: u64) -> Arc<Roster> {
        Arc::new(Roster::new((0..n).collect()))
    }

    #[test]
    fn structure() {
        for n in [1, 2, 3, 10, 100, 257] {
            for branching in [1, 2, 3, 8, 200] {
                let tree = Tree::new_nary(roster(n), branching, 0).unwrap();
                assert_eq!(tree.len(), n as usize);
                assert_eq!(tree.root().subtree_size(), n as usize);
                assert!(tree.root().is_root());

                let mut seen = HashSet::new();
                for node in tree.iter() {
                    assert!(seen.insert(node.peer()));
                    assert!(node.children().len() <= branching);
                    // parent-child compatibility
                    for child in node.children() {
                        assert_eq!(tree.parent_of(*child), Some(node.index()));
                    }
                    if let Some(parent) = node.parent() {
                        assert!(tree.children_of(parent).contains(&node.index()));
                    } else {
                        assert_eq!(node.index(), TreeNodeIndex::ROOT);
                    }
                    // subtree sizes add up
                    let below: usize = node
                        .children()
                        .iter()
                        .map(|c| tree.subtree_size_of(*c))
                        .sum();
                    assert_eq!(node.subtree_size(), below + 1);
                    assert_eq!(node.is_leaf(), tree.is_leaf(node.index()));
                }
            }
        }
    }

    #[test]
    fn root_moves_to_front() {
        let tree = Tree::new_nary(roster(10), 8, 4).unwrap();
        assert_eq!(tree.root().peer(), 4);
        assert_eq!(tree.root().children().len(), 8);
        let peers: Vec<_> = tree.iter().map(TreeNode::peer).collect();
        assert_eq!(peers, vec![4, 0, 1, 2, 3, 5, 6, 7, 8, 9]);
        // the ninth peer hangs below the first child
        let last = tree.find(9).unwrap();
        assert_eq!(last.parent(), Some(TreeNodeIndex::new(1)));
        assert_eq!(tree.find(0).unwrap().subtree_size(), 2);
        assert_eq!(tree.find(4).unwrap().descendants(), 9);
    }

    #[test]
    fn invalid_trees() {
        assert_eq!(
            Tree::new_nary(roster(3), 2, 7).unwrap_err(),
            TreeError::RootNotInRoster(7)
        );
        assert_eq!(
            Tree::new_nary(roster(3), 0, 0).unwrap_err(),
            TreeError::ZeroBranching
        );
        let dup = Arc::new(Roster::new(vec![0, 1, 1]));
        assert_eq!(
            Tree::new_nary(dup, 2, 0).unwrap_err(),
            TreeError::DuplicatePeer(1)
        );
    }

    #[test]
    fn descriptor_rebuilds_same_tree() {
        let tree = Tree::new_nary(roster(20), 3, 5).unwrap();
        let rebuilt = Tree::from_descriptor(&tree.descriptor()).unwrap();
        assert_eq!(tree.id(), rebuilt.id());
        for (a, b) in tree.iter().zip(rebuilt.iter()) {
            assert_eq!(a.peer(), b.peer());
            assert_eq!(a.parent(), b.parent());
            assert_eq!(a.children(), b.children());
        }
    }

    #[test]
    fn single_node() {
        let tree = Tree::new_nary(roster(1), 8, 0).unwrap();
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().descendants(), 0);
        assert!(tree.is_root(TreeNodeIndex::ROOT));
        assert!(tree.children_of(TreeNodeIndex::new(5)).is_empty());
    }
}
