// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The node arena backing the allocation tree.
//!
//! Nodes are addressed by [`NodeId`] handles rather than pointers. Slots are never
//! removed from the arena; deleting a node marks its slot as reusable and the next
//! node creation picks the lowest reusable slot.

use std::collections::BTreeSet;
use std::ops::{Index, IndexMut};

use crate::geometry::Rect;

/// Handle of a node in the allocation tree.
///
/// [`NodeId::NONE`] is the null handle, used for absent parents and siblings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The null handle.
    pub const NONE: Self = Self(u32::MAX);

    /// The root node always lives in the first slot.
    pub(crate) const ROOT: Self = Self(0);

    /// Exclusive upper bound of slot indices, keeping every slot distinct from [`NodeId::NONE`].
    pub(crate) const MAX_INDEX: u32 = u32::MAX;

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw slot index.
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the null handle.
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    /// Whether this is a non-null handle.
    pub const fn is_some(self) -> bool {
        !self.is_none()
    }
}

/// The axis along which a node is cut when it gets carved.
///
/// A `Vertical` node is cut by a vertical line: its split strip ends up to its right, so
/// its sibling chain runs left to right. `Horizontal` nodes chain top to bottom.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Orientation {
    Vertical,
    Horizontal,
}

impl Orientation {
    pub(crate) fn flipped(self) -> Self {
        match self {
            Self::Vertical => Self::Horizontal,
            Self::Horizontal => Self::Vertical,
        }
    }
}

/// What a node currently represents.
///
/// `Free` and `Occupied` are the two states of a leaf. A `Fork` has been subdivided and
/// only serves as bookkeeping for its children. `Deleted` slots are unreachable and
/// wait for reuse.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum NodeKind {
    Fork,
    Free,
    Occupied,
    Deleted,
}

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) parent: NodeId,
    pub(crate) prev_sibling: NodeId,
    pub(crate) next_sibling: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) orientation: Orientation,
    pub(crate) rect: Rect,
}

impl Node {
    /// A detached free leaf.
    pub(crate) fn free(rect: Rect, orientation: Orientation) -> Self {
        Self {
            parent: NodeId::NONE,
            prev_sibling: NodeId::NONE,
            next_sibling: NodeId::NONE,
            kind: NodeKind::Free,
            orientation,
            rect,
        }
    }

    fn deleted() -> Self {
        Self {
            kind: NodeKind::Deleted,
            ..Self::free(Rect::default(), Orientation::Vertical)
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Free | NodeKind::Occupied)
    }

    pub(crate) fn is_free_leaf(&self) -> bool {
        self.kind == NodeKind::Free
    }
}

/// Growable arena of nodes with slot reuse.
pub(crate) struct NodeStore {
    nodes: Vec<Node>,
    /// One generation per slot ever created, bumped each time the slot becomes occupied.
    ///
    /// This outlives [`NodeStore::reset`] so that handles issued before a reset stay stale.
    generations: Vec<u32>,
    /// Deleted slots, ordered so that the lowest one is reused first.
    deleted: BTreeSet<u32>,
}

impl NodeStore {
    /// Create a store whose only node is a free root leaf covering `rect`.
    pub(crate) fn with_root(rect: Rect, orientation: Orientation) -> Self {
        Self {
            nodes: vec![Node::free(rect, orientation)],
            generations: vec![0],
            deleted: BTreeSet::new(),
        }
    }

    /// Drop every node but a fresh free root leaf covering `rect`.
    pub(crate) fn reset(&mut self, rect: Rect, orientation: Orientation) {
        self.nodes.clear();
        self.nodes.push(Node::free(rect, orientation));
        self.deleted.clear();
    }

    /// Number of slots, deleted ones included.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Number of slots holding a reachable node.
    pub(crate) fn live_count(&self) -> usize {
        self.len() - self.deleted.len()
    }

    /// Whether `count` more nodes can be created before running out of handles.
    pub(crate) fn can_create(&self, count: usize) -> bool {
        let fresh = NodeId::MAX_INDEX as usize - self.len();
        self.deleted.len() + fresh >= count
    }

    /// Store `node` in the lowest deleted slot, or in a new slot at the end.
    ///
    /// Returns `None` once the handle space is exhausted.
    pub(crate) fn create(&mut self, node: Node) -> Option<NodeId> {
        debug_assert_ne!(
            node.kind,
            NodeKind::Deleted,
            "created nodes must be reachable"
        );

        if let Some(slot) = self.deleted.pop_first() {
            debug_assert_eq!(
                self.nodes[slot as usize].kind,
                NodeKind::Deleted,
                "reused slot must have been deleted"
            );
            self.nodes[slot as usize] = node;
            return Some(NodeId(slot));
        }

        let slot = u32::try_from(self.nodes.len()).ok()?;
        if slot >= NodeId::MAX_INDEX {
            return None;
        }
        self.nodes.push(node);
        if self.generations.len() < self.nodes.len() {
            self.generations.push(0);
        }
        Some(NodeId(slot))
    }

    /// Mark the slot as deleted. Its links are cleared and it becomes eligible for reuse.
    pub(crate) fn delete(&mut self, id: NodeId) {
        debug_assert_ne!(id, NodeId::ROOT, "the root is never deleted");
        debug_assert_ne!(
            self.nodes[id.index()].kind,
            NodeKind::Deleted,
            "node deleted twice"
        );
        self.nodes[id.index()] = Node::deleted();
        self.deleted.insert(id.0);
    }

    /// Turn a free leaf into an occupied one, invalidating handles to its previous occupancy.
    pub(crate) fn occupy(&mut self, id: NodeId) {
        debug_assert_eq!(
            self.nodes[id.index()].kind,
            NodeKind::Free,
            "only free leaves can be occupied"
        );
        self.nodes[id.index()].kind = NodeKind::Occupied;
        let generation = &mut self.generations[id.index()];
        *generation = generation.wrapping_add(1);
    }

    pub(crate) fn generation(&self, id: NodeId) -> u32 {
        self.generations[id.index()]
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        if id.is_none() {
            return None;
        }
        self.nodes.get(id.index())
    }

    /// Iterate over all nodes that have not been deleted, in handle order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.kind != NodeKind::Deleted)
            .map(|(idx, node)| (NodeId(idx as u32), node))
    }
}

impl Index<NodeId> for NodeStore {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

impl IndexMut<NodeId> for NodeStore {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("len", &self.nodes.len())
            .field("live", &self.live_count())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NodeStore {
        NodeStore::with_root(Rect::new(0, 0, 64, 64), Orientation::Vertical)
    }

    fn leaf() -> Node {
        Node::free(Rect::new(0, 0, 1, 1), Orientation::Horizontal)
    }

    #[test]
    fn root_occupies_first_slot() {
        let store = store();
        assert_eq!(store.len(), 1);
        assert_eq!(store[NodeId::ROOT].kind, NodeKind::Free);
        assert!(store[NodeId::ROOT].parent.is_none());
    }

    #[test]
    fn create_appends_when_nothing_was_deleted() {
        let mut store = store();
        assert_eq!(store.create(leaf()), Some(NodeId(1)));
        assert_eq!(store.create(leaf()), Some(NodeId(2)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn create_reuses_lowest_deleted_slot() {
        let mut store = store();
        for _ in 0..4 {
            store.create(leaf()).unwrap();
        }
        store.delete(NodeId(3));
        store.delete(NodeId(1));
        assert_eq!(store.live_count(), 3);

        assert_eq!(store.create(leaf()), Some(NodeId(1)));
        assert_eq!(store.create(leaf()), Some(NodeId(3)));
        assert_eq!(store.create(leaf()), Some(NodeId(5)));
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn consecutive_creates_never_share_a_slot() {
        let mut store = store();
        let a = store.create(leaf()).unwrap();
        let b = store.create(leaf()).unwrap();
        store.delete(a);
        store.delete(b);
        let c = store.create(leaf()).unwrap();
        let d = store.create(leaf()).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn deleted_nodes_are_skipped_by_iteration() {
        let mut store = store();
        let a = store.create(leaf()).unwrap();
        let b = store.create(leaf()).unwrap();
        store.delete(a);
        let ids: Vec<_> = store.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![NodeId::ROOT, b]);
        assert!(!store[a].is_leaf());
    }

    #[test]
    fn occupy_bumps_generation() {
        let mut store = store();
        let id = store.create(leaf()).unwrap();
        let before = store.generation(id);
        store.occupy(id);
        assert_eq!(store[id].kind, NodeKind::Occupied);
        assert_eq!(store.generation(id), before.wrapping_add(1));
    }

    #[test]
    fn generations_do_not_wrap_after_a_byte() {
        let mut store = store();
        let id = store.create(leaf()).unwrap();
        for _ in 0..300 {
            store.occupy(id);
            store[id].kind = NodeKind::Free;
        }
        assert_eq!(store.generation(id), 300);
    }

    #[test]
    fn generations_survive_reset() {
        let mut store = store();
        let id = store.create(leaf()).unwrap();
        store.occupy(id);
        let generation = store.generation(id);

        store.reset(Rect::new(0, 0, 64, 64), Orientation::Vertical);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).map(|node| node.kind), None);

        let again = store.create(leaf()).unwrap();
        assert_eq!(again, id);
        assert_eq!(store.generation(again), generation);
    }

    #[test]
    fn null_handle_resolves_to_nothing() {
        let store = store();
        assert!(NodeId::NONE.is_none());
        assert!(store.get(NodeId::NONE).is_none());
        assert!(store.get(NodeId(17)).is_none());
    }

    #[test]
    fn capacity_accounts_for_deleted_slots() {
        let mut store = store();
        let a = store.create(leaf()).unwrap();
        store.delete(a);
        let fresh = NodeId::MAX_INDEX as usize - store.len();
        assert!(store.can_create(fresh + 1));
        assert!(!store.can_create(fresh + 2));
    }
}
