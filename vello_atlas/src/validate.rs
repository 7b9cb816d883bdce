// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Structural checks of the allocation tree.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::allocator::Allocator;
use crate::geometry::Rect;
use crate::store::{Node, NodeId, NodeKind, Orientation};

/// A broken invariant found by [`Allocator::validate`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Violation {
    /// The root is linked to a parent or siblings, or does not span the canvas.
    #[error("Root node is detached from the canvas: {0}")]
    Root(Rect),
    /// A fork does not have exactly one first child.
    #[error("Fork {fork:?} has {heads} child chains")]
    ChildChains {
        /// The fork.
        fork: NodeId,
        /// How many children have no previous sibling.
        heads: usize,
    },
    /// A link points to a deleted or missing node, or prev/next links disagree.
    #[error("Broken link at node {0:?}")]
    BrokenLink(NodeId),
    /// A node was reached twice while walking the tree.
    #[error("Node {0:?} is reachable more than once")]
    Cycle(NodeId),
    /// A live node cannot be reached from the root.
    #[error("Node {0:?} is not reachable from the root")]
    Unreachable(NodeId),
    /// Two consecutive siblings do not touch along their axis.
    #[error("Siblings {first:?} and {second:?} are not adjacent")]
    NotAdjacent {
        /// The earlier sibling.
        first: NodeId,
        /// The later sibling.
        second: NodeId,
    },
    /// Two consecutive siblings are both free leaves and should have been merged.
    #[error("Free siblings {first:?} and {second:?} were not merged")]
    Unmerged {
        /// The earlier sibling.
        first: NodeId,
        /// The later sibling.
        second: NodeId,
    },
    /// The children of a fork do not cover exactly its rectangle.
    #[error("Children of fork {0:?} do not cover it")]
    ForkCoverage(NodeId),
    /// A fork whose only child is a free leaf was not collapsed.
    #[error("Fork {0:?} has a single child that was not collapsed")]
    Uncollapsed(NodeId),
    /// Two leaves overlap.
    #[error("Leaves {first:?} and {second:?} overlap")]
    Overlap {
        /// One of the leaves.
        first: NodeId,
        /// The other leaf.
        second: NodeId,
    },
    /// The leaves do not cover the canvas.
    #[error("Leaves cover {covered} of {canvas} canvas pixels")]
    Coverage {
        /// Total area of all leaves.
        covered: u64,
        /// Area of the canvas.
        canvas: u64,
    },
}

impl Allocator {
    /// Check the structure of the allocation tree.
    ///
    /// The root spans the canvas and every live node is reachable from it exactly once.
    /// Sibling chains are doubly linked, adjacent along their axis and cover their parent.
    /// Leaves tile the canvas without overlapping. A free leaf never sits next to another
    /// free leaf, and a free subtree is always collapsed into a single leaf.
    ///
    /// This walks the whole tree and is meant for tests and debugging.
    pub fn validate(&self) -> Result<(), Violation> {
        let canvas = Rect::from_size(self.size);
        let root = &self.nodes[NodeId::ROOT];
        if root.kind == NodeKind::Deleted
            || root.parent.is_some()
            || root.prev_sibling.is_some()
            || root.next_sibling.is_some()
            || root.rect != canvas
        {
            return Err(Violation::Root(root.rect));
        }

        // First children, keyed by their parent.
        let mut heads: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in self.nodes.iter() {
            if id != NodeId::ROOT && node.prev_sibling.is_none() {
                heads.entry(node.parent).or_default().push(id);
            }
        }

        let mut visited = BTreeSet::new();
        let mut pending = vec![NodeId::ROOT];
        visited.insert(NodeId::ROOT);
        while let Some(fork_id) = pending.pop() {
            let fork = &self.nodes[fork_id];
            if fork.kind != NodeKind::Fork {
                continue;
            }

            let chain_heads = heads.get(&fork_id).map_or(&[][..], Vec::as_slice);
            let [head] = chain_heads else {
                return Err(Violation::ChildChains {
                    fork: fork_id,
                    heads: chain_heads.len(),
                });
            };

            let mut covered = Rect::default();
            let mut prev_id = NodeId::NONE;
            let mut node_id = *head;
            while node_id.is_some() {
                let node = self.live(node_id)?;
                if node.parent != fork_id || node.prev_sibling != prev_id {
                    return Err(Violation::BrokenLink(node_id));
                }
                if !visited.insert(node_id) {
                    return Err(Violation::Cycle(node_id));
                }
                if prev_id.is_some() {
                    let prev = &self.nodes[prev_id];
                    if !adjacent(prev, node) {
                        return Err(Violation::NotAdjacent {
                            first: prev_id,
                            second: node_id,
                        });
                    }
                    if prev.is_free_leaf() && node.is_free_leaf() {
                        return Err(Violation::Unmerged {
                            first: prev_id,
                            second: node_id,
                        });
                    }
                }

                covered = covered.union(node.rect);
                pending.push(node_id);
                prev_id = node_id;
                node_id = node.next_sibling;
            }

            if covered != fork.rect {
                return Err(Violation::ForkCoverage(fork_id));
            }
            if *head == prev_id && self.nodes[*head].is_free_leaf() {
                return Err(Violation::Uncollapsed(fork_id));
            }
        }

        if let Some((id, _)) = self.nodes.iter().find(|(id, _)| !visited.contains(id)) {
            return Err(Violation::Unreachable(id));
        }

        let leaves: Vec<(NodeId, Rect)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.is_leaf())
            .map(|(id, node)| (id, node.rect))
            .collect();
        for (i, &(first, a)) in leaves.iter().enumerate() {
            for &(second, b) in &leaves[i + 1..] {
                if a.intersects(b) {
                    return Err(Violation::Overlap { first, second });
                }
            }
        }

        let covered: u64 = leaves.iter().map(|(_, rect)| rect.area()).sum();
        if covered != canvas.area() || leaves.iter().any(|(_, rect)| !canvas.contains_rect(*rect)) {
            return Err(Violation::Coverage {
                covered,
                canvas: canvas.area(),
            });
        }

        Ok(())
    }

    fn live(&self, id: NodeId) -> Result<&Node, Violation> {
        match self.nodes.get(id) {
            Some(node) if node.kind != NodeKind::Deleted => Ok(node),
            _ => Err(Violation::BrokenLink(id)),
        }
    }
}

/// Whether `second` directly follows `first` along their sibling axis.
fn adjacent(first: &Node, second: &Node) -> bool {
    let (a, b) = (first.rect, second.rect);
    if first.orientation != second.orientation {
        return false;
    }
    match first.orientation {
        Orientation::Vertical => a.right() == b.x && a.y == b.y && a.height == b.height,
        Orientation::Horizontal => a.bottom() == b.y && a.x == b.x && a.width == b.width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    fn populated() -> Allocator {
        let mut alloc = Allocator::new(Size::new(100, 100));
        alloc.allocate(Size::new(40, 40));
        alloc.allocate(Size::new(30, 30));
        alloc.allocate(Size::new(50, 20));
        alloc.validate().unwrap();
        alloc
    }

    #[test]
    fn fresh_allocator_is_valid() {
        Allocator::new(Size::new(1, 1)).validate().unwrap();
    }

    #[test]
    fn detects_overlapping_leaves() {
        let mut alloc = populated();
        let leaf = alloc
            .nodes
            .iter()
            .find(|(_, node)| node.kind == NodeKind::Occupied)
            .map(|(id, _)| id)
            .unwrap();
        alloc.nodes[leaf].rect.width += 1;
        assert!(alloc.validate().is_err());
    }

    #[test]
    fn detects_broken_prev_link() {
        let mut alloc = populated();
        let (id, _) = alloc
            .nodes
            .iter()
            .find(|(_, node)| node.prev_sibling.is_some())
            .unwrap();
        alloc.nodes[id].prev_sibling = NodeId::NONE;
        assert!(matches!(
            alloc.validate(),
            Err(Violation::ChildChains { heads: 2, .. })
        ));
    }

    #[test]
    fn detects_unmerged_free_siblings() {
        let mut alloc = Allocator::new(Size::new(100, 100));
        let a = alloc.allocate(Size::new(40, 40));
        // Free `a` behind the allocator's back, next to its free leftover.
        alloc.nodes[a.id.node()].kind = NodeKind::Free;
        let leftover = alloc.nodes[a.id.node()].next_sibling;
        assert_eq!(
            alloc.validate(),
            Err(Violation::Unmerged {
                first: a.id.node(),
                second: leftover,
            })
        );
    }

    #[test]
    fn detects_detached_root() {
        let mut alloc = populated();
        alloc.nodes[NodeId::ROOT].rect = Rect::new(0, 0, 10, 10);
        assert_eq!(
            alloc.validate(),
            Err(Violation::Root(Rect::new(0, 0, 10, 10)))
        );
    }
}
