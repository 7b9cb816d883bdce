// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Releasing allocations.
//!
//! A released leaf absorbs its free neighbours in the sibling chain. Once it is the only
//! child left, it is collapsed into its parent and the process repeats one level up, so
//! freeing the last allocation of a subtree turns the whole subtree back into one free
//! rectangle.

use crate::allocator::{AllocError, AllocId, Allocator};
use crate::store::{NodeId, NodeKind};

impl Allocator {
    /// Release an allocation previously returned by [`Allocator::allocate`].
    ///
    /// Fails with [`AllocError::InvalidHandle`], leaving the allocator untouched, if `id` is
    /// null, was never issued by this allocator or has already been released.
    pub fn deallocate(&mut self, id: AllocId) -> Result<(), AllocError> {
        let Some(node_id) = self.resolve(id) else {
            log::debug!("Refused to deallocate invalid handle {id:?}");
            return Err(AllocError::InvalidHandle(id));
        };

        self.nodes[node_id].kind = NodeKind::Free;
        self.coalesce(node_id);
        Ok(())
    }

    fn coalesce(&mut self, mut node_id: NodeId) {
        loop {
            // Siblings are sorted along the axis they were split on, so merging neighbours
            // always yields a rectangle.
            while self.merge_next_sibling(node_id) {}
            while self.merge_prev_sibling(node_id) {}

            let node = &self.nodes[node_id];
            if node.parent.is_none() || node.prev_sibling.is_some() || node.next_sibling.is_some()
            {
                break;
            }

            // The only child left covers its whole parent.
            let parent_id = node.parent;
            let rect = node.rect;
            debug_assert_eq!(
                self.nodes[parent_id].kind,
                NodeKind::Fork,
                "parent of unique child must be a fork"
            );
            debug_assert_eq!(
                self.nodes[parent_id].rect,
                rect,
                "unique child must cover its parent"
            );

            let parent = &mut self.nodes[parent_id];
            parent.rect = rect;
            parent.kind = NodeKind::Free;
            self.nodes.delete(node_id);
            log::trace!("Collapsed node {node_id:?} into its parent {parent_id:?}");

            node_id = parent_id;
        }
    }

    /// Absorb the next sibling if it is a free leaf.
    fn merge_next_sibling(&mut self, node_id: NodeId) -> bool {
        let next_id = self.nodes[node_id].next_sibling;
        if next_id.is_none() || !self.nodes[next_id].is_free_leaf() {
            return false;
        }

        let next = &self.nodes[next_id];
        let (next_rect, next_next) = (next.rect, next.next_sibling);

        let node = &mut self.nodes[node_id];
        node.rect = node.rect.union(next_rect);
        node.next_sibling = next_next;
        if next_next.is_some() {
            self.nodes[next_next].prev_sibling = node_id;
        }

        self.nodes.delete(next_id);
        log::trace!("Merged node {next_id:?} into {node_id:?}");
        true
    }

    /// Absorb the previous sibling if it is a free leaf.
    fn merge_prev_sibling(&mut self, node_id: NodeId) -> bool {
        let prev_id = self.nodes[node_id].prev_sibling;
        if prev_id.is_none() || !self.nodes[prev_id].is_free_leaf() {
            return false;
        }

        let prev = &self.nodes[prev_id];
        let (prev_rect, prev_prev) = (prev.rect, prev.prev_sibling);

        let node = &mut self.nodes[node_id];
        node.rect = node.rect.union(prev_rect);
        node.prev_sibling = prev_prev;
        if prev_prev.is_some() {
            self.nodes[prev_prev].next_sibling = node_id;
        }

        self.nodes.delete(prev_id);
        log::trace!("Merged node {prev_id:?} into {node_id:?}");
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::geometry::{Rect, Size};
    use crate::store::{NodeId, NodeKind};
    use crate::{AllocError, AllocId, Allocator, AllocatorOptions};

    fn upright(width: u32, height: u32) -> Allocator {
        Allocator::with_options(
            Size::new(width, height),
            AllocatorOptions {
                allow_transpose: false,
            },
        )
    }

    fn assert_pristine(alloc: &Allocator) {
        assert!(alloc.is_empty());
        assert_eq!(alloc.node_count(), 1);
        let root = &alloc.nodes[NodeId::ROOT];
        assert_eq!(root.kind, NodeKind::Free);
        assert_eq!(root.rect, Rect::from_size(alloc.size()));
        alloc.validate().unwrap();
    }

    #[test]
    fn deallocate_reclaims_space() {
        let mut alloc = upright(64, 64);
        let a = alloc.allocate(Size::new(64, 64));
        assert!(alloc.allocate(Size::new(1, 1)).is_null());
        alloc.deallocate(a.id).unwrap();
        let b = alloc.allocate(Size::new(64, 64));
        assert_eq!(b.rect, Rect::new(0, 0, 64, 64));
    }

    #[test]
    fn release_in_acquisition_order() {
        let mut alloc = upright(100, 100);
        let a = alloc.allocate(Size::new(40, 40));
        let b = alloc.allocate(Size::new(60, 100));
        alloc.deallocate(a.id).unwrap();

        // `a` absorbed its leftover and collapsed into the body fork.
        let body = NodeId::from_raw(4);
        assert_eq!(alloc.nodes[body].kind, NodeKind::Free);
        assert_eq!(alloc.nodes[body].rect, Rect::new(0, 0, 40, 100));
        assert_eq!(alloc.nodes[a.id.node()].kind, NodeKind::Deleted);
        assert_eq!(alloc.nodes[NodeId::from_raw(2)].kind, NodeKind::Deleted);
        assert_eq!(alloc.node_count(), 3);
        alloc.validate().unwrap();

        // `b` absorbs the free body in front of it, then collapses into the root.
        alloc.deallocate(b.id).unwrap();
        assert_pristine(&alloc);
    }

    #[test]
    fn release_in_reverse_order() {
        let mut alloc = upright(100, 100);
        let a = alloc.allocate(Size::new(40, 40));
        let b = alloc.allocate(Size::new(60, 100));

        // The body in front of `b` is still a fork, so nothing merges.
        alloc.deallocate(b.id).unwrap();
        assert_eq!(alloc.nodes[b.id.node()].kind, NodeKind::Free);
        assert_eq!(alloc.node_count(), 5);
        alloc.validate().unwrap();

        // The body becomes free one level up and absorbs `b`'s strip.
        alloc.deallocate(a.id).unwrap();
        assert_pristine(&alloc);
    }

    #[test]
    fn occupied_neighbours_block_merging() {
        let mut alloc = upright(90, 30);
        let a = alloc.allocate(Size::new(30, 30));
        let b = alloc.allocate(Size::new(30, 30));
        let c = alloc.allocate(Size::new(30, 30));
        assert_eq!(b.rect, Rect::new(30, 0, 30, 30));
        assert_eq!(c.rect, Rect::new(60, 0, 30, 30));

        alloc.deallocate(b.id).unwrap();
        let mut free = Vec::new();
        alloc.for_each_free_rect(|rect| free.push(rect));
        assert_eq!(free, vec![Rect::new(30, 0, 30, 30)]);
        alloc.validate().unwrap();

        alloc.deallocate(a.id).unwrap();
        alloc.validate().unwrap();
        alloc.deallocate(c.id).unwrap();
        assert_pristine(&alloc);
    }

    #[test]
    fn collapse_cascades_to_the_root() {
        let mut alloc = upright(100, 100);
        let mut ids = Vec::new();
        for _ in 0..4 {
            for _ in 0..4 {
                let a = alloc.allocate(Size::new(25, 25));
                assert!(!a.is_null());
                ids.push(a.id);
            }
        }
        assert!(alloc.allocate(Size::new(1, 1)).is_null());
        assert_eq!(alloc.free_area(), 0);

        for id in ids {
            alloc.deallocate(id).unwrap();
            alloc.validate().unwrap();
        }
        assert_pristine(&alloc);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut alloc = upright(64, 64);
        let a = alloc.allocate(Size::new(10, 10));
        alloc.allocate(Size::new(20, 20));
        alloc.deallocate(a.id).unwrap();
        let nodes = alloc.node_count();
        assert_eq!(
            alloc.deallocate(a.id),
            Err(AllocError::InvalidHandle(a.id))
        );
        assert_eq!(alloc.node_count(), nodes);
        alloc.validate().unwrap();
    }

    #[test]
    fn stale_handle_to_a_reoccupied_node_is_rejected() {
        let mut alloc = upright(64, 64);
        let a = alloc.allocate(Size::new(64, 64));
        alloc.deallocate(a.id).unwrap();
        let b = alloc.allocate(Size::new(64, 64));
        assert_eq!(a.id.node(), b.id.node());
        assert_ne!(a.id, b.id);

        assert_eq!(
            alloc.deallocate(a.id),
            Err(AllocError::InvalidHandle(a.id))
        );
        assert_eq!(alloc.get(b.id), Some(Rect::new(0, 0, 64, 64)));
        alloc.deallocate(b.id).unwrap();
        assert_pristine(&alloc);
    }

    #[test]
    fn stale_handle_outlives_many_reoccupations() {
        let mut alloc = upright(64, 64);
        let first = alloc.allocate(Size::new(64, 64));
        alloc.deallocate(first.id).unwrap();

        for _ in 0..300 {
            let a = alloc.allocate(Size::new(64, 64));
            assert_eq!(a.id.node(), first.id.node());
            assert_ne!(a.id, first.id);
            alloc.deallocate(a.id).unwrap();
        }

        let live = alloc.allocate(Size::new(64, 64));
        assert_eq!(
            alloc.deallocate(first.id),
            Err(AllocError::InvalidHandle(first.id))
        );
        assert_eq!(alloc.get(live.id), Some(Rect::new(0, 0, 64, 64)));
        assert!(alloc.allocate(Size::new(1, 1)).is_null());
        alloc.deallocate(live.id).unwrap();
        assert_pristine(&alloc);
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let mut alloc = upright(64, 64);
        alloc.allocate(Size::new(10, 10));
        assert!(alloc.deallocate(AllocId::NULL).is_err());
        assert!(alloc.deallocate(AllocId::from_u64(1234)).is_err());
        // The root is a fork now, not an allocation.
        assert!(alloc.deallocate(AllocId::from_u64(0)).is_err());
        alloc.validate().unwrap();
    }
}
