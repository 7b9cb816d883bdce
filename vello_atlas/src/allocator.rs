// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The allocator front-end and its placement engine.
//!
//! Allocation picks the free leaf that fits the request most snugly and carves it with a
//! guillotine cut. Releasing space is the job of [`Allocator::deallocate`].

use thiserror::Error;

use crate::geometry::{Rect, Size};
use crate::store::{Node, NodeId, NodeKind, NodeStore, Orientation};

/// The root starts out cut by a vertical line, so the first split strip lies to the right
/// of the first allocation.
const ROOT_ORIENTATION: Orientation = Orientation::Vertical;

const IDX_MASK: u64 = 0xFFFF_FFFF;
const GEN_SHIFT: u32 = 32;

/// Options to fine tune the behavior of an [`Allocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// Place a request rotated by 90 degrees when it does not fit upright.
    ///
    /// Allocations placed this way have [`Allocation::transposed`] set.
    pub allow_transpose: bool,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            allow_transpose: true,
        }
    }
}

/// Handle of a live allocation, to be passed back to [`Allocator::deallocate`].
///
/// The low 32 bits address the node holding the allocation, the high 32 bits carry the
/// generation of that node so that stale handles are detected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AllocId(u64);

impl AllocId {
    /// The null handle, carried by failed allocations.
    pub const NULL: Self = Self(u64::MAX);

    fn new(node: NodeId, generation: u32) -> Self {
        Self(u64::from(node.to_u32()) | (u64::from(generation) << GEN_SHIFT))
    }

    /// Whether this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// The node that holds this allocation, or [`NodeId::NONE`] for the null handle.
    pub const fn node(self) -> NodeId {
        if self.is_null() {
            NodeId::NONE
        } else {
            NodeId::from_raw((self.0 & IDX_MASK) as u32)
        }
    }

    fn generation(self) -> u32 {
        (self.0 >> GEN_SHIFT) as u32
    }

    /// The packed representation, for storage outside of Rust (e.g. in a GPU buffer).
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from [`AllocId::to_u64`].
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// The outcome of [`Allocator::allocate`].
///
/// A failed request yields a null allocation; check [`Allocation::is_null`] before using
/// the rectangle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Where the request was placed. Meaningless for a null allocation.
    pub rect: Rect,
    /// Handle used to release the space again.
    pub id: AllocId,
    /// Whether the request was placed with width and height swapped.
    pub transposed: bool,
}

impl Allocation {
    /// The allocation returned for requests that could not be satisfied.
    pub const NULL: Self = Self {
        rect: Rect::new(0, 0, 0, 0),
        id: AllocId::NULL,
        transposed: false,
    };

    /// Whether the request failed.
    pub const fn is_null(&self) -> bool {
        self.id.is_null()
    }
}

impl Default for Allocation {
    fn default() -> Self {
        Self::NULL
    }
}

/// Errors reported by the allocator.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The handle is null, was never issued, or its allocation was already released.
    #[error("Invalid allocation handle {0:?}")]
    InvalidHandle(AllocId),
    /// A canvas needs a positive width and height.
    #[error("Cannot create an allocator for an empty {width}x{height} canvas")]
    EmptyCanvas {
        /// The requested canvas width.
        width: u32,
        /// The requested canvas height.
        height: u32,
    },
}

/// A dynamic texture atlas allocator using the guillotine algorithm with tree-based coalescing.
///
/// The canvas is partitioned by a tree whose leaves are free or occupied rectangles and whose
/// inner nodes ("forks") are rectangles that have been carved. Leaves sharing a parent form
/// a doubly linked sibling chain ordered along their cut axis, which lets neighbouring free
/// leaves merge in O(1) once space is released.
///
/// If no free space fits a request, a null [`Allocation`] is returned.
pub struct Allocator {
    pub(crate) nodes: NodeStore,
    pub(crate) size: Size,
    pub(crate) options: AllocatorOptions,
}

impl Allocator {
    /// Create an allocator for a canvas of the given size, with default options.
    ///
    /// # Panics
    ///
    /// If the canvas has no area. Use [`Allocator::try_new`] to handle this case.
    pub fn new(size: Size) -> Self {
        Self::with_options(size, AllocatorOptions::default())
    }

    /// Create an allocator for a canvas of the given size.
    ///
    /// # Panics
    ///
    /// If the canvas has no area. Use [`Allocator::try_with_options`] to handle this case.
    pub fn with_options(size: Size, options: AllocatorOptions) -> Self {
        assert!(size.width > 0, "atlas width must be positive");
        assert!(size.height > 0, "atlas height must be positive");
        Self::build(size, options)
    }

    /// Create an allocator with default options, failing on an empty canvas.
    pub fn try_new(size: Size) -> Result<Self, AllocError> {
        Self::try_with_options(size, AllocatorOptions::default())
    }

    /// Create an allocator, failing on an empty canvas.
    pub fn try_with_options(size: Size, options: AllocatorOptions) -> Result<Self, AllocError> {
        if size.is_empty() {
            return Err(AllocError::EmptyCanvas {
                width: size.width,
                height: size.height,
            });
        }
        Ok(Self::build(size, options))
    }

    fn build(size: Size, options: AllocatorOptions) -> Self {
        Self {
            nodes: NodeStore::with_root(Rect::from_size(size), ROOT_ORIENTATION),
            size,
            options,
        }
    }

    /// The canvas size, constant for the lifetime of the allocator.
    pub fn size(&self) -> Size {
        self.size
    }

    /// The options this allocator was created with.
    pub fn options(&self) -> AllocatorOptions {
        self.options
    }

    /// Allocate a rectangle of the requested size.
    ///
    /// Returns a null allocation if the request has no area or if no free space can hold
    /// it, in which case the allocator is left untouched.
    pub fn allocate(&mut self, requested_size: Size) -> Allocation {
        if requested_size.is_empty() {
            log::debug!("Rejected allocation request with an empty size {requested_size}");
            return Allocation::NULL;
        }

        let Some((selected_id, size, transposed)) = self.select(requested_size) else {
            log::debug!("No free space for an allocation of {requested_size}");
            return Allocation::NULL;
        };

        let Some(allocated_id) = self.place(selected_id, size) else {
            log::warn!("Ran out of node handles while allocating {requested_size}");
            return Allocation::NULL;
        };

        Allocation {
            rect: self.nodes[allocated_id].rect,
            id: AllocId::new(allocated_id, self.nodes.generation(allocated_id)),
            transposed,
        }
    }

    /// The rectangle of a live allocation.
    pub fn get(&self, id: AllocId) -> Option<Rect> {
        self.resolve(id).map(|node_id| self.nodes[node_id].rect)
    }

    /// Whether nothing is currently allocated.
    pub fn is_empty(&self) -> bool {
        self.nodes[NodeId::ROOT].kind == NodeKind::Free
    }

    /// Release every allocation at once, returning to a single free root leaf.
    ///
    /// All outstanding handles become invalid.
    pub fn clear(&mut self) {
        self.nodes
            .reset(Rect::from_size(self.size), ROOT_ORIENTATION);
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::Occupied)
            .count()
    }

    /// Total area covered by live allocations.
    pub fn allocated_area(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::Occupied)
            .map(|(_, node)| node.rect.area())
            .sum()
    }

    /// Total area available to future allocations.
    pub fn free_area(&self) -> u64 {
        self.size.area() - self.allocated_area()
    }

    /// Number of nodes in the tree, forks included.
    pub fn node_count(&self) -> usize {
        self.nodes.live_count()
    }

    /// Invoke `callback` for every live allocation, in handle order.
    pub fn for_each_allocated_rect(&self, mut callback: impl FnMut(AllocId, Rect)) {
        for (id, node) in self.nodes.iter() {
            if node.kind == NodeKind::Occupied {
                callback(AllocId::new(id, self.nodes.generation(id)), node.rect);
            }
        }
    }

    /// Invoke `callback` for every free rectangle, in handle order.
    pub fn for_each_free_rect(&self, mut callback: impl FnMut(Rect)) {
        for (_, node) in self.nodes.iter() {
            if node.is_free_leaf() {
                callback(node.rect);
            }
        }
    }

    /// Map a handle to the occupied leaf it designates, if it is still live.
    pub(crate) fn resolve(&self, id: AllocId) -> Option<NodeId> {
        if id.is_null() {
            return None;
        }
        let node_id = id.node();
        let node = self.nodes.get(node_id)?;
        (node.kind == NodeKind::Occupied && self.nodes.generation(node_id) == id.generation())
            .then_some(node_id)
    }

    /// Pick a free leaf for the request, rotating it if allowed and necessary.
    fn select(&self, requested_size: Size) -> Option<(NodeId, Size, bool)> {
        if let Some(id) = self.select_free_node(requested_size) {
            return Some((id, requested_size, false));
        }

        let transposed = requested_size.transposed();
        if !self.options.allow_transpose || transposed == requested_size {
            return None;
        }
        self.select_free_node(transposed)
            .map(|id| (id, transposed, true))
    }

    /// Best-fit search over the free leaves.
    ///
    /// The score of a candidate is its smaller residual dimension. Ties go to the lowest
    /// handle.
    fn select_free_node(&self, size: Size) -> Option<NodeId> {
        let mut candidate = None;
        let mut candidate_score = u32::MAX;

        for (id, node) in self.nodes.iter() {
            if !node.is_free_leaf() {
                continue;
            }

            let available = node.rect.size();
            if !available.contains(size) {
                continue;
            }

            let score = u32::min(available.width - size.width, available.height - size.height);
            if candidate.is_none() || score < candidate_score {
                candidate = Some(id);
                candidate_score = score;
                if score == 0 {
                    // Nothing later in the scan can beat it.
                    break;
                }
            }
        }

        candidate
    }

    /// Carve `size` out of the free leaf `selected_id` and return the occupied leaf.
    ///
    /// Returns `None`, without touching the tree, if there are not enough node handles left.
    fn place(&mut self, selected_id: NodeId, size: Size) -> Option<NodeId> {
        let selected = self.nodes[selected_id].clone();
        debug_assert_eq!(
            selected.kind,
            NodeKind::Free,
            "selected node must be a free leaf"
        );

        if selected.rect.size() == size {
            self.nodes.occupy(selected_id);
            log::trace!("Exact fit for {size} in node {selected_id:?}");
            return Some(selected_id);
        }

        let (allocated_rect, leftover_rect, split_rect) =
            guillotine_rect(selected.rect, size, selected.orientation);

        // The root has no sibling chain to receive the split strip. It keeps spanning the
        // canvas and the carved region moves into a new "body" fork underneath it.
        let needs_body = selected.parent.is_none() && !split_rect.is_empty();

        let required = 1
            + usize::from(!leftover_rect.is_empty())
            + usize::from(!split_rect.is_empty())
            + usize::from(needs_body);
        if !self.nodes.can_create(required) {
            return None;
        }

        // Zero-area rectangles never become nodes.
        let child_orientation = selected.orientation.flipped();
        let allocated_id = self
            .nodes
            .create(Node::free(allocated_rect, child_orientation))?;
        let leftover_id = if leftover_rect.is_empty() {
            NodeId::NONE
        } else {
            self.nodes
                .create(Node::free(leftover_rect, child_orientation))?
        };
        let split_id = if split_rect.is_empty() {
            NodeId::NONE
        } else {
            self.nodes
                .create(Node::free(split_rect, selected.orientation))?
        };

        let carved_rect = allocated_rect.union(leftover_rect);
        let fork_id = if needs_body {
            let body_id = self.nodes.create(Node {
                parent: selected_id,
                kind: NodeKind::Fork,
                ..Node::free(carved_rect, selected.orientation)
            })?;
            self.nodes[selected_id].kind = NodeKind::Fork;
            log::trace!("Moved the carved root region into body node {body_id:?}");
            body_id
        } else {
            let fork = &mut self.nodes[selected_id];
            fork.kind = NodeKind::Fork;
            fork.rect = carved_rect;
            selected_id
        };

        self.nodes[allocated_id].parent = fork_id;
        self.nodes[allocated_id].next_sibling = leftover_id;
        if leftover_id.is_some() {
            let leftover = &mut self.nodes[leftover_id];
            leftover.parent = fork_id;
            leftover.prev_sibling = allocated_id;
        }

        // The split strip spans the whole extent of the selected node, so it becomes a peer of the fork
        // rather than one of its children.
        if split_id.is_some() {
            let parent = self.nodes[fork_id].parent;
            let next_sibling = self.nodes[fork_id].next_sibling;
            let split = &mut self.nodes[split_id];
            split.parent = parent;
            split.prev_sibling = fork_id;
            split.next_sibling = next_sibling;

            self.nodes[fork_id].next_sibling = split_id;
            if next_sibling.is_some() {
                self.nodes[next_sibling].prev_sibling = split_id;
            }
        }

        self.nodes.occupy(allocated_id);
        log::trace!(
            "Split node {selected_id:?}: allocated {allocated_rect} as {allocated_id:?}, \
             leftover {leftover_rect}, split {split_rect}"
        );
        Some(allocated_id)
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("size", &self.size)
            .field("options", &self.options)
            .field("nodes", &self.nodes)
            .finish()
    }
}

/// Cut `size` out of the top-left corner of `bounds`.
///
/// Returns the allocated rectangle, the leftover strip next to it along the cut axis, and
/// the split strip spanning the rest of `bounds`. Either strip may be empty.
fn guillotine_rect(bounds: Rect, size: Size, orientation: Orientation) -> (Rect, Rect, Rect) {
    let allocated_rect = Rect::from_origin_size(bounds.origin(), size);

    match orientation {
        Orientation::Vertical => {
            let leftover_rect = Rect::new(
                bounds.x,
                bounds.y + size.height,
                size.width,
                bounds.height - size.height,
            );
            let split_rect = Rect::new(
                bounds.x + size.width,
                bounds.y,
                bounds.width - size.width,
                bounds.height,
            );
            (allocated_rect, leftover_rect, split_rect)
        }
        Orientation::Horizontal => {
            let leftover_rect = Rect::new(
                bounds.x + size.width,
                bounds.y,
                bounds.width - size.width,
                size.height,
            );
            let split_rect = Rect::new(
                bounds.x,
                bounds.y + size.height,
                bounds.width,
                bounds.height - size.height,
            );
            (allocated_rect, leftover_rect, split_rect)
        }
    }
}
