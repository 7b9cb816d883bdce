// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A dynamic texture atlas allocator based on guillotine cuts.
//!
//! Given a fixed canvas, [`Allocator`] packs rectangles of varying sizes and reclaims them
//! again once they are released. It is meant for texture atlases (glyph caches, image
//! caches) where entries come and go over time.
//!
//! # Usage
//!
//! ```
//! use vello_atlas::{Allocator, Rect, Size};
//!
//! let mut atlas = Allocator::new(Size::new(100, 100));
//!
//! let a = atlas.allocate(Size::new(40, 40));
//! assert_eq!(a.rect, Rect::new(0, 0, 40, 40));
//!
//! // The strip to the right of the first allocation is still whole.
//! let b = atlas.allocate(Size::new(60, 100));
//! assert_eq!(b.rect, Rect::new(40, 0, 60, 100));
//!
//! // Nothing else fits.
//! assert!(atlas.allocate(Size::new(50, 50)).is_null());
//!
//! atlas.deallocate(b.id).unwrap();
//! atlas.deallocate(a.id).unwrap();
//! assert!(atlas.is_empty());
//! ```
//!
//! # How it works
//!
//! The canvas is partitioned by a tree. Leaves are free or occupied rectangles. Allocating
//! picks the free leaf with the smallest residual dimension and cuts the request out of its
//! top-left corner, leaving up to two free strips behind. Children alternate their cut
//! axis with depth, and nodes sharing a parent form a doubly linked chain ordered along
//! that axis.
//!
//! Releasing an allocation merges it with free neighbours in its chain and collapses
//! parents that are left with a single child, cascading up the tree as far as possible.
//! Once everything is released the tree is back to a single free leaf.
//!
//! Allocation is best-fit over a linear scan of the free leaves, which keeps placement
//! deterministic: among equally good candidates the earliest created one wins.
//!
//! Failed allocations are not errors: [`Allocator::allocate`] returns a null
//! [`Allocation`] that must be checked with [`Allocation::is_null`].
// LINEBENDER LINT SET - lib.rs - v3
// See https://linebender.org/wiki/canonical-lints/
// These lints shouldn't apply to examples or tests.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
// These lints shouldn't apply to examples.
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

mod allocator;
mod coalesce;
pub mod geometry;
mod store;
mod validate;

pub use allocator::{AllocError, AllocId, Allocation, Allocator, AllocatorOptions};
pub use geometry::{Point, Rect, Size};
pub use store::NodeId;
pub use validate::Violation;
