// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal integer geometry used by the allocator.
//!
//! All coordinates are in canvas space, with the origin at the top-left corner
//! and `y` growing downwards.

use std::fmt;

/// A width and a height, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    /// Extent along the x axis.
    pub width: u32,
    /// Extent along the y axis.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether this size covers no area.
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The covered area.
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// The same size with width and height swapped.
    #[must_use]
    pub const fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Whether both dimensions of `other` fit inside `self`.
    pub const fn contains(self, other: Self) -> bool {
        other.width <= self.width && other.height <= self.height
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width, height)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A position on the canvas.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: u32,
    /// Vertical coordinate.
    pub y: u32,
}

impl Point {
    /// Create a new point.
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle, described by its top-left corner and its size.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Extent along the x axis.
    pub width: u32,
    /// Extent along the y axis.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle of the given size anchored at the origin.
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// A rectangle of the given size anchored at `origin`.
    pub const fn from_origin_size(origin: Point, size: Size) -> Self {
        Self::new(origin.x, origin.y, size.width, size.height)
    }

    /// The top-left corner.
    pub const fn origin(self) -> Point {
        Point::new(self.x, self.y)
    }

    /// The width and height.
    pub const fn size(self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Exclusive right edge.
    pub const fn right(self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub const fn bottom(self) -> u32 {
        self.y + self.height
    }

    /// Whether this rectangle covers no area.
    pub const fn is_empty(self) -> bool {
        self.size().is_empty()
    }

    /// The covered area.
    pub const fn area(self) -> u64 {
        self.size().area()
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub const fn contains_rect(self, other: Self) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Whether the two rectangles share a region of positive area.
    ///
    /// Rectangles that merely touch along an edge do not intersect.
    pub const fn intersects(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// The smallest rectangle containing both `self` and `other`.
    ///
    /// An empty rectangle contributes nothing to the union.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Self::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.x, self.y, self.width, self.height
        )
    }
}
