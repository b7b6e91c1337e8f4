//! Float and integer rectangles.
//!
//! `IRect` is half-open: the `right` column and `bottom` row are outside the
//! rectangle. A rectangle is valid iff it contains at least one pixel.

use crate::{IPoint, Point};
use std::ops::{Add, AddAssign, BitAnd, BitOr, Sub, SubAssign};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_points(top_left: Point, bottom_right: Point) -> Self {
        Self::new(top_left.x, top_left.y, bottom_right.x, bottom_right.y)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.left, self.top)
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }
}

impl IRect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(top_left: IPoint, size: IPoint) -> Self {
        Self::new(
            top_left.x,
            top_left.y,
            top_left.x + size.x,
            top_left.y + size.y,
        )
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn size(&self) -> IPoint {
        IPoint::new(self.width(), self.height())
    }

    pub fn top_left(&self) -> IPoint {
        IPoint::new(self.left, self.top)
    }

    /// The rectangle translated to origin. Useful for expressing a frame in
    /// its own local coordinate system.
    pub fn bounds(&self) -> IRect {
        IRect::new(0, 0, self.width(), self.height())
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    pub fn contains(&self, p: IPoint) -> bool {
        p.x >= self.left && p.x < self.right && p.y >= self.top && p.y < self.bottom
    }

    pub fn intersects(&self, other: &IRect) -> bool {
        self.left < other.right
            && self.right > other.left
            && self.top < other.bottom
            && self.bottom > other.top
    }
}

impl From<Rect> for IRect {
    fn from(r: Rect) -> Self {
        Self {
            left: r.left as i32,
            top: r.top as i32,
            right: r.right as i32,
            bottom: r.bottom as i32,
        }
    }
}

impl From<IRect> for Rect {
    fn from(r: IRect) -> Self {
        Self {
            left: r.left as f32,
            top: r.top as f32,
            right: r.right as f32,
            bottom: r.bottom as f32,
        }
    }
}

/// Pixelwise intersection. The result may be invalid; callers check
/// `is_valid()` before using it.
impl BitAnd for IRect {
    type Output = IRect;
    fn bitand(self, rhs: IRect) -> IRect {
        IRect::new(
            self.left.max(rhs.left),
            self.top.max(rhs.top),
            self.right.min(rhs.right),
            self.bottom.min(rhs.bottom),
        )
    }
}

/// Minimal enclosing rectangle of both operands.
impl BitOr for IRect {
    type Output = IRect;
    fn bitor(self, rhs: IRect) -> IRect {
        IRect::new(
            self.left.min(rhs.left),
            self.top.min(rhs.top),
            self.right.max(rhs.right),
            self.bottom.max(rhs.bottom),
        )
    }
}

impl Add<IPoint> for IRect {
    type Output = IRect;
    fn add(self, p: IPoint) -> IRect {
        IRect::new(self.left + p.x, self.top + p.y, self.right + p.x, self.bottom + p.y)
    }
}

impl Sub<IPoint> for IRect {
    type Output = IRect;
    fn sub(self, p: IPoint) -> IRect {
        IRect::new(self.left - p.x, self.top - p.y, self.right - p.x, self.bottom - p.y)
    }
}

impl AddAssign<IPoint> for IRect {
    fn add_assign(&mut self, p: IPoint) {
        self.left += p.x;
        self.top += p.y;
        self.right += p.x;
        self.bottom += p.y;
    }
}

impl SubAssign<IPoint> for IRect {
    fn sub_assign(&mut self, p: IPoint) {
        self.left -= p.x;
        self.top -= p.y;
        self.right -= p.x;
        self.bottom -= p.y;
    }
}

impl Add<Point> for Rect {
    type Output = Rect;
    fn add(self, p: Point) -> Rect {
        Rect::new(self.left + p.x, self.top + p.y, self.right + p.x, self.bottom + p.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_geometry() {
        let r = IRect::new(0, 0, 10, 5);
        assert_eq!(r.width(), 10);
        assert_eq!(r.height(), 5);
        assert!(r.contains(IPoint::new(9, 4)));
        assert!(!r.contains(IPoint::new(10, 4)));
    }

    #[test]
    fn intersection_and_union() {
        let a = IRect::new(0, 0, 10, 10);
        let b = IRect::new(5, 5, 15, 15);
        assert_eq!(a & b, IRect::new(5, 5, 10, 10));
        assert_eq!(a | b, IRect::new(0, 0, 15, 15));
        let c = IRect::new(20, 20, 30, 30);
        assert!(!(a & c).is_valid());
        assert!(!a.intersects(&c));
    }

    #[test]
    fn translation() {
        let r = IRect::new(1, 2, 3, 4) + IPoint::new(10, 20);
        assert_eq!(r, IRect::new(11, 22, 13, 24));
    }
}
