//! Region algebra: a finite pixel set stored as non-overlapping rectangles.
//!
//! Invariants:
//! * Stored rectangles are pairwise disjoint.
//! * No stored rectangle is empty.
//! * No canonical ordering is required; two regions are equal iff they cover
//!   the same pixel set.
//! * `optimize()` merges collinear neighbors and is idempotent.

use crate::{IPoint, IRect};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<IRect>,
}

impl Region {
    /// Empty region.
    pub const fn empty() -> Self {
        Self { rects: Vec::new() }
    }

    /// Single-rectangle region, or empty if `rect` is not valid.
    pub fn new(rect: IRect) -> Self {
        if rect.is_valid() {
            Self { rects: vec![rect] }
        } else {
            Self::empty()
        }
    }

    /// View `other` through `clip_rect`. With `normalize` the result is
    /// translated so `clip_rect`'s top-left lands at the origin; used to
    /// express a parent region in a child's local frame.
    pub fn clone_clipped(other: &Region, clip_rect: IRect, normalize: bool) -> Self {
        let offset = clip_rect.top_left();
        let rects = other
            .rects
            .iter()
            .filter_map(|r| {
                let clipped = *r & clip_rect;
                if clipped.is_valid() {
                    Some(if normalize { clipped - offset } else { clipped })
                } else {
                    None
                }
            })
            .collect();
        Self { rects }
    }

    pub fn rects(&self) -> &[IRect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Minimal enclosing rectangle; the empty rectangle for an empty region.
    pub fn bounds(&self) -> IRect {
        let mut iter = self.rects.iter();
        match iter.next() {
            None => IRect::default(),
            Some(first) => iter.fold(*first, |acc, r| acc | *r),
        }
    }

    /// Add the pixels of `rect`. Existing coverage is carved out first so
    /// the non-overlap invariant holds.
    pub fn include(&mut self, rect: IRect) {
        if !rect.is_valid() {
            return;
        }
        self.exclude(rect);
        self.rects.push(rect);
    }

    /// Remove the pixels of `rect`. Each intersected rectangle is split into
    /// up to four fragments (top, bottom, left, right bands).
    pub fn exclude(&mut self, rect: IRect) {
        if !rect.is_valid() || self.rects.is_empty() {
            return;
        }
        let mut result = Vec::with_capacity(self.rects.len());
        for r in self.rects.drain(..) {
            if !r.intersects(&rect) {
                result.push(r);
                continue;
            }
            if r.top < rect.top {
                result.push(IRect::new(r.left, r.top, r.right, rect.top));
            }
            if r.bottom > rect.bottom {
                result.push(IRect::new(r.left, rect.bottom, r.right, r.bottom));
            }
            let mid_top = r.top.max(rect.top);
            let mid_bottom = r.bottom.min(rect.bottom);
            if r.left < rect.left {
                result.push(IRect::new(r.left, mid_top, rect.left, mid_bottom));
            }
            if r.right > rect.right {
                result.push(IRect::new(rect.right, mid_top, r.right, mid_bottom));
            }
        }
        self.rects = result;
    }

    /// Remove every rectangle of `other`, translated by `offset`.
    pub fn exclude_region(&mut self, other: &Region, offset: IPoint) {
        for r in &other.rects {
            self.exclude(*r + offset);
        }
    }

    /// Replace with the pixelwise intersection of `self` and `other`.
    pub fn intersect(&mut self, other: &Region) {
        let mut result = Vec::new();
        for a in &self.rects {
            for b in &other.rects {
                let r = *a & *b;
                if r.is_valid() {
                    result.push(r);
                }
            }
        }
        self.rects = result;
    }

    /// Translate every rectangle by `offset`.
    pub fn translate(&mut self, offset: IPoint) {
        for r in &mut self.rects {
            *r += offset;
        }
    }

    /// Merge horizontally or vertically collinear neighbors whose shared
    /// edge matches exactly. Runs to a fixpoint, so applying it twice is the
    /// same as applying it once.
    pub fn optimize(&mut self) {
        loop {
            let mut merged_any = false;
            let mut i = 0;
            while i < self.rects.len() {
                let mut j = i + 1;
                while j < self.rects.len() {
                    let a = self.rects[i];
                    let b = self.rects[j];
                    let merged = if a.top == b.top && a.bottom == b.bottom {
                        if a.right == b.left {
                            Some(IRect::new(a.left, a.top, b.right, a.bottom))
                        } else if b.right == a.left {
                            Some(IRect::new(b.left, a.top, a.right, a.bottom))
                        } else {
                            None
                        }
                    } else if a.left == b.left && a.right == b.right {
                        if a.bottom == b.top {
                            Some(IRect::new(a.left, a.top, a.right, b.bottom))
                        } else if b.bottom == a.top {
                            Some(IRect::new(a.left, b.top, a.right, a.bottom))
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    if let Some(m) = merged {
                        self.rects[i] = m;
                        self.rects.swap_remove(j);
                        merged_any = true;
                    } else {
                        j += 1;
                    }
                }
                i += 1;
            }
            if !merged_any {
                break;
            }
        }
    }

    /// Total pixel count. Linear in the rectangle count; meant for tests and
    /// diagnostics.
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| r.width() as i64 * r.height() as i64)
            .sum()
    }

    /// Whether the pixel at `p` belongs to the region.
    pub fn contains(&self, p: IPoint) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }

    /// Clip the segment `p0..=p1` to `clip` (Cohen–Sutherland). Returns
    /// whether any portion remains; the endpoints are updated in place to
    /// the clipped segment. Exact for axis-aligned lines.
    pub fn clip_line(clip: IRect, p0: &mut IPoint, p1: &mut IPoint) -> bool {
        if !clip.is_valid() {
            return false;
        }
        const LEFT: u8 = 1;
        const RIGHT: u8 = 2;
        const TOP: u8 = 4;
        const BOTTOM: u8 = 8;

        let x_max = clip.right - 1;
        let y_max = clip.bottom - 1;

        let outcode = |x: i32, y: i32| -> u8 {
            let mut code = 0;
            if x < clip.left {
                code |= LEFT;
            } else if x > x_max {
                code |= RIGHT;
            }
            if y < clip.top {
                code |= TOP;
            } else if y > y_max {
                code |= BOTTOM;
            }
            code
        };

        let mut code0 = outcode(p0.x, p0.y);
        let mut code1 = outcode(p1.x, p1.y);

        loop {
            if code0 == 0 && code1 == 0 {
                return true;
            }
            if code0 & code1 != 0 {
                return false;
            }
            let clip_first = code0 != 0;
            let code = if clip_first { code0 } else { code1 };
            let dx = (p1.x - p0.x) as i64;
            let dy = (p1.y - p0.y) as i64;
            // dx (resp. dy) cannot be zero when a horizontal (resp.
            // vertical) boundary code is set on only one endpoint.
            let (x, y) = if code & LEFT != 0 {
                let y = p0.y as i64 + dy * (clip.left - p0.x) as i64 / dx;
                (clip.left, y as i32)
            } else if code & RIGHT != 0 {
                let y = p0.y as i64 + dy * (x_max - p0.x) as i64 / dx;
                (x_max, y as i32)
            } else if code & TOP != 0 {
                let x = p0.x as i64 + dx * (clip.top - p0.y) as i64 / dy;
                (x as i32, clip.top)
            } else {
                let x = p0.x as i64 + dx * (y_max - p0.y) as i64 / dy;
                (x as i32, y_max)
            };
            if clip_first {
                *p0 = IPoint::new(x, y);
                code0 = outcode(x, y);
            } else {
                *p1 = IPoint::new(x, y);
                code1 = outcode(x, y);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rect(l: i32, t: i32, r: i32, b: i32) -> IRect {
        IRect::new(l, t, r, b)
    }

    #[test]
    fn new_from_invalid_rect_is_empty() {
        assert!(Region::new(rect(5, 5, 5, 10)).is_empty());
    }

    #[test]
    fn include_keeps_rects_disjoint() {
        let mut reg = Region::new(rect(0, 0, 10, 10));
        reg.include(rect(5, 5, 15, 15));
        assert_eq!(reg.area(), 100 + 100 - 25);
        for (i, a) in reg.rects().iter().enumerate() {
            for b in &reg.rects()[i + 1..] {
                assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn exclude_splits_into_bands() {
        let mut reg = Region::new(rect(0, 0, 10, 10));
        reg.exclude(rect(3, 3, 7, 7));
        assert_eq!(reg.area(), 100 - 16);
        assert!(!reg.contains(IPoint::new(5, 5)));
        assert!(reg.contains(IPoint::new(0, 0)));
        assert!(reg.contains(IPoint::new(9, 9)));
    }

    #[test]
    fn intersect_pairwise() {
        let mut a = Region::new(rect(0, 0, 10, 10));
        let b = Region::new(rect(5, 0, 20, 10));
        a.intersect(&b);
        assert_eq!(a.bounds(), rect(5, 0, 10, 10));
        assert_eq!(a.area(), 50);
    }

    #[test]
    fn clone_clipped_normalizes() {
        let parent = Region::new(rect(0, 0, 100, 100));
        let child = Region::clone_clipped(&parent, rect(20, 30, 60, 80), true);
        assert_eq!(child.bounds(), rect(0, 0, 40, 50));
    }

    #[test]
    fn optimize_merges_adjacent_rows() {
        let mut reg = Region::empty();
        reg.include(rect(0, 0, 10, 5));
        reg.include(rect(0, 5, 10, 10));
        reg.optimize();
        assert_eq!(reg.rects(), &[rect(0, 0, 10, 10)]);
    }

    #[test]
    fn clip_line_axis_aligned_exact() {
        let clip = rect(0, 0, 100, 100);
        let mut p0 = IPoint::new(-50, 20);
        let mut p1 = IPoint::new(150, 20);
        assert!(Region::clip_line(clip, &mut p0, &mut p1));
        assert_eq!(p0, IPoint::new(0, 20));
        assert_eq!(p1, IPoint::new(99, 20));
    }

    #[test]
    fn clip_line_fully_outside() {
        let clip = rect(0, 0, 100, 100);
        let mut p0 = IPoint::new(-10, -10);
        let mut p1 = IPoint::new(-1, 50);
        assert!(!Region::clip_line(clip, &mut p0, &mut p1));
    }

    #[test]
    fn clip_line_diagonal_stays_inside() {
        let clip = rect(0, 0, 100, 100);
        let mut p0 = IPoint::new(-100, -100);
        let mut p1 = IPoint::new(200, 200);
        assert!(Region::clip_line(clip, &mut p0, &mut p1));
        assert!(clip.contains(p0));
        assert!(clip.contains(p1));
    }

    fn arb_rect() -> impl Strategy<Value = IRect> {
        (0i32..64, 0i32..64, 1i32..32, 1i32..32)
            .prop_map(|(l, t, w, h)| IRect::new(l, t, l + w, t + h))
    }

    proptest! {
        #[test]
        fn optimize_is_idempotent(rects in proptest::collection::vec(arb_rect(), 0..12)) {
            let mut reg = Region::empty();
            for r in rects {
                reg.include(r);
            }
            let area = reg.area();
            reg.optimize();
            let once = reg.clone();
            prop_assert_eq!(reg.area(), area);
            reg.optimize();
            prop_assert_eq!(&reg, &once);
        }

        #[test]
        fn include_then_exclude_round_trips(base in arb_rect(), hole in arb_rect()) {
            let mut reg = Region::new(base);
            reg.exclude(hole);
            reg.include(hole & base);
            reg.optimize();
            let mut expected = Region::new(base);
            expected.optimize();
            prop_assert_eq!(reg.area(), expected.area());
            prop_assert_eq!(reg.bounds(), expected.bounds());
        }
    }
}
