//! Float and integer points.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IPoint {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl IPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub const fn is_zero(self) -> bool {
        self.x == 0 && self.y == 0
    }
}

impl From<Point> for IPoint {
    fn from(p: Point) -> Self {
        Self {
            x: p.x as i32,
            y: p.y as i32,
        }
    }
}

impl From<IPoint> for Point {
    fn from(p: IPoint) -> Self {
        Self {
            x: p.x as f32,
            y: p.y as f32,
        }
    }
}

macro_rules! point_ops {
    ($ty:ident, $scalar:ty) => {
        impl Add for $ty {
            type Output = $ty;
            fn add(self, rhs: $ty) -> $ty {
                $ty::new(self.x + rhs.x, self.y + rhs.y)
            }
        }
        impl Sub for $ty {
            type Output = $ty;
            fn sub(self, rhs: $ty) -> $ty {
                $ty::new(self.x - rhs.x, self.y - rhs.y)
            }
        }
        impl Neg for $ty {
            type Output = $ty;
            fn neg(self) -> $ty {
                $ty::new(-self.x, -self.y)
            }
        }
        impl AddAssign for $ty {
            fn add_assign(&mut self, rhs: $ty) {
                self.x += rhs.x;
                self.y += rhs.y;
            }
        }
        impl SubAssign for $ty {
            fn sub_assign(&mut self, rhs: $ty) {
                self.x -= rhs.x;
                self.y -= rhs.y;
            }
        }
    };
}

point_ops!(Point, f32);
point_ops!(IPoint, i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_truncates() {
        let p = IPoint::from(Point::new(3.9, -1.2));
        assert_eq!(p, IPoint::new(3, -1));
    }

    #[test]
    fn arithmetic() {
        let a = IPoint::new(3, 4) + IPoint::new(1, -2);
        assert_eq!(a, IPoint::new(4, 2));
        assert_eq!(-a, IPoint::new(-4, -2));
    }
}
