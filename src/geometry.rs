// geometry.rs — Points, bounding boxes and the orientation predicate.
//
// Everything here is plain data used by value. Point sets are ordinary
// slices; their index order is the correspondence key between a source set
// and its paired target set, so nothing in this crate ever sorts a point set
// in place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 2D point in double precision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Point2 { x, y }
    }

    /// Euclidean distance to `other`.
    #[inline]
    pub fn distance(&self, other: &Point2) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Linear blend towards `other`: `self + w * (other - self)`.
    #[inline]
    pub fn lerp(&self, other: &Point2, w: f64) -> Point2 {
        Point2 {
            x: self.x + w * (other.x - self.x),
            y: self.y + w * (other.y - self.y),
        }
    }
}

impl From<(f64, f64)> for Point2 {
    fn from((x, y): (f64, f64)) -> Self {
        Point2 { x, y }
    }
}

impl From<[f64; 2]> for Point2 {
    fn from([x, y]: [f64; 2]) -> Self {
        Point2 { x, y }
    }
}

impl From<Point3> for Point2 {
    /// Drop the depth coordinate. Landmark trackers report 3D points but the
    /// warp only ever uses the image-plane projection.
    fn from(p: Point3) -> Self {
        Point2 { x: p.x, y: p.y }
    }
}

impl fmt::Display for Point2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// A 3D point as delivered by a landmark tracker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Point3 { x, y, z }
    }
}

/// Project a slice of 3D landmarks onto the image plane.
pub fn project(points: &[Point3]) -> Vec<Point2> {
    points.iter().map(|&p| Point2::from(p)).collect()
}

/// Orientation of `c` relative to the directed line `a → b`.
///
/// Positive for a left (counter-clockwise) turn in a y-up frame, negative
/// for a right turn, zero when collinear.
#[inline]
pub fn cross(a: &Point2, b: &Point2, c: &Point2) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

// ---------------------------------------------------------------------------
// BoundingBox
// ---------------------------------------------------------------------------

/// Integer axis-aligned box over a point set.
///
/// Mins are floored and maxes are ceiled, so every input point lies inside
/// the closed box. The pixel grid covered by the box is
/// `[min_x, max_x) × [min_y, max_y)`: pixel `(i, j)` of a region image
/// corresponds to world coordinate `(min_x + i, min_y + j)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl BoundingBox {
    /// Compute the box around `points`. Returns `None` for an empty set or
    /// when any coordinate is not finite.
    pub fn from_points(points: &[Point2]) -> Option<Self> {
        let first = points.first()?;
        let (mut lx, mut hx, mut ly, mut hy) = (first.x, first.x, first.y, first.y);
        for p in points {
            if !p.x.is_finite() || !p.y.is_finite() {
                return None;
            }
            lx = lx.min(p.x);
            hx = hx.max(p.x);
            ly = ly.min(p.y);
            hy = hy.max(p.y);
        }
        Some(BoundingBox {
            min_x: lx.floor() as i32,
            max_x: hx.ceil() as i32,
            min_y: ly.floor() as i32,
            max_y: hy.ceil() as i32,
        })
    }

    /// Region width in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        extent(self.min_x, self.max_x)
    }

    /// Region height in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        extent(self.min_y, self.max_y)
    }

    /// `width × height`, or `None` if the product does not fit a `usize`.
    #[inline]
    pub fn pixel_count(&self) -> Option<usize> {
        self.width().checked_mul(self.height())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// World coordinate of region pixel `(i, j)`.
    #[inline]
    pub fn to_world(&self, i: usize, j: usize) -> Point2 {
        Point2::new(f64::from(self.min_x) + i as f64, f64::from(self.min_y) + j as f64)
    }

    /// Region pixel index of an integer world coordinate, if inside.
    #[inline]
    pub fn to_region(&self, x: i32, y: i32) -> Option<(usize, usize)> {
        if x < self.min_x || x >= self.max_x || y < self.min_y || y >= self.max_y {
            return None;
        }
        Some((extent(self.min_x, x), extent(self.min_y, y)))
    }
}

/// `max - min` widened to `i64`, clamped at zero.
#[inline]
fn extent(min: i32, max: i32) -> usize {
    let d = (i64::from(max) - i64::from(min)).max(0);
    usize::try_from(d).unwrap_or(usize::MAX)
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}) × [{}, {}) ({}×{})",
            self.min_x,
            self.max_x,
            self.min_y,
            self.max_y,
            self.width(),
            self.height()
        )
    }
}
