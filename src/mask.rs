// mask.rs — Region mask: silhouette → inside mask → soft blend weights.
//
// Built once per session from the silhouette of the face in image space:
//
//   1. Outline. By default the convex hull of the silhouette (Graham scan).
//      A facial silhouette is usually not convex, so the hull over-includes
//      background in concave spots (under the chin, around the ears). The
//      precise alternative keeps the silhouette polygon as given and tests
//      with even-odd crossings. `MaskMode` selects between them.
//
//   2. Inside mask. Rasterised over the silhouette's bounding box, 255 for
//      pixels inside the outline and 0 outside. Region pixel (i, j) is
//      world pixel (min_x + i, min_y + j).
//
//   3. Blur mask. `passes` rounds of 3×3 weighted accumulation:
//
//        w(dx, dy) = 0.5^(2 + |dx| + |dy|)
//
//          0.0625  0.125  0.0625
//          0.125   0.25   0.125
//          0.0625  0.125  0.0625
//
//      The weights sum to exactly 1, so a uniform 255 interior stays 255 and
//      the falloff only forms at the outline. Out-of-region neighbours
//      contribute nothing, so the region border itself also darkens. Each
//      pass rounds into a byte, clamped at 255.
//
// The blur mask is the per-pixel blend weight of the warp: 0 leaves the
// pixel untouched, 255 applies the full displacement.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{WarpError, WarpResult};
use crate::geometry::{cross, BoundingBox, Point2};
use crate::image::Image;

/// Blur passes used when nothing else is configured.
pub const DEFAULT_BLUR_PASSES: usize = 20;

/// Largest region, in pixels, a mask will rasterise (4096 × 4096).
pub const MAX_REGION_PIXELS: usize = 1 << 24;

/// How the silhouette outline decides inside/outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    /// Convex hull of the silhouette points.
    #[default]
    ConvexHull,
    /// The silhouette polygon itself, in the given point order.
    Polygon,
}

// ---------------------------------------------------------------------------
// Convex hull
// ---------------------------------------------------------------------------

/// Convex hull by Graham scan.
///
/// The pivot is the lowest-y point (lowest x on ties). The remaining points
/// are ordered by polar angle around the pivot, nearer first on equal angle,
/// then swept while popping every vertex that does not make a strict left
/// turn. Collinear boundary points are dropped. Fewer than three input
/// points are returned unchanged.
pub fn convex_hull(points: &[Point2]) -> Vec<Point2> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut pivot_idx = 0;
    for (i, p) in points.iter().enumerate().skip(1) {
        let best = &points[pivot_idx];
        if p.y < best.y || (p.y == best.y && p.x < best.x) {
            pivot_idx = i;
        }
    }
    let pivot = points[pivot_idx];

    let mut rest: Vec<Point2> = points
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != pivot_idx)
        .map(|(_, p)| *p)
        .collect();
    rest.sort_by(|a, b| {
        let ta = (a.y - pivot.y).atan2(a.x - pivot.x);
        let tb = (b.y - pivot.y).atan2(b.x - pivot.x);
        ta.total_cmp(&tb)
            .then_with(|| pivot.distance(a).total_cmp(&pivot.distance(b)))
    });

    let mut hull: Vec<Point2> = Vec::with_capacity(points.len());
    hull.push(pivot);
    for p in rest {
        while hull.len() > 1 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], &p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull
}

/// Inside test against a hull in [`convex_hull`] order.
///
/// Inside means on the non-negative side of every edge, so points on the
/// outline count as inside. Degenerate hulls (fewer than three vertices)
/// contain nothing.
pub fn point_in_hull(p: &Point2, hull: &[Point2]) -> bool {
    if hull.len() < 3 {
        return false;
    }
    (0..hull.len()).all(|i| {
        let a = &hull[i];
        let b = &hull[(i + 1) % hull.len()];
        cross(a, b, p) >= 0.0
    })
}

/// Even-odd inside test against an arbitrary simple polygon.
pub fn point_in_polygon(p: &Point2, polygon: &[Point2]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (&polygon[i], &polygon[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_at = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_at {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ---------------------------------------------------------------------------
// Blur
// ---------------------------------------------------------------------------

const BLUR_WEIGHTS: [[f64; 3]; 3] = [
    [0.0625, 0.125, 0.0625],
    [0.125, 0.25, 0.125],
    [0.0625, 0.125, 0.0625],
];

/// Run `passes` rounds of weighted 3×3 diffusion over `mask`.
pub fn diffuse(mask: &Image<u8>, passes: usize) -> Image<u8> {
    let (w, h) = (mask.width(), mask.height());
    let mut prev = Image::from_vec(w, h, mask.to_compact_vec());
    let mut next: Image<u8> = Image::new(w, h);

    for _ in 0..passes {
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0.0;
                for (wy, dy) in (-1i64..=1).enumerate() {
                    for (wx, dx) in (-1i64..=1).enumerate() {
                        if let Some(v) = prev.get_checked(x as i64 + dx, y as i64 + dy) {
                            acc += v as f64 * BLUR_WEIGHTS[wy][wx];
                        }
                    }
                }
                next.set(x, y, acc.round().min(255.0) as u8);
            }
        }
        std::mem::swap(&mut prev, &mut next);
    }
    prev
}

// ---------------------------------------------------------------------------
// RegionMask
// ---------------------------------------------------------------------------

/// Bounding box, hard inside mask and soft blend mask over one silhouette.
#[derive(Debug, Clone)]
pub struct RegionMask {
    bbox: BoundingBox,
    mode: MaskMode,
    outline: Vec<Point2>,
    inside: Image<u8>,
    blur: Image<u8>,
}

impl RegionMask {
    /// Build the mask for a silhouette given in image space.
    ///
    /// Fails with `TooFewPoints` for fewer than three silhouette points,
    /// `EmptyRegion` when the bounding box has no pixels and `RegionTooLarge`
    /// when it covers more than [`MAX_REGION_PIXELS`].
    #[tracing::instrument(level = "debug", skip(silhouette), fields(n = silhouette.len()))]
    pub fn build(silhouette: &[Point2], mode: MaskMode, passes: usize) -> WarpResult<Self> {
        if silhouette.len() < 3 {
            return Err(WarpError::TooFewPoints { got: silhouette.len(), min: 3 });
        }
        let bbox = BoundingBox::from_points(silhouette).ok_or(WarpError::EmptyRegion)?;
        if bbox.is_empty() {
            return Err(WarpError::EmptyRegion);
        }
        if bbox.pixel_count().map_or(true, |n| n > MAX_REGION_PIXELS) {
            return Err(WarpError::RegionTooLarge {
                width: bbox.width(),
                height: bbox.height(),
                max: MAX_REGION_PIXELS,
            });
        }

        let outline = match mode {
            MaskMode::ConvexHull => convex_hull(silhouette),
            MaskMode::Polygon => silhouette.to_vec(),
        };

        let inside = Image::from_fn(bbox.width(), bbox.height(), |i, j| {
            let p = bbox.to_world(i, j);
            let hit = match mode {
                MaskMode::ConvexHull => point_in_hull(&p, &outline),
                MaskMode::Polygon => point_in_polygon(&p, &outline),
            };
            if hit { 255 } else { 0 }
        });
        let blur = diffuse(&inside, passes);

        debug!(
            %bbox,
            inside = inside.count_nonzero(),
            weighted = blur.count_nonzero(),
            "region mask built"
        );
        Ok(RegionMask { bbox, mode, outline, inside, blur })
    }

    /// [`RegionMask::build`] with the convex hull and the default pass count.
    pub fn from_silhouette(silhouette: &[Point2]) -> WarpResult<Self> {
        Self::build(silhouette, MaskMode::ConvexHull, DEFAULT_BLUR_PASSES)
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    /// The outline the inside test runs against (hull or polygon).
    pub fn outline(&self) -> &[Point2] {
        &self.outline
    }

    /// Hard 0/255 mask, row-major over the bounding box.
    pub fn inside(&self) -> &Image<u8> {
        &self.inside
    }

    /// Soft 0..=255 blend weights, row-major over the bounding box.
    pub fn blur(&self) -> &Image<u8> {
        &self.blur
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.bbox.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.bbox.height()
    }

    /// Inside test for an arbitrary world point.
    pub fn contains(&self, p: &Point2) -> bool {
        match self.mode {
            MaskMode::ConvexHull => point_in_hull(p, &self.outline),
            MaskMode::Polygon => point_in_polygon(p, &self.outline),
        }
    }

    /// Blend weight at an integer world pixel, 0 outside the region.
    pub fn weight_at(&self, x: i32, y: i32) -> u8 {
        match self.bbox.to_region(x, y) {
            Some((i, j)) => self.blur.get(i, j),
            None => 0,
        }
    }
}
