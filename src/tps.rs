// tps.rs — Thin-plate spline fitting and evaluation.
//
// A TPS maps the plane onto itself so that each control point lands exactly
// on its paired target while minimising bending energy everywhere else:
//
//   f(p) = c0 + c1·x + c2·y + Σ_r c(r+3) · K(p − P_r),   K(d) = |d|² ln |d|²
//
// FITTING
// ───────
// With m control points P_0..P_{m-1} the coefficients solve the
// (m+3)×(m+3) system
//
//         ┌ 0      0      0    │  1      1     …   1      ┐
//         │ 0      0      0    │  x_0    x_1   …   x_{m-1} │
//   A  =  │ 0      0      0    │  y_0    y_1   …   y_{m-1} │
//         │ 1      x_0    y_0  │  K_00   K_01  …           │
//         │ …                  │           …               │
//         └ 1      x_{m-1} …   │                  K_mm     ┘
//
// and c = A⁻¹ · [0, 0, 0, t_0, …, t_{m-1}]ᵀ, once for the x column of the
// targets and once for y. Because the right-hand side is zero in its first
// three entries only columns 3.. of A⁻¹ are ever read.
//
// Forward parameters are fit source → target, inverse parameters target →
// source. The two are independent splines: the inverse is not the exact
// analytic inverse of the forward map, only its best smooth approximation
// through the same correspondences.
//
// FAST REFIT
// ──────────
// A⁻¹ depends only on the control points. When only the targets move we
// keep A⁻¹ from the last fit (`CachedFactorization`) and recompute the
// coefficients as one matrix-vector product per axis.
//
// The inverse direction is different: its control points ARE the targets,
// so new targets invalidate its factorization. `update_inverse_target_points`
// therefore re-solves the inverse system over the new targets and then pins
// the linear part to the identity (c1 = 1, c2 = 0 for x; c1 = 0, c2 = 1 for
// y). The pin keeps the inverse from picking up global scale or shear when
// only a handful of landmarks move between frames. A full `fit` never pins.

use tracing::{debug, warn};

use crate::error::{WarpError, WarpResult};
use crate::geometry::Point2;
use crate::solver::{self, Matrix};

/// Fewest control points for which the affine block can be nonsingular.
pub const MIN_CONTROL_POINTS: usize = 3;

/// Number of affine terms at the head of each coefficient vector.
pub const AFFINE_TERMS: usize = 3;

/// Radial basis `r² · ln(r²)`, with `K(0, 0) = 0`.
#[inline]
pub fn kernel(dx: f64, dy: f64) -> f64 {
    if dx == 0.0 && dy == 0.0 {
        return 0.0;
    }
    let r2 = dx * dx + dy * dy;
    r2 * r2.ln()
}

/// Evaluate a spline given as raw coefficient slices.
///
/// `xc` and `yc` must hold `control_points.len() + 3` entries. This is the
/// one evaluation routine shared by [`TpsParameters`] and the flat buffers
/// handed to compute backends, so both produce identical results.
pub fn evaluate_coefficients(xc: &[f64], yc: &[f64], control_points: &[Point2], p: Point2) -> Point2 {
    let mut xo = xc[0] + xc[1] * p.x + xc[2] * p.y;
    let mut yo = yc[0] + yc[1] * p.x + yc[2] * p.y;
    for (r, cp) in control_points.iter().enumerate() {
        let k = kernel(p.x - cp.x, p.y - cp.y);
        xo += xc[r + AFFINE_TERMS] * k;
        yo += yc[r + AFFINE_TERMS] * k;
    }
    Point2::new(xo, yo)
}

// ---------------------------------------------------------------------------
// TpsParameters
// ---------------------------------------------------------------------------

/// Coefficients of one spline direction plus the control points they were
/// solved against.
///
/// Invariant: `xc.len() == yc.len() == control_points.len() + 3`.
#[derive(Debug, Clone, PartialEq)]
pub struct TpsParameters {
    pub xc: Vec<f64>,
    pub yc: Vec<f64>,
    pub control_points: Vec<Point2>,
}

impl TpsParameters {
    /// Number of control points `m`.
    #[inline]
    pub fn m(&self) -> usize {
        self.control_points.len()
    }

    /// Evaluate the spline at `p`.
    #[inline]
    pub fn evaluate(&self, p: Point2) -> Point2 {
        evaluate_coefficients(&self.xc, &self.yc, &self.control_points, p)
    }

    /// Force the linear part to the identity, leaving the translation and
    /// the radial terms as solved.
    fn pin_linear_identity(&mut self) {
        self.xc[1] = 1.0;
        self.xc[2] = 0.0;
        self.yc[1] = 0.0;
        self.yc[2] = 1.0;
    }
}

// ---------------------------------------------------------------------------
// CachedFactorization
// ---------------------------------------------------------------------------

/// `A⁻¹` for a fixed set of control points.
///
/// Owned by the spline that solved it and discarded whenever that
/// direction's control points change.
#[derive(Debug, Clone)]
pub struct CachedFactorization {
    inv_a: Matrix,
    control_points: Vec<Point2>,
}

impl CachedFactorization {
    /// Build and invert the system matrix over `control_points`.
    pub fn solve(control_points: &[Point2]) -> WarpResult<Self> {
        let inv_a = solver::invert(&system_matrix(control_points))?;
        Ok(CachedFactorization { inv_a, control_points: control_points.to_vec() })
    }

    #[inline]
    pub fn m(&self) -> usize {
        self.control_points.len()
    }

    pub fn control_points(&self) -> &[Point2] {
        &self.control_points
    }

    /// Coefficients that carry the control points onto `values`.
    ///
    /// The caller guarantees `values.len() == self.m()`.
    pub fn coefficients(&self, values: &[Point2]) -> TpsParameters {
        let m = self.m();
        debug_assert_eq!(values.len(), m);
        let mut xc = vec![0.0; m + AFFINE_TERMS];
        let mut yc = vec![0.0; m + AFFINE_TERMS];
        for r in 0..m + AFFINE_TERMS {
            let row = self.inv_a.view((r, AFFINE_TERMS), (1, m));
            let (mut sx, mut sy) = (0.0, 0.0);
            for (a, v) in row.iter().zip(values) {
                sx += a * v.x;
                sy += a * v.y;
            }
            xc[r] = sx;
            yc[r] = sy;
        }
        TpsParameters { xc, yc, control_points: self.control_points.clone() }
    }
}

/// Assemble the (m+3)×(m+3) TPS system over `points`.
pub fn system_matrix(points: &[Point2]) -> Matrix {
    let m = points.len();
    let mut a = Matrix::zeros(m + AFFINE_TERMS, m + AFFINE_TERMS);
    for (i, pi) in points.iter().enumerate() {
        let c = AFFINE_TERMS + i;
        a[(0, c)] = 1.0;
        a[(1, c)] = pi.x;
        a[(2, c)] = pi.y;

        a[(c, 0)] = 1.0;
        a[(c, 1)] = pi.x;
        a[(c, 2)] = pi.y;

        for (j, pj) in points.iter().enumerate() {
            a[(c, AFFINE_TERMS + j)] = kernel(pi.x - pj.x, pi.y - pj.y);
        }
    }
    a
}

fn check_correspondence(source: &[Point2], target: &[Point2]) -> WarpResult<()> {
    if source.len() != target.len() {
        return Err(WarpError::CorrespondenceMismatch {
            expected: source.len(),
            got: target.len(),
        });
    }
    if source.len() < MIN_CONTROL_POINTS {
        return Err(WarpError::TooFewPoints { got: source.len(), min: MIN_CONTROL_POINTS });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ThinPlateSpline
// ---------------------------------------------------------------------------

/// A bidirectional thin-plate spline between two corresponding point sets.
///
/// An unfit spline (never fit, or whose last fit failed) is the identity in
/// both directions. That is an observable fallback: a failed leg of a warp
/// composition passes points through unchanged instead of aborting the frame.
#[derive(Debug, Clone, Default)]
pub struct ThinPlateSpline {
    source: Vec<Point2>,
    target: Vec<Point2>,
    forward: Option<TpsParameters>,
    inverse: Option<TpsParameters>,
    forward_factor: Option<CachedFactorization>,
    inverse_factor: Option<CachedFactorization>,
}

impl ThinPlateSpline {
    /// An unfit (identity) spline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit a new spline from `source` to `target`.
    pub fn fitted(source: &[Point2], target: &[Point2]) -> WarpResult<Self> {
        let mut tps = Self::new();
        tps.fit(source, target)?;
        Ok(tps)
    }

    /// A spline fit from `points` onto themselves.
    ///
    /// Evaluates to the identity, but unlike an unfit spline it carries
    /// factorizations, so it can be moved later with the fast update paths.
    pub fn identity(points: &[Point2]) -> WarpResult<Self> {
        Self::fitted(points, points)
    }

    /// Fit forward (source → target) and inverse (target → source)
    /// parameters, replacing any previous fit wholesale.
    ///
    /// On failure the spline is left unfit (identity in both directions) and
    /// the error is returned.
    #[tracing::instrument(level = "debug", skip_all, fields(m = source.len()))]
    pub fn fit(&mut self, source: &[Point2], target: &[Point2]) -> WarpResult<()> {
        let result = Self::solve_both(source, target);
        match result {
            Ok((fwd_factor, inv_factor)) => {
                self.forward = Some(fwd_factor.coefficients(target));
                self.inverse = Some(inv_factor.coefficients(source));
                self.forward_factor = Some(fwd_factor);
                self.inverse_factor = Some(inv_factor);
                self.source = source.to_vec();
                self.target = target.to_vec();
                debug!("spline fit");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "spline fit failed, falling back to identity");
                *self = Self::default();
                Err(e)
            }
        }
    }

    fn solve_both(
        source: &[Point2],
        target: &[Point2],
    ) -> WarpResult<(CachedFactorization, CachedFactorization)> {
        check_correspondence(source, target)?;
        let fwd = CachedFactorization::solve(source)?;
        let inv = CachedFactorization::solve(target)?;
        Ok((fwd, inv))
    }

    /// Map a point from source space to target space.
    #[inline]
    pub fn forward(&self, p: Point2) -> Point2 {
        match &self.forward {
            Some(params) => params.evaluate(p),
            None => p,
        }
    }

    /// Map a point from target space back to source space.
    #[inline]
    pub fn inverse(&self, p: Point2) -> Point2 {
        match &self.inverse {
            Some(params) => params.evaluate(p),
            None => p,
        }
    }

    /// Refit the forward coefficients for new targets, keeping the source
    /// points and reusing the cached `A⁻¹`.
    ///
    /// The inverse parameters are left as they were. Fails with
    /// `CorrespondenceMismatch` if `new_target` differs in length from the
    /// fitted source set, and with `NotFitted` if the spline was never fit.
    pub fn update_target_points(&mut self, new_target: &[Point2]) -> WarpResult<&TpsParameters> {
        let factor = self.forward_factor.as_ref().ok_or(WarpError::NotFitted)?;
        if new_target.len() != factor.m() {
            return Err(WarpError::CorrespondenceMismatch {
                expected: factor.m(),
                got: new_target.len(),
            });
        }
        self.target = new_target.to_vec();
        Ok(self.forward.insert(factor.coefficients(new_target)))
    }

    /// Refit the inverse direction for new targets and pin its linear part
    /// to the identity.
    ///
    /// The new targets become the inverse spline's control points, so its
    /// system is re-solved and the inverse factorization replaced. The
    /// forward parameters are left as they were. On a singular system the
    /// previous inverse parameters stay in place and the error is returned.
    /// Fails with `NotFitted` if the spline was never fit.
    pub fn update_inverse_target_points(
        &mut self,
        new_target: &[Point2],
    ) -> WarpResult<&TpsParameters> {
        if self.inverse.is_none() {
            return Err(WarpError::NotFitted);
        }
        if new_target.len() != self.source.len() {
            return Err(WarpError::CorrespondenceMismatch {
                expected: self.source.len(),
                got: new_target.len(),
            });
        }
        let factor = CachedFactorization::solve(new_target)?;
        let mut params = factor.coefficients(&self.source);
        params.pin_linear_identity();
        self.inverse_factor = Some(factor);
        self.target = new_target.to_vec();
        Ok(self.inverse.insert(params))
    }

    #[inline]
    pub fn is_fit(&self) -> bool {
        self.forward.is_some()
    }

    pub fn source_points(&self) -> &[Point2] {
        &self.source
    }

    pub fn target_points(&self) -> &[Point2] {
        &self.target
    }

    pub fn forward_parameters(&self) -> Option<&TpsParameters> {
        self.forward.as_ref()
    }

    pub fn inverse_parameters(&self) -> Option<&TpsParameters> {
        self.inverse.as_ref()
    }

    pub fn forward_factorization(&self) -> Option<&CachedFactorization> {
        self.forward_factor.as_ref()
    }

    pub fn inverse_factorization(&self) -> Option<&CachedFactorization> {
        self.inverse_factor.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64) -> Point2 {
        Point2::new(x, y)
    }

    fn assert_near(a: Point2, b: Point2, tol: f64) {
        assert!(
            (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol,
            "{a} vs {b} (tol {tol})"
        );
    }

    fn grid_source() -> Vec<Point2> {
        let mut pts = Vec::new();
        for j in 0..4 {
            for i in 0..4 {
                pts.push(p(i as f64 * 20.0, j as f64 * 20.0));
            }
        }
        pts
    }

    fn bulged(src: &[Point2]) -> Vec<Point2> {
        src.iter()
            .map(|q| p(q.x + 0.05 * (q.y - 30.0), q.y + 3.0 * ((q.x / 60.0) * 3.0).sin()))
            .collect()
    }

    #[test]
    fn test_kernel_zero_at_origin() {
        assert_eq!(kernel(0.0, 0.0), 0.0);
        // r² = 1 → ln 1 = 0.
        assert_eq!(kernel(1.0, 0.0), 0.0);
        assert!((kernel(2.0, 0.0) - 4.0 * 4.0f64.ln()).abs() < 1e-12);
        assert_eq!(kernel(3.0, -4.0), kernel(-3.0, 4.0));
    }

    #[test]
    fn test_system_matrix_layout() {
        let pts = [p(0.0, 0.0), p(10.0, 0.0), p(0.0, 10.0)];
        let a = system_matrix(&pts);
        assert_eq!(a.nrows(), 6);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(a[(i, j)], 0.0);
            }
        }
        assert_eq!(a[(0, 4)], 1.0);
        assert_eq!(a[(1, 4)], 10.0);
        assert_eq!(a[(5, 2)], 10.0);
        assert_eq!(a[(3, 3)], 0.0);
        assert_eq!(a[(3, 4)], a[(4, 3)]);
    }

    #[test]
    fn test_interpolation_property() {
        let src = grid_source();
        let dst = bulged(&src);
        let tps = ThinPlateSpline::fitted(&src, &dst).unwrap();
        for (s, t) in src.iter().zip(&dst) {
            assert_near(tps.forward(*s), *t, 1e-6);
            assert_near(tps.inverse(*t), *s, 1e-6);
        }
    }

    #[test]
    fn test_inverse_round_trip() {
        let src = grid_source();
        let dst = bulged(&src);
        let tps = ThinPlateSpline::fitted(&src, &dst).unwrap();
        for q in [p(10.0, 10.0), p(35.0, 22.0), p(47.5, 51.0)] {
            assert_near(tps.inverse(tps.forward(q)), q, 0.1);
        }
    }

    #[test]
    fn test_unfit_is_identity() {
        let tps = ThinPlateSpline::new();
        assert!(!tps.is_fit());
        let q = p(123.4, -5.0);
        assert_eq!(tps.forward(q), q);
        assert_eq!(tps.inverse(q), q);
    }

    #[test]
    fn test_failed_fit_resets_to_identity() {
        let src = grid_source();
        let mut tps = ThinPlateSpline::fitted(&src, &bulged(&src)).unwrap();
        let err = tps.fit(&src[..2], &src[..2]).unwrap_err();
        assert!(matches!(err, WarpError::TooFewPoints { got: 2, min: 3 }));
        assert!(!tps.is_fit());
        assert_eq!(tps.forward(p(5.0, 5.0)), p(5.0, 5.0));
    }

    #[test]
    fn test_coincident_points_are_singular() {
        let src = [p(2.0, 3.0), p(2.0, 3.0), p(2.0, 3.0)];
        let err = ThinPlateSpline::fitted(&src, &src).unwrap_err();
        assert!(matches!(err, WarpError::SingularSystem { .. }));
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let src = grid_source();
        let err = ThinPlateSpline::fitted(&src, &src[..5]).unwrap_err();
        assert!(matches!(
            err,
            WarpError::CorrespondenceMismatch { expected: 16, got: 5 }
        ));
    }

    #[test]
    fn test_update_target_points_matches_full_fit() {
        let src = grid_source();
        let t1 = bulged(&src);
        let t2: Vec<Point2> = src.iter().map(|q| p(q.x * 1.1 - 2.0, q.y + 0.02 * q.x)).collect();

        let mut fast = ThinPlateSpline::fitted(&src, &t1).unwrap();
        fast.update_target_points(&t2).unwrap();
        let full = ThinPlateSpline::fitted(&src, &t2).unwrap();

        for q in [p(0.0, 0.0), p(13.0, 41.0), p(59.0, 7.5), p(80.0, 80.0)] {
            assert_near(fast.forward(q), full.forward(q), 1e-8);
        }
        assert_eq!(fast.target_points(), &t2[..]);
    }

    #[test]
    fn test_update_target_points_length_check() {
        let src = grid_source();
        let mut tps = ThinPlateSpline::identity(&src).unwrap();
        let err = tps.update_target_points(&src[..15]).unwrap_err();
        assert!(matches!(err, WarpError::CorrespondenceMismatch { expected: 16, got: 15 }));
        let err = ThinPlateSpline::new().update_target_points(&src).unwrap_err();
        assert!(matches!(err, WarpError::NotFitted), "got {err}");
    }

    #[test]
    fn test_update_inverse_pins_linear_part() {
        let src = grid_source();
        let mut tps = ThinPlateSpline::identity(&src).unwrap();
        let moved: Vec<Point2> = src.iter().map(|q| p(q.x * 1.5, q.y * 0.5)).collect();
        let params = tps.update_inverse_target_points(&moved).unwrap();
        assert_eq!(params.xc[1], 1.0);
        assert_eq!(params.xc[2], 0.0);
        assert_eq!(params.yc[1], 0.0);
        assert_eq!(params.yc[2], 1.0);
        assert_eq!(params.control_points, moved);
        assert_eq!(params.xc.len(), src.len() + 3);
    }

    #[test]
    fn test_update_inverse_keeps_translation() {
        let src = grid_source();
        let mut tps = ThinPlateSpline::identity(&src).unwrap();
        let moved: Vec<Point2> = src.iter().map(|q| p(q.x + 5.0, q.y - 3.0)).collect();
        tps.update_inverse_target_points(&moved).unwrap();
        // A pure translation already has an identity linear part, so the
        // pin leaves the solved map exact.
        for (m, s) in moved.iter().zip(&src) {
            assert_near(tps.inverse(*m), *s, 1e-6);
        }
        assert_near(tps.inverse(p(100.0, 100.0)), p(95.0, 103.0), 1e-6);
    }

    #[test]
    fn test_update_inverse_length_check() {
        let src = grid_source();
        let mut tps = ThinPlateSpline::identity(&src).unwrap();
        let before = tps.inverse_parameters().cloned();
        assert!(tps.update_inverse_target_points(&src[..3]).is_err());
        assert_eq!(tps.inverse_parameters().cloned(), before);
    }
}
