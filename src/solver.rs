// solver.rs — Gauss-Jordan inversion over nalgebra's dense matrices.
//
// A spline fit solves one (m+3)×(m+3) system per direction, where m is the
// control-point count. m is tens to low hundreds of landmarks, so an O(n³)
// dense inverse on the CPU is well inside an interactive frame budget and we
// keep the inverse itself (not just a solution vector) because the
// target-only refit is a plain matrix-vector product against it.
//
// PIVOTING:
// Pivot search is zero-avoidance only: when the diagonal entry is exactly
// zero we scan downward for the first nonzero row and swap. There is no
// partial pivoting by magnitude, so nalgebra's LU is not used here. The TPS
// system always has a zero block in its top-left corner, so the swap path
// runs on every fit. Systems that are technically nonsingular but badly
// conditioned can therefore lose precision.

use nalgebra::DMatrix;

use crate::error::{WarpError, WarpResult};

/// Dense runtime-sized matrix used for the spline systems.
pub type Matrix = DMatrix<f64>;

/// Invert a square matrix with Gauss-Jordan elimination on `[A | I]`.
///
/// Returns `WarpError::SingularSystem` when some column has no nonzero
/// pivot at or below the diagonal.
///
/// # Panics
/// Panics if `a` is not square.
pub fn invert(a: &Matrix) -> WarpResult<Matrix> {
    assert!(a.is_square(), "invert() needs a square matrix ({}×{})", a.nrows(), a.ncols());
    let n = a.nrows();
    let mut a = a.clone();
    let mut inv = Matrix::identity(n, n);

    for i in 0..n {
        // Zero-avoidance: only swap when the pivot is exactly zero.
        if a[(i, i)] == 0.0 {
            match (i + 1..n).find(|&r| a[(r, i)] != 0.0) {
                Some(r) => {
                    a.swap_rows(i, r);
                    inv.swap_rows(i, r);
                }
                None => return Err(WarpError::SingularSystem { size: n }),
            }
        }

        let pivot = a[(i, i)];
        if !pivot.is_finite() {
            return Err(WarpError::SingularSystem { size: n });
        }
        let mut row = a.row_mut(i);
        row /= pivot;
        let mut row = inv.row_mut(i);
        row /= pivot;

        let pivot_row = a.row(i).clone_owned();
        let inv_pivot_row = inv.row(i).clone_owned();
        for r in 0..n {
            if r == i {
                continue;
            }
            let factor = a[(r, i)];
            if factor == 0.0 {
                continue;
            }
            let mut row = a.row_mut(r);
            row -= &pivot_row * factor;
            let mut row = inv.row_mut(r);
            row -= &inv_pivot_row * factor;
        }
    }

    Ok(inv)
}
