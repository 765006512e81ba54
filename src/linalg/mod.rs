//! Sparse linear algebra utilities shared by the covariance estimators.
//!
//! Large objects (tangent-space Jacobians, Gauss-Newton Hessians) are sparse
//! faer matrices; small dense blocks (per-point 3x3 systems, the reduced
//! camera system) use nalgebra. Conversions between the two worlds happen at
//! the block level.

use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::Triplet;
use faer::Side;
use thiserror::Error;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Type alias for dense faer matrices
pub type FaerMatrix = faer::Mat<f64>;

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Errors from sparse matrix construction and factorization
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Sparse matrix could not be assembled from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Layout conversion (e.g. transposition) failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Symbolic analysis of the sparsity pattern failed
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// A matrix expected to be invertible was numerically singular
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    /// Inputs with inconsistent dimensions
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Create a sparse matrix from triplets.
///
/// Duplicate entries at the same position are summed, which the Jacobian
/// assembly relies on.
pub fn triplets_to_sparse(
    rows: usize,
    cols: usize,
    triplets: &[Triplet<usize, usize, f64>],
) -> LinAlgResult<SparseMatrix> {
    faer::sparse::SparseColMat::try_new_from_triplets(rows, cols, triplets)
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("{e:?}")))
}

/// Form the Gauss-Newton Hessian approximation `H = J^T J`.
pub fn gauss_newton_hessian(jacobian: &SparseMatrix) -> LinAlgResult<SparseMatrix> {
    let jt = jacobian
        .as_ref()
        .transpose()
        .to_col_major()
        .map_err(|e| LinAlgError::MatrixConversion(format!("Transpose failed: {e:?}")))?;
    Ok(jt.mul(jacobian))
}

/// Add `damping * I` to the diagonal of a square sparse matrix.
///
/// A zero damping returns the matrix unchanged so the sparsity pattern is
/// not widened with explicit zero diagonal entries.
pub fn add_damping(matrix: &SparseMatrix, damping: f64) -> LinAlgResult<SparseMatrix> {
    if matrix.nrows() != matrix.ncols() {
        return Err(LinAlgError::InvalidInput(format!(
            "damping requires a square matrix, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    if damping == 0.0 {
        return Ok(matrix.clone());
    }

    let n = matrix.ncols();
    let mut triplets = Vec::with_capacity(n);
    for i in 0..n {
        triplets.push(Triplet::new(i, i, damping));
    }
    let damping_diag = triplets_to_sparse(n, n, &triplets)?;
    Ok(matrix.clone() + damping_diag)
}

/// Solve `A x = b` for a symmetric positive definite sparse `A` via Cholesky.
///
/// Returns `Ok(None)` when the numerical factorization fails, i.e. the
/// matrix is not positive definite. Symbolic analysis failures are
/// structural and surface as errors.
pub fn sparse_llt_solve(
    matrix: &SparseMatrix,
    rhs: &FaerMatrix,
) -> LinAlgResult<Option<FaerMatrix>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(LinAlgError::InvalidInput(format!(
            "Cholesky requires a square matrix, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    if rhs.nrows() != matrix.nrows() {
        return Err(LinAlgError::InvalidInput(format!(
            "right-hand side has {} rows, expected {}",
            rhs.nrows(),
            matrix.nrows()
        )));
    }

    let sym = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
        .map_err(|e| LinAlgError::FactorizationFailed(format!("Symbolic Cholesky failed: {e:?}")))?;
    match Llt::try_new_with_symbolic(sym, matrix.as_ref(), Side::Lower) {
        Ok(cholesky) => Ok(Some(cholesky.solve(rhs))),
        Err(_) => Ok(None),
    }
}

/// Compute the full inverse of a symmetric positive definite sparse matrix
/// by solving against the identity.
///
/// Returns `Ok(None)` when the matrix is not positive definite.
pub fn sparse_llt_inverse(matrix: &SparseMatrix) -> LinAlgResult<Option<FaerMatrix>> {
    let n = matrix.nrows();
    let identity = FaerMatrix::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
    sparse_llt_solve(matrix, &identity)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spd_3x3() -> SparseMatrix {
        // [4 1 0; 1 3 0; 0 0 2], symmetric positive definite.
        let triplets = vec![
            Triplet::new(0, 0, 4.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(2, 2, 2.0),
        ];
        triplets_to_sparse(3, 3, &triplets).expect("Test: valid triplets")
    }

    #[test]
    fn test_triplets_sum_duplicates() {
        let triplets = vec![Triplet::new(0, 0, 1.5), Triplet::new(0, 0, 2.5)];
        let m = triplets_to_sparse(2, 2, &triplets).expect("Test: duplicate triplets");
        assert_eq!(m.val_of_col(0), &[4.0][..]);
    }

    #[test]
    fn test_triplets_out_of_bounds() {
        let triplets = vec![Triplet::new(5, 0, 1.0)];
        assert!(triplets_to_sparse(2, 2, &triplets).is_err());
    }

    #[test]
    fn test_llt_solve_known_system() {
        let a = spd_3x3();
        // b chosen so that x = [1, 2, 3].
        let b = FaerMatrix::from_fn(3, 1, |i, _| [6.0, 7.0, 6.0][i]);
        let x = sparse_llt_solve(&a, &b)
            .expect("Test: solve succeeds")
            .expect("Test: matrix is positive definite");
        assert!((x[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((x[(1, 0)] - 2.0).abs() < 1e-12);
        assert!((x[(2, 0)] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_llt_inverse_round_trip() {
        let a = spd_3x3();
        let inv = sparse_llt_inverse(&a)
            .expect("Test: inverse succeeds")
            .expect("Test: matrix is positive definite");
        // A * A^{-1} = I, checked entry-wise through the sparse columns.
        for col in 0..3 {
            for row in 0..3 {
                let mut acc = 0.0;
                let rows = a.symbolic().row_idx_of_col_raw(row);
                let vals = a.val_of_col(row);
                for (idx, &r) in rows.iter().enumerate() {
                    acc += vals[idx] * inv[(r, col)];
                }
                // Works because A is symmetric: column `row` of A equals its row.
                let expected = if row == col { 1.0 } else { 0.0 };
                assert!((acc - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_llt_singular_returns_none() {
        // Rank-1 matrix.
        let triplets = vec![
            Triplet::new(0, 0, 1.0),
            Triplet::new(0, 1, 1.0),
            Triplet::new(1, 0, 1.0),
            Triplet::new(1, 1, 1.0),
        ];
        let m = triplets_to_sparse(2, 2, &triplets).expect("Test: valid triplets");
        let result = sparse_llt_inverse(&m).expect("Test: no structural error");
        assert!(result.is_none());
    }

    #[test]
    fn test_add_damping() {
        let a = spd_3x3();
        let damped = add_damping(&a, 0.5).expect("Test: damping succeeds");
        assert_eq!(damped.val_of_col(2), &[2.5][..]);
        // Off-diagonal entries untouched.
        let col0 = damped.val_of_col(0);
        assert!((col0[0] - 4.5).abs() < 1e-15);
        assert!((col0[1] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_add_zero_damping_keeps_pattern() {
        let triplets = vec![Triplet::new(0, 1, 1.0)];
        let m = triplets_to_sparse(2, 2, &triplets).expect("Test: valid triplets");
        let damped = add_damping(&m, 0.0).expect("Test: zero damping");
        assert_eq!(damped.compute_nnz(), 1);
    }

    #[test]
    fn test_hessian_of_identity_jacobian() {
        let triplets = vec![Triplet::new(0, 0, 2.0), Triplet::new(1, 1, 3.0)];
        let j = triplets_to_sparse(2, 2, &triplets).expect("Test: valid triplets");
        let h = gauss_newton_hessian(&j).expect("Test: J^T J succeeds");
        assert_eq!(h.val_of_col(0), &[4.0][..]);
        assert_eq!(h.val_of_col(1), &[9.0][..]);
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let a = spd_3x3();
        let b = FaerMatrix::zeros(2, 1);
        assert!(sparse_llt_solve(&a, &b).is_err());
    }
}
