//! Schur elimination of point blocks from the damped Hessian.
//!
//! Points interact only through camera parameters, so the point-point
//! Hessian is block diagonal with 3x3 blocks. Eliminating it yields the
//! Schur complement over the camera columns,
//!
//! S = H_cc - sum_i H_cp_i * H_pp_i^-1 * H_pc_i,
//!
//! whose inverse is the camera covariance. Point marginals are recovered by
//! back-substitution,
//!
//! Cov_i = H_pp_i^-1 + H_pp_i^-1 * H_pc_i * S^-1 * H_cp_i * H_pp_i^-1.
//!
//! Rank deficiency anywhere in this pipeline is a property of the problem,
//! not a caller mistake, and surfaces as `Ok(None)`.

use std::collections::BTreeMap;

use nalgebra::{Cholesky, DMatrix, Matrix3, Vector3};
use rayon::prelude::*;
use tracing::warn;

use crate::covariance::jacobian::TangentLayout;
use crate::error::CovarianceResult;
use crate::linalg::{LinAlgError, SparseMatrix};
use crate::scene::Point3DId;

/// Camera covariance and point marginals from one Schur pass.
pub(crate) struct SchurSolution {
    /// Inverse Schur complement over the camera columns, symmetric
    pub cam_cov: DMatrix<f64>,
    /// Marginal point covariances, layout order
    pub point_covs: Vec<(Point3DId, Matrix3<f64>)>,
}

struct PointBlock {
    point3d_id: Point3DId,
    hpp_inv: Matrix3<f64>,
    /// Camera columns coupled to this point
    rows: Vec<usize>,
    /// H_pp^-1 * w_r for each coupled camera column r
    transformed: Vec<Vector3<f64>>,
}

/// Eliminate the point blocks of a damped Hessian and invert the result.
///
/// `hessian` must be the symmetric damped Gauss-Newton Hessian over the
/// layout columns. Point marginals are skipped unless requested since
/// back-substitution dominates for large point counts.
pub(crate) fn solve_schur(
    hessian: &SparseMatrix,
    layout: &TangentLayout,
    damping: f64,
    with_point_covs: bool,
) -> CovarianceResult<Option<SchurSolution>> {
    let num_cam = layout.num_cam_cols();

    // Camera-camera block. Coupling entries live in the point columns and
    // are picked up there.
    let mut schur = DMatrix::zeros(num_cam, num_cam);
    for col in 0..num_cam {
        let rows = hessian.row_idx_of_col_raw(col);
        let values = hessian.val_of_col(col);
        for (&row, &value) in rows.iter().zip(values) {
            if row < num_cam {
                schur[(row, col)] = value;
            }
        }
    }

    let mut point_blocks = Vec::with_capacity(layout.point_entries().len());
    for entry in layout.point_entries() {
        let mut hpp = Matrix3::zeros();
        let mut coupling: BTreeMap<usize, Vector3<f64>> = BTreeMap::new();
        for k in 0..3 {
            let col = entry.offset + k;
            let rows = hessian.row_idx_of_col_raw(col);
            let values = hessian.val_of_col(col);
            for (&row, &value) in rows.iter().zip(values) {
                if row < num_cam {
                    coupling.entry(row).or_insert_with(Vector3::zeros)[k] = value;
                } else if row >= entry.offset && row < entry.offset + 3 {
                    hpp[(row - entry.offset, k)] = value;
                } else {
                    return Err(LinAlgError::InvalidInput(format!(
                        "point block of 3D point {} is coupled to another point block; \
                         points must interact only through camera parameters",
                        entry.point3d_id
                    ))
                    .into());
                }
            }
        }

        let cholesky = match Cholesky::new(hpp) {
            Some(cholesky) => cholesky,
            None => {
                warn!(
                    "Point block of 3D point {} is rank deficient, covariance unavailable (damping = {})",
                    entry.point3d_id, damping
                );
                return Ok(None);
            }
        };
        let hpp_inv = cholesky.inverse();

        let rows: Vec<usize> = coupling.keys().copied().collect();
        let couplings: Vec<Vector3<f64>> = coupling.into_values().collect();
        let transformed: Vec<Vector3<f64>> = couplings.iter().map(|w| hpp_inv * w).collect();
        for (a, &row_a) in rows.iter().enumerate() {
            for (b, &row_b) in rows.iter().enumerate() {
                schur[(row_a, row_b)] -= couplings[a].dot(&transformed[b]);
            }
        }

        point_blocks.push(PointBlock {
            point3d_id: entry.point3d_id,
            hpp_inv,
            rows,
            transformed,
        });
    }

    let cholesky = match Cholesky::new(schur) {
        Some(cholesky) => cholesky,
        None => {
            warn!(
                "Schur complement is not positive definite, the problem is likely gauge deficient (damping = {})",
                damping
            );
            return Ok(None);
        }
    };
    let inverse = cholesky.inverse();
    let cam_cov = (&inverse + &inverse.transpose()) * 0.5;

    let point_covs = if with_point_covs {
        point_blocks
            .par_iter()
            .map(|block| {
                let mut cov = block.hpp_inv;
                for (a, v_a) in block.transformed.iter().enumerate() {
                    for (b, v_b) in block.transformed.iter().enumerate() {
                        let weight = cam_cov[(block.rows[a], block.rows[b])];
                        cov += v_a * v_b.transpose() * weight;
                    }
                }
                let transposed = cov.transpose();
                (block.point3d_id, (cov + transposed) * 0.5)
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(Some(SchurSolution {
        cam_cov,
        point_covs,
    }))
}
