//! Residual factors and their tangent-space Jacobians.
//!
//! A factor evaluates a residual and its Jacobian at given parameter values.
//! Jacobian columns are grouped per connected block, one group per block in
//! connection order, each group as wide as the block's parameterization
//! tangent. Rotation blocks are differentiated with respect to a right
//! perturbation q * exp(delta), matching the covariance tangent convention.

use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::camera::PinholeCamera;
use crate::manifold::{quat_from_coeffs, skew_symmetric};
use crate::problem::ProblemError;

/// Residual term connecting one or more parameter blocks.
///
/// Implementations must be thread safe; covariance estimation linearizes
/// residuals from parallel workers.
pub trait Factor: Send + Sync {
    /// Length of the residual vector
    fn residual_dim(&self) -> usize;

    /// Evaluate residual and Jacobian at the given block values.
    ///
    /// `params` holds the values of the connected blocks in connection
    /// order. The Jacobian must have `residual_dim()` rows and one column
    /// group per block, each group as wide as that block's parameterization
    /// tangent.
    fn linearize(
        &self,
        params: &[DVector<f64>],
    ) -> Result<(DVector<f64>, DMatrix<f64>), ProblemError>;
}

/// Pinhole reprojection error of one 3D point in one image.
///
/// Connects four blocks in order: rotation quaternion [x, y, z, w],
/// translation, 3D point, intrinsics [fx, fy, cx, cy]. The pose maps world
/// to camera coordinates, p_cam = R * p_world + t.
#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    observation: Vector2<f64>,
}

impl ReprojectionFactor {
    /// Create a factor for one observed pixel position.
    pub fn new(observation: Vector2<f64>) -> Self {
        Self { observation }
    }

    /// The observed pixel position
    pub fn observation(&self) -> &Vector2<f64> {
        &self.observation
    }
}

impl Factor for ReprojectionFactor {
    fn residual_dim(&self) -> usize {
        2
    }

    fn linearize(
        &self,
        params: &[DVector<f64>],
    ) -> Result<(DVector<f64>, DMatrix<f64>), ProblemError> {
        if params.len() != 4 {
            return Err(ProblemError::Evaluation(format!(
                "reprojection factor expects 4 parameter blocks, got {}",
                params.len()
            )));
        }
        let expected_lens = [4, 3, 3, 4];
        for (block, (values, expected)) in params.iter().zip(expected_lens).enumerate() {
            if values.len() != expected {
                return Err(ProblemError::Evaluation(format!(
                    "reprojection factor block {block} has {} values, expected {expected}",
                    values.len()
                )));
            }
        }

        let rotation = quat_from_coeffs(params[0].as_slice())
            .to_rotation_matrix()
            .into_inner();
        let translation = Vector3::new(params[1][0], params[1][1], params[1][2]);
        let p_world = Vector3::new(params[2][0], params[2][1], params[2][2]);
        let camera = PinholeCamera::from_params(&params[3]).ok_or_else(|| {
            ProblemError::Evaluation("intrinsics block must hold [fx, fy, cx, cy]".to_string())
        })?;

        let p_cam = rotation * p_world + translation;
        let projected = camera
            .project(&p_cam)
            .ok_or_else(|| ProblemError::Evaluation("point behind camera".to_string()))?;
        let residual = projected - self.observation;

        let j_proj = camera.jacobian_point(&p_cam);
        // d p_cam / d delta for p_cam = R * exp(delta) * p_world + t
        let j_rot = -(j_proj * rotation * skew_symmetric(&p_world));
        let j_point = j_proj * rotation;
        let j_intr = camera.jacobian_intrinsics(&p_cam);

        let mut jacobian = DMatrix::zeros(2, 13);
        jacobian.view_mut((0, 0), (2, 3)).copy_from(&j_rot);
        jacobian.view_mut((0, 3), (2, 3)).copy_from(&j_proj);
        jacobian.view_mut((0, 6), (2, 3)).copy_from(&j_point);
        jacobian.view_mut((0, 9), (2, 4)).copy_from(&j_intr);

        Ok((DVector::from_column_slice(residual.as_slice()), jacobian))
    }
}

/// Direct observation of a Euclidean block, residual = values - target.
///
/// Anchors a block with an identity Jacobian. Only meaningful for Euclidean
/// blocks; on manifold blocks the identity width disagrees with the tangent
/// and assembly rejects it.
#[derive(Debug, Clone)]
pub struct PriorFactor {
    target: DVector<f64>,
}

impl PriorFactor {
    /// Create a prior pulling a block towards the given target values.
    pub fn new(target: &[f64]) -> Self {
        Self {
            target: DVector::from_column_slice(target),
        }
    }
}

impl Factor for PriorFactor {
    fn residual_dim(&self) -> usize {
        self.target.len()
    }

    fn linearize(
        &self,
        params: &[DVector<f64>],
    ) -> Result<(DVector<f64>, DMatrix<f64>), ProblemError> {
        if params.len() != 1 {
            return Err(ProblemError::Evaluation(format!(
                "prior factor expects 1 parameter block, got {}",
                params.len()
            )));
        }
        let values = &params[0];
        if values.len() != self.target.len() {
            return Err(ProblemError::Evaluation(format!(
                "prior factor block has {} values, expected {}",
                values.len(),
                self.target.len()
            )));
        }

        let n = self.target.len();
        Ok((values - &self.target, DMatrix::identity(n, n)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::manifold::{quat_right_plus, so3_exp};

    fn test_params() -> Vec<DVector<f64>> {
        let q = so3_exp(&Vector3::new(0.1, -0.2, 0.15));
        vec![
            DVector::from_column_slice(q.coords.as_slice()),
            DVector::from_column_slice(&[0.3, -0.1, 0.5]),
            DVector::from_column_slice(&[0.4, 0.2, 3.0]),
            DVector::from_column_slice(&[520.0, 510.0, 320.0, 240.0]),
        ]
    }

    fn numerical_jacobian(factor: &ReprojectionFactor, params: &[DVector<f64>]) -> DMatrix<f64> {
        let eps = 1e-6;
        let mut jacobian = DMatrix::zeros(2, 13);
        let mut col = 0;
        for (block, width) in [(0usize, 3usize), (1, 3), (2, 3), (3, 4)] {
            for k in 0..width {
                let mut plus = params.to_vec();
                let mut minus = params.to_vec();
                if block == 0 {
                    let q = quat_from_coeffs(params[0].as_slice());
                    let mut delta = Vector3::zeros();
                    delta[k] = eps;
                    let q_plus = quat_right_plus(&q, &delta);
                    delta[k] = -eps;
                    let q_minus = quat_right_plus(&q, &delta);
                    plus[0] = DVector::from_column_slice(q_plus.coords.as_slice());
                    minus[0] = DVector::from_column_slice(q_minus.coords.as_slice());
                } else {
                    plus[block][k] += eps;
                    minus[block][k] -= eps;
                }
                let (r_plus, _) = factor.linearize(&plus).expect("Test: linearize plus");
                let (r_minus, _) = factor.linearize(&minus).expect("Test: linearize minus");
                for row in 0..2 {
                    jacobian[(row, col)] = (r_plus[row] - r_minus[row]) / (2.0 * eps);
                }
                col += 1;
            }
        }
        jacobian
    }

    #[test]
    fn test_residual_zero_at_exact_projection() {
        let params = test_params();
        let camera = PinholeCamera::from_params(&params[3]).expect("Test: camera");
        let q = quat_from_coeffs(params[0].as_slice());
        let p_cam = q.to_rotation_matrix() * Vector3::new(0.4, 0.2, 3.0)
            + Vector3::new(0.3, -0.1, 0.5);
        let observation = camera.project(&p_cam).expect("Test: projection");

        let factor = ReprojectionFactor::new(observation);
        let (residual, jacobian) = factor.linearize(&params).expect("Test: linearize");
        assert!(residual.norm() < 1e-12);
        assert_eq!(jacobian.nrows(), 2);
        assert_eq!(jacobian.ncols(), 13);
    }

    #[test]
    fn test_jacobian_matches_numerical_differentiation() {
        let params = test_params();
        let factor = ReprojectionFactor::new(Vector2::new(300.0, 250.0));
        let (_, analytic) = factor.linearize(&params).expect("Test: linearize");
        let numerical = numerical_jacobian(&factor, &params);

        for row in 0..2 {
            for col in 0..13 {
                let expected = analytic[(row, col)];
                let actual = numerical[(row, col)];
                assert!(
                    (expected - actual).abs() < 1e-4 * expected.abs().max(1.0),
                    "Jacobian mismatch at ({row}, {col}): analytic {expected}, numerical {actual}"
                );
            }
        }
    }

    #[test]
    fn test_point_behind_camera_fails_evaluation() {
        let factor = ReprojectionFactor::new(Vector2::new(320.0, 240.0));
        let params = vec![
            DVector::from_column_slice(&[0.0, 0.0, 0.0, 1.0]),
            DVector::from_column_slice(&[0.0, 0.0, 0.0]),
            DVector::from_column_slice(&[0.0, 0.0, -1.0]),
            DVector::from_column_slice(&[500.0, 500.0, 320.0, 240.0]),
        ];
        let result = factor.linearize(&params);
        assert!(matches!(result, Err(ProblemError::Evaluation(_))));
    }

    #[test]
    fn test_reprojection_validates_block_count() {
        let factor = ReprojectionFactor::new(Vector2::new(0.0, 0.0));
        let result = factor.linearize(&[DVector::zeros(4)]);
        assert!(matches!(result, Err(ProblemError::Evaluation(_))));
    }

    #[test]
    fn test_prior_residual_and_identity_jacobian() {
        let factor = PriorFactor::new(&[1.0, 2.0, 3.0]);
        assert_eq!(factor.residual_dim(), 3);

        let params = vec![DVector::from_column_slice(&[1.5, 1.0, 3.0])];
        let (residual, jacobian) = factor.linearize(&params).expect("Test: linearize");
        assert_eq!(residual.as_slice(), &[0.5, -1.0, 0.0]);
        assert_eq!(jacobian, DMatrix::identity(3, 3));
    }

    #[test]
    fn test_prior_validates_block_size() {
        let factor = PriorFactor::new(&[1.0, 2.0]);
        let params = vec![DVector::from_column_slice(&[1.0, 2.0, 3.0])];
        assert!(matches!(
            factor.linearize(&params),
            Err(ProblemError::Evaluation(_))
        ));
    }
}
