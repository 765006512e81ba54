//! Covariance estimation for bundle adjustment problems.
//!
//! Estimates tangent-space covariances of poses, points and further
//! parameter blocks from the Gauss-Newton approximation H = J^T J of the
//! Hessian at the current parameter values. The point-point block of H is
//! eliminated per point via the Schur complement, so problems with many 3D
//! points stay tractable; [`estimate_ba_covariance_dense`] inverts the full
//! damped Hessian instead and serves as a reference for moderate sizes.
//!
//! All covariances live in the tangent space of the estimated parameters.
//! Pose covariances are ordered rotation first, then translation, with
//! fixed translation components removed. Constant blocks and fixed
//! components carry no uncertainty; results are conditioned on them.
//!
//! Three outcomes are distinguished. Structural misuse of the API is an
//! error. A problem whose damped Hessian is rank deficient, typically from
//! an unfixed gauge, yields `Ok(None)`. Otherwise every requested and
//! estimable covariance is available, and lookups for constant entities,
//! unobserved points or foreign ids return `None` from the accessors.

mod jacobian;
pub mod partition;
mod schur;

use std::collections::HashMap;

use faer_ext::IntoNalgebra;
use nalgebra::{DMatrix, Matrix3};
use tracing::{debug, warn};

use crate::error::CovarianceResult;
use crate::linalg::{add_damping, gauss_newton_hessian, sparse_llt_inverse, LinAlgError};
use crate::problem::{BlockId, Problem};
use crate::scene::{ImageId, Point3DId, Reconstruction};

use jacobian::{assemble_tangent_jacobian, TangentLayout};
use schur::solve_schur;

/// Which covariances to recover.
///
/// The selection never changes what is estimated or marginalized; all
/// variable parameters stay in the system regardless. It only skips the
/// recovery work for covariances the caller does not need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovarianceParams {
    /// Point covariances only
    OnlyPoints,
    /// Pose covariances only
    OnlyPoses,
    /// Pose and point covariances
    PosesAndPoints,
    /// Pose, point and remaining block covariances
    #[default]
    All,
}

impl CovarianceParams {
    /// Whether pose covariances are recovered
    pub fn estimates_poses(&self) -> bool {
        match self {
            CovarianceParams::OnlyPoints => false,
            CovarianceParams::OnlyPoses => true,
            CovarianceParams::PosesAndPoints => true,
            CovarianceParams::All => true,
        }
    }

    /// Whether point covariances are recovered
    pub fn estimates_points(&self) -> bool {
        match self {
            CovarianceParams::OnlyPoints => true,
            CovarianceParams::OnlyPoses => false,
            CovarianceParams::PosesAndPoints => true,
            CovarianceParams::All => true,
        }
    }

    /// Whether covariances of non-pose non-point blocks are recovered
    pub fn estimates_others(&self) -> bool {
        match self {
            CovarianceParams::OnlyPoints => false,
            CovarianceParams::OnlyPoses => false,
            CovarianceParams::PosesAndPoints => false,
            CovarianceParams::All => true,
        }
    }
}

/// Options for covariance estimation.
#[derive(Debug, Clone, Copy)]
pub struct BACovarianceOptions {
    /// Which covariances to recover
    pub params: CovarianceParams,
    /// Ridge added to the Hessian diagonal before factorization. Zero
    /// disables damping; rank-deficient problems then fail cleanly.
    pub damping: f64,
}

impl Default for BACovarianceOptions {
    fn default() -> Self {
        Self {
            params: CovarianceParams::All,
            damping: 1e-8,
        }
    }
}

impl BACovarianceOptions {
    /// Default options: recover everything, damping 1e-8.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select which covariances to recover.
    pub fn with_params(mut self, params: CovarianceParams) -> Self {
        self.params = params;
        self
    }

    /// Set the diagonal damping.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }
}

/// Estimated covariances of one bundle adjustment problem.
///
/// Lookups return `None` for entities whose covariance was not estimated,
/// whether because the entity is constant, unobserved, excluded by
/// [`CovarianceParams`] or simply unknown.
#[derive(Debug, Clone, Default)]
pub struct BACovariance {
    pose_covs: HashMap<ImageId, DMatrix<f64>>,
    point_covs: HashMap<Point3DId, Matrix3<f64>>,
    other_covs: HashMap<BlockId, DMatrix<f64>>,
}

impl BACovariance {
    /// Tangent-space covariance of an image's world-to-camera pose.
    ///
    /// Rows and columns are ordered rotation first, then the free
    /// translation components.
    pub fn cam_from_world_cov(&self, image_id: ImageId) -> Option<&DMatrix<f64>> {
        self.pose_covs.get(&image_id)
    }

    /// Covariance of a 3D point position.
    pub fn point_cov(&self, point3d_id: Point3DId) -> Option<&Matrix3<f64>> {
        self.point_covs.get(&point3d_id)
    }

    /// Covariance of a non-pose non-point block, e.g. intrinsics, over its
    /// free components.
    pub fn other_params_cov(&self, block: BlockId) -> Option<&DMatrix<f64>> {
        self.other_covs.get(&block)
    }
}

fn validate_damping(damping: f64) -> CovarianceResult<()> {
    if !damping.is_finite() || damping < 0.0 {
        return Err(LinAlgError::InvalidInput(format!(
            "damping must be finite and non-negative, got {damping}"
        ))
        .into());
    }
    Ok(())
}

fn prepare_layout(
    reconstruction: &Reconstruction,
    problem: &Problem,
) -> CovarianceResult<TangentLayout> {
    let poses = partition::get_pose_params(reconstruction, problem);
    let points = partition::get_point_params(reconstruction, problem);
    let others = partition::get_other_params(problem, &poses, &points);
    let layout = TangentLayout::new(problem, &poses, &points, &others)?;
    debug!(
        "Covariance layout: {} poses, {} other blocks, {} points, {} tangent columns",
        layout.pose_ranges().len(),
        layout.other_ranges().len(),
        layout.point_entries().len(),
        layout.num_cols()
    );
    Ok(layout)
}

/// Estimate covariances by Schur elimination of the point blocks.
///
/// Returns `Ok(None)` when the damped Hessian is rank deficient, which with
/// zero damping is the expected outcome for problems with an unfixed gauge.
/// Structural misuse, such as malformed point blocks or parameter blocks
/// shared between estimated entities, is an error instead.
pub fn estimate_ba_covariance(
    options: &BACovarianceOptions,
    reconstruction: &Reconstruction,
    problem: &Problem,
) -> CovarianceResult<Option<BACovariance>> {
    validate_damping(options.damping)?;
    let layout = prepare_layout(reconstruction, problem)?;
    if layout.num_cols() == 0 {
        return Ok(Some(BACovariance::default()));
    }

    let jacobian = assemble_tangent_jacobian(problem, &layout)?;
    let hessian = gauss_newton_hessian(&jacobian)?;
    let damped = add_damping(&hessian, options.damping)?;
    let solution = match solve_schur(
        &damped,
        &layout,
        options.damping,
        options.params.estimates_points(),
    )? {
        Some(solution) => solution,
        None => return Ok(None),
    };

    let mut covariance = BACovariance::default();
    if options.params.estimates_poses() {
        for (image_id, range) in layout.pose_ranges() {
            let cov = solution
                .cam_cov
                .view((range.offset, range.offset), (range.size, range.size))
                .into_owned();
            covariance.pose_covs.insert(*image_id, cov);
        }
    }
    if options.params.estimates_others() {
        for (block, range) in layout.other_ranges() {
            let cov = solution
                .cam_cov
                .view((range.offset, range.offset), (range.size, range.size))
                .into_owned();
            covariance.other_covs.insert(*block, cov);
        }
    }
    if options.params.estimates_points() {
        for (point3d_id, cov) in solution.point_covs {
            covariance.point_covs.insert(point3d_id, cov);
        }
    }
    Ok(Some(covariance))
}

/// Estimate covariances by inverting the full damped Hessian.
///
/// Results match [`estimate_ba_covariance`] up to floating-point error.
/// Intended as a reference and for small problems; cost grows cubically
/// with the total tangent dimension.
pub fn estimate_ba_covariance_dense(
    options: &BACovarianceOptions,
    reconstruction: &Reconstruction,
    problem: &Problem,
) -> CovarianceResult<Option<BACovariance>> {
    validate_damping(options.damping)?;
    let layout = prepare_layout(reconstruction, problem)?;
    if layout.num_cols() == 0 {
        return Ok(Some(BACovariance::default()));
    }

    let jacobian = assemble_tangent_jacobian(problem, &layout)?;
    let hessian = gauss_newton_hessian(&jacobian)?;
    let damped = add_damping(&hessian, options.damping)?;
    let inverse = match sparse_llt_inverse(&damped)? {
        Some(inverse) => inverse,
        None => {
            warn!(
                "Damped Hessian is not positive definite, the problem is likely rank deficient (damping = {})",
                options.damping
            );
            return Ok(None);
        }
    };
    let full = inverse.as_ref().into_nalgebra();
    let full = (&full + &full.transpose()) * 0.5;

    let mut covariance = BACovariance::default();
    if options.params.estimates_poses() {
        for (image_id, range) in layout.pose_ranges() {
            let cov = full
                .view((range.offset, range.offset), (range.size, range.size))
                .into_owned();
            covariance.pose_covs.insert(*image_id, cov);
        }
    }
    if options.params.estimates_others() {
        for (block, range) in layout.other_ranges() {
            let cov = full
                .view((range.offset, range.offset), (range.size, range.size))
                .into_owned();
            covariance.other_covs.insert(*block, cov);
        }
    }
    if options.params.estimates_points() {
        for entry in layout.point_entries() {
            let cov = Matrix3::from_fn(|row, col| full[(entry.offset + row, entry.offset + col)]);
            covariance.point_covs.insert(entry.point3d_id, cov);
        }
    }
    Ok(Some(covariance))
}
