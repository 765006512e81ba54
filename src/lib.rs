//! Tangent-space covariance estimation for bundle adjustment.
//!
//! Builds the Gauss-Newton Hessian of a bundle adjustment problem and
//! recovers pose, point and intrinsics covariances by eliminating the point
//! blocks via the Schur complement. Covariances are expressed in the
//! tangent space of the estimated parameters and are conditioned on all
//! constant blocks and fixed components.
//!
//! # Example
//!
//! ```
//! use ba_covariance::camera::PinholeCamera;
//! use ba_covariance::covariance::{estimate_ba_covariance, BACovarianceOptions};
//! use ba_covariance::problem::{Parameterization, Problem, ReprojectionFactor};
//! use ba_covariance::scene::Reconstruction;
//! use nalgebra::Vector3;
//!
//! let mut problem = Problem::new();
//! let mut reconstruction = Reconstruction::new();
//!
//! let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
//! let intrinsics = problem.add_block(camera.params().as_slice(), Parameterization::Euclidean)?;
//! problem.set_constant(intrinsics)?;
//! reconstruction.add_camera(0, intrinsics)?;
//!
//! // Two views half a unit apart, both looking down the z axis.
//! let mut images = Vec::new();
//! for (image_id, shift) in [(0u32, 0.0), (1u32, 0.5)] {
//!     let rotation = problem.add_block(&[0.0, 0.0, 0.0, 1.0], Parameterization::UnitQuaternion)?;
//!     let translation = problem.add_block(&[shift, 0.0, 0.0], Parameterization::Euclidean)?;
//!     reconstruction.add_image(image_id, 0, rotation, translation)?;
//!     images.push((rotation, translation, Vector3::new(shift, 0.0, 0.0)));
//! }
//!
//! let coordinates = [
//!     [0.0, 0.0, 4.0], [1.0, -0.5, 5.0], [-0.8, 0.6, 4.5],
//!     [0.3, 0.8, 6.0], [-0.5, -0.7, 5.5], [0.9, 0.1, 4.2],
//! ];
//! for (i, &[x, y, z]) in coordinates.iter().enumerate() {
//!     let point = Vector3::new(x, y, z);
//!     let position = problem.add_block(point.as_slice(), Parameterization::Euclidean)?;
//!     reconstruction.add_point3d(i as u64, position)?;
//!     // Three fixed points anchor the gauge.
//!     if i < 3 {
//!         problem.set_constant(position)?;
//!     }
//!     for &(rotation, translation, offset) in &images {
//!         let observation = camera.project(&(point + offset)).unwrap();
//!         problem.add_residual(
//!             &[rotation, translation, position, intrinsics],
//!             Box::new(ReprojectionFactor::new(observation)),
//!         )?;
//!     }
//! }
//!
//! let covariance =
//!     estimate_ba_covariance(&BACovarianceOptions::default(), &reconstruction, &problem)?
//!         .expect("problem is well constrained");
//! let pose_cov = covariance.cam_from_world_cov(0).expect("pose is estimated");
//! assert_eq!(pose_cov.nrows(), 6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod camera;
pub mod covariance;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod problem;
pub mod scene;

pub use covariance::{
    estimate_ba_covariance, estimate_ba_covariance_dense, BACovariance, BACovarianceOptions,
    CovarianceParams,
};
pub use error::{CovarianceError, CovarianceResult};
pub use logger::{init_logger, init_logger_with_level};
