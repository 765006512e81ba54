//! Minimal SO(3) manifold helpers for tangent-space linearization.
//!
//! Rotations are stored as unit quaternions with coefficients ordered
//! `[x, y, z, w]` and perturbed on the right: `q' = q * exp(delta)` where
//! `delta` is a 3-vector in the local tangent space. Covariances and
//! Jacobians for rotation blocks therefore live in this 3-dimensional
//! tangent space, not in the 4 raw quaternion coefficients.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Build the skew-symmetric cross-product matrix `[v]x` of a 3-vector.
///
/// Satisfies `skew_symmetric(v) * w == v.cross(&w)` for all `w`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map from the SO(3) tangent space to a unit quaternion.
///
/// The input is a scaled axis: direction gives the rotation axis, magnitude
/// the rotation angle in radians. Near-zero rotations fall back to the
/// identity to avoid dividing by the vanishing angle.
pub fn so3_exp(theta: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle_sq = theta.norm_squared();
    if angle_sq < 1e-24 {
        return UnitQuaternion::identity();
    }

    let angle = angle_sq.sqrt();
    let half_angle = 0.5 * angle;
    let scale = half_angle.sin() / angle;
    UnitQuaternion::from_quaternion(Quaternion::new(
        half_angle.cos(),
        theta.x * scale,
        theta.y * scale,
        theta.z * scale,
    ))
}

/// Right-perturb a unit quaternion by a tangent increment: `q * exp(delta)`.
pub fn quat_right_plus(q: &UnitQuaternion<f64>, delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    q * so3_exp(delta)
}

/// Reconstruct a unit quaternion from raw `[x, y, z, w]` coefficients.
///
/// The coefficients are renormalized, so slightly drifted inputs (e.g. after
/// many optimizer updates) still yield a valid rotation.
pub fn quat_from_coeffs(coeffs: &[f64]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        coeffs[3], coeffs[0], coeffs[1], coeffs[2],
    ))
}
