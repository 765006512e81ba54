//! Pinhole camera model (no distortion).
//!
//! The intrinsics of a camera form a 4-parameter block `[fx, fy, cx, cy]`
//! that can itself be estimated, so besides the usual point Jacobian the
//! model also exposes the Jacobian with respect to its own parameters.

use nalgebra::{DVector, Matrix2x3, Matrix2x4, Vector2, Vector3};

/// Number of intrinsic parameters for the pinhole camera
pub const INTRINSIC_DIM: usize = 4;

/// Minimum depth in front of the camera for a projection to be valid
const MIN_DEPTH: f64 = 1e-6;

/// Pinhole camera model with 4 intrinsic parameters.
///
/// # Parameters
///
/// - `fx`, `fy`: Focal lengths in pixels
/// - `cx`, `cy`: Principal point coordinates in pixels
///
/// # Projection Model
///
/// For a 3D point `p_cam = (x, y, z)` in camera frame (right-handed,
/// Z-axis pointing forward):
/// ```text
/// u = fx * (x/z) + cx
/// v = fy * (y/z) + cy
/// ```
///
/// # Example
///
/// ```
/// use ba_covariance::camera::PinholeCamera;
/// use nalgebra::Vector3;
///
/// let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
/// let p_cam = Vector3::new(0.1, 0.2, 1.0);
/// let uv = camera.project(&p_cam).expect("Valid projection");
///
/// assert!((uv.x - 370.0).abs() < 1e-10);  // 500 * 0.1 + 320
/// assert!((uv.y - 340.0).abs() < 1e-10);  // 500 * 0.2 + 240
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeCamera {
    /// Focal length in x direction (pixels)
    pub fx: f64,
    /// Focal length in y direction (pixels)
    pub fy: f64,
    /// Principal point x coordinate (pixels)
    pub cx: f64,
    /// Principal point y coordinate (pixels)
    pub cy: f64,
}

impl PinholeCamera {
    /// Create a new pinhole camera.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Build a camera from a `[fx, fy, cx, cy]` parameter block.
    ///
    /// Returns `None` if the block does not have exactly 4 entries.
    pub fn from_params(params: &DVector<f64>) -> Option<Self> {
        if params.len() != INTRINSIC_DIM {
            return None;
        }
        Some(Self::new(params[0], params[1], params[2], params[3]))
    }

    /// Intrinsics as a parameter block vector `[fx, fy, cx, cy]`.
    pub fn params(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.fx, self.fy, self.cx, self.cy])
    }

    /// Project a 3D point in camera frame to 2D pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z < MIN_DEPTH {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Whether a point in camera frame projects to a valid pixel.
    pub fn is_valid_point(&self, p_cam: &Vector3<f64>) -> bool {
        p_cam.z >= MIN_DEPTH
    }

    /// Jacobian of the projection with respect to the 3D point (2x3).
    ///
    /// ```text
    /// d(u,v)/d(x,y,z) = | fx/z    0   -fx*x/z^2 |
    ///                   |   0   fy/z  -fy*y/z^2 |
    /// ```
    pub fn jacobian_point(&self, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p_cam.z;
        let inv_z_sq = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z,
            0.0,
            -self.fx * p_cam.x * inv_z_sq,
            0.0,
            self.fy * inv_z,
            -self.fy * p_cam.y * inv_z_sq,
        )
    }

    /// Jacobian of the projection with respect to `[fx, fy, cx, cy]` (2x4).
    pub fn jacobian_intrinsics(&self, p_cam: &Vector3<f64>) -> Matrix2x4<f64> {
        let inv_z = 1.0 / p_cam.z;
        Matrix2x4::new(
            p_cam.x * inv_z,
            0.0,
            1.0,
            0.0,
            0.0,
            p_cam.y * inv_z,
            0.0,
            1.0,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_camera() -> PinholeCamera {
        PinholeCamera::new(500.0, 480.0, 320.0, 240.0)
    }

    #[test]
    fn test_project_center() {
        let camera = test_camera();
        let uv = camera
            .project(&Vector3::new(0.0, 0.0, 2.0))
            .expect("Test: point on optical axis projects");
        assert!((uv.x - 320.0).abs() < 1e-12);
        assert!((uv.y - 240.0).abs() < 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        let camera = test_camera();
        assert!(camera.project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(camera.project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
        assert!(!camera.is_valid_point(&Vector3::new(0.0, 0.0, -2.0)));
    }

    #[test]
    fn test_params_round_trip() {
        let camera = test_camera();
        let rebuilt =
            PinholeCamera::from_params(&camera.params()).expect("Test: 4-entry block accepted");
        assert_eq!(camera, rebuilt);

        let short = DVector::from_vec(vec![500.0, 500.0, 320.0]);
        assert!(PinholeCamera::from_params(&short).is_none());
    }

    #[test]
    fn test_jacobian_point_matches_numerical() {
        let camera = test_camera();
        let p = Vector3::new(0.3, -0.2, 1.7);
        let analytic = camera.jacobian_point(&p);

        let eps = 1e-7;
        for k in 0..3 {
            let mut fwd = p;
            let mut bwd = p;
            fwd[k] += eps;
            bwd[k] -= eps;
            let uv_fwd = camera.project(&fwd).expect("Test: forward projection");
            let uv_bwd = camera.project(&bwd).expect("Test: backward projection");
            let numerical = (uv_fwd - uv_bwd) / (2.0 * eps);
            for row in 0..2 {
                assert!(
                    (analytic[(row, k)] - numerical[row]).abs() < 1e-5,
                    "point Jacobian mismatch at ({row}, {k}): analytic {} vs numerical {}",
                    analytic[(row, k)],
                    numerical[row]
                );
            }
        }
    }

    #[test]
    fn test_jacobian_intrinsics_matches_numerical() {
        let camera = test_camera();
        let p = Vector3::new(0.25, 0.4, 2.1);
        let analytic = camera.jacobian_intrinsics(&p);

        let eps = 1e-7;
        let base = camera.params();
        for k in 0..INTRINSIC_DIM {
            let mut fwd = base.clone();
            let mut bwd = base.clone();
            fwd[k] += eps;
            bwd[k] -= eps;
            let cam_fwd = PinholeCamera::from_params(&fwd).expect("Test: perturbed camera");
            let cam_bwd = PinholeCamera::from_params(&bwd).expect("Test: perturbed camera");
            let uv_fwd = cam_fwd.project(&p).expect("Test: forward projection");
            let uv_bwd = cam_bwd.project(&p).expect("Test: backward projection");
            let numerical = (uv_fwd - uv_bwd) / (2.0 * eps);
            for row in 0..2 {
                assert!(
                    (analytic[(row, k)] - numerical[row]).abs() < 1e-6,
                    "intrinsics Jacobian mismatch at ({row}, {k})"
                );
            }
        }
    }
}
