//! Integration tests for rank deficient and near-degenerate problems
//!
//! Covers points far enough from the cameras that their depth carries no
//! information, and problems whose gauge is entirely unconstrained. Default
//! damping must turn both cases into usable estimates, and the detection
//! logic must refuse both once damping is removed.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]


use ba_covariance::camera::PinholeCamera;
use ba_covariance::problem::{Parameterization, Problem, ReprojectionFactor};
use ba_covariance::scene::Reconstruction;
use ba_covariance::{estimate_ba_covariance, estimate_ba_covariance_dense, BACovarianceOptions};
use nalgebra::Vector3;
use synthetic::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ============================================================================
// 1. Scene construction
// ============================================================================

/// Two views separated by a unit baseline along y, observing ten points
/// whose depths grow from 1 to 1e9 in powers of ten.
///
/// The first pose and the shared intrinsics are constant; the x component
/// of the second translation is fixed, leaving a five dimensional pose
/// tangent. Without damping the distant points carry no depth information.
fn build_depth_ramp_scene() -> (Problem, Reconstruction) {
    let mut problem = Problem::new();
    let mut reconstruction = Reconstruction::new();

    let camera = PinholeCamera::new(500.0, 500.0, 0.0, 0.0);
    let intrinsics = problem
        .add_block(camera.params().as_slice(), Parameterization::Euclidean)
        .expect("Test: add intrinsics");
    problem.set_constant(intrinsics).expect("Test: set constant");
    reconstruction
        .add_camera(1, intrinsics)
        .expect("Test: add camera");

    let rotation1 = problem
        .add_block(&[0.0, 0.0, 0.0, 1.0], Parameterization::UnitQuaternion)
        .expect("Test: add rotation");
    let translation1 = problem
        .add_block(&[0.0, 0.0, 0.0], Parameterization::Euclidean)
        .expect("Test: add translation");
    problem.set_constant(rotation1).expect("Test: set constant");
    problem
        .set_constant(translation1)
        .expect("Test: set constant");
    reconstruction
        .add_image(1, 1, rotation1, translation1)
        .expect("Test: add image");

    let rotation2 = problem
        .add_block(&[0.0, 0.0, 0.0, 1.0], Parameterization::UnitQuaternion)
        .expect("Test: add rotation");
    let translation2 = problem
        .add_block(&[0.0, 1.0, 0.0], Parameterization::Euclidean)
        .expect("Test: add translation");
    problem
        .set_fixed_components(translation2, &[0])
        .expect("Test: fix x component");
    reconstruction
        .add_image(2, 1, rotation2, translation2)
        .expect("Test: add image");

    let baseline = Vector3::new(0.0, 1.0, 0.0);
    for k in 0..10u32 {
        let angle = f64::from(k) * std::f64::consts::FRAC_PI_2;
        let point = Vector3::new(angle.cos(), angle.sin(), 10f64.powi(k as i32));
        let position = problem
            .add_block(point.as_slice(), Parameterization::Euclidean)
            .expect("Test: add point");
        reconstruction
            .add_point3d(u64::from(k) + 1, position)
            .expect("Test: add point");

        let obs1 = camera.project(&point).expect("Test: point in front");
        let obs2 = camera
            .project(&(point + baseline))
            .expect("Test: point in front");
        problem
            .add_residual(
                &[rotation1, translation1, position, intrinsics],
                Box::new(ReprojectionFactor::new(obs1)),
            )
            .expect("Test: add residual");
        problem
            .add_residual(
                &[rotation2, translation2, position, intrinsics],
                Box::new(ReprojectionFactor::new(obs2)),
            )
            .expect("Test: add residual");
    }

    (problem, reconstruction)
}

/// Two rigid clusters of two images and six points each, twenty units
/// apart, with no observations across clusters. Only the shared intrinsics
/// are constant, so each cluster keeps its full seven dimensional gauge.
fn build_disconnected_scene() -> (Problem, Reconstruction) {
    let mut problem = Problem::new();
    let mut reconstruction = Reconstruction::new();

    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
    let intrinsics = problem
        .add_block(camera.params().as_slice(), Parameterization::Euclidean)
        .expect("Test: add intrinsics");
    problem.set_constant(intrinsics).expect("Test: set constant");
    reconstruction
        .add_camera(1, intrinsics)
        .expect("Test: add camera");

    let local_points = [
        Vector3::new(-1.2, 0.4, 4.6),
        Vector3::new(0.9, -0.7, 5.3),
        Vector3::new(0.3, 1.1, 5.8),
        Vector3::new(-0.6, -1.0, 4.2),
        Vector3::new(1.4, 0.8, 6.1),
        Vector3::new(-0.2, 0.1, 5.0),
    ];

    let mut next_image = 1u32;
    let mut next_point = 1u64;
    for cluster in 0..2 {
        let shift = Vector3::new(20.0 * f64::from(cluster), 0.0, 0.0);

        let mut images = Vec::new();
        for local in 0..2 {
            let center = shift + Vector3::new(f64::from(local), 0.0, 0.0);
            let translation = -center;
            let rotation_block = problem
                .add_block(&[0.0, 0.0, 0.0, 1.0], Parameterization::UnitQuaternion)
                .expect("Test: add rotation");
            let translation_block = problem
                .add_block(translation.as_slice(), Parameterization::Euclidean)
                .expect("Test: add translation");
            reconstruction
                .add_image(next_image, 1, rotation_block, translation_block)
                .expect("Test: add image");
            images.push((rotation_block, translation_block, translation));
            next_image += 1;
        }

        for local in &local_points {
            let point = shift + local;
            let position = problem
                .add_block(point.as_slice(), Parameterization::Euclidean)
                .expect("Test: add point");
            reconstruction
                .add_point3d(next_point, position)
                .expect("Test: add point");
            next_point += 1;

            for &(rotation_block, translation_block, translation) in &images {
                let observation = camera
                    .project(&(point + translation))
                    .expect("Test: point in front");
                problem
                    .add_residual(
                        &[rotation_block, translation_block, position, intrinsics],
                        Box::new(ReprojectionFactor::new(observation)),
                    )
                    .expect("Test: add residual");
            }
        }
    }

    (problem, reconstruction)
}

// ============================================================================
// 2. Distant points with depth ramp
// ============================================================================

#[test]
fn test_far_points_recoverable_with_default_damping() -> TestResult {
    let (problem, reconstruction) = build_depth_ramp_scene();

    let options = BACovarianceOptions::default();
    let estimate = estimate_ba_covariance(&options, &reconstruction, &problem)?
        .expect("Test: damping must regularize the distant points");
    let reference = estimate_ba_covariance_dense(&options, &reconstruction, &problem)?
        .expect("Test: dense estimate");

    // Pose 1 is fully constant, pose 2 keeps rotation plus two translation
    // components.
    assert!(estimate.cam_from_world_cov(1).is_none());
    let pose_cov = estimate
        .cam_from_world_cov(2)
        .expect("Test: pose covariance");
    assert_eq!(pose_cov.nrows(), 5);
    assert_eq!(pose_cov.ncols(), 5);
    assert_symmetric(pose_cov, 1e-12, "pose covariance");
    let pose_reference = reference
        .cam_from_world_cov(2)
        .expect("Test: reference pose covariance");
    assert_matrix_near_relative(pose_cov, pose_reference, 1e-6, "pose covariance");

    for point_id in 1..=10u64 {
        let cov = estimate.point_cov(point_id).expect("Test: point covariance");
        let expected = reference
            .point_cov(point_id)
            .expect("Test: reference point covariance");
        assert_matrix3_near_relative(cov, expected, 1e-6, "point covariance");
    }

    // The farthest point's depth is held up by the damping term alone; the
    // nearest point's depth is orders of magnitude better determined.
    let near = estimate.point_cov(1).expect("Test: near point");
    let far = estimate.point_cov(10).expect("Test: far point");
    assert!(
        far[(2, 2)] > 1e6,
        "Test: far point depth variance {}",
        far[(2, 2)]
    );
    assert!(
        near[(2, 2)] < 1e-3 * far[(2, 2)],
        "Test: near point depth variance {} vs far {}",
        near[(2, 2)],
        far[(2, 2)]
    );
    Ok(())
}

#[test]
fn test_far_points_rejected_without_damping() -> TestResult {
    let (problem, reconstruction) = build_depth_ramp_scene();

    let estimate = estimate_ba_covariance(
        &BACovarianceOptions::default().with_damping(0.0),
        &reconstruction,
        &problem,
    )?;
    assert!(
        estimate.is_none(),
        "Test: undamped distant points must be detected as rank deficient"
    );
    Ok(())
}

// ============================================================================
// 3. Unconstrained gauge
// ============================================================================

#[test]
fn test_disconnected_clusters_recoverable_with_default_damping() -> TestResult {
    let (problem, reconstruction) = build_disconnected_scene();

    let options = BACovarianceOptions::default();
    let estimate = estimate_ba_covariance(&options, &reconstruction, &problem)?
        .expect("Test: default damping must regularize the gauge");
    let dense = estimate_ba_covariance_dense(&options, &reconstruction, &problem)?;
    assert!(
        dense.is_some(),
        "Test: both paths must accept the same damped system"
    );

    for image_id in 1..=4u32 {
        let cov = estimate
            .cam_from_world_cov(image_id)
            .expect("Test: pose covariance");
        assert_eq!(cov.nrows(), 6);
        assert_symmetric(cov, 1e-9, "pose covariance");
        for row in 0..6 {
            assert!(
                cov[(row, row)] > 0.0,
                "Test: pose variance must be positive"
            );
        }
    }
    for point_id in 1..=12u64 {
        assert!(estimate.point_cov(point_id).is_some());
    }
    Ok(())
}

#[test]
fn test_disconnected_clusters_rejected_without_damping() -> TestResult {
    let (problem, reconstruction) = build_disconnected_scene();

    let estimate = estimate_ba_covariance(
        &BACovarianceOptions::default().with_damping(0.0),
        &reconstruction,
        &problem,
    )?;
    assert!(
        estimate.is_none(),
        "Test: a free gauge must be detected as rank deficient"
    );
    Ok(())
}
