//! Covariance Estimation Demo
//!
//! Builds a synthetic multi-view bundle adjustment problem, estimates pose,
//! point and intrinsics covariances via Schur elimination and checks the
//! result against the dense full-Hessian reference.
//!
//! # Usage
//! ```bash
//! cargo run --release --bin covariance_demo
//!
//! # More points and stronger synthetic pixel noise:
//! cargo run --release --bin covariance_demo -- -n 2000 --pixel-noise 1.0
//!
//! # Without damping, gauge-deficient setups fail cleanly:
//! cargo run --release --bin covariance_demo -- --damping 0.0
//! ```

use ba_covariance::camera::PinholeCamera;
use ba_covariance::covariance::{
    estimate_ba_covariance, estimate_ba_covariance_dense, BACovariance, BACovarianceOptions,
};
use ba_covariance::init_logger;
use ba_covariance::problem::{BlockId, Parameterization, Problem, ReprojectionFactor};
use ba_covariance::scene::{ImageId, Point3DId, Reconstruction};
use clap::Parser;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};
use std::error::Error;
use std::time::Instant;
use tracing::info;

/// Covariance estimation for a synthetic bundle adjustment problem
#[derive(Parser)]
#[command(name = "covariance_demo")]
#[command(about = "Covariance estimation for a synthetic bundle adjustment problem")]
struct Args {
    /// Number of 3D points in the synthetic scene
    #[arg(short = 'n', long, default_value_t = 200)]
    num_points: usize,

    /// Diagonal damping added to the Hessian before factorization
    #[arg(long, default_value_t = 1e-8)]
    damping: f64,

    /// Standard deviation of the synthetic pixel noise
    #[arg(long, default_value_t = 0.25)]
    pixel_noise: f64,
}

const NUM_IMAGES: usize = 5;
const NUM_CONSTANT_POINTS: usize = 4;
const RING_RADIUS: f64 = 6.0;

struct Scene {
    problem: Problem,
    reconstruction: Reconstruction,
    image_ids: Vec<ImageId>,
    point_ids: Vec<Point3DId>,
    intrinsics_blocks: Vec<BlockId>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logger();

    info!("BUNDLE ADJUSTMENT COVARIANCE DEMO");
    info!("");

    if args.num_points < 2 * NUM_CONSTANT_POINTS {
        return Err(format!("need at least {} points", 2 * NUM_CONSTANT_POINTS).into());
    }

    let scene = build_scene(args.num_points, args.pixel_noise)?;
    info!("Scene statistics:");
    info!("  Images: {}", scene.reconstruction.num_images());
    info!("  Cameras: {}", scene.reconstruction.num_cameras());
    info!(
        "  Points: {} ({} held constant)",
        scene.reconstruction.num_points3d(),
        NUM_CONSTANT_POINTS
    );
    info!("  Observations: {}", scene.problem.num_residual_blocks());
    info!("  Pixel noise: {}", args.pixel_noise);
    info!("  Damping: {}", args.damping);
    info!("");

    let options = BACovarianceOptions::new().with_damping(args.damping);

    let start = Instant::now();
    let schur = estimate_ba_covariance(&options, &scene.reconstruction, &scene.problem)?;
    let schur_time = start.elapsed();
    let schur = match schur {
        Some(covariance) => covariance,
        None => {
            info!("Covariance unavailable: the problem is rank deficient at this damping");
            return Ok(());
        }
    };
    info!("Schur estimation: {:?}", schur_time);

    let start = Instant::now();
    let dense = estimate_ba_covariance_dense(&options, &scene.reconstruction, &scene.problem)?;
    let dense_time = start.elapsed();
    let dense = match dense {
        Some(covariance) => covariance,
        None => {
            info!("Dense reference failed although the Schur path succeeded");
            return Ok(());
        }
    };
    info!("Dense reference: {:?}", dense_time);
    info!("");

    report(&scene, &schur, &dense);
    Ok(())
}

fn report(scene: &Scene, schur: &BACovariance, dense: &BACovariance) {
    let mut max_diff = 0.0_f64;
    for &image_id in &scene.image_ids {
        let (Some(a), Some(b)) = (
            schur.cam_from_world_cov(image_id),
            dense.cam_from_world_cov(image_id),
        ) else {
            continue;
        };
        max_diff = max_diff.max((a - b).abs().max());

        let rotation_sigma = (a[(0, 0)] + a[(1, 1)] + a[(2, 2)]).sqrt();
        let translation_sigma = (a[(3, 3)] + a[(4, 4)] + a[(5, 5)]).sqrt();
        info!(
            "Image {:2}: rotation sigma {:.3e} rad, translation sigma {:.3e}",
            image_id, rotation_sigma, translation_sigma
        );
    }

    for &block in &scene.intrinsics_blocks {
        if let Some(cov) = schur.other_params_cov(block) {
            let sigmas: Vec<String> = (0..cov.nrows())
                .map(|i| format!("{:.3e}", cov[(i, i)].sqrt()))
                .collect();
            info!("Intrinsics block {}: sigmas [{}]", block, sigmas.join(", "));
        }
    }

    let mut point_sigma_sum = 0.0;
    let mut point_sigma_max = 0.0_f64;
    let mut num_estimated = 0;
    for &point_id in &scene.point_ids {
        if let Some(cov) = schur.point_cov(point_id) {
            let sigma = cov.trace().sqrt();
            point_sigma_sum += sigma;
            point_sigma_max = point_sigma_max.max(sigma);
            num_estimated += 1;
        }
    }
    info!("");
    info!(
        "Points: {} estimated, mean sigma {:.3e}, max sigma {:.3e}",
        num_estimated,
        point_sigma_sum / num_estimated.max(1) as f64,
        point_sigma_max
    );
    info!("Max pose covariance deviation from dense reference: {:.3e}", max_diff);
}

/// Cameras on a ring around the origin, all points visible in all images.
fn build_scene(num_points: usize, pixel_noise: f64) -> Result<Scene, Box<dyn Error>> {
    let mut problem = Problem::new();
    let mut reconstruction = Reconstruction::new();

    let cameras = [
        PinholeCamera::new(520.0, 520.0, 320.0, 240.0),
        PinholeCamera::new(530.0, 530.0, 319.0, 241.0),
    ];
    let mut intrinsics_blocks = Vec::new();
    for (i, camera) in cameras.iter().enumerate() {
        let block = problem.add_block(camera.params().as_slice(), Parameterization::Euclidean)?;
        reconstruction.add_camera(i as u32 + 1, block)?;
        intrinsics_blocks.push(block);
    }

    let mut image_ids = Vec::new();
    let mut poses = Vec::new();
    for k in 0..NUM_IMAGES {
        let angle = std::f64::consts::TAU * k as f64 / NUM_IMAGES as f64;
        let center = Vector3::new(RING_RADIUS * angle.cos(), RING_RADIUS * angle.sin(), 0.0);
        let rotation = look_at_origin(&center);
        let translation = -(rotation * center);
        let quaternion = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
            rotation,
        ));

        let rotation_block = problem.add_block(
            quaternion.coords.as_slice(),
            Parameterization::UnitQuaternion,
        )?;
        let translation_block =
            problem.add_block(translation.as_slice(), Parameterization::Euclidean)?;
        let camera_id = (k % cameras.len()) as u32 + 1;
        let image_id = k as ImageId + 1;
        reconstruction.add_image(image_id, camera_id, rotation_block, translation_block)?;
        image_ids.push(image_id);
        poses.push((rotation_block, translation_block, rotation, translation, camera_id));
    }

    let mut point_ids = Vec::new();
    for n in 0..num_points {
        let seed = n as u64;
        let point = Vector3::new(
            4.0 * unit_interval(hash_u64(seed)) - 2.0,
            4.0 * unit_interval(hash_u64(seed ^ 0x5bf0_3635)) - 2.0,
            4.0 * unit_interval(hash_u64(seed ^ 0x94d0_49bb)) - 2.0,
        );
        let position = problem.add_block(point.as_slice(), Parameterization::Euclidean)?;
        let point_id = n as Point3DId + 1;
        reconstruction.add_point3d(point_id, position)?;
        if n < NUM_CONSTANT_POINTS {
            problem.set_constant(position)?;
        }
        point_ids.push(point_id);

        for (obs_index, &(rotation_block, translation_block, rotation, translation, camera_id)) in
            poses.iter().enumerate()
        {
            let p_cam = rotation * point + translation;
            let projected = cameras[(camera_id - 1) as usize]
                .project(&p_cam)
                .ok_or("synthetic point behind camera")?;
            let noise_seed = (n * NUM_IMAGES + obs_index) as u64;
            let observation = projected
                + Vector2::new(
                    gaussian(noise_seed, pixel_noise),
                    gaussian(noise_seed ^ 0xc2b2_ae35, pixel_noise),
                );
            let intrinsics = intrinsics_blocks[(camera_id - 1) as usize];
            problem.add_residual(
                &[rotation_block, translation_block, position, intrinsics],
                Box::new(ReprojectionFactor::new(observation)),
            )?;
        }
    }

    Ok(Scene {
        problem,
        reconstruction,
        image_ids,
        point_ids,
        intrinsics_blocks,
    })
}

/// World-to-camera rotation with the optical axis pointing at the origin.
fn look_at_origin(center: &Vector3<f64>) -> Matrix3<f64> {
    let forward = (-center).normalize();
    let right = Vector3::z().cross(&forward).normalize();
    let down = forward.cross(&right);
    Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()])
}

fn hash_u64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Uniform in (0, 1), never exactly zero.
fn unit_interval(hash: u64) -> f64 {
    ((hash >> 11) as f64 + 0.5) / 9_007_199_254_740_992.0
}

/// Deterministic zero-mean Gaussian sample via the Box-Muller transform.
fn gaussian(seed: u64, stddev: f64) -> f64 {
    let u1 = unit_interval(hash_u64(seed));
    let u2 = unit_interval(hash_u64(seed ^ 0x6a09_e667_f3bc_c909));
    stddev * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
