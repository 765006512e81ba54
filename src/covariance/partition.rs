//! Partition of the estimated parameter blocks into poses, points, others.
//!
//! Covariance estimation orders the tangent space as cameras first (poses,
//! then remaining blocks), points last, so the point-point Hessian can be
//! eliminated block by block. The partition inspects the reconstruction and
//! the problem's constancy flags; only estimated blocks get entries.
//!
//! The builders are public so callers can inspect which parameters an
//! estimation would cover without running it.

use std::collections::HashSet;

use crate::problem::{BlockId, Problem};
use crate::scene::{ImageId, Point3DId, Reconstruction};

/// Estimated pose blocks of one image.
///
/// Either side may be absent when the corresponding block is constant, has
/// no free components or is not part of the problem. Images with neither
/// side estimated get no entry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseParam {
    /// Image the pose belongs to
    pub image_id: ImageId,
    /// Estimated rotation block, if any
    pub rotation: Option<BlockId>,
    /// Estimated translation block, if any
    pub translation: Option<BlockId>,
}

/// Estimated position block of one 3D point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointParam {
    /// Point the position belongs to
    pub point3d_id: Point3DId,
    /// Estimated position block
    pub position: BlockId,
}

/// An estimated block that is neither a pose nor a point, e.g. intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtherParam {
    /// The parameter block
    pub block: BlockId,
    /// Estimated tangent dimension of the block
    pub tangent_size: usize,
}

fn estimated_tangent(problem: &Problem, block: BlockId) -> Option<usize> {
    let param = problem.block(block)?;
    if param.is_constant() {
        return None;
    }
    match param.tangent_size() {
        0 => None,
        size => Some(size),
    }
}

/// Collect the estimated pose blocks per image, in image id order.
pub fn get_pose_params(reconstruction: &Reconstruction, problem: &Problem) -> Vec<PoseParam> {
    let mut poses = Vec::new();
    for (image_id, image) in reconstruction.images() {
        let rotation = estimated_tangent(problem, image.rotation).map(|_| image.rotation);
        let translation = estimated_tangent(problem, image.translation).map(|_| image.translation);
        if rotation.is_some() || translation.is_some() {
            poses.push(PoseParam {
                image_id,
                rotation,
                translation,
            });
        }
    }
    poses
}

/// Collect the estimated point blocks, in point id order.
pub fn get_point_params(reconstruction: &Reconstruction, problem: &Problem) -> Vec<PointParam> {
    let mut points = Vec::new();
    for (point3d_id, position) in reconstruction.points3d() {
        if estimated_tangent(problem, position).is_some() {
            points.push(PointParam {
                point3d_id,
                position,
            });
        }
    }
    points
}

/// Collect all remaining estimated blocks, in registration order.
pub fn get_other_params(
    problem: &Problem,
    poses: &[PoseParam],
    points: &[PointParam],
) -> Vec<OtherParam> {
    let mut reserved: HashSet<BlockId> = HashSet::new();
    for pose in poses {
        reserved.extend(pose.rotation);
        reserved.extend(pose.translation);
    }
    reserved.extend(points.iter().map(|point| point.position));

    let mut others = Vec::new();
    for block in problem.block_ids() {
        if reserved.contains(&block) {
            continue;
        }
        if let Some(tangent_size) = estimated_tangent(problem, block) {
            others.push(OtherParam {
                block,
                tangent_size,
            });
        }
    }
    others
}
