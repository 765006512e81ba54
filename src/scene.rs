//! Reconstruction structure: cameras, images and 3D points.
//!
//! A [`Reconstruction`] names which parameter blocks of a [`Problem`] play
//! which role in a bundle adjustment: per-camera intrinsics, per-image poses
//! and per-point positions. It stores handles only; values and constancy
//! live in the problem. Entity maps are ordered, so iteration and therefore
//! covariance parameter ordering is deterministic.
//!
//! [`Problem`]: crate::problem::Problem

use std::collections::BTreeMap;

use thiserror::Error;

use crate::problem::BlockId;

/// Identifier of an image (one pose)
pub type ImageId = u32;
/// Identifier of a 3D point
pub type Point3DId = u64;
/// Identifier of a physical camera (one intrinsics set)
pub type CameraId = u32;

/// Image id that never refers to a registered image
pub const INVALID_IMAGE_ID: ImageId = ImageId::MAX;
/// Point id that never refers to a registered point
pub const INVALID_POINT3D_ID: Point3DId = Point3DId::MAX;
/// Camera id that never refers to a registered camera
pub const INVALID_CAMERA_ID: CameraId = CameraId::MAX;

/// Errors from reconstruction construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SceneError {
    /// Camera id already registered
    #[error("camera {0} is already registered")]
    DuplicateCamera(CameraId),

    /// Image id already registered
    #[error("image {0} is already registered")]
    DuplicateImage(ImageId),

    /// Point id already registered
    #[error("point {0} is already registered")]
    DuplicatePoint(Point3DId),

    /// Image references a camera that was never registered
    #[error("image references unknown camera {0}")]
    UnknownCamera(CameraId),
}

/// One image: the camera it was taken with and its pose blocks.
///
/// The pose maps world to camera coordinates. The rotation block is a unit
/// quaternion [x, y, z, w], the translation block a 3-vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Image {
    /// Camera providing the intrinsics
    pub camera_id: CameraId,
    /// Rotation quaternion block
    pub rotation: BlockId,
    /// Translation block
    pub translation: BlockId,
}

/// Maps reconstruction entities to parameter blocks.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, BlockId>,
    images: BTreeMap<ImageId, Image>,
    points3d: BTreeMap<Point3DId, BlockId>,
}

impl Reconstruction {
    /// Create an empty reconstruction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a camera with its intrinsics block.
    pub fn add_camera(
        &mut self,
        camera_id: CameraId,
        intrinsics: BlockId,
    ) -> Result<(), SceneError> {
        if self.cameras.contains_key(&camera_id) {
            return Err(SceneError::DuplicateCamera(camera_id));
        }
        self.cameras.insert(camera_id, intrinsics);
        Ok(())
    }

    /// Register an image with its pose blocks.
    ///
    /// The camera must already be registered.
    pub fn add_image(
        &mut self,
        image_id: ImageId,
        camera_id: CameraId,
        rotation: BlockId,
        translation: BlockId,
    ) -> Result<(), SceneError> {
        if self.images.contains_key(&image_id) {
            return Err(SceneError::DuplicateImage(image_id));
        }
        if !self.cameras.contains_key(&camera_id) {
            return Err(SceneError::UnknownCamera(camera_id));
        }
        self.images.insert(
            image_id,
            Image {
                camera_id,
                rotation,
                translation,
            },
        );
        Ok(())
    }

    /// Register a 3D point with its position block.
    pub fn add_point3d(
        &mut self,
        point3d_id: Point3DId,
        position: BlockId,
    ) -> Result<(), SceneError> {
        if self.points3d.contains_key(&point3d_id) {
            return Err(SceneError::DuplicatePoint(point3d_id));
        }
        self.points3d.insert(point3d_id, position);
        Ok(())
    }

    /// Intrinsics block of a camera
    pub fn camera_intrinsics(&self, camera_id: CameraId) -> Option<BlockId> {
        self.cameras.get(&camera_id).copied()
    }

    /// Look up an image by id.
    pub fn image(&self, image_id: ImageId) -> Option<&Image> {
        self.images.get(&image_id)
    }

    /// Position block of a 3D point
    pub fn point3d(&self, point3d_id: Point3DId) -> Option<BlockId> {
        self.points3d.get(&point3d_id).copied()
    }

    /// Cameras in ascending id order
    pub fn cameras(&self) -> impl Iterator<Item = (CameraId, BlockId)> + '_ {
        self.cameras.iter().map(|(&id, &block)| (id, block))
    }

    /// Images in ascending id order
    pub fn images(&self) -> impl Iterator<Item = (ImageId, &Image)> + '_ {
        self.images.iter().map(|(&id, image)| (id, image))
    }

    /// Points in ascending id order
    pub fn points3d(&self) -> impl Iterator<Item = (Point3DId, BlockId)> + '_ {
        self.points3d.iter().map(|(&id, &block)| (id, block))
    }

    /// Number of registered cameras
    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Number of registered images
    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// Number of registered 3D points
    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }
}
