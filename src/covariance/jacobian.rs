//! Tangent-space column layout and sparse Jacobian assembly.
//!
//! The layout assigns one global column to every estimated tangent
//! component, cameras first (pose blocks in image order, rotation before
//! translation, then the remaining blocks), points last. Fixed components
//! of Euclidean blocks get no column, so conditioning on them happens by
//! construction. Assembly then scatters each residual's dense Jacobian
//! into a sparse matrix over this layout.

use std::collections::BTreeSet;

use faer::sparse::Triplet;
use tracing::debug;

use crate::covariance::partition::{OtherParam, PointParam, PoseParam};
use crate::error::{CovarianceError, CovarianceResult};
use crate::linalg::{triplets_to_sparse, SparseMatrix};
use crate::problem::{BlockId, Parameterization, Problem, ProblemError};
use crate::scene::{ImageId, Point3DId};

/// Contiguous column range of one layout entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRange {
    pub offset: usize,
    pub size: usize,
}

/// One 3D point in the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PointEntry {
    pub point3d_id: Point3DId,
    pub block: BlockId,
    pub offset: usize,
}

/// Global column assignment for the estimated tangent space.
#[derive(Debug, Clone)]
pub(crate) struct TangentLayout {
    /// Per problem block: local tangent component to global column.
    /// Empty for blocks outside the layout; `None` entries are fixed
    /// components.
    block_cols: Vec<Vec<Option<usize>>>,
    /// All layout blocks in column assignment order
    blocks: Vec<BlockId>,
    pose_ranges: Vec<(ImageId, BlockRange)>,
    other_ranges: Vec<(BlockId, BlockRange)>,
    point_entries: Vec<PointEntry>,
    num_cam_cols: usize,
    num_cols: usize,
}

fn assign_columns(
    problem: &Problem,
    block: BlockId,
    block_cols: &mut [Vec<Option<usize>>],
    blocks: &mut Vec<BlockId>,
    next_col: &mut usize,
) -> CovarianceResult<usize> {
    let param = problem
        .block(block)
        .ok_or(ProblemError::UnknownBlock(block))?;
    if !block_cols[block.index()].is_empty() {
        return Err(CovarianceError::SharedBlock(block));
    }

    let width = param.parameterization().tangent_size(param.ambient_size());
    let mut map = Vec::with_capacity(width);
    let mut assigned = 0;
    match param.parameterization() {
        Parameterization::UnitQuaternion => {
            for _ in 0..width {
                map.push(Some(*next_col));
                *next_col += 1;
                assigned += 1;
            }
        }
        Parameterization::Euclidean => {
            for component in 0..width {
                if param.is_component_fixed(component) {
                    map.push(None);
                } else {
                    map.push(Some(*next_col));
                    *next_col += 1;
                    assigned += 1;
                }
            }
        }
    }
    block_cols[block.index()] = map;
    blocks.push(block);
    Ok(assigned)
}

impl TangentLayout {
    /// Assign columns for the partitioned parameters.
    ///
    /// Fails on point blocks that are not free 3-vectors and on blocks
    /// appearing in more than one layout role. Points without observations
    /// are dropped; their covariance stays absent.
    pub(crate) fn new(
        problem: &Problem,
        poses: &[PoseParam],
        points: &[PointParam],
        others: &[OtherParam],
    ) -> CovarianceResult<Self> {
        let mut layout = TangentLayout {
            block_cols: vec![Vec::new(); problem.num_blocks()],
            blocks: Vec::new(),
            pose_ranges: Vec::with_capacity(poses.len()),
            other_ranges: Vec::with_capacity(others.len()),
            point_entries: Vec::with_capacity(points.len()),
            num_cam_cols: 0,
            num_cols: 0,
        };
        let mut next_col = 0;

        for pose in poses {
            let offset = next_col;
            let mut size = 0;
            if let Some(rotation) = pose.rotation {
                size += assign_columns(
                    problem,
                    rotation,
                    &mut layout.block_cols,
                    &mut layout.blocks,
                    &mut next_col,
                )?;
            }
            if let Some(translation) = pose.translation {
                size += assign_columns(
                    problem,
                    translation,
                    &mut layout.block_cols,
                    &mut layout.blocks,
                    &mut next_col,
                )?;
            }
            layout
                .pose_ranges
                .push((pose.image_id, BlockRange { offset, size }));
        }

        for other in others {
            let offset = next_col;
            let size = assign_columns(
                problem,
                other.block,
                &mut layout.block_cols,
                &mut layout.blocks,
                &mut next_col,
            )?;
            layout
                .other_ranges
                .push((other.block, BlockRange { offset, size }));
        }
        layout.num_cam_cols = next_col;

        for point in points {
            let param = problem
                .block(point.position)
                .ok_or(ProblemError::UnknownBlock(point.position))?;
            let free_3_vector = param.parameterization() == Parameterization::Euclidean
                && param.ambient_size() == 3
                && param.fixed_components().is_empty();
            if !free_3_vector {
                return Err(CovarianceError::InvalidPointBlock {
                    block: point.position,
                    tangent_size: param.tangent_size(),
                });
            }
            if problem.residuals_for_block(point.position).is_empty() {
                debug!(
                    "Excluding 3D point {} without observations from covariance estimation",
                    point.point3d_id
                );
                continue;
            }

            let offset = next_col;
            assign_columns(
                problem,
                point.position,
                &mut layout.block_cols,
                &mut layout.blocks,
                &mut next_col,
            )?;
            layout.point_entries.push(PointEntry {
                point3d_id: point.point3d_id,
                block: point.position,
                offset,
            });
        }
        layout.num_cols = next_col;
        Ok(layout)
    }

    /// Column map of one block; empty for blocks outside the layout.
    pub(crate) fn block_cols(&self, block: BlockId) -> &[Option<usize>] {
        self.block_cols
            .get(block.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All layout blocks in column order
    pub(crate) fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Column ranges of the estimated poses, image id order
    pub(crate) fn pose_ranges(&self) -> &[(ImageId, BlockRange)] {
        &self.pose_ranges
    }

    /// Column ranges of the remaining camera-side blocks
    pub(crate) fn other_ranges(&self) -> &[(BlockId, BlockRange)] {
        &self.other_ranges
    }

    /// Points in the layout with their column offsets
    pub(crate) fn point_entries(&self) -> &[PointEntry] {
        &self.point_entries
    }

    /// Number of camera-side columns (poses and others)
    pub(crate) fn num_cam_cols(&self) -> usize {
        self.num_cam_cols
    }

    /// Total number of tangent columns
    pub(crate) fn num_cols(&self) -> usize {
        self.num_cols
    }
}

/// Assemble the sparse tangent-space Jacobian over the layout columns.
///
/// Rows cover every residual block touching at least one layout block, in
/// ascending residual index order. Jacobian groups of blocks outside the
/// layout are dropped, which conditions the result on those blocks staying
/// at their current values.
pub(crate) fn assemble_tangent_jacobian(
    problem: &Problem,
    layout: &TangentLayout,
) -> CovarianceResult<SparseMatrix> {
    let mut residual_indices = BTreeSet::new();
    for &block in layout.blocks() {
        residual_indices.extend(problem.residuals_for_block(block).iter().copied());
    }

    let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
    let mut row_offset = 0;
    for &index in &residual_indices {
        let (residual, jacobian) = problem.linearize_residual(index)?;
        let residual_block = problem.residual_block(index).ok_or_else(|| {
            ProblemError::Evaluation(format!("residual block {index} does not exist"))
        })?;

        let mut group_offset = 0;
        for &block in residual_block.block_ids() {
            let param = problem
                .block(block)
                .ok_or(ProblemError::UnknownBlock(block))?;
            let width = param.parameterization().tangent_size(param.ambient_size());
            for (local, col) in layout.block_cols(block).iter().enumerate() {
                if let Some(col) = col {
                    for row in 0..residual.len() {
                        triplets.push(Triplet::new(
                            row_offset + row,
                            *col,
                            jacobian[(row, group_offset + local)],
                        ));
                    }
                }
            }
            group_offset += width;
        }
        row_offset += residual.len();
    }

    Ok(triplets_to_sparse(row_offset, layout.num_cols(), &triplets)?)
}
