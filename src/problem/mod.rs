//! Parameter block registry and residual wiring.
//!
//! A [`Problem`] owns the parameter blocks of a bundle adjustment system and
//! the residual blocks connecting them. Each parameter block carries a
//! parameterization that determines its tangent-space dimension: Euclidean
//! blocks are perturbed component-wise, unit quaternion blocks store 4
//! coefficients but expose a 3-dimensional tangent space. Blocks can be held
//! constant wholesale or, for Euclidean blocks, per component.
//!
//! The registry keeps a residual-to-block adjacency index so covariance
//! estimation can enumerate all residuals touching a set of blocks without
//! scanning unrelated parts of the problem.

pub mod factors;

use std::fmt;

use nalgebra::DVector;
use thiserror::Error;

pub use factors::{Factor, PriorFactor, ReprojectionFactor};

/// Errors from problem construction and residual evaluation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProblemError {
    /// Parameter blocks must contain at least one value
    #[error("parameter block must not be empty")]
    EmptyBlock,

    /// Unit quaternion blocks store exactly [x, y, z, w]
    #[error("quaternion block requires 4 coefficients, got {0}")]
    InvalidQuaternionSize(usize),

    /// Handle does not refer to a registered block
    #[error("unknown parameter block {0}")]
    UnknownBlock(BlockId),

    /// Component index outside the block
    #[error("component index {component} out of range for block of size {size}")]
    ComponentOutOfRange { component: usize, size: usize },

    /// Per-component fixing is meaningless on manifold blocks
    #[error("per-component fixing is only supported for Euclidean blocks")]
    FixedComponentsOnManifold,

    /// Residual blocks must connect at least one parameter block
    #[error("residual must connect at least one parameter block")]
    EmptyResidual,

    /// Factor Jacobian width disagrees with the connected blocks
    #[error("factor produced a {actual}-column Jacobian, expected {expected} tangent columns")]
    JacobianDimension { expected: usize, actual: usize },

    /// Factor residual length disagrees with its declared dimension
    #[error("factor produced a residual of length {actual}, declared {expected}")]
    ResidualDimension { expected: usize, actual: usize },

    /// Residual evaluation failed at the current parameter values
    #[error("failed to evaluate residual: {0}")]
    Evaluation(String),
}

/// Opaque handle to a parameter block inside a [`Problem`].
///
/// Handles are assigned in registration order and never invalidated. The
/// [`BlockId::INVALID`] sentinel compares unequal to every real handle, so
/// looking it up is always an absence, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(usize);

impl BlockId {
    /// Sentinel handle that never refers to a registered block
    pub const INVALID: BlockId = BlockId(usize::MAX);

    /// Position of the block in registration order
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == BlockId::INVALID {
            write!(f, "<invalid>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// How a parameter block is perturbed during linearization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameterization {
    /// Plain vector block, tangent dimension equals the number of values
    Euclidean,
    /// Unit quaternion stored [x, y, z, w] with a 3-dimensional tangent,
    /// perturbed on the right: q' = q * exp(delta)
    UnitQuaternion,
}

impl Parameterization {
    /// Tangent dimension for a block of the given ambient size, ignoring
    /// any per-component fixing.
    pub fn tangent_size(&self, ambient_size: usize) -> usize {
        match self {
            Parameterization::Euclidean => ambient_size,
            Parameterization::UnitQuaternion => 3,
        }
    }
}

/// A registered parameter block: values, parameterization, constancy.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    values: DVector<f64>,
    parameterization: Parameterization,
    constant: bool,
    /// Sorted component indices excluded from the tangent space.
    /// Always empty for manifold blocks.
    fixed_components: Vec<usize>,
}

impl ParamBlock {
    /// Current values of the block
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// The block's parameterization
    pub fn parameterization(&self) -> Parameterization {
        self.parameterization
    }

    /// Number of stored coefficients
    pub fn ambient_size(&self) -> usize {
        self.values.len()
    }

    /// Estimated tangent dimension: the parameterization tangent minus any
    /// fixed components. Independent of whether the block is constant.
    pub fn tangent_size(&self) -> usize {
        self.parameterization.tangent_size(self.ambient_size()) - self.fixed_components.len()
    }

    /// Whether the whole block is held constant
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Sorted indices of individually fixed components
    pub fn fixed_components(&self) -> &[usize] {
        &self.fixed_components
    }

    /// Whether a single component is fixed
    pub fn is_component_fixed(&self, component: usize) -> bool {
        self.fixed_components.binary_search(&component).is_ok()
    }
}

/// One residual block: a factor and the parameter blocks it connects.
pub struct ResidualBlock {
    blocks: Vec<BlockId>,
    factor: Box<dyn Factor>,
}

impl ResidualBlock {
    /// Connected parameter blocks, in the factor's expected order
    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// The factor evaluating this residual
    pub fn factor(&self) -> &dyn Factor {
        self.factor.as_ref()
    }

    /// Residual dimension as declared by the factor
    pub fn dim(&self) -> usize {
        self.factor.residual_dim()
    }
}

/// Registry of parameter blocks and the residuals connecting them.
#[derive(Default)]
pub struct Problem {
    blocks: Vec<ParamBlock>,
    residual_blocks: Vec<ResidualBlock>,
    /// blocks[i] -> indices into residual_blocks touching block i
    block_residuals: Vec<Vec<usize>>,
}

impl Problem {
    /// Create an empty problem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter block and return its handle.
    ///
    /// Unit quaternion blocks must have exactly 4 coefficients in
    /// [x, y, z, w] order.
    pub fn add_block(
        &mut self,
        values: &[f64],
        parameterization: Parameterization,
    ) -> Result<BlockId, ProblemError> {
        if values.is_empty() {
            return Err(ProblemError::EmptyBlock);
        }
        if parameterization == Parameterization::UnitQuaternion && values.len() != 4 {
            return Err(ProblemError::InvalidQuaternionSize(values.len()));
        }

        let id = BlockId(self.blocks.len());
        self.blocks.push(ParamBlock {
            values: DVector::from_column_slice(values),
            parameterization,
            constant: false,
            fixed_components: Vec::new(),
        });
        self.block_residuals.push(Vec::new());
        Ok(id)
    }

    /// Number of registered parameter blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Look up a parameter block; `None` for foreign or invalid handles.
    pub fn block(&self, id: BlockId) -> Option<&ParamBlock> {
        self.blocks.get(id.0)
    }

    /// All block handles in registration order
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId)
    }

    /// Hold an entire block constant.
    pub fn set_constant(&mut self, id: BlockId) -> Result<(), ProblemError> {
        let block = self
            .blocks
            .get_mut(id.0)
            .ok_or(ProblemError::UnknownBlock(id))?;
        block.constant = true;
        Ok(())
    }

    /// Release a previously constant block.
    pub fn set_variable(&mut self, id: BlockId) -> Result<(), ProblemError> {
        let block = self
            .blocks
            .get_mut(id.0)
            .ok_or(ProblemError::UnknownBlock(id))?;
        block.constant = false;
        Ok(())
    }

    /// Whether a block is held constant; `None` for unknown handles.
    pub fn is_constant(&self, id: BlockId) -> Option<bool> {
        self.block(id).map(ParamBlock::is_constant)
    }

    /// Estimated tangent dimension of a block; `None` for unknown handles.
    pub fn tangent_size(&self, id: BlockId) -> Option<usize> {
        self.block(id).map(ParamBlock::tangent_size)
    }

    /// Fix individual components of a Euclidean block.
    ///
    /// Replaces any previously fixed set; pass an empty slice to release
    /// all components. Indices are deduplicated.
    pub fn set_fixed_components(
        &mut self,
        id: BlockId,
        components: &[usize],
    ) -> Result<(), ProblemError> {
        let block = self
            .blocks
            .get_mut(id.0)
            .ok_or(ProblemError::UnknownBlock(id))?;
        if block.parameterization != Parameterization::Euclidean {
            return Err(ProblemError::FixedComponentsOnManifold);
        }
        let size = block.values.len();
        for &component in components {
            if component >= size {
                return Err(ProblemError::ComponentOutOfRange { component, size });
            }
        }

        let mut sorted = components.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        block.fixed_components = sorted;
        Ok(())
    }

    /// Connect a residual block to the given parameter blocks.
    ///
    /// The block order must match what the factor expects during
    /// linearization.
    pub fn add_residual(
        &mut self,
        blocks: &[BlockId],
        factor: Box<dyn Factor>,
    ) -> Result<(), ProblemError> {
        if blocks.is_empty() {
            return Err(ProblemError::EmptyResidual);
        }
        for &id in blocks {
            if self.block(id).is_none() {
                return Err(ProblemError::UnknownBlock(id));
            }
        }

        let residual_index = self.residual_blocks.len();
        for &id in blocks {
            // A factor may reference the same block twice; index it once.
            let touching = &mut self.block_residuals[id.0];
            if touching.last() != Some(&residual_index) {
                touching.push(residual_index);
            }
        }
        self.residual_blocks.push(ResidualBlock {
            blocks: blocks.to_vec(),
            factor,
        });
        Ok(())
    }

    /// Number of residual blocks
    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    /// Look up a residual block by index.
    pub fn residual_block(&self, index: usize) -> Option<&ResidualBlock> {
        self.residual_blocks.get(index)
    }

    /// Indices of all residual blocks touching the given parameter block.
    /// Empty for unknown handles.
    pub fn residuals_for_block(&self, id: BlockId) -> &[usize] {
        self.block_residuals
            .get(id.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Linearize one residual block at the current parameter values.
    ///
    /// Returns the residual and the Jacobian stacked as one column group per
    /// connected block, each group as wide as the block's parameterization
    /// tangent (fixed components are dropped later, during assembly).
    /// Dimensions are validated against the factor's declaration.
    pub fn linearize_residual(
        &self,
        index: usize,
    ) -> Result<(DVector<f64>, nalgebra::DMatrix<f64>), ProblemError> {
        let residual_block = self.residual_blocks.get(index).ok_or_else(|| {
            ProblemError::Evaluation(format!("residual block {index} does not exist"))
        })?;

        let mut params = Vec::with_capacity(residual_block.blocks.len());
        let mut expected_cols = 0;
        for &id in &residual_block.blocks {
            let block = self.block(id).ok_or(ProblemError::UnknownBlock(id))?;
            expected_cols += block.parameterization().tangent_size(block.ambient_size());
            params.push(block.values().clone());
        }

        let (residual, jacobian) = residual_block.factor.linearize(&params)?;
        let expected_rows = residual_block.factor.residual_dim();
        if residual.len() != expected_rows {
            return Err(ProblemError::ResidualDimension {
                expected: expected_rows,
                actual: residual.len(),
            });
        }
        if jacobian.nrows() != expected_rows || jacobian.ncols() != expected_cols {
            return Err(ProblemError::JacobianDimension {
                expected: expected_cols,
                actual: jacobian.ncols(),
            });
        }
        Ok((residual, jacobian))
    }
}

/// Scoped constancy override restoring prior flags on drop.
///
/// Holding blocks constant through a guard lets callers condition an
/// estimation on a parameter subset without permanently mutating the
/// problem. Guards nest through [`ConstancyGuard::problem_mut`]; the borrow
/// checker then enforces last-in-first-out release, so restoration is
/// always well ordered.
///
/// # Example
///
/// ```
/// use ba_covariance::problem::{ConstancyGuard, Parameterization, Problem};
///
/// let mut problem = Problem::new();
/// let block = problem
///     .add_block(&[1.0, 2.0, 3.0], Parameterization::Euclidean)
///     .unwrap();
/// {
///     let guard = ConstancyGuard::hold(&mut problem, &[block]).unwrap();
///     assert_eq!(guard.problem().is_constant(block), Some(true));
/// }
/// assert_eq!(problem.is_constant(block), Some(false));
/// ```
pub struct ConstancyGuard<'a> {
    problem: &'a mut Problem,
    saved: Vec<(BlockId, bool)>,
}

impl<'a> ConstancyGuard<'a> {
    /// Hold the given blocks constant until the guard is dropped.
    ///
    /// Validates all handles before mutating anything, so a failed hold
    /// leaves the problem untouched.
    pub fn hold(problem: &'a mut Problem, blocks: &[BlockId]) -> Result<Self, ProblemError> {
        for &id in blocks {
            if problem.block(id).is_none() {
                return Err(ProblemError::UnknownBlock(id));
            }
        }

        let mut saved = Vec::with_capacity(blocks.len());
        for &id in blocks {
            if let Some(block) = problem.blocks.get_mut(id.0) {
                saved.push((id, block.constant));
                block.constant = true;
            }
        }
        Ok(Self { problem, saved })
    }

    /// Read access to the held problem.
    pub fn problem(&self) -> &Problem {
        self.problem
    }

    /// Mutable access, e.g. for stacking a nested guard.
    pub fn problem_mut(&mut self) -> &mut Problem {
        self.problem
    }
}

impl Drop for ConstancyGuard<'_> {
    fn drop(&mut self) {
        // Reverse order so duplicate handles restore their first-seen flag.
        for &(id, was_constant) in self.saved.iter().rev() {
            if let Some(block) = self.problem.blocks.get_mut(id.0) {
                block.constant = was_constant;
            }
        }
    }
}
