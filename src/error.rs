//! Error types for the ba-covariance library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! Structural misuse of the API (unknown block handles, dimension mismatches,
//! invalid elimination structure) surfaces as a [`CovarianceError`]. Numerical
//! failure of an otherwise well-posed estimation, such as a rank-deficient
//! system whose factorization breaks down, is not an error: the estimators
//! return `Ok(None)` in that case so callers can distinguish "the problem was
//! built wrong" from "this problem has no finite covariance".

use crate::linalg::LinAlgError;
use crate::problem::{BlockId, ProblemError};
use crate::scene::SceneError;
use thiserror::Error;

/// Main result type used throughout the ba-covariance library
pub type CovarianceResult<T> = Result<T, CovarianceError>;

/// Main error type for the ba-covariance library
#[derive(Debug, Clone, Error)]
pub enum CovarianceError {
    /// Problem construction or evaluation errors
    #[error("Problem error: {0}")]
    Problem(#[from] ProblemError),

    /// Reconstruction bookkeeping errors
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),

    /// A point block scheduled for elimination does not have tangent size 3,
    /// e.g. because individual components of it were fixed
    #[error("point block {block} has tangent size {tangent_size}, expected 3")]
    InvalidPointBlock { block: BlockId, tangent_size: usize },

    /// The same parameter block is claimed by more than one estimated entity
    #[error("parameter block {0} is shared by multiple estimated entities")]
    SharedBlock(BlockId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CovarianceError::LinAlg(LinAlgError::SingularMatrix(
            "zero pivot in column 3".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Linear algebra error: Singular matrix: zero pivot in column 3"
        );
    }

    #[test]
    fn test_problem_error_conversion() {
        let error: CovarianceError = ProblemError::UnknownBlock(BlockId::INVALID).into();
        match error {
            CovarianceError::Problem(ProblemError::UnknownBlock(id)) => {
                assert_eq!(id, BlockId::INVALID);
            }
            _ => panic!("Expected problem error"),
        }
    }

    #[test]
    fn test_invalid_point_block_display() {
        let error = CovarianceError::InvalidPointBlock {
            block: BlockId::INVALID,
            tangent_size: 2,
        };
        assert!(error.to_string().contains("expected 3"));
    }
}
