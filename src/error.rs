//! # Error
//!
//! $$
//! \text{op}:\ \text{inputs} \to \text{Result}\langle T,\ \text{PortfolioError}\rangle
//! $$
//!
//! Error taxonomy shared by every operation of the crate. Errors are raised
//! synchronously by the operation that detects them and are never retried
//! internally.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PortfolioError>;

#[derive(Debug, Error)]
pub enum PortfolioError {
  /// Too few observations to compute the requested statistic.
  #[error("insufficient data: {what} requires at least {required} observations, got {actual}")]
  InsufficientData {
    what: &'static str,
    required: usize,
    actual: usize,
  },

  /// Covariance matrix is not positive-semidefinite within tolerance, or is
  /// singular (duplicate / perfectly collinear assets).
  #[error("degenerate covariance matrix: {reason}")]
  DegenerateCovariance { reason: String },

  /// Requested target return or bounds admit no feasible weight vector.
  #[error("infeasible problem: {reason}")]
  Infeasible { reason: String },

  /// Numerical solve did not satisfy its convergence criteria within budget.
  #[error("{solver} did not converge after {iterations} iterations: {reason}")]
  SolverNonConvergence {
    solver: &'static str,
    iterations: u64,
    reason: String,
  },

  /// Structural violation of an input (shape mismatch, NaN, bad config).
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Error raised while evaluating an objective function.
  #[error("objective evaluation failed: {0}")]
  Objective(#[from] argmin::core::Error),
}

impl PortfolioError {
  pub(crate) fn invalid(msg: impl Into<String>) -> Self {
    Self::InvalidInput(msg.into())
  }

  pub(crate) fn infeasible(reason: impl Into<String>) -> Self {
    Self::Infeasible {
      reason: reason.into(),
    }
  }

  pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
    Self::DegenerateCovariance {
      reason: reason.into(),
    }
  }
}
