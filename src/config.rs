//! # Config
//!
//! $$
//! \ell_i \le w_i \le u_i,\qquad \sum_i w_i = 1
//! $$
//!
//! Configuration surface recognized by the optimizer, frontier generator and
//! engine.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::data::ReturnMethod;
use crate::portfolio::types::Bounds;

/// Numerical budget and tolerances shared by both solver strategies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverConfig {
  /// Iteration budget of the interior-point QP solver.
  pub qp_max_iters: u64,
  /// Iteration budget of the SQP solver (outer iterations).
  pub sqp_max_iters: u64,
  /// Duality-gap and feasibility tolerance for the QP solver.
  pub qp_tolerance: f64,
  /// Step-norm and objective-progress tolerance for the SQP solver.
  pub sqp_tolerance: f64,
  /// Tolerance on `sum(w) = 1`, bounds and target-return equality of the
  /// returned weights.
  pub weight_tolerance: f64,
  /// Relative eigenvalue tolerance used when validating the covariance.
  pub psd_tolerance: f64,
  /// Optional wall-clock budget per solve.
  pub max_duration: Option<Duration>,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      qp_max_iters: 200,
      sqp_max_iters: 200,
      qp_tolerance: 1e-9,
      sqp_tolerance: 1e-9,
      weight_tolerance: 1e-6,
      psd_tolerance: 1e-10,
      max_duration: None,
    }
  }
}

/// Per-asset box constraints as configured, resolved against the asset count
/// with [`BoundsSpec::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum BoundsSpec {
  /// `0 <= w_i <= 1` for every asset.
  #[default]
  LongOnly,
  /// Same `[lower, upper]` for every asset, e.g. `[-1, 1]` for long/short.
  Uniform { lower: f64, upper: f64 },
  /// Explicit `(lower, upper)` per asset, in asset order.
  PerAsset(Vec<(f64, f64)>),
}

impl BoundsSpec {
  pub fn resolve(&self, n_assets: usize) -> Result<Bounds> {
    match self {
      BoundsSpec::LongOnly => Bounds::uniform(n_assets, 0.0, 1.0),
      BoundsSpec::Uniform { lower, upper } => Bounds::uniform(n_assets, *lower, *upper),
      BoundsSpec::PerAsset(pairs) => {
        if pairs.len() != n_assets {
          return Err(PortfolioError::invalid(format!(
            "{} bound pairs supplied for {n_assets} assets",
            pairs.len()
          )));
        }
        Bounds::from_pairs(pairs)
      }
    }
  }
}

/// Session-level configuration of a [`crate::portfolio::PortfolioEngine`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisConfig {
  /// Annualized risk-free rate used by Sharpe computations.
  pub risk_free_rate: f64,
  /// Trading periods per year used for annualization.
  pub periods_per_year: u32,
  /// Box constraints applied to every optimization.
  pub bounds: BoundsSpec,
  /// Number of target returns in the analytic frontier sweep.
  pub num_frontier_points: usize,
  /// Number of random portfolios in the Monte Carlo frontier.
  pub num_monte_carlo_samples: usize,
  /// Seed for Monte Carlo sampling. `None` draws one from OS entropy.
  pub random_seed: Option<u64>,
  /// Periodic return definition used when deriving returns from prices.
  pub return_method: ReturnMethod,
  /// Minimum acceptable return (periodic) for Sortino ratios.
  pub minimum_acceptable_return: f64,
  /// Solver budgets and tolerances.
  pub solver: SolverConfig,
}

impl Default for AnalysisConfig {
  fn default() -> Self {
    Self {
      risk_free_rate: 0.0,
      periods_per_year: 252,
      bounds: BoundsSpec::LongOnly,
      num_frontier_points: 50,
      num_monte_carlo_samples: 10_000,
      random_seed: None,
      return_method: ReturnMethod::Simple,
      minimum_acceptable_return: 0.0,
      solver: SolverConfig::default(),
    }
  }
}

impl AnalysisConfig {
  pub fn validate(&self) -> Result<()> {
    if self.periods_per_year == 0 {
      return Err(PortfolioError::invalid("periods_per_year must be > 0"));
    }
    if !self.risk_free_rate.is_finite() {
      return Err(PortfolioError::invalid("risk_free_rate must be finite"));
    }
    if !self.minimum_acceptable_return.is_finite() {
      return Err(PortfolioError::invalid(
        "minimum_acceptable_return must be finite",
      ));
    }
    if self.num_frontier_points == 0 {
      return Err(PortfolioError::invalid("num_frontier_points must be > 0"));
    }
    if self.num_monte_carlo_samples == 0 {
      return Err(PortfolioError::invalid(
        "num_monte_carlo_samples must be > 0",
      ));
    }
    let s = &self.solver;
    if s.qp_max_iters == 0 || s.sqp_max_iters == 0 {
      return Err(PortfolioError::invalid("solver iteration budgets must be > 0"));
    }
    for (name, tol) in [
      ("qp_tolerance", s.qp_tolerance),
      ("sqp_tolerance", s.sqp_tolerance),
      ("weight_tolerance", s.weight_tolerance),
      ("psd_tolerance", s.psd_tolerance),
    ] {
      if !(tol.is_finite() && tol > 0.0) {
        return Err(PortfolioError::invalid(format!(
          "{name} must be finite and positive"
        )));
      }
    }
    Ok(())
  }

  pub fn periods(&self) -> f64 {
    self.periods_per_year as f64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_surface() {
    let cfg = AnalysisConfig::default();
    assert_eq!(cfg.risk_free_rate, 0.0);
    assert_eq!(cfg.periods_per_year, 252);
    assert_eq!(cfg.bounds, BoundsSpec::LongOnly);
    assert_eq!(cfg.num_frontier_points, 50);
    assert_eq!(cfg.num_monte_carlo_samples, 10_000);
    assert!(cfg.random_seed.is_none());
    assert!(cfg.validate().is_ok());
  }

  #[test]
  fn validate_rejects_zero_periods() {
    let cfg = AnalysisConfig {
      periods_per_year: 0,
      ..AnalysisConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(PortfolioError::InvalidInput(_))));
  }

  #[test]
  fn per_asset_bounds_must_match_asset_count() {
    let spec = BoundsSpec::PerAsset(vec![(0.0, 0.5), (0.0, 0.5)]);
    assert!(spec.resolve(3).is_err());
    let bounds = spec.resolve(2).unwrap();
    assert_eq!(bounds.len(), 2);
  }
}
