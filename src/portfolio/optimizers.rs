//! # Mean-Variance Optimizers
//!
//! $$
//! \min_{\mathbf{w}}\ \mathbf w^\top\Sigma\mathbf w
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w=1,\ \ \boldsymbol\ell\le\mathbf w\le\mathbf u
//! $$
//!
//! Constrained allocation under `(mu, cov)`. Minimum variance and target
//! return are convex quadratic programs solved by `clarabel`; the
//! maximum Sharpe ratio is non-convex and goes through SQP. Every entry
//! point validates the covariance first and verifies the returned weights
//! against the budget and box constraints.

use std::time::Instant;

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use ndarray::array;
use tracing::debug;

use super::data::MarketStatistics;
use super::data::validate_covariance;
use super::quadratic;
use super::quadratic::QpSettings;
use super::quadratic::QpSolution;
use super::quadratic::QuadraticProgram;
use super::sqp;
use super::sqp::NegativeSharpe;
use super::sqp::SqpSettings;
use super::types::Allocation;
use super::types::Bounds;
use super::types::Objective;
use crate::config::SolverConfig;
use crate::error::PortfolioError;
use crate::error::Result;

fn check_inputs(stats: &MarketStatistics, bounds: &Bounds, solver: &SolverConfig) -> Result<()> {
  if bounds.len() != stats.n_assets() {
    return Err(PortfolioError::invalid(format!(
      "bounds for {} assets supplied for {} assets",
      bounds.len(),
      stats.n_assets()
    )));
  }
  validate_covariance(stats.cov(), solver.psd_tolerance)
}

fn deadline(solver: &SolverConfig) -> Option<Instant> {
  solver.max_duration.map(|d| Instant::now() + d)
}

fn qp_settings(solver: &SolverConfig, deadline: Option<Instant>) -> QpSettings {
  QpSettings {
    max_iters: solver.qp_max_iters,
    tolerance: solver.qp_tolerance,
    deadline,
  }
}

fn return_tolerance(target: f64) -> f64 {
  1e-9 * target.abs().max(1.0)
}

/// Wrap solver output, refusing weights that break the constraints instead
/// of clipping them.
fn finish(
  stats: &MarketStatistics,
  bounds: &Bounds,
  solver: &SolverConfig,
  name: &'static str,
  iterations: u64,
  w: Array1<f64>,
) -> Result<Allocation> {
  if !bounds.admits(&w, solver.weight_tolerance) {
    return Err(PortfolioError::SolverNonConvergence {
      solver: name,
      iterations,
      reason: format!(
        "solution violates the budget or box constraints (sum = {:.10})",
        w.sum()
      ),
    });
  }
  Allocation::new(stats.tickers().to_vec(), w)
}

/// Exact `[min, max]` expected return attainable under `bounds`.
pub fn feasible_return_range(stats: &MarketStatistics, bounds: &Bounds) -> Result<(f64, f64)> {
  if bounds.len() != stats.n_assets() {
    return Err(PortfolioError::invalid(format!(
      "bounds for {} assets supplied for {} assets",
      bounds.len(),
      stats.n_assets()
    )));
  }
  Ok(bounds.return_range(stats.mu()))
}

/// Global minimum-variance portfolio under `bounds`.
pub fn minimize_volatility(
  stats: &MarketStatistics,
  bounds: &Bounds,
  solver: &SolverConfig,
) -> Result<Allocation> {
  check_inputs(stats, bounds, solver)?;
  let n = stats.n_assets();
  if n == 1 {
    return finish(stats, bounds, solver, "trivial", 0, Array1::ones(1));
  }

  let problem = QuadraticProgram {
    p: stats.cov(),
    q: Array1::zeros(n),
    eq: Array2::ones((1, n)),
    rhs: array![1.0],
    lower: bounds.lower(),
    upper: bounds.upper(),
  };
  let sol = quadratic::solve(&problem, &qp_settings(solver, deadline(solver)))?;
  debug!(iterations = sol.iterations, "minimum volatility solved");
  finish(stats, bounds, solver, quadratic::SOLVER, sol.iterations, sol.x)
}

/// Tangency portfolio: maximum `(w' mu - rf) / sqrt(w' cov w)` under
/// `bounds`.
///
/// Starts from the equal-weight vector projected onto the feasible set, or
/// from the maximum-return vertex when that start has no excess return.
/// [`PortfolioError::Infeasible`] if no feasible portfolio beats `risk_free_rate`.
pub fn maximize_sharpe(
  stats: &MarketStatistics,
  risk_free_rate: f64,
  bounds: &Bounds,
  solver: &SolverConfig,
) -> Result<Allocation> {
  if !risk_free_rate.is_finite() {
    return Err(PortfolioError::invalid("risk_free_rate must be finite"));
  }
  check_inputs(stats, bounds, solver)?;
  let n = stats.n_assets();
  let mu = stats.mu();

  let (_, r_max) = bounds.return_range(mu);
  if r_max <= risk_free_rate + return_tolerance(risk_free_rate) {
    return Err(PortfolioError::infeasible(format!(
      "maximum attainable return {r_max:.6} does not exceed the risk-free rate {risk_free_rate:.6}"
    )));
  }
  if n == 1 {
    return finish(stats, bounds, solver, "trivial", 0, Array1::ones(1));
  }

  let mut x0 = bounds.project(&Array1::from_elem(n, 1.0 / n as f64));
  if x0.dot(mu) <= risk_free_rate {
    x0 = bounds.extreme_portfolio(mu, true);
  }

  let objective = NegativeSharpe {
    mu,
    cov: stats.cov(),
    risk_free_rate,
  };
  let settings = SqpSettings {
    max_iters: solver.sqp_max_iters,
    tolerance: solver.sqp_tolerance,
    qp_max_iters: solver.qp_max_iters,
    qp_tolerance: solver.qp_tolerance,
    deadline: deadline(solver),
  };
  let sol = sqp::minimize(&objective, bounds.lower(), bounds.upper(), x0, &settings)?;
  debug!(
    iterations = sol.iterations,
    sharpe = -sol.cost,
    "maximum sharpe solved"
  );
  finish(stats, bounds, solver, "SQP", sol.iterations, sol.x)
}

/// Minimum-variance portfolio with expected return exactly `target_return`.
///
/// Targets outside [`feasible_return_range`] are
/// [`PortfolioError::Infeasible`]. Interior targets add `w' mu = target` as
/// a second equality row; boundary targets are solved on the optimal face
/// of the return-extreme linear program, where the box has no interior.
pub fn efficient_return(
  stats: &MarketStatistics,
  target_return: f64,
  bounds: &Bounds,
  solver: &SolverConfig,
) -> Result<Allocation> {
  if !target_return.is_finite() {
    return Err(PortfolioError::invalid("target_return must be finite"));
  }
  check_inputs(stats, bounds, solver)?;
  let n = stats.n_assets();
  let mu = stats.mu();

  let (r_min, r_max) = bounds.return_range(mu);
  let eps = return_tolerance(target_return);
  if target_return < r_min - eps || target_return > r_max + eps {
    return Err(PortfolioError::infeasible(format!(
      "target return {target_return:.6} outside attainable range [{r_min:.6}, {r_max:.6}]"
    )));
  }
  if r_max - r_min <= eps {
    // Every feasible portfolio has the same return.
    return minimize_volatility(stats, bounds, solver);
  }

  let deadline = deadline(solver);
  let name = quadratic::SOLVER;
  let sol = if target_return >= r_max - eps {
    extreme_face(stats, bounds, solver, deadline, true)?
  } else if target_return <= r_min + eps {
    extreme_face(stats, bounds, solver, deadline, false)?
  } else {
    let mut eq = Array2::ones((2, n));
    eq.row_mut(1).assign(mu);
    let problem = QuadraticProgram {
      p: stats.cov(),
      q: Array1::zeros(n),
      eq,
      rhs: array![1.0, target_return],
      lower: bounds.lower(),
      upper: bounds.upper(),
    };
    quadratic::solve(&problem, &qp_settings(solver, deadline))?
  };

  let achieved = sol.x.dot(mu);
  let tol = solver.weight_tolerance * target_return.abs().max(1.0);
  if (achieved - target_return).abs() > tol {
    return Err(PortfolioError::SolverNonConvergence {
      solver: name,
      iterations: sol.iterations,
      reason: format!("achieved return {achieved:.10} misses target {target_return:.10}"),
    });
  }
  debug!(
    iterations = sol.iterations,
    target = target_return,
    "efficient return solved"
  );
  finish(stats, bounds, solver, name, sol.iterations, sol.x)
}

/// Minimum variance over the set of portfolios attaining the extreme return.
///
/// Assets strictly better (worse) than the marginal asset of the greedy
/// vertex are pinned at their vertex weights; only ties with the marginal
/// asset stay free. When the tied group has no room to move the vertex
/// itself is the answer.
fn extreme_face(
  stats: &MarketStatistics,
  bounds: &Bounds,
  solver: &SolverConfig,
  deadline: Option<Instant>,
  maximize: bool,
) -> Result<QpSolution> {
  let mu = stats.mu();
  let lower = bounds.lower();
  let vertex = bounds.extreme_portfolio(mu, maximize);

  // The marginal asset is the worst-ranked one that received budget.
  let filled = (0..mu.len()).filter(|&i| vertex[i] > lower[i]);
  let marginal = if maximize {
    filled.map(|i| mu[i]).reduce(f64::min)
  } else {
    filled.map(|i| mu[i]).reduce(f64::max)
  };
  let Some(marginal) = marginal else {
    return Ok(QpSolution {
      x: vertex,
      iterations: 0,
    });
  };

  let tie = 1e-12 * marginal.abs().max(1.0);
  let tied: Vec<usize> = (0..mu.len()).filter(|&i| (mu[i] - marginal).abs() <= tie).collect();
  let budget: f64 = tied.iter().map(|&i| vertex[i]).sum();
  let floor: f64 = tied.iter().map(|&i| lower[i]).sum();
  let cap: f64 = tied.iter().map(|&i| bounds.upper()[i]).sum();
  let slack = 1e-12 * budget.abs().max(1.0);
  if tied.len() < 2 || budget <= floor + slack || budget >= cap - slack {
    return Ok(QpSolution {
      x: vertex,
      iterations: 0,
    });
  }

  let mut face_lower = vertex.clone();
  let mut face_upper = vertex.clone();
  for &i in &tied {
    face_lower[i] = lower[i];
    face_upper[i] = bounds.upper()[i];
  }

  let n = mu.len();
  let problem = QuadraticProgram {
    p: stats.cov(),
    q: Array1::zeros(n),
    eq: Array1::<f64>::ones(n).insert_axis(Axis(0)),
    rhs: array![1.0],
    lower: &face_lower,
    upper: &face_upper,
  };
  quadratic::solve(&problem, &qp_settings(solver, deadline))
}

/// Dispatch on the objective: convex objectives go to the QP path, the
/// Sharpe ratio to SQP.
pub fn optimize(
  objective: Objective,
  stats: &MarketStatistics,
  bounds: &Bounds,
  solver: &SolverConfig,
) -> Result<Allocation> {
  match objective {
    Objective::MinVolatility => minimize_volatility(stats, bounds, solver),
    Objective::MaxSharpe { risk_free_rate } => maximize_sharpe(stats, risk_free_rate, bounds, solver),
    Objective::EfficientReturn { target_return } => efficient_return(stats, target_return, bounds, solver),
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::portfolio::metrics::portfolio_performance;

  fn tickers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("A{i}")).collect()
  }

  fn diagonal() -> MarketStatistics {
    MarketStatistics::new(
      tickers(3),
      array![0.08, 0.10, 0.12],
      array![[0.04, 0.0, 0.0], [0.0, 0.09, 0.0], [0.0, 0.0, 0.16]],
      252,
    )
    .unwrap()
  }

  fn correlated() -> MarketStatistics {
    MarketStatistics::new(
      tickers(3),
      array![0.08, 0.10, 0.12],
      array![[0.04, 0.05, 0.0], [0.05, 0.09, 0.0], [0.0, 0.0, 0.16]],
      252,
    )
    .unwrap()
  }

  fn vol(stats: &MarketStatistics, w: &Array1<f64>) -> f64 {
    portfolio_performance(w, stats.mu(), stats.cov(), 0.0)
      .unwrap()
      .volatility
  }

  #[test]
  fn minimum_variance_matches_inverse_variance_weights() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = minimize_volatility(&stats, &bounds, &SolverConfig::default()).unwrap();

    let inv = array![25.0, 100.0 / 9.0, 6.25];
    let expected = &inv / inv.sum();
    assert_abs_diff_eq!(*alloc.weights(), expected, epsilon = 1e-6);
    assert_abs_diff_eq!(alloc.weights().sum(), 1.0, epsilon = 1e-8);
  }

  #[test]
  fn minimum_variance_beats_equal_weight() {
    let stats = correlated();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = minimize_volatility(&stats, &bounds, &SolverConfig::default()).unwrap();
    let equal = Array1::from_elem(3, 1.0 / 3.0);

    assert!(bounds.admits(alloc.weights(), 1e-6));
    assert!(vol(&stats, alloc.weights()) <= vol(&stats, &equal) + 1e-9);
    for corner in [array![1.0, 0.0, 0.0], array![0.0, 1.0, 0.0], array![0.0, 0.0, 1.0]] {
      assert!(vol(&stats, alloc.weights()) <= vol(&stats, &corner) + 1e-9);
    }
  }

  #[test]
  fn long_short_bounds_allow_negative_weights() {
    let stats = correlated();
    let solver = SolverConfig::default();
    let long_short = Bounds::uniform(3, -1.0, 1.0).unwrap();
    let alloc = minimize_volatility(&stats, &long_short, &solver).unwrap();

    // Unconstrained GMV: cov^{-1} 1 / (1' cov^{-1} 1).
    let raw = array![(0.09 - 0.05) / 0.0011, (0.04 - 0.05) / 0.0011, 6.25];
    let expected = &raw / raw.sum();
    assert_abs_diff_eq!(*alloc.weights(), expected, epsilon = 1e-6);
    assert!(alloc.weights()[1] < 0.0);

    let long_only = minimize_volatility(&stats, &Bounds::long_only(3).unwrap(), &solver).unwrap();
    assert!(long_only.weights().iter().all(|&w| w >= 0.0));
    assert!(vol(&stats, long_only.weights()) >= vol(&stats, alloc.weights()) - 1e-9);
  }

  #[test]
  fn tangency_portfolio_closed_form() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = maximize_sharpe(&stats, 0.02, &bounds, &SolverConfig::default()).unwrap();

    let raw = array![0.06 / 0.04, 0.08 / 0.09, 0.10 / 0.16];
    let expected = &raw / raw.sum();
    assert_abs_diff_eq!(*alloc.weights(), expected, epsilon = 1e-5);
  }

  #[test]
  fn tangency_on_a_bound_converges() {
    let stats = MarketStatistics::new(
      tickers(3),
      array![0.1, 0.05, 0.15],
      array![
        [0.04864, -0.01489, -0.00988],
        [-0.01489, 0.03679, 0.02141],
        [-0.00988, 0.02141, 0.03324]
      ],
      252,
    )
    .unwrap();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = maximize_sharpe(&stats, 0.0, &bounds, &SolverConfig::default()).unwrap();
    let perf = portfolio_performance(alloc.weights(), stats.mu(), stats.cov(), 0.0).unwrap();

    assert_abs_diff_eq!(alloc.weights()[1], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(*alloc.weights(), array![0.3671505, 0.0, 0.6328495], epsilon = 1e-4);
    assert_abs_diff_eq!(perf.sharpe.as_f64(), 1.0650337, epsilon = 1e-6);
  }

  #[test]
  fn max_sharpe_beats_equal_weight_under_correlation() {
    let stats = correlated();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = maximize_sharpe(&stats, 0.02, &bounds, &SolverConfig::default()).unwrap();
    let sharpe = |w: &Array1<f64>| {
      portfolio_performance(w, stats.mu(), stats.cov(), 0.02)
        .unwrap()
        .sharpe
        .as_f64()
    };

    assert!(bounds.admits(alloc.weights(), 1e-6));
    assert!(sharpe(alloc.weights()) >= sharpe(&Array1::from_elem(3, 1.0 / 3.0)) - 1e-9);
  }

  #[test]
  fn max_sharpe_without_excess_return_is_infeasible() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    assert!(matches!(
      maximize_sharpe(&stats, 0.2, &bounds, &SolverConfig::default()),
      Err(PortfolioError::Infeasible { .. })
    ));
  }

  #[test]
  fn efficient_return_hits_target_on_unconstrained_frontier() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = efficient_return(&stats, 0.10, &bounds, &SolverConfig::default()).unwrap();

    assert_abs_diff_eq!(alloc.weights().dot(stats.mu()), 0.10, epsilon = 1e-8);
    assert_abs_diff_eq!(
      *alloc.weights(),
      array![9.0 / 28.0, 10.0 / 28.0, 9.0 / 28.0],
      epsilon = 1e-6
    );
  }

  #[test]
  fn efficient_return_at_range_edges() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let solver = SolverConfig::default();

    let top = efficient_return(&stats, 0.12, &bounds, &solver).unwrap();
    assert_abs_diff_eq!(*top.weights(), array![0.0, 0.0, 1.0], epsilon = 1e-12);
    let bottom = efficient_return(&stats, 0.08, &bounds, &solver).unwrap();
    assert_abs_diff_eq!(*bottom.weights(), array![1.0, 0.0, 0.0], epsilon = 1e-12);
  }

  #[test]
  fn efficient_return_with_tied_best_assets() {
    let stats = MarketStatistics::new(
      tickers(3),
      array![0.05, 0.10, 0.10],
      array![[0.04, 0.0, 0.0], [0.0, 0.04, 0.0], [0.0, 0.0, 0.04]],
      252,
    )
    .unwrap();
    let bounds = Bounds::long_only(3).unwrap();
    let alloc = efficient_return(&stats, 0.10, &bounds, &SolverConfig::default()).unwrap();
    assert_eq!(alloc.weights()[0], 0.0);
    assert_abs_diff_eq!(*alloc.weights(), array![0.0, 0.5, 0.5], epsilon = 1e-6);
  }

  #[test]
  fn target_outside_range_is_infeasible() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let solver = SolverConfig::default();
    for target in [0.05, 0.13] {
      assert!(matches!(
        efficient_return(&stats, target, &bounds, &solver),
        Err(PortfolioError::Infeasible { .. })
      ));
    }
    assert_eq!(feasible_return_range(&stats, &bounds).unwrap(), (0.08, 0.12));
  }

  #[test]
  fn identical_assets_are_degenerate() {
    let stats = MarketStatistics::new(
      tickers(2),
      array![0.1, 0.1],
      array![[0.04, 0.04], [0.04, 0.04]],
      252,
    )
    .unwrap();
    let bounds = Bounds::long_only(2).unwrap();
    let solver = SolverConfig::default();
    for objective in [
      Objective::MinVolatility,
      Objective::MaxSharpe { risk_free_rate: 0.0 },
      Objective::EfficientReturn { target_return: 0.1 },
    ] {
      assert!(matches!(
        optimize(objective, &stats, &bounds, &solver),
        Err(PortfolioError::DegenerateCovariance { .. })
      ));
    }
  }

  #[test]
  fn dispatch_matches_direct_calls() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let solver = SolverConfig::default();
    assert_eq!(
      optimize(Objective::MinVolatility, &stats, &bounds, &solver).unwrap(),
      minimize_volatility(&stats, &bounds, &solver).unwrap()
    );
    assert_eq!(
      optimize(Objective::EfficientReturn { target_return: 0.1 }, &stats, &bounds, &solver).unwrap(),
      efficient_return(&stats, 0.1, &bounds, &solver).unwrap()
    );
  }

  #[test]
  fn exhausted_iteration_budget_is_reported() {
    let stats = diagonal();
    let bounds = Bounds::long_only(3).unwrap();
    let solver = SolverConfig {
      qp_max_iters: 1,
      ..Default::default()
    };
    assert!(matches!(
      minimize_volatility(&stats, &bounds, &solver),
      Err(PortfolioError::SolverNonConvergence { .. })
    ));
  }

  #[test]
  fn exhausted_time_budget_is_reported() {
    let stats = correlated();
    let bounds = Bounds::long_only(3).unwrap();
    let solver = SolverConfig {
      max_duration: Some(Duration::ZERO),
      ..Default::default()
    };
    assert!(matches!(
      minimize_volatility(&stats, &bounds, &solver),
      Err(PortfolioError::SolverNonConvergence { .. })
    ));
    assert!(matches!(
      efficient_return(&stats, 0.10, &bounds, &solver),
      Err(PortfolioError::SolverNonConvergence { .. })
    ));
    assert!(matches!(
      maximize_sharpe(&stats, 0.02, &bounds, &solver),
      Err(PortfolioError::SolverNonConvergence { solver: "SQP", .. })
    ));
  }

  #[test]
  fn mismatched_bounds_are_rejected() {
    let stats = diagonal();
    let bounds = Bounds::long_only(2).unwrap();
    assert!(matches!(
      minimize_volatility(&stats, &bounds, &SolverConfig::default()),
      Err(PortfolioError::InvalidInput(_))
    ));
  }
}
