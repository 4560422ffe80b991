//! # Convex Quadratic Program
//!
//! $$
//! \min_{x}\ \tfrac12 x^\top P x + q^\top x
//! \quad\text{s.t.}\quad Ex=b,\ \ \ell\le x\le u
//! $$
//!
//! Thin layer over the `clarabel` interior-point solver. Equality rows go to
//! a zero cone, the box to a nonnegative cone of `2n` rows. Variables with
//! `lower == upper` are substituted out before the solve so the remaining
//! box always has an interior.

use std::time::Instant;

use clarabel::algebra::CscMatrix;
use clarabel::solver::*;
use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;

use crate::error::PortfolioError;
use crate::error::Result;

pub(crate) const SOLVER: &str = "interior-point QP";

/// Problem data. `eq` is `m x n` with right-hand side `rhs`.
pub(crate) struct QuadraticProgram<'a> {
  pub p: &'a Array2<f64>,
  pub q: Array1<f64>,
  pub eq: Array2<f64>,
  pub rhs: Array1<f64>,
  pub lower: &'a Array1<f64>,
  pub upper: &'a Array1<f64>,
}

pub(crate) struct QpSettings {
  pub max_iters: u64,
  pub tolerance: f64,
  pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct QpSolution {
  pub x: Array1<f64>,
  pub iterations: u64,
}

/// Dense to compressed-column, dropping exact zeros. With `upper_triangle`
/// only entries `i <= j` are stored, as the solver expects for `P`.
fn csc(rows: usize, cols: usize, upper_triangle: bool, value: impl Fn(usize, usize) -> f64) -> CscMatrix<f64> {
  let mut colptr = Vec::with_capacity(cols + 1);
  let mut rowval = Vec::new();
  let mut nzval = Vec::new();
  colptr.push(0);
  for j in 0..cols {
    let last = if upper_triangle { (j + 1).min(rows) } else { rows };
    for i in 0..last {
      let v = value(i, j);
      if v != 0.0 {
        rowval.push(i);
        nzval.push(v);
      }
    }
    colptr.push(nzval.len());
  }
  CscMatrix::new(rows, cols, colptr, rowval, nzval)
}

/// Seconds left before `deadline`, for the solver's own time limit.
fn time_left(deadline: Option<Instant>) -> Result<f64> {
  match deadline {
    None => Ok(f64::INFINITY),
    Some(d) => {
      let now = Instant::now();
      if now >= d {
        return Err(PortfolioError::SolverNonConvergence {
          solver: SOLVER,
          iterations: 0,
          reason: "time budget exhausted".into(),
        });
      }
      Ok((d - now).as_secs_f64())
    }
  }
}

pub(crate) fn solve(problem: &QuadraticProgram<'_>, settings: &QpSettings) -> Result<QpSolution> {
  let n = problem.lower.len();
  let m = problem.eq.nrows();
  let (lower, upper) = (problem.lower, problem.upper);
  let time_limit = time_left(settings.deadline)?;

  let free: Vec<usize> = (0..n).filter(|&i| upper[i] > lower[i]).collect();
  let mut x = lower.clone();
  if free.is_empty() {
    // Every variable is pinned: the feasible set is at most one point.
    return Ok(QpSolution { x, iterations: 0 });
  }
  let nf = free.len();
  let pinned: Vec<usize> = (0..n).filter(|&i| upper[i] <= lower[i]).collect();

  // Fold pinned variables into the linear term and the equality rows.
  let q: Vec<f64> = free
    .iter()
    .map(|&i| problem.q[i] + pinned.iter().map(|&k| problem.p[[i, k]] * x[k]).sum::<f64>())
    .collect();
  let mut b: Vec<f64> = (0..m)
    .map(|r| problem.rhs[r] - pinned.iter().map(|&k| problem.eq[[r, k]] * x[k]).sum::<f64>())
    .collect();
  b.extend(free.iter().map(|&i| -lower[i]));
  b.extend(free.iter().map(|&i| upper[i]));

  let p = csc(nf, nf, true, |a, c| problem.p[[free[a], free[c]]]);
  let a = csc(m + 2 * nf, nf, false, |r, c| {
    if r < m {
      return problem.eq[[r, free[c]]];
    }
    let k = r - m;
    match (k < nf, k % nf == c) {
      (true, true) => -1.0,
      (false, true) => 1.0,
      _ => 0.0,
    }
  });
  let cones = [SupportedConeT::ZeroConeT(m), SupportedConeT::NonnegativeConeT(2 * nf)];

  let tol = settings.tolerance;
  let solver_settings = DefaultSettingsBuilder::default()
    .max_iter(u32::try_from(settings.max_iters).unwrap_or(u32::MAX))
    .time_limit(time_limit)
    .verbose(false)
    .tol_gap_abs(tol)
    .tol_gap_rel(tol)
    .tol_feas(tol)
    .build()
    .map_err(|e| PortfolioError::invalid(format!("solver settings rejected: {e}")))?;

  let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, solver_settings).map_err(|e| {
    PortfolioError::SolverNonConvergence {
      solver: SOLVER,
      iterations: 0,
      reason: format!("problem setup failed: {e:?}"),
    }
  })?;
  solver.solve();

  let iterations = u64::from(solver.solution.iterations);
  if !matches!(solver.solution.status, SolverStatus::Solved) {
    let reason = match &solver.solution.status {
      SolverStatus::MaxTime => "time budget exhausted".to_string(),
      SolverStatus::MaxIterations => "iteration budget exhausted".to_string(),
      status => format!("solver finished with status {status:?}"),
    };
    return Err(PortfolioError::SolverNonConvergence {
      solver: SOLVER,
      iterations,
      reason,
    });
  }

  // Interior iterates approach active bounds without touching them.
  let snap = 1e2 * tol;
  for (k, &i) in free.iter().enumerate() {
    let v = solver.solution.x[k];
    x[i] = if (v - lower[i]).abs() <= snap {
      lower[i]
    } else if (upper[i] - v).abs() <= snap {
      upper[i]
    } else {
      v
    };
  }
  debug!(iterations, free = nf, "{SOLVER} solved");
  Ok(QpSolution { x, iterations })
}
