//! # Sequential Quadratic Programming
//!
//! $$
//! d_k=\arg\min_{d}\ \tfrac12 d^\top B_k d+\nabla f(w_k)^\top d
//! \quad\text{s.t.}\quad \mathbf 1^\top d=0,\ \ \ell-w_k\le d\le u-w_k
//! $$
//!
//! General smooth objective over the bounded simplex. The constraints are
//! linear, so every iterate stays feasible and the merit function is the
//! objective itself. `B_k` is a damped BFGS approximation of the Hessian;
//! each QP subproblem is handed to the interior-point solver in
//! [`super::quadratic`]. The iteration stops on a vanishing step or once an
//! accepted step no longer moves the objective.

use std::time::Instant;

use argmin::core::CostFunction;
use argmin::core::Gradient;
use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;

use super::quadratic;
use super::quadratic::QpSettings;
use super::quadratic::QuadraticProgram;
use crate::error::PortfolioError;
use crate::error::Result;

const SOLVER: &str = "SQP";
const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-12;

/// Negative Sharpe ratio `-(w' mu - rf) / sqrt(w' cov w)`.
pub(crate) struct NegativeSharpe<'a> {
  pub mu: &'a Array1<f64>,
  pub cov: &'a Array2<f64>,
  pub risk_free_rate: f64,
}

impl CostFunction for NegativeSharpe<'_> {
  type Param = Array1<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let var = w.dot(&self.cov.dot(w));
    if var <= 0.0 {
      return Err(argmin::core::Error::msg(format!("portfolio variance {var:e} is not positive")));
    }
    Ok(-(w.dot(self.mu) - self.risk_free_rate) / var.sqrt())
  }
}

impl Gradient for NegativeSharpe<'_> {
  type Param = Array1<f64>;
  type Gradient = Array1<f64>;

  /// `-mu / s + (w' mu - rf) cov w / s^3`
  fn gradient(&self, w: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
    let sigma_w = self.cov.dot(w);
    let var = w.dot(&sigma_w);
    if var <= 0.0 {
      return Err(argmin::core::Error::msg(format!("portfolio variance {var:e} is not positive")));
    }
    let s = var.sqrt();
    let excess = w.dot(self.mu) - self.risk_free_rate;
    Ok(self.mu * (-1.0 / s) + sigma_w * (excess / (s * var)))
  }
}

pub(crate) struct SqpSettings {
  pub max_iters: u64,
  pub tolerance: f64,
  pub qp_max_iters: u64,
  pub qp_tolerance: f64,
  pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct SqpSolution {
  pub x: Array1<f64>,
  pub cost: f64,
  pub iterations: u64,
}

fn inf_norm(v: &Array1<f64>) -> f64 {
  v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Powell-damped BFGS update keeping `b` positive definite.
fn bfgs_update(b: &mut Array2<f64>, s: &Array1<f64>, y: &Array1<f64>) {
  let bs = b.dot(s);
  let sbs = s.dot(&bs);
  if sbs <= 0.0 {
    return;
  }
  let sy = s.dot(y);
  let r = if sy >= 0.2 * sbs {
    y.clone()
  } else {
    let theta = 0.8 * sbs / (sbs - sy);
    y * theta + &bs * (1.0 - theta)
  };
  let sr = s.dot(&r);
  if sr <= 0.0 {
    return;
  }

  let n = s.len();
  for i in 0..n {
    for j in 0..n {
      b[[i, j]] += r[i] * r[j] / sr - bs[i] * bs[j] / sbs;
    }
  }
}

/// Minimize `objective` over `{w : sum(w) = 1, lower <= w <= upper}` from the
/// feasible point `x0`.
pub(crate) fn minimize<O>(
  objective: &O,
  lower: &Array1<f64>,
  upper: &Array1<f64>,
  x0: Array1<f64>,
  settings: &SqpSettings,
) -> Result<SqpSolution>
where
  O: CostFunction<Param = Array1<f64>, Output = f64>
    + Gradient<Param = Array1<f64>, Gradient = Array1<f64>>,
{
  let n = x0.len();
  let mut x = x0;
  let mut fx = objective.cost(&x)?;
  let mut grad = objective.gradient(&x)?;
  let mut hessian = Array2::<f64>::eye(n);
  let ones = Array2::<f64>::ones((1, n));
  let qp_settings = QpSettings {
    max_iters: settings.qp_max_iters,
    tolerance: settings.qp_tolerance,
    deadline: settings.deadline,
  };

  for iter in 0..settings.max_iters {
    if settings.deadline.is_some_and(|d| Instant::now() >= d) {
      return Err(PortfolioError::SolverNonConvergence {
        solver: SOLVER,
        iterations: iter,
        reason: "time budget exhausted".into(),
      });
    }

    // Step bounds are relative to the current iterate; d = 0 is feasible.
    let d_lower = lower - &x;
    let d_upper = upper - &x;
    let sub = QuadraticProgram {
      p: &hessian,
      q: grad.clone(),
      eq: ones.clone(),
      rhs: Array1::zeros(1),
      lower: &d_lower,
      upper: &d_upper,
    };
    let d = quadratic::solve(&sub, &qp_settings)?.x;

    let d_norm = inf_norm(&d);
    if d_norm <= settings.tolerance {
      debug!(iterations = iter + 1, cost = fx, "{SOLVER} converged");
      return Ok(SqpSolution {
        x,
        cost: fx,
        iterations: iter + 1,
      });
    }

    // Backtracking line search on the objective.
    let slope = grad.dot(&d);
    let mut alpha = 1.0;
    let accepted = loop {
      let mut trial = &x + &(&d * alpha);
      // Keep round-off in the subproblem from leaving the box.
      trial.zip_mut_with(lower, |t, l| *t = t.max(*l));
      trial.zip_mut_with(upper, |t, u| *t = t.min(*u));
      let f_trial = objective.cost(&trial)?;
      if f_trial <= fx + ARMIJO * alpha * slope {
        break Some((trial, f_trial));
      }
      alpha *= 0.5;
      if alpha < MIN_STEP {
        break None;
      }
    };

    let Some((x_new, f_new)) = accepted else {
      // No decrease along a tiny direction means the iterate is stationary up
      // to round-off.
      if d_norm <= settings.tolerance.sqrt() {
        debug!(iterations = iter + 1, cost = fx, "{SOLVER} stalled at round-off level");
        return Ok(SqpSolution {
          x,
          cost: fx,
          iterations: iter + 1,
        });
      }
      return Err(PortfolioError::SolverNonConvergence {
        solver: SOLVER,
        iterations: iter + 1,
        reason: format!("line search failed with step norm {d_norm:e}"),
      });
    };

    let moved = inf_norm(&(&x_new - &x));
    if fx - f_new <= settings.tolerance * fx.abs().max(1.0) && moved <= settings.tolerance.sqrt() {
      // Stationary up to the accuracy of the subproblem.
      debug!(iterations = iter + 1, cost = f_new, "{SOLVER} converged without progress");
      return Ok(SqpSolution {
        x: x_new,
        cost: f_new,
        iterations: iter + 1,
      });
    }

    let grad_new = objective.gradient(&x_new)?;
    let s = &x_new - &x;
    let y = &grad_new - &grad;
    if iter == 0 {
      // Shanno-Phua scaling of the initial identity.
      let sy = s.dot(&y);
      if sy > 0.0 {
        hessian *= y.dot(&y) / sy;
      }
    }
    bfgs_update(&mut hessian, &s, &y);

    x = x_new;
    fx = f_new;
    grad = grad_new;
  }

  Err(PortfolioError::SolverNonConvergence {
    solver: SOLVER,
    iterations: settings.max_iters,
    reason: "iteration budget exhausted".into(),
  })
}
