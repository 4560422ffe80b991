//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Shared enums and result containers for portfolio optimization.

use std::cmp::Ordering;

use ndarray::Array1;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;

/// Optimization objective. Selects the solver strategy in
/// [`crate::portfolio::optimizers::optimize`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Objective {
  /// Global minimum variance (convex QP).
  MinVolatility,
  /// Tangency portfolio (non-convex, SQP).
  MaxSharpe { risk_free_rate: f64 },
  /// Minimum variance at a fixed expected return (convex QP).
  EfficientReturn { target_return: f64 },
}

/// Ratio-type metric that may be unbounded or undefined.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
  Finite(f64),
  /// Zero downside deviation (no return below the threshold).
  Unbounded,
  /// Zero denominator with no meaningful limit (e.g. zero volatility).
  Undefined,
}

impl MetricValue {
  pub fn value(&self) -> Option<f64> {
    match self {
      Self::Finite(v) => Some(*v),
      _ => None,
    }
  }

  /// Lossy `f64` view: `+inf` for unbounded and `NaN` for undefined.
  pub fn as_f64(&self) -> f64 {
    match self {
      Self::Finite(v) => *v,
      Self::Unbounded => f64::INFINITY,
      Self::Undefined => f64::NAN,
    }
  }

  pub fn is_finite(&self) -> bool {
    matches!(self, Self::Finite(_))
  }

  /// Total order used to pick the "best" ratio among samples: undefined
  /// sorts lowest, unbounded highest.
  pub fn rank_cmp(&self, other: &Self) -> Ordering {
    fn rank(m: &MetricValue) -> (u8, f64) {
      match m {
        MetricValue::Undefined => (0, 0.0),
        MetricValue::Finite(v) => (1, *v),
        MetricValue::Unbounded => (2, 0.0),
      }
    }
    let (ra, va) = rank(self);
    let (rb, vb) = rank(other);
    ra.cmp(&rb).then(va.total_cmp(&vb))
  }
}

/// Model performance of a weight vector under `(mu, cov)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPerformance {
  /// `w' mu` (annualized if inputs are annualized).
  pub expected_return: f64,
  /// `sqrt(w' cov w)`.
  pub volatility: f64,
  /// `(expected_return - risk_free) / volatility`.
  pub sharpe: MetricValue,
}

/// Per-asset box constraints, resolved against a fixed asset count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
  lower: Array1<f64>,
  upper: Array1<f64>,
}

impl Bounds {
  /// Same `[lower, upper]` box for each of `n` assets.
  pub fn uniform(n: usize, lower: f64, upper: f64) -> Result<Self> {
    Self::from_pairs(&vec![(lower, upper); n])
  }

  /// `0 <= w_i <= 1`, no short positions.
  pub fn long_only(n: usize) -> Result<Self> {
    Self::uniform(n, 0.0, 1.0)
  }

  /// Explicit `(lower, upper)` per asset. Fails when the box cannot hold a
  /// fully invested portfolio.
  pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self> {
    if pairs.is_empty() {
      return Err(PortfolioError::invalid("bounds need at least one asset"));
    }
    for (i, &(lo, hi)) in pairs.iter().enumerate() {
      if !lo.is_finite() || !hi.is_finite() {
        return Err(PortfolioError::invalid(format!(
          "bounds for asset {i} must be finite"
        )));
      }
      if lo > hi {
        return Err(PortfolioError::invalid(format!(
          "lower bound {lo} exceeds upper bound {hi} for asset {i}"
        )));
      }
    }

    let lower: Array1<f64> = pairs.iter().map(|p| p.0).collect();
    let upper: Array1<f64> = pairs.iter().map(|p| p.1).collect();
    let (sum_lo, sum_hi) = (lower.sum(), upper.sum());
    if sum_lo > 1.0 + 1e-12 || sum_hi < 1.0 - 1e-12 {
      return Err(PortfolioError::infeasible(format!(
        "bounds admit no fully invested portfolio (sum of lower = {sum_lo}, sum of upper = {sum_hi})"
      )));
    }

    Ok(Self { lower, upper })
  }

  /// Number of assets covered.
  pub fn len(&self) -> usize {
    self.lower.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lower.is_empty()
  }

  /// Per-asset lower bounds.
  pub fn lower(&self) -> &Array1<f64> {
    &self.lower
  }

  /// Per-asset upper bounds.
  pub fn upper(&self) -> &Array1<f64> {
    &self.upper
  }

  /// Whether `w` is fully invested and inside the box within `tol`.
  pub fn admits(&self, w: &Array1<f64>, tol: f64) -> bool {
    w.len() == self.len()
      && (w.sum() - 1.0).abs() <= tol
      && w
        .iter()
        .zip(self.lower.iter().zip(self.upper.iter()))
        .all(|(&x, (&lo, &hi))| x >= lo - tol && x <= hi + tol)
  }

  /// Euclidean projection onto `{w : sum(w) = 1, lower <= w <= upper}`.
  ///
  /// Finds the shift `tau` with `sum(clamp(v - tau)) = 1` by bisection; the
  /// clamped sum is monotone in `tau`.
  pub fn project(&self, v: &Array1<f64>) -> Array1<f64> {
    let clamped = |tau: f64| -> Array1<f64> {
      Array1::from_iter(
        v.iter()
          .zip(self.lower.iter().zip(self.upper.iter()))
          .map(|(&x, (&lo, &hi))| (x - tau).clamp(lo, hi)),
      )
    };

    let mut lo_tau = v
      .iter()
      .zip(self.upper.iter())
      .map(|(x, hi)| x - hi)
      .fold(f64::INFINITY, f64::min)
      - 1.0;
    let mut hi_tau = v
      .iter()
      .zip(self.lower.iter())
      .map(|(x, lo)| x - lo)
      .fold(f64::NEG_INFINITY, f64::max)
      + 1.0;

    for _ in 0..200 {
      let mid = 0.5 * (lo_tau + hi_tau);
      if clamped(mid).sum() > 1.0 {
        lo_tau = mid;
      } else {
        hi_tau = mid;
      }
      if hi_tau - lo_tau < 1e-15 {
        break;
      }
    }

    clamped(0.5 * (lo_tau + hi_tau))
  }

  /// Vertex of the feasible polytope that maximizes (or minimizes) `w' mu`:
  /// start from the lower bounds and fill the remaining budget greedily by
  /// return rank. Ties are broken by asset order.
  pub fn extreme_portfolio(&self, mu: &Array1<f64>, maximize: bool) -> Array1<f64> {
    let mut order: Vec<usize> = (0..self.len()).collect();
    order.sort_by(|&a, &b| {
      let ord = mu[a].total_cmp(&mu[b]);
      if maximize { ord.reverse() } else { ord }
    });

    let mut w = self.lower.clone();
    let mut budget = 1.0 - self.lower.sum();
    for i in order {
      if budget <= 0.0 {
        break;
      }
      let add = (self.upper[i] - self.lower[i]).min(budget);
      w[i] += add;
      budget -= add;
    }
    w
  }

  /// Exact `[min, max]` of `w' mu` over the feasible polytope.
  pub fn return_range(&self, mu: &Array1<f64>) -> (f64, f64) {
    let lo = self.extreme_portfolio(mu, false).dot(mu);
    let hi = self.extreme_portfolio(mu, true).dot(mu);
    (lo, hi)
  }
}

/// Immutable weight vector labelled with tickers. Deserialization goes
/// through [`Allocation::new`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAllocation")]
pub struct Allocation {
  tickers: Vec<String>,
  weights: Array1<f64>,
}

#[derive(Deserialize)]
struct RawAllocation {
  tickers: Vec<String>,
  weights: Array1<f64>,
}

impl TryFrom<RawAllocation> for Allocation {
  type Error = PortfolioError;

  fn try_from(raw: RawAllocation) -> Result<Self> {
    Self::new(raw.tickers, raw.weights)
  }
}

impl Allocation {
  /// Label `weights` with `tickers`. Lengths must agree and every weight
  /// must be finite.
  pub fn new(tickers: Vec<String>, weights: Array1<f64>) -> Result<Self> {
    if tickers.len() != weights.len() {
      return Err(PortfolioError::invalid(format!(
        "{} tickers for {} weights",
        tickers.len(),
        weights.len()
      )));
    }
    if weights.iter().any(|w| !w.is_finite()) {
      return Err(PortfolioError::invalid("weights must be finite"));
    }
    Ok(Self { tickers, weights })
  }

  /// Equal weight `1/n` on every ticker.
  pub fn equal_weight(tickers: Vec<String>) -> Result<Self> {
    if tickers.is_empty() {
      return Err(PortfolioError::invalid("equal weight needs at least one asset"));
    }
    let n = tickers.len();
    Self::new(tickers, Array1::from_elem(n, 1.0 / n as f64))
  }

  /// Asset labels in weight order.
  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Weight vector in ticker order.
  pub fn weights(&self) -> &Array1<f64> {
    &self.weights
  }

  pub fn len(&self) -> usize {
    self.weights.len()
  }

  pub fn is_empty(&self) -> bool {
    self.weights.is_empty()
  }

  /// Weight held in `ticker`, if present.
  pub fn weight(&self, ticker: &str) -> Option<f64> {
    self
      .tickers
      .iter()
      .position(|t| t == ticker)
      .map(|i| self.weights[i])
  }

  /// `(ticker, weight)` pairs.
  pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
    self
      .tickers
      .iter()
      .map(String::as_str)
      .zip(self.weights.iter().copied())
  }
}

/// One solved optimization on the frontier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
  /// Requested expected return.
  pub target_return: f64,
  /// Achieved `w' mu` (equal to the target within solver tolerance).
  pub expected_return: f64,
  /// Achieved `sqrt(w' cov w)`.
  pub volatility: f64,
  /// Sharpe ratio at the configured risk-free rate.
  pub sharpe: MetricValue,
  /// Solved weights.
  pub allocation: Allocation,
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  #[test]
  fn projection_lands_in_bounded_simplex() {
    let b = Bounds::uniform(3, 0.0, 0.5).unwrap();
    let p = b.project(&array![2.0, -1.0, 0.3]);
    assert!(b.admits(&p, 1e-9));
    assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-9);
  }

  #[test]
  fn equal_weight_is_its_own_projection() {
    let b = Bounds::long_only(4).unwrap();
    let w = Array1::from_elem(4, 0.25);
    let p = b.project(&w);
    assert_abs_diff_eq!(p, w, epsilon = 1e-12);
  }

  #[test]
  fn return_range_long_only_is_min_and_max_asset() {
    let b = Bounds::long_only(3).unwrap();
    let mu = array![0.05, 0.12, 0.08];
    let (lo, hi) = b.return_range(&mu);
    assert_abs_diff_eq!(lo, 0.05, epsilon = 1e-12);
    assert_abs_diff_eq!(hi, 0.12, epsilon = 1e-12);
  }

  #[test]
  fn return_range_respects_caps() {
    let b = Bounds::uniform(3, 0.0, 0.5).unwrap();
    let mu = array![0.05, 0.12, 0.08];
    let (_, hi) = b.return_range(&mu);
    assert_abs_diff_eq!(hi, 0.5 * 0.12 + 0.5 * 0.08, epsilon = 1e-12);
  }

  #[test]
  fn bounds_that_cannot_sum_to_one_are_infeasible() {
    assert!(matches!(
      Bounds::uniform(3, 0.0, 0.2),
      Err(PortfolioError::Infeasible { .. })
    ));
    assert!(matches!(
      Bounds::uniform(2, 0.8, 1.0),
      Err(PortfolioError::Infeasible { .. })
    ));
  }

  #[test]
  fn sentinel_ranking() {
    assert_eq!(
      MetricValue::Unbounded.rank_cmp(&MetricValue::Finite(10.0)),
      Ordering::Greater
    );
    assert_eq!(
      MetricValue::Undefined.rank_cmp(&MetricValue::Finite(-10.0)),
      Ordering::Less
    );
    assert!(MetricValue::Undefined.as_f64().is_nan());
  }

  #[test]
  fn allocation_lookup_by_ticker() {
    let a = Allocation::new(vec!["A".into(), "B".into()], array![0.3, 0.7]).unwrap();
    assert_eq!(a.weight("B"), Some(0.7));
    assert_eq!(a.weight("C"), None);
    assert!(Allocation::new(vec!["A".into()], array![0.3, 0.7]).is_err());
  }

  #[test]
  fn deserialized_allocation_is_validated() {
    let a = Allocation::new(vec!["A".into(), "B".into()], array![0.25, 0.75]).unwrap();
    let json = serde_json::to_string(&a).unwrap();
    assert_eq!(serde_json::from_str::<Allocation>(&json).unwrap(), a);

    let mismatched = r#"{"tickers":["A"],"weights":{"v":1,"dim":[2],"data":[0.25,0.75]}}"#;
    assert!(serde_json::from_str::<Allocation>(mismatched).is_err());
  }
}
