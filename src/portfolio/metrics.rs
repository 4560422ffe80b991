//! # Performance Metrics
//!
//! $$
//! S=\frac{p\,\bar r-r_f}{\sqrt{p}\,s_r},\qquad
//! \mathrm{MDD}=\min_t\Big(\frac{V_t}{\max_{u\le t}V_u}-1\Big)
//! $$
//!
//! Risk and performance measures of periodic return series and of weight
//! vectors under `(mu, cov)`. Return slices are periodic (not annualized);
//! `periods_per_year` annualizes.

use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use statrs::distribution::ContinuousCDF;
use statrs::distribution::Normal;

use super::types::MetricValue;
use super::types::PortfolioPerformance;
use crate::error::PortfolioError;
use crate::error::Result;

/// Volatility below which ratio metrics are reported as undefined.
const ZERO_VOL: f64 = 1e-14;

fn require(xs: &[f64], required: usize, what: &'static str) -> Result<()> {
  if xs.len() < required {
    return Err(PortfolioError::InsufficientData {
      what,
      required,
      actual: xs.len(),
    });
  }
  if xs.iter().any(|x| !x.is_finite()) {
    return Err(PortfolioError::invalid(format!("{what}: returns must be finite")));
  }
  Ok(())
}

fn sample_mean(xs: &[f64]) -> f64 {
  xs.iter().sum::<f64>() / xs.len() as f64
}

fn sample_std(xs: &[f64], mean: f64) -> f64 {
  let ss: f64 = xs.iter().map(|x| (x - mean).powi(2)).sum();
  (ss / (xs.len() - 1) as f64).sqrt()
}

fn ratio(excess: f64, denom: f64) -> MetricValue {
  if denom > ZERO_VOL {
    MetricValue::Finite(excess / denom)
  } else {
    MetricValue::Undefined
  }
}

/// Arithmetic mean return scaled by `periods_per_year`.
pub fn annualized_return(returns: &[f64], periods_per_year: f64) -> Result<f64> {
  require(returns, 1, "annualized_return")?;
  Ok(sample_mean(returns) * periods_per_year)
}

/// Sample standard deviation (ddof = 1) scaled by `sqrt(periods_per_year)`.
pub fn annualized_volatility(returns: &[f64], periods_per_year: f64) -> Result<f64> {
  require(returns, 2, "annualized_volatility")?;
  Ok(sample_std(returns, sample_mean(returns)) * periods_per_year.sqrt())
}

/// `(mean * p - rf) / (std * sqrt(p))`. Zero volatility gives
/// [`MetricValue::Undefined`].
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Result<MetricValue> {
  require(returns, 2, "sharpe_ratio")?;
  let mean = sample_mean(returns);
  let excess = mean * periods_per_year - risk_free_rate;
  let vol = sample_std(returns, mean) * periods_per_year.sqrt();
  Ok(ratio(excess, vol))
}

/// Sharpe numerator over the annualized downside deviation
/// `sqrt(mean(min(r - mar, 0)^2) * p)`.
///
/// With no observation below `mar` the ratio is [`MetricValue::Unbounded`],
/// whatever the sign of the excess return.
pub fn sortino_ratio(
  returns: &[f64],
  risk_free_rate: f64,
  periods_per_year: f64,
  minimum_acceptable_return: f64,
) -> Result<MetricValue> {
  require(returns, 2, "sortino_ratio")?;
  let excess = sample_mean(returns) * periods_per_year - risk_free_rate;
  let downside: Vec<f64> = returns
    .iter()
    .map(|r| (r - minimum_acceptable_return).min(0.0))
    .collect();

  if downside.iter().all(|d| *d == 0.0) {
    return Ok(MetricValue::Unbounded);
  }

  let dd = (downside.iter().map(|d| d * d).sum::<f64>() / returns.len() as f64).sqrt()
    * periods_per_year.sqrt();
  Ok(ratio(excess, dd))
}

/// Value-at-Risk estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarMethod {
  /// Empirical quantile of the observed returns.
  Historical,
  /// Normal approximation from the sample mean and standard deviation.
  Parametric,
}

/// One-period Value-at-Risk, expressed as a positive loss.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueAtRisk {
  pub method: VarMethod,
  pub confidence: f64,
  pub value: f64,
}

fn check_confidence(confidence: f64) -> Result<()> {
  if !(confidence > 0.0 && confidence < 1.0) {
    return Err(PortfolioError::invalid(format!(
      "confidence must be in (0, 1), got {confidence}"
    )));
  }
  Ok(())
}

/// Linear interpolation between order statistics, `q` in `[0, 1]`.
fn empirical_quantile(sorted: &[f64], q: f64) -> f64 {
  let pos = q * (sorted.len() - 1) as f64;
  let lo = pos.floor() as usize;
  let hi = pos.ceil() as usize;
  let frac = pos - lo as f64;
  sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Historical or parametric VaR at `confidence`. The estimator used is
/// recorded in the result.
pub fn value_at_risk(returns: &[f64], confidence: f64, method: VarMethod) -> Result<ValueAtRisk> {
  check_confidence(confidence)?;
  let value = match method {
    VarMethod::Historical => {
      require(returns, 1, "value_at_risk")?;
      let mut sorted = returns.to_vec();
      sorted.sort_by(f64::total_cmp);
      -empirical_quantile(&sorted, 1.0 - confidence)
    }
    VarMethod::Parametric => {
      require(returns, 2, "value_at_risk")?;
      let mean = sample_mean(returns);
      let std = sample_std(returns, mean);
      let std_normal = Normal::new(0.0, 1.0).expect("standard normal must be valid");
      let z = std_normal.inverse_cdf(1.0 - confidence);
      -(mean + z * std)
    }
  };

  Ok(ValueAtRisk {
    method,
    confidence,
    value,
  })
}

/// Expected shortfall: negated mean of the worst `ceil(n * (1 - confidence))`
/// returns.
pub fn conditional_value_at_risk(returns: &[f64], confidence: f64) -> Result<f64> {
  check_confidence(confidence)?;
  require(returns, 1, "conditional_value_at_risk")?;
  let mut sorted = returns.to_vec();
  sorted.sort_by(f64::total_cmp);
  let cutoff = ((sorted.len() as f64) * (1.0 - confidence)).ceil() as usize;
  let cutoff = cutoff.clamp(1, sorted.len());
  Ok(-sample_mean(&sorted[..cutoff]))
}

fn check_wealth(values: &[f64]) -> Result<()> {
  if values.is_empty() {
    return Err(PortfolioError::InsufficientData {
      what: "max_drawdown",
      required: 1,
      actual: 0,
    });
  }
  if values.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
    return Err(PortfolioError::invalid(
      "drawdowns need a positive, finite value series",
    ));
  }
  Ok(())
}

/// `value_t / running_peak_t - 1` for every `t`.
pub fn drawdown_series(values: &[f64]) -> Result<Vec<f64>> {
  check_wealth(values)?;
  let mut peak = f64::NEG_INFINITY;
  Ok(
    values
      .iter()
      .map(|&v| {
        peak = peak.max(v);
        v / peak - 1.0
      })
      .collect(),
  )
}

/// Largest peak-to-trough decline of a positive value series, in `(-1, 0]`.
pub fn max_drawdown(values: &[f64]) -> Result<f64> {
  Ok(drawdown_series(values)?.into_iter().fold(0.0, f64::min))
}

/// Per-period portfolio returns `R w` for a `periods x assets` matrix.
pub fn portfolio_returns(weights: &Array1<f64>, returns: &Array2<f64>) -> Result<Array1<f64>> {
  if weights.len() != returns.ncols() {
    return Err(PortfolioError::invalid(format!(
      "{} weights for {} assets",
      weights.len(),
      returns.ncols()
    )));
  }
  Ok(returns.dot(weights))
}

/// `(w' mu, sqrt(w' cov w), sharpe)`. A materially negative `w' cov w`
/// is surfaced as [`PortfolioError::DegenerateCovariance`].
pub fn portfolio_performance(
  weights: &Array1<f64>,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  risk_free_rate: f64,
) -> Result<PortfolioPerformance> {
  let n = weights.len();
  if mu.len() != n || cov.dim() != (n, n) {
    return Err(PortfolioError::invalid(format!(
      "{n} weights for mu of length {} and {:?} covariance",
      mu.len(),
      cov.dim()
    )));
  }

  let expected_return = weights.dot(mu);
  let variance = weights.dot(&cov.dot(weights));
  let scale = weights.mapv(f64::abs).dot(&cov.diag().mapv(f64::abs)).max(1e-300);
  if variance < -1e-12 * scale {
    return Err(PortfolioError::degenerate(format!(
      "negative portfolio variance {variance:e}"
    )));
  }
  let volatility = variance.max(0.0).sqrt();

  Ok(PortfolioPerformance {
    expected_return,
    volatility,
    sharpe: ratio(expected_return - risk_free_rate, volatility),
  })
}
