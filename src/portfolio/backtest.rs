//! # Backtest
//!
//! $$
//! r_t=\mathbf w^\top\mathbf r_t,\qquad C_t=\prod_{s\le t}(1+r_s)-1
//! $$
//!
//! Fixed-weight evaluation of an allocation over a historical return series.
//! Weights are held constant every period (continuous rebalancing, no costs).

use chrono::NaiveDate;
use impl_new_derive::ImplNew;
use ndarray::Array1;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::data::ReturnSeries;
use super::metrics::ValueAtRisk;
use super::metrics::VarMethod;
use super::metrics::annualized_return;
use super::metrics::annualized_volatility;
use super::metrics::max_drawdown;
use super::metrics::portfolio_returns;
use super::metrics::sharpe_ratio;
use super::metrics::sortino_ratio;
use super::metrics::value_at_risk;
use super::types::Allocation;
use super::types::MetricValue;
use crate::error::PortfolioError;
use crate::error::Result;

/// Annualization inputs for [`backtest_with`].
#[derive(ImplNew, Clone, Debug, Serialize, Deserialize)]
pub struct BacktestSettings {
  /// Annualized risk-free rate.
  pub risk_free_rate: f64,
  pub periods_per_year: f64,
  /// Periodic threshold for the Sortino downside deviation.
  pub minimum_acceptable_return: f64,
  /// Confidence of the reported historical VaR.
  pub var_confidence: f64,
}

impl Default for BacktestSettings {
  fn default() -> Self {
    Self {
      risk_free_rate: 0.0,
      periods_per_year: 252.0,
      minimum_acceptable_return: 0.0,
      var_confidence: 0.95,
    }
  }
}

/// Annualized statistics of the backtested return stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  pub sharpe: MetricValue,
  pub sortino: MetricValue,
  /// One-period historical VaR.
  pub value_at_risk: ValueAtRisk,
}

/// Period-by-period outcome of holding fixed weights over a return history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
  pub tickers: Vec<String>,
  pub weights: Array1<f64>,
  pub dates: Vec<NaiveDate>,
  /// `w' r_t` per period.
  pub period_returns: Array1<f64>,
  /// Compounded return up to and including each period.
  pub cumulative_returns: Array1<f64>,
  pub total_return: f64,
  /// Worst decline of `1 + cumulative` from its running peak, starting at 1.
  pub max_drawdown: f64,
  /// Share of periods with a strictly positive return.
  pub win_rate: f64,
  pub summary: Option<BacktestSummary>,
}

/// Apply `allocation` to every row of `returns`.
pub fn backtest(allocation: &Allocation, returns: &ReturnSeries) -> Result<BacktestResult> {
  if allocation.tickers() != returns.tickers() {
    return Err(PortfolioError::invalid(format!(
      "allocation assets {:?} do not match return series assets {:?}",
      allocation.tickers(),
      returns.tickers()
    )));
  }
  let t = returns.n_periods();
  if t == 0 {
    return Err(PortfolioError::InsufficientData {
      what: "backtest",
      required: 1,
      actual: 0,
    });
  }

  let period_returns = portfolio_returns(allocation.weights(), returns.values())?;
  let mut wealth = 1.0;
  let cumulative_returns = period_returns.mapv(|r| {
    wealth *= 1.0 + r;
    wealth - 1.0
  });
  let total_return = cumulative_returns[t - 1];
  let win_rate = period_returns.iter().filter(|r| **r > 0.0).count() as f64 / t as f64;

  let curve: Vec<f64> = std::iter::once(1.0)
    .chain(cumulative_returns.iter().map(|c| 1.0 + c))
    .collect();
  let max_drawdown = if curve.iter().all(|v| *v > 0.0) {
    max_drawdown(&curve)?
  } else {
    warn!("portfolio wealth reached zero during the backtest");
    -1.0
  };

  debug!(periods = t, total_return, max_drawdown, "backtest complete");
  Ok(BacktestResult {
    tickers: allocation.tickers().to_vec(),
    weights: allocation.weights().clone(),
    dates: returns.dates().to_vec(),
    period_returns,
    cumulative_returns,
    total_return,
    max_drawdown,
    win_rate,
    summary: None,
  })
}

/// [`backtest`] plus annualized summary statistics. Needs at least two
/// periods.
pub fn backtest_with(
  allocation: &Allocation,
  returns: &ReturnSeries,
  settings: &BacktestSettings,
) -> Result<BacktestResult> {
  let mut result = backtest(allocation, returns)?;
  let r = result.period_returns.to_vec();
  let p = settings.periods_per_year;
  result.summary = Some(BacktestSummary {
    annualized_return: annualized_return(&r, p)?,
    annualized_volatility: annualized_volatility(&r, p)?,
    sharpe: sharpe_ratio(&r, settings.risk_free_rate, p)?,
    sortino: sortino_ratio(&r, settings.risk_free_rate, p, settings.minimum_acceptable_return)?,
    value_at_risk: value_at_risk(&r, settings.var_confidence, VarMethod::Historical)?,
  });
  Ok(result)
}

/// Backtest several labelled allocations over the same history.
pub fn compare_allocations(
  allocations: &[(String, Allocation)],
  returns: &ReturnSeries,
  settings: &BacktestSettings,
) -> Result<Vec<(String, BacktestResult)>> {
  allocations
    .iter()
    .map(|(label, allocation)| Ok((label.clone(), backtest_with(allocation, returns, settings)?)))
    .collect()
}
