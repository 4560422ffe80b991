//! # Portfolio Engine
//!
//! $$
//! \text{prices}\ \to\ (\boldsymbol\mu,\Sigma)\ \to\ \mathbf w^\*\ \to\ \text{backtest}
//! $$
//!
//! One analysis session: configuration plus the statistics derived from a
//! single price table or return history. Every operation reads the session;
//! nothing is cached globally.

use tracing::debug;

use super::backtest::BacktestResult;
use super::backtest::BacktestSettings;
use super::backtest::backtest_with;
use super::backtest::compare_allocations;
use super::data::MarketStatistics;
use super::data::PriceTable;
use super::data::ReturnSeries;
use super::data::compute_returns;
use super::data::compute_statistics;
use super::frontier::EfficientFrontier;
use super::frontier::FrontierReport;
use super::frontier::FrontierSettings;
use super::frontier::MonteCarloFrontier;
use super::frontier::MonteCarloSettings;
use super::frontier::efficient_frontier;
use super::frontier::frontier_report;
use super::frontier::monte_carlo_frontier;
use super::metrics::ValueAtRisk;
use super::metrics::VarMethod;
use super::metrics::conditional_value_at_risk;
use super::metrics::portfolio_performance;
use super::metrics::portfolio_returns;
use super::metrics::value_at_risk;
use super::optimizers;
use super::types::Allocation;
use super::types::Bounds;
use super::types::Objective;
use super::types::PortfolioPerformance;
use crate::config::AnalysisConfig;
use crate::error::PortfolioError;
use crate::error::Result;

/// Analysis session over one asset universe.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  config: AnalysisConfig,
  bounds: Bounds,
  returns: Option<ReturnSeries>,
  stats: MarketStatistics,
}

impl PortfolioEngine {
  /// Derive returns and statistics from a gap-free price table.
  pub fn from_prices(prices: &PriceTable, config: AnalysisConfig) -> Result<Self> {
    config.validate()?;
    let returns = compute_returns(prices, config.return_method)?;
    Self::from_returns(returns, config)
  }

  /// Session over an existing periodic return history.
  pub fn from_returns(returns: ReturnSeries, config: AnalysisConfig) -> Result<Self> {
    config.validate()?;
    let stats = compute_statistics(&returns, config.periods_per_year)?;
    let bounds = config.bounds.resolve(stats.n_assets())?;
    debug!(
      assets = stats.n_assets(),
      periods = returns.n_periods(),
      "portfolio engine initialized"
    );
    Ok(Self {
      config,
      bounds,
      returns: Some(returns),
      stats,
    })
  }

  /// Session over externally estimated `(mu, cov)`. Backtests are not
  /// available without a return history.
  pub fn from_statistics(stats: MarketStatistics, config: AnalysisConfig) -> Result<Self> {
    config.validate()?;
    let bounds = config.bounds.resolve(stats.n_assets())?;
    Ok(Self {
      config,
      bounds,
      returns: None,
      stats,
    })
  }

  /// Borrow the session configuration.
  pub fn config(&self) -> &AnalysisConfig {
    &self.config
  }

  /// Annualized `(mu, cov)` the optimizers run on.
  pub fn statistics(&self) -> &MarketStatistics {
    &self.stats
  }

  /// Periodic return history, absent for sessions built from statistics.
  pub fn returns(&self) -> Option<&ReturnSeries> {
    self.returns.as_ref()
  }

  /// Box constraints resolved against the asset count.
  pub fn bounds(&self) -> &Bounds {
    &self.bounds
  }

  /// Asset labels in column order.
  pub fn tickers(&self) -> &[String] {
    self.stats.tickers()
  }

  fn history(&self) -> Result<&ReturnSeries> {
    self
      .returns
      .as_ref()
      .ok_or_else(|| PortfolioError::invalid("session has no return history"))
  }

  fn frontier_settings(&self) -> FrontierSettings {
    FrontierSettings {
      num_points: self.config.num_frontier_points,
      risk_free_rate: self.config.risk_free_rate,
      solver: self.config.solver.clone(),
    }
  }

  fn monte_carlo_settings(&self) -> MonteCarloSettings {
    MonteCarloSettings {
      num_samples: self.config.num_monte_carlo_samples,
      risk_free_rate: self.config.risk_free_rate,
      random_seed: self.config.random_seed,
      ..Default::default()
    }
  }

  fn backtest_settings(&self) -> BacktestSettings {
    BacktestSettings {
      risk_free_rate: self.config.risk_free_rate,
      periods_per_year: self.config.periods(),
      minimum_acceptable_return: self.config.minimum_acceptable_return,
      ..Default::default()
    }
  }

  /// Global minimum-variance portfolio.
  pub fn min_volatility(&self) -> Result<Allocation> {
    optimizers::minimize_volatility(&self.stats, &self.bounds, &self.config.solver)
  }

  /// Tangency portfolio at the configured risk-free rate.
  pub fn max_sharpe(&self) -> Result<Allocation> {
    optimizers::maximize_sharpe(
      &self.stats,
      self.config.risk_free_rate,
      &self.bounds,
      &self.config.solver,
    )
  }

  /// Minimum-variance portfolio earning `target_return`.
  pub fn efficient_return(&self, target_return: f64) -> Result<Allocation> {
    optimizers::efficient_return(&self.stats, target_return, &self.bounds, &self.config.solver)
  }

  /// Solve `objective` under the session bounds.
  pub fn optimize(&self, objective: Objective) -> Result<Allocation> {
    optimizers::optimize(objective, &self.stats, &self.bounds, &self.config.solver)
  }

  /// Lowest and highest expected return the bounds allow.
  pub fn feasible_return_range(&self) -> Result<(f64, f64)> {
    optimizers::feasible_return_range(&self.stats, &self.bounds)
  }

  /// Model return, volatility and Sharpe of `allocation`.
  pub fn performance(&self, allocation: &Allocation) -> Result<PortfolioPerformance> {
    self.check_assets(allocation)?;
    portfolio_performance(
      allocation.weights(),
      self.stats.mu(),
      self.stats.cov(),
      self.config.risk_free_rate,
    )
  }

  /// Analytic frontier over the configured number of target returns.
  pub fn frontier(&self) -> Result<EfficientFrontier> {
    efficient_frontier(&self.stats, &self.bounds, &self.frontier_settings())
  }

  /// Random portfolio cloud with its empirical upper boundary.
  pub fn monte_carlo(&self) -> Result<MonteCarloFrontier> {
    monte_carlo_frontier(&self.stats, &self.bounds, &self.monte_carlo_settings())
  }

  /// Both anchor portfolios plus the frontier, optionally with the
  /// Monte Carlo cloud.
  pub fn report(&self, with_monte_carlo: bool) -> Result<FrontierReport> {
    let mc = with_monte_carlo.then(|| self.monte_carlo_settings());
    frontier_report(&self.stats, &self.bounds, &self.frontier_settings(), mc.as_ref())
  }

  /// Fixed-weight backtest over the session history with summary statistics.
  pub fn backtest(&self, allocation: &Allocation) -> Result<BacktestResult> {
    backtest_with(allocation, self.history()?, &self.backtest_settings())
  }

  /// Backtest labelled allocations side by side.
  pub fn compare(&self, allocations: &[(String, Allocation)]) -> Result<Vec<(String, BacktestResult)>> {
    compare_allocations(allocations, self.history()?, &self.backtest_settings())
  }

  /// One-period VaR of `allocation` over the session history.
  pub fn value_at_risk(&self, allocation: &Allocation, confidence: f64, method: VarMethod) -> Result<ValueAtRisk> {
    let r = self.allocation_returns(allocation)?;
    value_at_risk(&r, confidence, method)
  }

  /// Historical expected shortfall of `allocation` at `confidence`.
  pub fn expected_shortfall(&self, allocation: &Allocation, confidence: f64) -> Result<f64> {
    let r = self.allocation_returns(allocation)?;
    conditional_value_at_risk(&r, confidence)
  }

  fn allocation_returns(&self, allocation: &Allocation) -> Result<Vec<f64>> {
    self.check_assets(allocation)?;
    Ok(portfolio_returns(allocation.weights(), self.history()?.values())?.to_vec())
  }

  fn check_assets(&self, allocation: &Allocation) -> Result<()> {
    if allocation.tickers() != self.tickers() {
      return Err(PortfolioError::invalid(format!(
        "allocation assets {:?} do not match session assets {:?}",
        allocation.tickers(),
        self.tickers()
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::NaiveDate;
  use ndarray::Array1;
  use ndarray::Array2;
  use ndarray::array;
  use rand::Rng;
  use rand::SeedableRng;
  use rand::rngs::StdRng;
  use rand_distr::StandardNormal;
  use tracing_test::traced_test;

  use super::*;
  use crate::portfolio::metrics::sharpe_ratio;

  fn tickers() -> Vec<String> {
    vec!["LOW".into(), "MID".into(), "HIGH".into()]
  }

  /// Correlated lognormal prices with strong drifts.
  fn prices(days: usize, seed: u64) -> PriceTable {
    let drift = [0.001, 0.0015, 0.002];
    let vol = [0.008, 0.01, 0.012];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Array2::zeros((days, 3));
    let mut level = [100.0, 50.0, 20.0];
    for t in 0..days {
      let market: f64 = rng.sample(StandardNormal);
      for i in 0..3 {
        let own: f64 = rng.sample(StandardNormal);
        let shock = 0.5 * market + 0.866 * own;
        level[i] *= (drift[i] + vol[i] * shock).exp();
        values[[t, i]] = level[i];
      }
    }
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    PriceTable::new(start.iter_days().take(days).collect(), tickers(), values).unwrap()
  }

  fn engine() -> PortfolioEngine {
    PortfolioEngine::from_prices(
      &prices(500, 7),
      AnalysisConfig {
        risk_free_rate: 0.02,
        num_frontier_points: 15,
        num_monte_carlo_samples: 2000,
        random_seed: Some(99),
        ..Default::default()
      },
    )
    .unwrap()
  }

  #[test]
  fn optimizers_rank_as_expected() {
    let engine = engine();
    let equal = Allocation::equal_weight(tickers()).unwrap();
    let gmv = engine.min_volatility().unwrap();
    let tangency = engine.max_sharpe().unwrap();

    let perf_equal = engine.performance(&equal).unwrap();
    let perf_gmv = engine.performance(&gmv).unwrap();
    let perf_tan = engine.performance(&tangency).unwrap();
    assert!(perf_gmv.volatility <= perf_equal.volatility + 1e-9);
    assert!(perf_tan.sharpe.as_f64() >= perf_gmv.sharpe.as_f64() - 1e-7);
    assert!(perf_tan.sharpe.as_f64() >= perf_equal.sharpe.as_f64() - 1e-7);
    for w in [&gmv, &tangency] {
      assert!(engine.bounds().admits(w.weights(), 1e-6));
    }
  }

  #[test]
  fn model_sharpe_matches_realized_sharpe() {
    let engine = engine();
    let alloc = Allocation::new(tickers(), array![0.2, 0.3, 0.5]).unwrap();
    let model = engine.performance(&alloc).unwrap().sharpe.as_f64();

    let realized = portfolio_returns(alloc.weights(), engine.returns().unwrap().values()).unwrap();
    let expected = sharpe_ratio(&realized.to_vec(), 0.02, 252.0).unwrap().as_f64();
    assert_abs_diff_eq!(model, expected, epsilon = 1e-10);
  }

  #[test]
  fn backtest_and_risk_use_session_history() {
    let engine = engine();
    let alloc = engine.min_volatility().unwrap();
    let result = engine.backtest(&alloc).unwrap();
    assert_eq!(result.period_returns.len(), 499);
    assert!(result.summary.is_some());
    assert!(result.max_drawdown <= 0.0);

    let var = engine.value_at_risk(&alloc, 0.95, VarMethod::Historical).unwrap();
    let es = engine.expected_shortfall(&alloc, 0.95).unwrap();
    assert!(es >= var.value);

    let rows = engine
      .compare(&[
        ("gmv".into(), alloc),
        ("equal".into(), Allocation::equal_weight(tickers()).unwrap()),
      ])
      .unwrap();
    assert_eq!(rows.len(), 2);
  }

  #[test]
  #[traced_test]
  fn frontier_sweep_is_logged() {
    let engine = engine();
    let frontier = engine.frontier().unwrap();
    assert!(!frontier.is_empty());
    assert!(logs_contain("efficient frontier built"));
  }

  #[test]
  fn monte_carlo_uses_configured_seed() {
    let engine = engine();
    let a = engine.monte_carlo().unwrap();
    let b = engine.monte_carlo().unwrap();
    assert_eq!(a.seed, 99);
    assert_eq!(a.samples, b.samples);

    let report = engine.report(true).unwrap();
    assert_eq!(report.monte_carlo.unwrap().samples, a.samples);
  }

  #[test]
  fn invalid_sessions_are_rejected() {
    let mut table = prices(10, 1);
    let short = PriceTable::new(
      table.dates()[..1].to_vec(),
      tickers(),
      table.prices().slice(ndarray::s![..1, ..]).to_owned(),
    )
    .unwrap();
    assert!(matches!(
      PortfolioEngine::from_prices(&short, AnalysisConfig::default()),
      Err(PortfolioError::InsufficientData { .. })
    ));

    let mut gappy = table.prices().clone();
    gappy[[3, 1]] = f64::NAN;
    table = PriceTable::new(table.dates().to_vec(), tickers(), gappy).unwrap();
    assert!(matches!(
      PortfolioEngine::from_prices(&table, AnalysisConfig::default()),
      Err(PortfolioError::InvalidInput(_))
    ));

    let bad = AnalysisConfig {
      periods_per_year: 0,
      ..Default::default()
    };
    assert!(PortfolioEngine::from_prices(&prices(10, 1), bad).is_err());
  }

  #[test]
  fn statistics_session_has_no_history() {
    let stats = MarketStatistics::new(
      tickers(),
      array![0.08, 0.10, 0.12],
      array![[0.04, 0.0, 0.0], [0.0, 0.09, 0.0], [0.0, 0.0, 0.16]],
      252,
    )
    .unwrap();
    let engine = PortfolioEngine::from_statistics(stats, AnalysisConfig::default()).unwrap();
    let alloc = engine.min_volatility().unwrap();
    assert!(matches!(engine.backtest(&alloc), Err(PortfolioError::InvalidInput(_))));
    assert_eq!(engine.feasible_return_range().unwrap(), (0.08, 0.12));
  }

  #[test]
  fn public_aggregates_serialize() {
    let config = AnalysisConfig {
      random_seed: Some(5),
      ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    let back: AnalysisConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.random_seed, Some(5));
    assert_eq!(back.bounds, config.bounds);

    let alloc = Allocation::new(tickers(), array![0.25, 0.25, 0.5]).unwrap();
    let json = serde_json::to_string(&alloc).unwrap();
    assert_eq!(serde_json::from_str::<Allocation>(&json).unwrap(), alloc);

    let frontier = engine().frontier().unwrap();
    let back: EfficientFrontier = serde_json::from_str(&serde_json::to_string(&frontier).unwrap()).unwrap();
    assert_eq!(back.len(), frontier.len());
    let vols = |f: &EfficientFrontier| Array1::from_iter(f.points.iter().map(|p| p.volatility));
    assert_abs_diff_eq!(vols(&back), vols(&frontier), epsilon = 1e-12);
  }
}
