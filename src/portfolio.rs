//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Mean-variance optimization, efficient frontiers, risk metrics and
//! backtesting over historical returns.

pub mod backtest;
pub mod data;
pub mod engine;
pub mod frontier;
pub mod metrics;
pub mod optimizers;
pub(crate) mod quadratic;
pub(crate) mod sqp;
pub mod types;

pub use backtest::BacktestResult;
pub use backtest::BacktestSettings;
pub use backtest::BacktestSummary;
pub use backtest::backtest;
pub use backtest::backtest_with;
pub use backtest::compare_allocations;
pub use data::MarketStatistics;
pub use data::MissingPolicy;
pub use data::PriceTable;
pub use data::ReturnMethod;
pub use data::ReturnSeries;
pub use data::compute_returns;
pub use data::compute_statistics;
pub use data::correlation_matrix;
pub use data::validate_covariance;
pub use engine::PortfolioEngine;
pub use frontier::BoundaryPoint;
pub use frontier::EfficientFrontier;
pub use frontier::FrontierReport;
pub use frontier::FrontierSettings;
pub use frontier::MonteCarloFrontier;
pub use frontier::MonteCarloSettings;
pub use frontier::PortfolioSample;
pub use frontier::efficient_frontier;
pub use frontier::frontier_report;
pub use frontier::monte_carlo_frontier;
pub use metrics::ValueAtRisk;
pub use metrics::VarMethod;
pub use metrics::annualized_return;
pub use metrics::annualized_volatility;
pub use metrics::conditional_value_at_risk;
pub use metrics::drawdown_series;
pub use metrics::max_drawdown;
pub use metrics::portfolio_performance;
pub use metrics::portfolio_returns;
pub use metrics::sharpe_ratio;
pub use metrics::sortino_ratio;
pub use metrics::value_at_risk;
pub use optimizers::efficient_return;
pub use optimizers::feasible_return_range;
pub use optimizers::maximize_sharpe;
pub use optimizers::minimize_volatility;
pub use optimizers::optimize;
pub use types::Allocation;
pub use types::Bounds;
pub use types::FrontierPoint;
pub use types::MetricValue;
pub use types::Objective;
pub use types::PortfolioPerformance;
