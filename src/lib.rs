//! # mpt-rs
//!
//! $$
//! \max_{\mathbf w}\ \frac{\mathbf w^\top\boldsymbol\mu-r_f}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf w=1,\ \boldsymbol\ell\le\mathbf w\le\mathbf u
//! $$
//!
//! Modern Portfolio Theory on historical prices: return statistics,
//! constrained mean-variance optimization, analytic and Monte Carlo
//! efficient frontiers, risk metrics and fixed-weight backtests.

pub mod config;
pub mod error;
pub mod portfolio;

pub use config::AnalysisConfig;
pub use config::BoundsSpec;
pub use config::SolverConfig;
pub use error::PortfolioError;
pub use error::Result;
pub use portfolio::PortfolioEngine;
