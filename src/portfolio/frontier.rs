//! # Efficient Frontier
//!
//! $$
//! \sigma^\*(R)=\min\{\sqrt{\mathbf w^\top\Sigma\mathbf w}:\ \mathbf w^\top\boldsymbol\mu=R,\ \mathbf 1^\top\mathbf w=1,\ \boldsymbol\ell\le\mathbf w\le\mathbf u\}
//! $$
//!
//! Analytic sweep over target returns from the minimum-variance return to the
//! highest attainable return, and a Monte Carlo approximation from random
//! weight vectors. Sweep points and sample chunks are computed in parallel
//! and reduced afterwards, so results do not depend on the thread count.

use ndarray::Array1;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Exp1;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::data::MarketStatistics;
use super::metrics::portfolio_performance;
use super::optimizers::efficient_return;
use super::optimizers::maximize_sharpe;
use super::optimizers::minimize_volatility;
use super::types::Allocation;
use super::types::Bounds;
use super::types::FrontierPoint;
use super::types::MetricValue;
use crate::config::SolverConfig;
use crate::error::PortfolioError;
use crate::error::Result;

/// Samples drawn from one RNG stream.
const CHUNK_SIZE: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrontierSettings {
  /// Number of target returns in the sweep.
  pub num_points: usize,
  /// Risk-free rate used for the reported Sharpe ratios.
  pub risk_free_rate: f64,
  pub solver: SolverConfig,
}

impl Default for FrontierSettings {
  fn default() -> Self {
    Self {
      num_points: 50,
      risk_free_rate: 0.0,
      solver: SolverConfig::default(),
    }
  }
}

/// Efficient points sorted by ascending target return.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontier {
  pub points: Vec<FrontierPoint>,
  /// Solved points dropped because a higher-return point had lower volatility.
  pub discarded: usize,
}

impl EfficientFrontier {
  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Point with the highest Sharpe ratio on the sweep.
  pub fn best_sharpe(&self) -> Option<&FrontierPoint> {
    self.points.iter().max_by(|a, b| a.sharpe.rank_cmp(&b.sharpe))
  }
}

pub(crate) fn frontier_point(
  stats: &MarketStatistics,
  target_return: f64,
  allocation: Allocation,
  risk_free_rate: f64,
) -> Result<FrontierPoint> {
  let perf = portfolio_performance(allocation.weights(), stats.mu(), stats.cov(), risk_free_rate)?;
  Ok(FrontierPoint {
    target_return,
    expected_return: perf.expected_return,
    volatility: perf.volatility,
    sharpe: perf.sharpe,
    allocation,
  })
}

/// Keep points whose volatility does not exceed that of any later point.
/// Input must be sorted by target return.
fn retain_efficient(points: Vec<FrontierPoint>) -> (Vec<FrontierPoint>, usize) {
  let mut kept = Vec::with_capacity(points.len());
  let mut discarded = 0;
  let mut floor = f64::INFINITY;
  for point in points.into_iter().rev() {
    // Solver noise near the minimum-variance end is not domination.
    let tol = 1e-7 * point.volatility.max(1.0);
    if point.volatility <= floor + tol {
      floor = floor.min(point.volatility);
      kept.push(point);
    } else {
      warn!(
        target = point.target_return,
        volatility = point.volatility,
        "discarding dominated frontier point"
      );
      discarded += 1;
    }
  }
  kept.reverse();
  (kept, discarded)
}

/// Analytic frontier: `num_points` targets evenly spaced from the
/// minimum-variance return to the maximum attainable return. Any failed
/// point aborts the sweep.
pub fn efficient_frontier(
  stats: &MarketStatistics,
  bounds: &Bounds,
  settings: &FrontierSettings,
) -> Result<EfficientFrontier> {
  if settings.num_points == 0 {
    return Err(PortfolioError::invalid("num_points must be > 0"));
  }
  let rf = settings.risk_free_rate;
  let gmv = minimize_volatility(stats, bounds, &settings.solver)?;
  let r_gmv = gmv.weights().dot(stats.mu());
  let (_, r_max) = bounds.return_range(stats.mu());
  let span = r_max - r_gmv;

  if settings.num_points == 1 || span <= 1e-9 * r_max.abs().max(1.0) {
    return Ok(EfficientFrontier {
      points: vec![frontier_point(stats, r_gmv, gmv, rf)?],
      discarded: 0,
    });
  }

  let last = (settings.num_points - 1) as f64;
  let mut points = (0..settings.num_points)
    .into_par_iter()
    .map(|k| {
      let target = if k == 0 {
        r_gmv
      } else {
        (r_gmv + span * k as f64 / last).min(r_max)
      };
      let allocation = efficient_return(stats, target, bounds, &settings.solver)?;
      frontier_point(stats, target, allocation, rf)
    })
    .collect::<Result<Vec<_>>>()?;

  points.sort_by(|a, b| a.target_return.total_cmp(&b.target_return));
  let (points, discarded) = retain_efficient(points);
  debug!(
    points = points.len(),
    discarded,
    r_min = r_gmv,
    r_max,
    "efficient frontier built"
  );
  Ok(EfficientFrontier { points, discarded })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonteCarloSettings {
  pub num_samples: usize,
  pub risk_free_rate: f64,
  /// `None` draws a seed from OS entropy; the seed used is reported.
  pub random_seed: Option<u64>,
  /// Rejection-sampling attempts per sample before giving up.
  pub max_attempts: usize,
  /// Volatility bins used for the upper boundary.
  pub boundary_bins: usize,
}

impl Default for MonteCarloSettings {
  fn default() -> Self {
    Self {
      num_samples: 10_000,
      risk_free_rate: 0.0,
      random_seed: None,
      max_attempts: 1_000,
      boundary_bins: 50,
    }
  }
}

/// One random portfolio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSample {
  pub weights: Array1<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: MetricValue,
}

/// Point of the sampled upper boundary.
/// Vertex of the sampled upper boundary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPoint {
  pub volatility: f64,
  pub expected_return: f64,
}

/// Sampled portfolios under the session bounds with their best and
/// lowest-risk members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloFrontier {
  pub tickers: Vec<String>,
  pub samples: Vec<PortfolioSample>,
  /// Highest sampled return per volatility bin, kept only where it improves
  /// on every lower-volatility bin. Increasing in both coordinates.
  pub upper_boundary: Vec<BoundaryPoint>,
  pub best_sharpe: PortfolioSample,
  pub lowest_volatility: PortfolioSample,
  /// Draws rejected for breaking an upper bound.
  pub rejected: usize,
  /// Seed actually used, drawn from entropy when none was configured.
  pub seed: u64,
}

/// SplitMix64 finalizer; decorrelates the per-chunk seeds.
fn chunk_seed(seed: u64, chunk: u64) -> u64 {
  let mut z = seed.wrapping_add(chunk.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
  z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
  z ^ (z >> 31)
}

/// Dirichlet(1) draw, uniform over the simplex, from normalized `Exp(1)`.
fn simplex_draw(rng: &mut StdRng, n: usize) -> Array1<f64> {
  let e = Array1::from_shape_fn(n, |_| rng.sample::<f64, _>(Exp1));
  let total = e.sum();
  e / total
}

fn sample_chunk(
  stats: &MarketStatistics,
  bounds: &Bounds,
  settings: &MonteCarloSettings,
  seed: u64,
  count: usize,
) -> Result<(Vec<PortfolioSample>, usize)> {
  let n = stats.n_assets();
  let lower = bounds.lower();
  let upper = bounds.upper();
  let slack = 1.0 - lower.sum();
  let mut rng = StdRng::seed_from_u64(seed);
  let mut samples = Vec::with_capacity(count);
  let mut rejected = 0;

  for _ in 0..count {
    let mut accepted = None;
    for _ in 0..settings.max_attempts {
      let w = lower + &(simplex_draw(&mut rng, n) * slack);
      if w.iter().zip(upper.iter()).all(|(x, hi)| x <= hi) {
        accepted = Some(w);
        break;
      }
      rejected += 1;
    }
    let weights = accepted.ok_or_else(|| {
      PortfolioError::infeasible(format!(
        "no draw within the upper bounds after {} attempts",
        settings.max_attempts
      ))
    })?;

    let perf = portfolio_performance(&weights, stats.mu(), stats.cov(), settings.risk_free_rate)?;
    samples.push(PortfolioSample {
      weights,
      expected_return: perf.expected_return,
      volatility: perf.volatility,
      sharpe: perf.sharpe,
    });
  }
  Ok((samples, rejected))
}

fn upper_boundary(samples: &[PortfolioSample], bins: usize) -> Vec<BoundaryPoint> {
  let bins = bins.max(1);
  let (v_min, v_max) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
    (lo.min(s.volatility), hi.max(s.volatility))
  });
  let width = v_max - v_min;

  let mut best: Vec<Option<BoundaryPoint>> = vec![None; bins];
  for s in samples {
    let bin = if width > 0.0 {
      (((s.volatility - v_min) / width * bins as f64) as usize).min(bins - 1)
    } else {
      0
    };
    if best[bin].map_or(true, |b| s.expected_return > b.expected_return) {
      best[bin] = Some(BoundaryPoint {
        volatility: s.volatility,
        expected_return: s.expected_return,
      });
    }
  }

  let mut envelope: Vec<BoundaryPoint> = Vec::new();
  for point in best.into_iter().flatten() {
    if envelope.last().map_or(true, |last| point.expected_return > last.expected_return) {
      envelope.push(point);
    }
  }
  envelope
}

/// Monte Carlo approximation of the frontier from uniformly distributed
/// weight vectors inside the bounds.
pub fn monte_carlo_frontier(
  stats: &MarketStatistics,
  bounds: &Bounds,
  settings: &MonteCarloSettings,
) -> Result<MonteCarloFrontier> {
  if settings.num_samples == 0 {
    return Err(PortfolioError::invalid("num_samples must be > 0"));
  }
  if settings.max_attempts == 0 {
    return Err(PortfolioError::invalid("max_attempts must be > 0"));
  }
  if bounds.len() != stats.n_assets() {
    return Err(PortfolioError::invalid(format!(
      "bounds for {} assets supplied for {} assets",
      bounds.len(),
      stats.n_assets()
    )));
  }

  let seed = settings.random_seed.unwrap_or_else(|| rand::rng().random());
  let n_chunks = settings.num_samples.div_ceil(CHUNK_SIZE);
  let chunks = (0..n_chunks)
    .into_par_iter()
    .map(|c| {
      let count = CHUNK_SIZE.min(settings.num_samples - c * CHUNK_SIZE);
      sample_chunk(stats, bounds, settings, chunk_seed(seed, c as u64), count)
    })
    .collect::<Result<Vec<_>>>()?;

  let mut samples = Vec::with_capacity(settings.num_samples);
  let mut rejected = 0;
  for (chunk, r) in chunks {
    samples.extend(chunk);
    rejected += r;
  }
  if rejected > 0 {
    warn!(
      rejected,
      accepted = samples.len(),
      "monte carlo draws rejected by upper bounds"
    );
  }

  let best_sharpe = samples
    .iter()
    .max_by(|a, b| a.sharpe.rank_cmp(&b.sharpe))
    .cloned()
    .ok_or_else(|| PortfolioError::invalid("no monte carlo samples"))?;
  let lowest_volatility = samples
    .iter()
    .min_by(|a, b| a.volatility.total_cmp(&b.volatility))
    .cloned()
    .ok_or_else(|| PortfolioError::invalid("no monte carlo samples"))?;
  let upper_boundary = upper_boundary(&samples, settings.boundary_bins);
  debug!(
    samples = samples.len(),
    boundary = upper_boundary.len(),
    seed,
    "monte carlo frontier built"
  );

  Ok(MonteCarloFrontier {
    tickers: stats.tickers().to_vec(),
    samples,
    upper_boundary,
    best_sharpe,
    lowest_volatility,
    rejected,
    seed,
  })
}

/// Minimum-volatility and maximum-Sharpe portfolios, the analytic frontier,
/// and optionally a Monte Carlo cross-check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrontierReport {
  pub min_volatility: FrontierPoint,
  pub max_sharpe: FrontierPoint,
  pub frontier: EfficientFrontier,
  pub monte_carlo: Option<MonteCarloFrontier>,
}

pub fn frontier_report(
  stats: &MarketStatistics,
  bounds: &Bounds,
  settings: &FrontierSettings,
  monte_carlo: Option<&MonteCarloSettings>,
) -> Result<FrontierReport> {
  let rf = settings.risk_free_rate;
  let gmv = minimize_volatility(stats, bounds, &settings.solver)?;
  let gmv_return = gmv.weights().dot(stats.mu());
  let tangency = maximize_sharpe(stats, rf, bounds, &settings.solver)?;
  let tangency_return = tangency.weights().dot(stats.mu());

  Ok(FrontierReport {
    min_volatility: frontier_point(stats, gmv_return, gmv, rf)?,
    max_sharpe: frontier_point(stats, tangency_return, tangency, rf)?,
    frontier: efficient_frontier(stats, bounds, settings)?,
    monte_carlo: monte_carlo
      .map(|mc| monte_carlo_frontier(stats, bounds, mc))
      .transpose()?,
  })
}
