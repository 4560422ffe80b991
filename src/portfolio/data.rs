//! # Portfolio Data
//!
//! $$
//! \mu_i = p\,\overline{r_i},\qquad \Sigma = p\,\operatorname{Cov}(r)
//! $$
//!
//! Price tables, periodic returns and the annualized `(mu, cov)` statistics
//! consumed by the optimizer and frontier generator.

use std::collections::BTreeMap;
use std::collections::HashSet;

use chrono::NaiveDate;
use nalgebra::DMatrix;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use ndarray::s;
use ndarray_stats::CorrelationExt;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;

/// Periodic return definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnMethod {
  /// `p_t / p_{t-1} - 1`
  #[default]
  Simple,
  /// `ln(p_t / p_{t-1})`
  Log,
}

/// How gaps (`NaN` cells) are resolved before returns are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingPolicy {
  /// Drop every date on which any asset is missing.
  Drop,
  /// Carry the last observed price forward. Leading gaps are dropped.
  ForwardFill,
}

fn check_tickers(tickers: &[String]) -> Result<()> {
  if tickers.is_empty() {
    return Err(PortfolioError::invalid("at least one asset is required"));
  }
  let mut seen = HashSet::with_capacity(tickers.len());
  for t in tickers {
    if !seen.insert(t.as_str()) {
      return Err(PortfolioError::invalid(format!("duplicate ticker `{t}`")));
    }
  }
  Ok(())
}

fn check_dates(dates: &[NaiveDate], rows: usize) -> Result<()> {
  if dates.len() != rows {
    return Err(PortfolioError::invalid(format!(
      "{} dates for {rows} rows",
      dates.len()
    )));
  }
  if dates.windows(2).any(|w| w[0] >= w[1]) {
    return Err(PortfolioError::invalid("dates must be strictly increasing"));
  }
  Ok(())
}

/// Date-indexed prices, one column per ticker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
  dates: Vec<NaiveDate>,
  tickers: Vec<String>,
  prices: Array2<f64>,
}

impl PriceTable {
  /// Build a table from an already aligned `dates x tickers` matrix. Cells
  /// may be `NaN` (missing) but never zero, negative or infinite.
  pub fn new(dates: Vec<NaiveDate>, tickers: Vec<String>, prices: Array2<f64>) -> Result<Self> {
    check_tickers(&tickers)?;
    if prices.ncols() != tickers.len() {
      return Err(PortfolioError::invalid(format!(
        "{} price columns for {} tickers",
        prices.ncols(),
        tickers.len()
      )));
    }
    check_dates(&dates, prices.nrows())?;
    if let Some(bad) = prices.iter().find(|p| !p.is_nan() && !(p.is_finite() && **p > 0.0)) {
      return Err(PortfolioError::invalid(format!(
        "prices must be positive and finite, found {bad}"
      )));
    }

    Ok(Self {
      dates,
      tickers,
      prices,
    })
  }

  /// Align independently sampled series on the union of their dates. Dates
  /// on which an asset has no observation become `NaN` cells.
  pub fn from_series(series: Vec<(String, Vec<(NaiveDate, f64)>)>) -> Result<Self> {
    let tickers: Vec<String> = series.iter().map(|(t, _)| t.clone()).collect();
    check_tickers(&tickers)?;

    let mut index: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for (_, obs) in &series {
      for (d, _) in obs {
        index.insert(*d, 0);
      }
    }
    for (row, slot) in index.values_mut().enumerate() {
      *slot = row;
    }

    let mut prices = Array2::from_elem((index.len(), tickers.len()), f64::NAN);
    for (col, (ticker, obs)) in series.iter().enumerate() {
      for (d, p) in obs {
        let row = index[d];
        if !prices[[row, col]].is_nan() {
          return Err(PortfolioError::invalid(format!(
            "duplicate observation for `{ticker}` on {d}"
          )));
        }
        prices[[row, col]] = *p;
      }
    }

    Self::new(index.into_keys().collect(), tickers, prices)
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  pub fn prices(&self) -> &Array2<f64> {
    &self.prices
  }

  pub fn n_periods(&self) -> usize {
    self.prices.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.prices.ncols()
  }

  pub fn column(&self, ticker: &str) -> Option<ArrayView1<'_, f64>> {
    self
      .tickers
      .iter()
      .position(|t| t == ticker)
      .map(|i| self.prices.column(i))
  }

  pub fn has_missing(&self) -> bool {
    self.prices.iter().any(|p| p.is_nan())
  }

  /// Return a gap-free copy of the table.
  pub fn resolve_missing(&self, policy: MissingPolicy) -> Result<Self> {
    let mut filled = self.prices.clone();
    if policy == MissingPolicy::ForwardFill {
      for mut col in filled.columns_mut() {
        let mut last = f64::NAN;
        for p in col.iter_mut() {
          if p.is_nan() {
            *p = last;
          } else {
            last = *p;
          }
        }
      }
    }

    let keep: Vec<usize> = (0..filled.nrows())
      .filter(|&r| filled.row(r).iter().all(|p| !p.is_nan()))
      .collect();
    let dates = keep.iter().map(|&r| self.dates[r]).collect();
    let prices = filled.select(Axis(0), &keep);

    Self::new(dates, self.tickers.clone(), prices)
  }
}

/// Periodic returns, one column per ticker, dated by the later observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReturnSeries {
  dates: Vec<NaiveDate>,
  tickers: Vec<String>,
  values: Array2<f64>,
}

impl ReturnSeries {
  pub fn new(dates: Vec<NaiveDate>, tickers: Vec<String>, values: Array2<f64>) -> Result<Self> {
    check_tickers(&tickers)?;
    if values.ncols() != tickers.len() {
      return Err(PortfolioError::invalid(format!(
        "{} return columns for {} tickers",
        values.ncols(),
        tickers.len()
      )));
    }
    check_dates(&dates, values.nrows())?;
    if values.iter().any(|r| !r.is_finite()) {
      return Err(PortfolioError::invalid("returns must be finite"));
    }

    Ok(Self {
      dates,
      tickers,
      values,
    })
  }

  /// Undated returns; rows are indexed by consecutive days from the Unix
  /// epoch. Convenient for synthetic data and tests.
  pub fn from_matrix(tickers: Vec<String>, values: Array2<f64>) -> Result<Self> {
    let start = NaiveDate::default();
    let dates = start.iter_days().take(values.nrows()).collect();
    Self::new(dates, tickers, values)
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// `periods x assets` matrix of returns.
  pub fn values(&self) -> &Array2<f64> {
    &self.values
  }

  pub fn n_periods(&self) -> usize {
    self.values.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.values.ncols()
  }

  pub fn column(&self, ticker: &str) -> Option<ArrayView1<'_, f64>> {
    self
      .tickers
      .iter()
      .position(|t| t == ticker)
      .map(|i| self.values.column(i))
  }
}

/// Convert a price table to periodic returns.
pub fn compute_returns(prices: &PriceTable, method: ReturnMethod) -> Result<ReturnSeries> {
  let n = prices.n_periods();
  if n < 2 {
    return Err(PortfolioError::InsufficientData {
      what: "compute_returns",
      required: 2,
      actual: n,
    });
  }
  if prices.has_missing() {
    return Err(PortfolioError::invalid(
      "price table contains missing values; resolve them before computing returns",
    ));
  }

  let p = prices.prices();
  let ratio = &p.slice(s![1.., ..]) / &p.slice(s![..-1, ..]);
  let values = match method {
    ReturnMethod::Simple => ratio - 1.0,
    ReturnMethod::Log => ratio.mapv(f64::ln),
  };

  ReturnSeries::new(
    prices.dates()[1..].to_vec(),
    prices.tickers().to_vec(),
    values,
  )
}

/// Annualized expected returns and covariance of a set of assets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketStatistics {
  tickers: Vec<String>,
  mu: Array1<f64>,
  cov: Array2<f64>,
  periods_per_year: u32,
}

impl MarketStatistics {
  /// Wrap externally estimated `(mu, cov)`. Shapes, finiteness and symmetry
  /// are checked; positive-semidefiniteness is checked by the optimizers
  /// (see [`validate_covariance`]).
  pub fn new(
    tickers: Vec<String>,
    mu: Array1<f64>,
    cov: Array2<f64>,
    periods_per_year: u32,
  ) -> Result<Self> {
    check_tickers(&tickers)?;
    let n = tickers.len();
    if mu.len() != n || cov.dim() != (n, n) {
      return Err(PortfolioError::invalid(format!(
        "expected mu of length {n} and {n}x{n} covariance, got {} and {:?}",
        mu.len(),
        cov.dim()
      )));
    }
    if mu.iter().chain(cov.iter()).any(|x| !x.is_finite()) {
      return Err(PortfolioError::invalid("mu and cov must be finite"));
    }
    let scale = cov.iter().fold(1.0_f64, |m, x| m.max(x.abs()));
    for i in 0..n {
      for j in (i + 1)..n {
        if (cov[[i, j]] - cov[[j, i]]).abs() > 1e-10 * scale {
          return Err(PortfolioError::invalid(format!(
            "covariance is not symmetric at ({i}, {j})"
          )));
        }
      }
    }

    Ok(Self {
      tickers,
      mu,
      cov,
      periods_per_year,
    })
  }

  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Annualized expected returns.
  pub fn mu(&self) -> &Array1<f64> {
    &self.mu
  }

  /// Annualized covariance.
  pub fn cov(&self) -> &Array2<f64> {
    &self.cov
  }

  pub fn periods_per_year(&self) -> u32 {
    self.periods_per_year
  }

  pub fn n_assets(&self) -> usize {
    self.mu.len()
  }

  /// Annualized per-asset volatilities.
  pub fn volatilities(&self) -> Array1<f64> {
    self.cov.diag().mapv(|v| v.max(0.0).sqrt())
  }

  /// Correlation matrix implied by the annualized covariance.
  pub fn correlation(&self) -> Array2<f64> {
    correlation_matrix(&self.cov)
  }
}

/// Annualized `(mu, cov)` from periodic returns.
pub fn compute_statistics(returns: &ReturnSeries, periods_per_year: u32) -> Result<MarketStatistics> {
  let n = returns.n_periods();
  if n < 2 {
    return Err(PortfolioError::InsufficientData {
      what: "compute_statistics",
      required: 2,
      actual: n,
    });
  }
  if periods_per_year == 0 {
    return Err(PortfolioError::invalid("periods_per_year must be > 0"));
  }

  let p = periods_per_year as f64;
  let values = returns.values();
  let mean = values
    .mean_axis(Axis(0))
    .ok_or_else(|| PortfolioError::invalid("empty return matrix"))?;
  // Rows of `values.t()` are assets, columns are observations.
  let cov = values
    .t()
    .cov(1.0)
    .map_err(|_| PortfolioError::InsufficientData {
      what: "compute_statistics",
      required: 2,
      actual: n,
    })?;

  MarketStatistics::new(returns.tickers().to_vec(), mean * p, cov * p, periods_per_year)
}

/// Pearson correlation matrix implied by a covariance matrix.
pub fn correlation_matrix(cov: &Array2<f64>) -> Array2<f64> {
  let sd = cov.diag().mapv(|v| v.max(0.0).sqrt());
  Array2::from_shape_fn(cov.dim(), |(i, j)| {
    let denom = sd[i] * sd[j];
    if i == j {
      1.0
    } else if denom > 1e-15 {
      (cov[[i, j]] / denom).clamp(-1.0, 1.0)
    } else {
      0.0
    }
  })
}

/// Check that `cov` is usable for variance computation: square, symmetric,
/// non-negative diagonal and strictly positive definite up to a relative
/// eigenvalue tolerance `tol`.
///
/// A negative eigenvalue means `w' cov w` can be negative; a (near-)zero
/// eigenvalue means some combination of assets is riskless, which happens
/// with duplicated or perfectly collinear series. Both are reported as
/// [`PortfolioError::DegenerateCovariance`].
pub fn validate_covariance(cov: &Array2<f64>, tol: f64) -> Result<()> {
  let (n, m) = cov.dim();
  if n == 0 || n != m {
    return Err(PortfolioError::invalid(format!(
      "covariance must be square and non-empty, got {n}x{m}"
    )));
  }
  if let Some(i) = (0..n).find(|&i| cov[[i, i]] < 0.0) {
    return Err(PortfolioError::degenerate(format!(
      "negative variance {} for asset {i}",
      cov[[i, i]]
    )));
  }

  let mat = DMatrix::from_fn(n, n, |i, j| 0.5 * (cov[[i, j]] + cov[[j, i]]));
  let eig = mat.symmetric_eigenvalues();
  let min = eig.min();
  let max = eig.max();
  if max <= 0.0 {
    return Err(PortfolioError::degenerate("covariance matrix is zero"));
  }
  if min < -tol * max {
    return Err(PortfolioError::degenerate(format!(
      "not positive-semidefinite (smallest eigenvalue {min:e}, largest {max:e})"
    )));
  }
  if min <= tol * max {
    return Err(PortfolioError::degenerate(format!(
      "singular (smallest eigenvalue {min:e}, largest {max:e}); assets are duplicated or collinear"
    )));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
  }

  fn table() -> PriceTable {
    PriceTable::new(
      vec![day(1), day(2), day(3), day(4)],
      vec!["AAA".into(), "BBB".into()],
      array![[100.0, 50.0], [110.0, 50.0], [99.0, 55.0], [108.9, 44.0]],
    )
    .unwrap()
  }

  #[test]
  fn simple_and_log_returns() {
    let simple = compute_returns(&table(), ReturnMethod::Simple).unwrap();
    assert_eq!(simple.n_periods(), 3);
    assert_eq!(simple.dates()[0], day(2));
    assert_abs_diff_eq!(
      simple.values().column(0).to_owned(),
      array![0.1, -0.1, 0.1],
      epsilon = 1e-12
    );
    assert_abs_diff_eq!(
      simple.values().column(1).to_owned(),
      array![0.0, 0.1, -0.2],
      epsilon = 1e-12
    );

    let log = compute_returns(&table(), ReturnMethod::Log).unwrap();
    assert_abs_diff_eq!(log.values()[[0, 0]], 1.1_f64.ln(), epsilon = 1e-12);
  }

  #[test]
  fn returns_need_two_prices() {
    let t = PriceTable::new(vec![day(1)], vec!["AAA".into()], array![[100.0]]).unwrap();
    assert!(matches!(
      compute_returns(&t, ReturnMethod::Simple),
      Err(PortfolioError::InsufficientData { required: 2, actual: 1, .. })
    ));
  }

  #[test]
  fn statistics_are_annualized_sample_moments() {
    let r = ReturnSeries::from_matrix(
      vec!["A".into(), "B".into()],
      array![[0.01, 0.02], [0.03, -0.01], [-0.01, 0.00]],
    )
    .unwrap();
    let stats = compute_statistics(&r, 252).unwrap();

    assert_abs_diff_eq!(stats.mu()[0], 0.01 * 252.0, epsilon = 1e-12);
    assert_abs_diff_eq!(stats.mu()[1], (0.01 / 3.0) * 252.0, epsilon = 1e-12);
    // var(A) = ((0)^2 + 0.02^2 + 0.02^2) / 2 = 0.0004
    assert_abs_diff_eq!(stats.cov()[[0, 0]], 0.0004 * 252.0, epsilon = 1e-12);
    assert_abs_diff_eq!(stats.cov()[[0, 1]], stats.cov()[[1, 0]], epsilon = 1e-15);
  }

  #[test]
  fn statistics_need_two_returns() {
    let r = ReturnSeries::from_matrix(vec!["A".into()], array![[0.01]]).unwrap();
    assert!(matches!(
      compute_statistics(&r, 252),
      Err(PortfolioError::InsufficientData { .. })
    ));
  }

  #[test]
  fn missing_prices_are_rejected_until_resolved() {
    let t = PriceTable::from_series(vec![
      ("A".into(), vec![(day(1), 10.0), (day(2), 11.0), (day(3), 12.0)]),
      ("B".into(), vec![(day(1), 20.0), (day(3), 22.0)]),
    ])
    .unwrap();
    assert!(t.has_missing());
    assert!(compute_returns(&t, ReturnMethod::Simple).is_err());

    let dropped = t.resolve_missing(MissingPolicy::Drop).unwrap();
    assert_eq!(dropped.dates(), &[day(1), day(3)]);

    let filled = t.resolve_missing(MissingPolicy::ForwardFill).unwrap();
    assert_eq!(filled.n_periods(), 3);
    assert_eq!(filled.prices()[[1, 1]], 20.0);
  }

  #[test]
  fn rejects_non_positive_prices_and_duplicate_tickers() {
    assert!(PriceTable::new(vec![day(1)], vec!["A".into()], array![[0.0]]).is_err());
    assert!(PriceTable::new(
      vec![day(1)],
      vec!["A".into(), "A".into()],
      array![[1.0, 2.0]]
    )
    .is_err());
  }

  #[test]
  fn identical_assets_make_covariance_degenerate() {
    let r = ReturnSeries::from_matrix(
      vec!["A".into(), "A2".into(), "B".into()],
      array![
        [0.01, 0.01, 0.003],
        [-0.02, -0.02, 0.004],
        [0.015, 0.015, -0.006],
        [0.007, 0.007, 0.001]
      ],
    )
    .unwrap();
    let stats = compute_statistics(&r, 252).unwrap();
    assert!(matches!(
      validate_covariance(stats.cov(), 1e-10),
      Err(PortfolioError::DegenerateCovariance { .. })
    ));
  }

  #[test]
  fn indefinite_covariance_is_degenerate() {
    let cov = array![[0.04, 0.1], [0.1, 0.04]];
    let err = validate_covariance(&cov, 1e-10).unwrap_err();
    assert!(err.to_string().contains("not positive-semidefinite"));
  }

  #[test]
  fn correlation_has_unit_diagonal() {
    let cov = array![[0.04, 0.006], [0.006, 0.09]];
    let corr = correlation_matrix(&cov);
    assert_abs_diff_eq!(corr[[0, 0]], 1.0);
    assert_abs_diff_eq!(corr[[0, 1]], 0.1, epsilon = 1e-12);

    let stats = MarketStatistics::new(vec!["A".into(), "B".into()], array![0.05, 0.07], cov, 252).unwrap();
    assert_abs_diff_eq!(stats.correlation(), corr, epsilon = 1e-15);
  }
}
