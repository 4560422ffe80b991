use anyhow::Context;
use anyhow::Result;
use chrono::NaiveDate;
use mpt_rs::AnalysisConfig;
use mpt_rs::PortfolioEngine;
use mpt_rs::portfolio::Allocation;
use mpt_rs::portfolio::PriceTable;
use ndarray::Array2;
use prettytable::Table;
use prettytable::row;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TICKERS: [&str; 5] = ["BOND", "UTIL", "CONS", "TECH", "EMRG"];
const DRIFT: [f64; 5] = [0.03, 0.06, 0.08, 0.14, 0.12];
const VOL: [f64; 5] = [0.05, 0.14, 0.18, 0.30, 0.32];
const BETA: [f64; 5] = [0.05, 0.45, 0.6, 0.8, 0.7];

/// Daily GBM prices driven by one market factor plus idiosyncratic noise.
fn simulate_prices(days: usize, seed: u64) -> Result<PriceTable> {
  let dt = 1.0 / 252.0;
  let mut rng = StdRng::seed_from_u64(seed);
  let mut level = [100.0; 5];
  let mut prices = Array2::zeros((days, TICKERS.len()));

  for t in 0..days {
    let market: f64 = rng.sample(StandardNormal);
    for i in 0..TICKERS.len() {
      let own: f64 = rng.sample(StandardNormal);
      let z = BETA[i] * market + (1.0 - BETA[i] * BETA[i]).sqrt() * own;
      level[i] *= ((DRIFT[i] - 0.5 * VOL[i] * VOL[i]) * dt + VOL[i] * dt.sqrt() * z).exp();
      prices[[t, i]] = level[i];
    }
  }

  let start = NaiveDate::from_ymd_opt(2021, 1, 4).context("invalid start date")?;
  let dates = start.iter_days().take(days).collect();
  let tickers = TICKERS.iter().map(|t| t.to_string()).collect();
  Ok(PriceTable::new(dates, tickers, prices)?)
}

fn weights_table(rows: &[(&str, &Allocation)]) -> Table {
  let mut table = Table::new();
  let mut titles = row!["Ticker"];
  for (label, _) in rows {
    titles.add_cell(prettytable::Cell::new(label));
  }
  table.set_titles(titles);

  if let Some((_, first)) = rows.first() {
    for (ticker, _) in first.iter() {
      let mut r = row![ticker];
      for (_, alloc) in rows {
        let w = alloc.weight(ticker).unwrap_or(f64::NAN);
        r.add_cell(prettytable::Cell::new(&format!("{w:.4}")));
      }
      table.add_row(r);
    }
  }
  table
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let prices = simulate_prices(756, 42)?;
  let config = AnalysisConfig {
    risk_free_rate: 0.03,
    num_frontier_points: 20,
    num_monte_carlo_samples: 20_000,
    random_seed: Some(42),
    ..Default::default()
  };
  let engine = PortfolioEngine::from_prices(&prices, config).context("building analysis session")?;
  info!(
    assets = engine.tickers().len(),
    days = prices.n_periods(),
    "session ready"
  );

  let stats = engine.statistics();
  let mut table = Table::new();
  table.set_titles(row!["Ticker", "Return", "Volatility"]);
  for (i, ticker) in stats.tickers().iter().enumerate() {
    table.add_row(row![
      ticker,
      format!("{:.4}", stats.mu()[i]),
      format!("{:.4}", stats.volatilities()[i])
    ]);
  }
  table.printstd();

  let corr = stats.correlation();
  let mut table = Table::new();
  let mut titles = row![""];
  for ticker in stats.tickers() {
    titles.add_cell(prettytable::Cell::new(ticker));
  }
  table.set_titles(titles);
  for (i, ticker) in stats.tickers().iter().enumerate() {
    let mut r = row![ticker];
    for j in 0..stats.n_assets() {
      r.add_cell(prettytable::Cell::new(&format!("{:+.2}", corr[[i, j]])));
    }
    table.add_row(r);
  }
  table.printstd();

  let equal = Allocation::equal_weight(engine.tickers().to_vec())?;
  let gmv = engine.min_volatility().context("minimum volatility")?;
  let tangency = engine.max_sharpe().context("maximum sharpe")?;
  weights_table(&[("Equal", &equal), ("Min vol", &gmv), ("Max Sharpe", &tangency)]).printstd();

  let frontier = engine.frontier().context("efficient frontier")?;
  let mut table = Table::new();
  table.set_titles(row!["Target", "Volatility", "Sharpe"]);
  for p in &frontier.points {
    table.add_row(row![
      format!("{:.4}", p.target_return),
      format!("{:.4}", p.volatility),
      format!("{:.3}", p.sharpe.as_f64())
    ]);
  }
  table.printstd();

  let mc = engine.monte_carlo().context("monte carlo frontier")?;
  info!(
    samples = mc.samples.len(),
    seed = mc.seed,
    best_sharpe = mc.best_sharpe.sharpe.as_f64(),
    lowest_volatility = mc.lowest_volatility.volatility,
    "monte carlo cross-check"
  );

  let rows = engine.compare(&[
    ("Equal".into(), equal),
    ("Min vol".into(), gmv),
    ("Max Sharpe".into(), tangency),
  ])?;
  let mut table = Table::new();
  table.set_titles(row!["Portfolio", "Total", "Max DD", "Win rate", "Sharpe", "Sortino", "VaR 95%"]);
  for (label, result) in &rows {
    let summary = result.summary.as_ref().context("missing backtest summary")?;
    table.add_row(row![
      label,
      format!("{:.4}", result.total_return),
      format!("{:.4}", result.max_drawdown),
      format!("{:.3}", result.win_rate),
      format!("{:.3}", summary.sharpe.as_f64()),
      format!("{:.3}", summary.sortino.as_f64()),
      format!("{:.4}", summary.value_at_risk.value)
    ]);
  }
  table.printstd();

  Ok(())
}
