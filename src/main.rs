use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use discrete_portfolio::quant::portfolio::report;
use discrete_portfolio::quant::portfolio::DenoiserConfig;
use discrete_portfolio::quant::portfolio::OrchestratorConfig;
use discrete_portfolio::quant::portfolio::PartitionerConfig;
use discrete_portfolio::quant::portfolio::PipelineReport;
use discrete_portfolio::quant::portfolio::PriceTable;
use discrete_portfolio::quant::portfolio::SelectionOrchestrator;
use discrete_portfolio::quant::portfolio::SyntheticUniverse;
use discrete_portfolio::quant::portfolio::TruncationOrder;
use discrete_portfolio::quant::portfolio::TRADING_DAYS;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Truncation {
  ClusterOrder,
  BySharpe,
}

impl From<Truncation> for TruncationOrder {
  fn from(t: Truncation) -> Self {
    match t {
      Truncation::ClusterOrder => TruncationOrder::ClusterOrder,
      Truncation::BySharpe => TruncationOrder::BySharpe,
    }
  }
}

#[derive(Parser, Debug)]
#[command(
  author,
  version,
  about = "Discrete portfolio selection: global MILP against per-cluster pipeline",
  after_help = "EXAMPLES:
    # Synthetic universe of 4 groups x 3 assets
    discrete-portfolio --clusters 4 --min-per-cluster 3

    # Price table with a date column followed by one column per ticker
    discrete-portfolio --prices prices.csv --clusters 5 --output-dir out"
)]
struct Args {
  /// CSV price table (`date,TICKER1,TICKER2,...`); a synthetic universe is used when omitted
  #[arg(long)]
  prices: Option<PathBuf>,

  /// Exclude assets with fewer valid prices than this
  #[arg(long, default_value_t = 252)]
  min_history: usize,

  /// Number of clusters k
  #[arg(long, default_value_t = 4)]
  clusters: usize,

  /// Assets selected from every cluster
  #[arg(long, default_value_t = 3)]
  min_per_cluster: usize,

  /// Risk aversion q
  #[arg(long, default_value_t = 0.5)]
  risk_aversion: f64,

  /// Multiplier on q inside per-cluster sub-problems
  #[arg(long, default_value_t = 0.8)]
  risk_discount: f64,

  /// Which picks survive when the pipeline union is too large
  #[arg(long, value_enum, default_value_t = Truncation::ClusterOrder)]
  truncation: Truncation,

  #[arg(long, default_value_t = TRADING_DAYS)]
  periods_per_year: f64,

  #[arg(long, default_value_t = 0.0)]
  risk_free: f64,

  /// Wall-clock limit of each MILP solve, in seconds
  #[arg(long, default_value_t = 60.0)]
  time_limit_secs: f64,

  /// Solve clusters in parallel
  #[arg(long)]
  parallel: bool,

  /// Seed for clustering and the synthetic universe
  #[arg(long, default_value_t = 42)]
  seed: u64,

  /// Synthetic universe: number of factor groups
  #[arg(long, default_value_t = 4)]
  groups: usize,

  /// Synthetic universe: assets per group
  #[arg(long, default_value_t = 3)]
  assets_per_group: usize,

  /// Synthetic universe: prices per asset
  #[arg(long, default_value_t = 504)]
  periods: usize,

  /// Write metrics.csv, comparison.csv and tickers.csv here
  #[arg(long)]
  output_dir: Option<PathBuf>,
}

fn load_prices(args: &Args) -> anyhow::Result<PriceTable> {
  match &args.prices {
    Some(path) => {
      let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
      let table = PriceTable::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
      Ok(table.filter_min_history(args.min_history))
    }
    None => {
      let mut universe = SyntheticUniverse::default();
      universe.groups = args.groups;
      universe.assets_per_group = args.assets_per_group;
      universe.periods = args.periods;
      universe.seed = args.seed;
      info!(?universe, "generating synthetic universe");
      Ok(universe.prices()?)
    }
  }
}

fn write_outputs(dir: &Path, run: &PipelineReport, risk_free: f64) -> anyhow::Result<()> {
  fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

  let metrics = report::metrics_table(&run.statistics.asset_metrics(risk_free));
  let comparison = report::comparison_table(&run.comparison);
  let tickers = report::tickers_table(&run.global_tickers(), &run.pipeline_tickers());

  for (name, table) in [
    ("metrics.csv", &metrics),
    ("comparison.csv", &comparison),
    ("tickers.csv", &tickers),
  ] {
    let path = dir.join(name);
    fs::write(&path, report::to_csv_string(table)?)
      .with_context(|| format!("writing {}", path.display()))?;
  }
  info!(dir = %dir.display(), "wrote csv outputs");
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("discrete_portfolio=info"));
  tracing_subscriber::fmt().with_env_filter(env_filter).init();
  let args = Args::parse();

  let time_limit = Duration::try_from_secs_f64(args.time_limit_secs)
    .context("time limit must be a non-negative number of seconds")?;

  let config = OrchestratorConfig {
    risk_aversion: args.risk_aversion,
    min_per_cluster: args.min_per_cluster,
    pipeline_risk_discount: args.risk_discount,
    truncation: args.truncation.into(),
    time_limit,
    parallel: args.parallel,
    periods_per_year: args.periods_per_year,
    risk_free: args.risk_free,
    denoiser: DenoiserConfig::default(),
    partitioner: PartitionerConfig {
      n_clusters: args.clusters,
      min_size: args.min_per_cluster,
      seed: args.seed,
      ..Default::default()
    },
  };

  let prices = load_prices(&args)?;
  let returns = prices.to_returns().context("converting prices to returns")?;
  let run = SelectionOrchestrator::new(config)
    .run(&returns)
    .context("running selection pipeline")?;

  println!("{}", report::render(&run, args.risk_free));

  if let Some(dir) = &args.output_dir {
    write_outputs(dir, &run, args.risk_free)?;
  }
  Ok(())
}
