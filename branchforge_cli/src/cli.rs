use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use branchforge_rs::config::{ComparatorChoice, JobConfig, SplitStrategy};
use branchforge_rs::indicator::IndicatorFamily;

#[derive(Parser, Debug)]
#[command(name = "branchforge", about = "Systematic strategy discovery engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a branch-generation job over a ticker universe
    Run(RunArgs),
    /// Size a job without running it: report the closed-form branch count
    Plan(RunArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ComparatorValue {
    Lt,
    Gt,
    Both,
}

impl From<ComparatorValue> for ComparatorChoice {
    fn from(value: ComparatorValue) -> Self {
        match value {
            ComparatorValue::Lt => ComparatorChoice::Lt,
            ComparatorValue::Gt => ComparatorChoice::Gt,
            ComparatorValue::Both => ComparatorChoice::Both,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SplitValue {
    EvenOddMonth,
    EvenOddYear,
    Chronological,
}

impl From<SplitValue> for SplitStrategy {
    fn from(value: SplitValue) -> Self {
        match value {
            SplitValue::EvenOddMonth => SplitStrategy::EvenOddMonth,
            SplitValue::EvenOddYear => SplitStrategy::EvenOddYear,
            SplitValue::Chronological => SplitStrategy::Chronological,
        }
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON job configuration. When set, the search-space flags
    /// below are ignored.
    #[arg(long = "config", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config_path: Option<PathBuf>,

    /// Directory holding one <TICKER>.csv per ticker
    #[arg(long = "data-dir", value_hint = clap::ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// Indicator family (e.g. RSI, SMA, "Current Price")
    #[arg(long)]
    pub indicator: Option<String>,

    /// Smallest look-back window
    #[arg(long = "period-min", default_value_t = 1)]
    pub period_min: u32,

    /// Largest look-back window
    #[arg(long = "period-max", default_value_t = 1)]
    pub period_max: u32,

    /// Comma-separated ticker symbols
    #[arg(long, value_delimiter = ',')]
    pub tickers: Vec<String>,

    /// Comparator expansion (lt/gt/both)
    #[arg(long, value_enum, default_value = "both")]
    pub comparator: ComparatorValue,

    #[arg(long = "threshold-min")]
    pub threshold_min: Option<f64>,

    #[arg(long = "threshold-max")]
    pub threshold_max: Option<f64>,

    #[arg(long = "threshold-step", default_value_t = 1.0)]
    pub threshold_step: f64,

    /// Minimum in-sample time-in-market percentage
    #[arg(long = "min-tim", default_value_t = 0.0)]
    pub min_tim: f64,

    /// Minimum in-sample TIMAR
    #[arg(long = "min-timar", default_value_t = 0.0)]
    pub min_timar: f64,

    /// Maximum tolerated in-sample |max drawdown| percentage
    #[arg(long = "max-dd", default_value_t = 100.0)]
    pub max_dd: f64,

    /// Minimum in-sample trade count
    #[arg(long = "min-trades", default_value_t = 0)]
    pub min_trades: u32,

    /// Minimum in-sample TIMAR / |MaxDD|
    #[arg(long = "min-timar-dd", default_value_t = 0.0)]
    pub min_timar_dd: f64,

    /// In-sample / out-of-sample split policy
    #[arg(long = "split", value_enum, default_value = "even-odd-month")]
    pub split: SplitValue,

    /// First out-of-sample date (chronological split only)
    #[arg(long = "oos-start")]
    pub oos_start: Option<NaiveDate>,

    /// Worker threads; capped at the ticker count
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Flat per-entry transaction cost in basis points
    #[arg(long = "cost-bps", default_value_t = 0.0)]
    pub cost_bps: f64,

    /// Output directory for result parts and the DuckDB catalog
    #[arg(long = "output-dir", value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// Append logs to this file in addition to stdout
    #[arg(long = "log-file", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,

    /// Rows reported from the cumulative surface after the run
    #[arg(long = "top", default_value_t = 5)]
    pub report_top: usize,
}

impl RunArgs {
    /// Resolve the typed job configuration, either from the JSON file or
    /// from the individual flags.
    pub fn job_config(&self) -> Result<JobConfig> {
        if let Some(path) = &self.config_path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            return JobConfig::from_json(&raw);
        }

        let data_dir = self
            .data_dir
            .clone()
            .ok_or_else(|| anyhow!("--data-dir is required without --config"))?;
        let indicator: IndicatorFamily = self
            .indicator
            .as_deref()
            .ok_or_else(|| anyhow!("--indicator is required without --config"))?
            .parse()?;
        let threshold_min = self
            .threshold_min
            .ok_or_else(|| anyhow!("--threshold-min is required without --config"))?;
        let threshold_max = self
            .threshold_max
            .ok_or_else(|| anyhow!("--threshold-max is required without --config"))?;
        if self.tickers.is_empty() {
            return Err(anyhow!("--tickers is required without --config"));
        }

        let config = JobConfig {
            data_dir,
            indicator,
            period_min: self.period_min,
            period_max: self.period_max,
            tickers: self.tickers.clone(),
            comparator: self.comparator.into(),
            threshold_min,
            threshold_max,
            threshold_step: self.threshold_step,
            min_tim: self.min_tim,
            min_timar: self.min_timar,
            max_dd: self.max_dd,
            min_trades: self.min_trades,
            min_timar_dd: self.min_timar_dd,
            split_strategy: self.split.into(),
            oos_start_date: self.oos_start,
            num_workers: self.workers.unwrap_or_else(default_workers),
            cost_bps: self.cost_bps,
            l2: None,
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
