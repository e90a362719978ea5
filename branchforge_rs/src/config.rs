use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::indicator::IndicatorFamily;

/// Comparator choice as it appears in job configurations. `Both` expands to
/// `lt` then `gt` during enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComparatorChoice {
    #[serde(rename = "LT")]
    Lt,
    #[serde(rename = "GT")]
    Gt,
    #[serde(rename = "BOTH")]
    Both,
}

impl ComparatorChoice {
    pub fn comparators(self) -> &'static [Comparator] {
        match self {
            ComparatorChoice::Lt => &[Comparator::Lt],
            ComparatorChoice::Gt => &[Comparator::Gt],
            ComparatorChoice::Both => &[Comparator::Lt, Comparator::Gt],
        }
    }
}

/// Concrete comparator attached to a single branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Lt,
    Gt,
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Gt => ">",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Comparator::Lt => "LT",
            Comparator::Gt => "GT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    EvenOddMonth,
    EvenOddYear,
    Chronological,
}

/// Quality bars applied to in-sample metrics. OOS metrics are stored but
/// never filtered on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilterLimits {
    #[serde(rename = "minTIM")]
    pub min_tim: f64,
    #[serde(rename = "minTIMAR")]
    pub min_timar: f64,
    /// Maximum tolerated |max drawdown|, as a positive percentage.
    #[serde(rename = "maxDD")]
    pub max_dd: f64,
    #[serde(rename = "minTrades")]
    pub min_trades: u32,
    #[serde(rename = "minTIMARDD")]
    pub min_timar_dd: f64,
}

/// Optional second condition ANDed into the entry signal before the
/// execution lag. Adds its own axis to the search product.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct L2Config {
    pub indicator: IndicatorFamily,
    #[serde(default = "default_period")]
    pub period_min: u32,
    #[serde(default = "default_period")]
    pub period_max: u32,
    pub comparator: ComparatorChoice,
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub threshold_step: f64,
}

fn default_period() -> u32 {
    1
}

/// Typed job configuration. Unknown fields in external JSON are rejected at
/// this boundary; range inconsistencies are rejected by [`JobConfig::validate`]
/// before the job ever enters `running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobConfig {
    /// Directory holding one `<TICKER>.csv` per ticker.
    pub data_dir: PathBuf,
    pub indicator: IndicatorFamily,
    #[serde(default = "default_period")]
    pub period_min: u32,
    #[serde(default = "default_period")]
    pub period_max: u32,
    pub tickers: Vec<String>,
    pub comparator: ComparatorChoice,
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub threshold_step: f64,
    #[serde(rename = "minTIM")]
    pub min_tim: f64,
    #[serde(rename = "minTIMAR")]
    pub min_timar: f64,
    #[serde(rename = "maxDD")]
    pub max_dd: f64,
    #[serde(rename = "minTrades")]
    pub min_trades: u32,
    #[serde(rename = "minTIMARDD")]
    pub min_timar_dd: f64,
    pub split_strategy: SplitStrategy,
    /// First OOS date; required when `split_strategy` is chronological.
    #[serde(default)]
    pub oos_start_date: Option<NaiveDate>,
    pub num_workers: usize,
    /// Flat per-entry transaction cost in basis points.
    #[serde(default)]
    pub cost_bps: f64,
    #[serde(default)]
    pub l2: Option<L2Config>,
}

impl JobConfig {
    /// The in-sample quality bars as one record.
    pub fn filter(&self) -> FilterLimits {
        FilterLimits {
            min_tim: self.min_tim,
            min_timar: self.min_timar,
            max_dd: self.max_dd,
            min_trades: self.min_trades,
            min_timar_dd: self.min_timar_dd,
        }
    }

    /// Upgrade a loosely-typed external JSON document into the typed record.
    /// Unknown fields and malformed values are rejected here rather than
    /// surfacing mid-job.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: JobConfig = serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid job configuration: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tickers.is_empty() {
            return Err(anyhow!("tickers must be non-empty"));
        }
        if !self.indicator.is_windowless() {
            if self.period_min == 0 {
                return Err(anyhow!("periodMin must be a positive integer"));
            }
            if self.period_min > self.period_max {
                return Err(anyhow!(
                    "periodMin ({}) must not exceed periodMax ({})",
                    self.period_min,
                    self.period_max
                ));
            }
        }
        validate_threshold_grid(self.threshold_min, self.threshold_max, self.threshold_step)?;
        if self.split_strategy == SplitStrategy::Chronological && self.oos_start_date.is_none() {
            return Err(anyhow!(
                "oosStartDate is required for the chronological split strategy"
            ));
        }
        if self.num_workers == 0 {
            return Err(anyhow!("numWorkers must be a positive integer"));
        }
        if !self.cost_bps.is_finite() || self.cost_bps < 0.0 {
            return Err(anyhow!("costBps must be a non-negative number"));
        }
        if let Some(l2) = &self.l2 {
            if !l2.indicator.is_windowless() {
                if l2.period_min == 0 || l2.period_min > l2.period_max {
                    return Err(anyhow!(
                        "l2 period range [{}, {}] is invalid",
                        l2.period_min,
                        l2.period_max
                    ));
                }
            }
            validate_threshold_grid(l2.threshold_min, l2.threshold_max, l2.threshold_step)?;
        }
        Ok(())
    }
}

fn validate_threshold_grid(min: f64, max: f64, step: f64) -> Result<()> {
    if !min.is_finite() || !max.is_finite() || !step.is_finite() {
        return Err(anyhow!("threshold bounds must be finite numbers"));
    }
    if min > max {
        return Err(anyhow!(
            "thresholdMin ({min}) must not exceed thresholdMax ({max})"
        ));
    }
    if step <= 0.0 {
        return Err(anyhow!("thresholdStep must be > 0 (got {step})"));
    }
    Ok(())
}
