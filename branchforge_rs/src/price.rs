use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use polars::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Columns every price file must carry. `Adj Close` and anything else is
/// tolerated and ignored.
const REQUIRED_COLUMNS: [&str; 6] = ["Date", "Open", "High", "Low", "Close", "Volume"];

/// One ticker's history as dense aligned arrays, ascending by trading date.
/// `returns` is derived once at load: `returns[0] = 0`,
/// `returns[i] = close[i]/close[i-1] - 1`.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    pub ticker: String,
    pub dates: Vec<NaiveDate>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub returns: Vec<f64>,
}

impl PriceSeries {
    pub fn from_columns(
        ticker: impl Into<String>,
        dates: Vec<NaiveDate>,
        open: Vec<f64>,
        high: Vec<f64>,
        low: Vec<f64>,
        close: Vec<f64>,
        volume: Vec<f64>,
    ) -> Result<Self> {
        let len = dates.len();
        if len == 0 {
            return Err(anyhow!("price series is empty"));
        }
        for (name, column) in [
            ("Open", &open),
            ("High", &high),
            ("Low", &low),
            ("Close", &close),
            ("Volume", &volume),
        ] {
            if column.len() != len {
                return Err(anyhow!(
                    "column '{name}' has {} rows, expected {len}",
                    column.len()
                ));
            }
        }
        for pair in dates.windows(2) {
            if pair[1] <= pair[0] {
                return Err(anyhow!(
                    "dates must be strictly ascending (found {} after {})",
                    pair[1],
                    pair[0]
                ));
            }
        }

        let mut returns = vec![0.0; len];
        for i in 1..len {
            let prev = close[i - 1];
            if prev.is_finite() && prev != 0.0 && close[i].is_finite() {
                returns[i] = close[i] / prev - 1.0;
            }
        }

        Ok(Self {
            ticker: ticker.into(),
            dates,
            open,
            high,
            low,
            close,
            volume,
            returns,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Read-only columnar loader with a bounded per-ticker LRU. Every load error
/// (absent file, missing column, malformed rows) is soft missing-data from
/// the scheduler's point of view: the ticker's branches are skipped and the
/// job continues.
pub struct PriceStore {
    data_dir: PathBuf,
    capacity: usize,
    cache: AHashMap<String, Arc<PriceSeries>>,
    recency: VecDeque<String>,
    fingerprints: AHashMap<String, String>,
}

pub const DEFAULT_PRICE_CACHE_CAPACITY: usize = 128;

impl PriceStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(data_dir, DEFAULT_PRICE_CACHE_CAPACITY)
    }

    pub fn with_capacity(data_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            capacity: capacity.max(1),
            cache: AHashMap::new(),
            recency: VecDeque::new(),
            fingerprints: AHashMap::new(),
        }
    }

    /// Load a ticker, serving repeat requests from the LRU. The returned
    /// series is immutable and shared.
    pub fn load(&mut self, ticker: &str) -> Result<Arc<PriceSeries>> {
        if let Some(series) = self.cache.get(ticker) {
            let series = Arc::clone(series);
            self.touch(ticker);
            return Ok(series);
        }

        let path = self.data_dir.join(format!("{ticker}.csv"));
        if !path.exists() {
            return Err(anyhow!("no price file for '{ticker}' at {}", path.display()));
        }

        let series = Arc::new(load_price_csv(ticker, &path)?);
        self.fingerprints
            .insert(ticker.to_string(), fingerprint_file(&path)?);

        if self.cache.len() >= self.capacity {
            if let Some(evicted) = self.recency.pop_front() {
                self.cache.remove(&evicted);
                debug!(ticker = %evicted, "evicted price series from LRU");
            }
        }
        self.cache.insert(ticker.to_string(), Arc::clone(&series));
        self.recency.push_back(ticker.to_string());
        Ok(series)
    }

    /// SHA-256 of each loaded price file, keyed by ticker. Recorded with job
    /// metadata so results can later be tied to exact input content.
    pub fn fingerprints(&self) -> &AHashMap<String, String> {
        &self.fingerprints
    }

    fn touch(&mut self, ticker: &str) {
        if let Some(pos) = self.recency.iter().position(|t| t == ticker) {
            self.recency.remove(pos);
        }
        self.recency.push_back(ticker.to_string());
    }
}

fn load_price_csv(ticker: &str, path: &Path) -> Result<PriceSeries> {
    let lazy = LazyCsvReader::new(path)
        .has_header(true)
        .with_ignore_errors(true)
        .finish()
        .with_context(|| format!("failed to initialize CSV reader for {}", path.display()))?;
    let df = lazy
        .collect()
        .with_context(|| format!("failed to collect columnar data from {}", path.display()))?;

    for name in REQUIRED_COLUMNS {
        if df.column(name).is_err() {
            return Err(anyhow!(
                "price file {} is missing required column '{name}'",
                path.display()
            ));
        }
    }

    let dates = date_column(&df, "Date")
        .with_context(|| format!("failed to parse Date column of {}", path.display()))?;
    let open = float_column(&df, "Open")?;
    let high = float_column(&df, "High")?;
    let low = float_column(&df, "Low")?;
    let close = float_column(&df, "Close")?;
    let volume = float_column(&df, "Volume")?;

    PriceSeries::from_columns(ticker, dates, open, high, low, close, volume)
        .with_context(|| format!("invalid price data in {}", path.display()))
}

fn date_column(df: &DataFrame, name: &str) -> Result<Vec<NaiveDate>> {
    let series = df.column(name)?;
    let utf8 = series
        .cast(&DataType::String)
        .with_context(|| format!("column '{name}' is not readable as text"))?;
    let ca = utf8.str()?.clone();
    let mut dates = Vec::with_capacity(ca.len());
    for opt in ca.into_iter() {
        let raw = opt.ok_or_else(|| anyhow!("null value in column '{name}'"))?;
        let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .with_context(|| format!("'{raw}' is not an ISO date"))?;
        dates.push(date);
    }
    Ok(dates)
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df.column(name)?;
    let floats = series
        .cast(&DataType::Float64)
        .with_context(|| format!("column '{name}' is not numeric"))?;
    let ca = floats.f64()?.clone();
    let mut values = Vec::with_capacity(ca.len());
    for opt in ca.into_iter() {
        values.push(opt.unwrap_or(f64::NAN));
    }
    Ok(values)
}

/// Fingerprint every resolvable ticker file up front, for job metadata.
/// Tickers without a readable file are simply absent from the map; they
/// surface as missing-data branches during the run.
pub fn fingerprint_tickers(data_dir: &Path, tickers: &[String]) -> AHashMap<String, String> {
    let mut fingerprints = AHashMap::new();
    for ticker in tickers {
        let path = data_dir.join(format!("{ticker}.csv"));
        if let Ok(digest) = fingerprint_file(&path) {
            fingerprints.insert(ticker.clone(), digest);
        }
    }
    fingerprints
}

fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read {} for fingerprinting", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_price_file(dir: &Path, ticker: &str, rows: &[(&str, f64)]) {
        let mut file = fs::File::create(dir.join(format!("{ticker}.csv"))).unwrap();
        writeln!(file, "Date,Open,High,Low,Close,Volume").unwrap();
        for (date, close) in rows {
            writeln!(
                file,
                "{date},{close},{:.2},{:.2},{close},1000",
                close + 1.0,
                close - 1.0
            )
            .unwrap();
        }
    }

    #[test]
    fn loads_and_derives_returns() {
        let dir = tempdir().unwrap();
        write_price_file(
            dir.path(),
            "SPY",
            &[("2020-01-02", 100.0), ("2020-01-03", 102.0), ("2020-01-06", 99.96)],
        );

        let mut store = PriceStore::new(dir.path());
        let series = store.load("SPY").unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.returns[0], 0.0);
        assert!((series.returns[1] - 0.02).abs() < 1e-12);
        assert!((series.returns[2] - (99.96 / 102.0 - 1.0)).abs() < 1e-12);
        assert!(store.fingerprints().contains_key("SPY"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let mut store = PriceStore::new(dir.path());
        assert!(store.load("NOPE").is_err());
    }

    #[test]
    fn missing_column_is_an_error() {
        let dir = tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("BAD.csv")).unwrap();
        writeln!(file, "Date,Close").unwrap();
        writeln!(file, "2020-01-02,100.0").unwrap();
        drop(file);

        let mut store = PriceStore::new(dir.path());
        let err = store.load("BAD").unwrap_err();
        assert!(err.to_string().contains("missing required column"));
    }

    #[test]
    fn lru_evicts_oldest_ticker() {
        let dir = tempdir().unwrap();
        for ticker in ["A", "B", "C"] {
            write_price_file(dir.path(), ticker, &[("2020-01-02", 10.0), ("2020-01-03", 11.0)]);
        }

        let mut store = PriceStore::with_capacity(dir.path(), 2);
        store.load("A").unwrap();
        store.load("B").unwrap();
        // Touch A so B becomes the eviction candidate.
        store.load("A").unwrap();
        store.load("C").unwrap();

        assert!(store.cache.contains_key("A"));
        assert!(!store.cache.contains_key("B"));
        assert!(store.cache.contains_key("C"));
    }

    #[test]
    fn repeated_loads_share_one_snapshot() {
        let dir = tempdir().unwrap();
        write_price_file(dir.path(), "SPY", &[("2020-01-02", 100.0), ("2020-01-03", 101.0)]);

        let mut store = PriceStore::new(dir.path());
        let first = store.load("SPY").unwrap();
        let second = store.load("SPY").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn out_of_order_dates_are_rejected() {
        let dir = tempdir().unwrap();
        write_price_file(
            dir.path(),
            "OOO",
            &[("2020-01-03", 100.0), ("2020-01-02", 101.0)],
        );

        let mut store = PriceStore::new(dir.path());
        assert!(store.load("OOO").is_err());
    }
}
