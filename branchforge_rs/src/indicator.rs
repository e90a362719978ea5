use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::price::PriceSeries;

/// Indicator family identifiers as they appear in job configurations.
///
/// Every family has a closed-form definition over the aligned price arrays
/// and a warm-up length; warm-up entries carry `f64::NAN`, which compares
/// false against any threshold so those bars can never produce a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IndicatorFamily {
    #[serde(rename = "Current Price")]
    CurrentPrice,
    #[serde(rename = "SMA")]
    Sma,
    #[serde(rename = "EMA")]
    Ema,
    #[serde(rename = "RSI")]
    Rsi,
    #[serde(rename = "ROC")]
    Roc,
    #[serde(rename = "STDDEV")]
    StdDev,
    #[serde(rename = "BBANDS")]
    Bbands,
    #[serde(rename = "ATR")]
    Atr,
    #[serde(rename = "Williams %R")]
    WilliamsR,
    #[serde(rename = "CCI")]
    Cci,
    #[serde(rename = "Stoch %K")]
    StochK,
    #[serde(rename = "Stoch %D")]
    StochD,
    #[serde(rename = "ADX")]
    Adx,
    #[serde(rename = "MACD Hist")]
    MacdHist,
    #[serde(rename = "Aroon")]
    Aroon,
    #[serde(rename = "MFI")]
    Mfi,
    #[serde(rename = "OBV")]
    Obv,
}

impl IndicatorFamily {
    pub fn name(self) -> &'static str {
        match self {
            IndicatorFamily::CurrentPrice => "Current Price",
            IndicatorFamily::Sma => "SMA",
            IndicatorFamily::Ema => "EMA",
            IndicatorFamily::Rsi => "RSI",
            IndicatorFamily::Roc => "ROC",
            IndicatorFamily::StdDev => "STDDEV",
            IndicatorFamily::Bbands => "BBANDS",
            IndicatorFamily::Atr => "ATR",
            IndicatorFamily::WilliamsR => "Williams %R",
            IndicatorFamily::Cci => "CCI",
            IndicatorFamily::StochK => "Stoch %K",
            IndicatorFamily::StochD => "Stoch %D",
            IndicatorFamily::Adx => "ADX",
            IndicatorFamily::MacdHist => "MACD Hist",
            IndicatorFamily::Aroon => "Aroon",
            IndicatorFamily::Mfi => "MFI",
            IndicatorFamily::Obv => "OBV",
        }
    }

    /// Families that take no look-back period; the config's period range is
    /// ignored and the enumeration collapses to a single window point.
    pub fn is_windowless(self) -> bool {
        matches!(self, IndicatorFamily::CurrentPrice | IndicatorFamily::Obv)
    }

    /// Index of the first bar with a defined value. Bars below this index
    /// carry the NaN sentinel.
    pub fn warmup(self, window: Option<u32>) -> usize {
        let w = window.unwrap_or(0) as usize;
        match self {
            IndicatorFamily::CurrentPrice => 0,
            IndicatorFamily::Obv => 1,
            IndicatorFamily::Sma
            | IndicatorFamily::Ema
            | IndicatorFamily::StdDev
            | IndicatorFamily::Bbands
            | IndicatorFamily::WilliamsR
            | IndicatorFamily::Cci
            | IndicatorFamily::StochK => w.saturating_sub(1),
            IndicatorFamily::StochD => w + 1,
            IndicatorFamily::Roc
            | IndicatorFamily::Atr
            | IndicatorFamily::Aroon
            | IndicatorFamily::Mfi => w,
            IndicatorFamily::Rsi | IndicatorFamily::Adx => 2 * w,
            IndicatorFamily::MacdHist => 24 + w,
        }
    }

    /// Compute the raw indicator array for one price series. Warm-up
    /// normalization (forcing everything below [`warmup`] to NaN) happens in
    /// the cache, not here.
    fn compute(self, series: &PriceSeries, window: Option<u32>) -> Vec<f64> {
        let w = window.unwrap_or(0) as usize;
        let c = &series.close;
        match self {
            IndicatorFamily::CurrentPrice => c.clone(),
            IndicatorFamily::Sma => sma(c, w),
            IndicatorFamily::Ema => ema(c, w),
            IndicatorFamily::Rsi => rsi(c, w),
            IndicatorFamily::Roc => roc(c, w),
            IndicatorFamily::StdDev => rolling_std(c, w),
            IndicatorFamily::Bbands => percent_b(c, w),
            IndicatorFamily::Atr => atr(&series.high, &series.low, c, w),
            IndicatorFamily::WilliamsR => williams_r(&series.high, &series.low, c, w),
            IndicatorFamily::Cci => cci(&series.high, &series.low, c, w),
            IndicatorFamily::StochK => stoch_k(&series.high, &series.low, c, w),
            IndicatorFamily::StochD => sma(&stoch_k(&series.high, &series.low, c, w), 3),
            IndicatorFamily::Adx => adx(&series.high, &series.low, c, w),
            IndicatorFamily::MacdHist => macd_hist(c, w),
            IndicatorFamily::Aroon => aroon(&series.high, &series.low, w),
            IndicatorFamily::Mfi => mfi(&series.high, &series.low, c, &series.volume, w),
            IndicatorFamily::Obv => obv(c, &series.volume),
        }
    }
}

impl fmt::Display for IndicatorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndicatorFamily {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let family = match normalized.as_str() {
            "current price" | "current_price" | "price" => IndicatorFamily::CurrentPrice,
            "sma" => IndicatorFamily::Sma,
            "ema" => IndicatorFamily::Ema,
            "rsi" => IndicatorFamily::Rsi,
            "roc" => IndicatorFamily::Roc,
            "stddev" => IndicatorFamily::StdDev,
            "bbands" | "%b" => IndicatorFamily::Bbands,
            "atr" => IndicatorFamily::Atr,
            "williams %r" | "williams_r" | "willr" => IndicatorFamily::WilliamsR,
            "cci" => IndicatorFamily::Cci,
            "stoch %k" | "stoch_k" => IndicatorFamily::StochK,
            "stoch %d" | "stoch_d" => IndicatorFamily::StochD,
            "adx" => IndicatorFamily::Adx,
            "macd hist" | "macd_hist" => IndicatorFamily::MacdHist,
            "aroon" => IndicatorFamily::Aroon,
            "mfi" => IndicatorFamily::Mfi,
            "obv" => IndicatorFamily::Obv,
            other => return Err(anyhow!("unknown indicator family '{other}'")),
        };
        Ok(family)
    }
}

/// Per-worker memoization of indicator arrays, keyed by
/// `(ticker, family, window)`. Entries are computed lazily on first request
/// and retained for the lifetime of the job; workers own disjoint ticker
/// shards, so caches are never shared across threads.
pub struct IndicatorCache {
    entries: AHashMap<(String, IndicatorFamily, u32), Arc<Vec<f64>>>,
    anomaly_logged: AHashSet<(String, IndicatorFamily)>,
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            anomaly_logged: AHashSet::new(),
        }
    }

    /// Fetch (or compute) the indicator array for one branch axis. The
    /// returned array is aligned with the price series, with NaN at every
    /// warm-up position. Non-finite values past warm-up are numeric
    /// anomalies: they stay NaN (so they behave like warm-up bars) and are
    /// logged at most once per (ticker, family).
    pub fn get(
        &mut self,
        series: &PriceSeries,
        family: IndicatorFamily,
        window: Option<u32>,
    ) -> Arc<Vec<f64>> {
        let window_key = window.unwrap_or(0);
        let key = (series.ticker.clone(), family, window_key);
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(existing);
        }

        let mut values = family.compute(series, window);
        debug_assert_eq!(values.len(), series.len());
        let warmup = family.warmup(window).min(values.len());
        for value in values.iter_mut().take(warmup) {
            *value = f64::NAN;
        }

        let anomalies = values[warmup..].iter().filter(|v| !v.is_finite()).count();
        if anomalies > 0 && self.anomaly_logged.insert((series.ticker.clone(), family)) {
            warn!(
                ticker = %series.ticker,
                family = %family,
                bars = anomalies,
                "non-finite indicator values past warm-up; treating as warm-up"
            );
        }

        let arc = Arc::new(values);
        self.entries.insert(key, Arc::clone(&arc));
        arc
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Closed forms. All functions return arrays aligned with the input, NaN where
// the value is not yet defined.
// ---------------------------------------------------------------------------

fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    let mut sum = 0.0;
    let mut bad = 0usize;
    for i in 0..len {
        let v = values[i];
        if v.is_finite() {
            sum += v;
        } else {
            bad += 1;
        }
        if i >= period {
            let old = values[i - period];
            if old.is_finite() {
                sum -= old;
            } else {
                bad -= 1;
            }
        }
        if i + 1 >= period && bad == 0 {
            result[i] = sum / period as f64;
        }
    }
    result
}

fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len < period {
        return result;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    result[period - 1] = seed;
    let mut prev = seed;
    for i in period..len {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Wilder RSI. Average gain/loss are seeded with the simple mean of the
/// first `period` changes and smoothed with `(prev·(w-1) + x)/w` thereafter.
fn rsi(close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return result;
    }

    let mut gains = vec![0.0; len];
    let mut losses = vec![0.0; len];
    for i in 1..len {
        let change = close[i] - close[i - 1];
        gains[i] = change.max(0.0);
        losses[i] = (-change).max(0.0);
    }

    let mut avg_gain = gains[1..=period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[1..=period].iter().sum::<f64>() / period as f64;
    result[period] = rsi_value(avg_gain, avg_loss);
    for i in period + 1..len {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        result[i] = rsi_value(avg_gain, avg_loss);
    }
    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

fn roc(values: &[f64], period: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, &current)| {
            if period == 0 || i < period || values[i - period].abs() < f64::EPSILON {
                f64::NAN
            } else {
                current / values[i - period] - 1.0
            }
        })
        .collect()
}

fn rolling_std(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut result = vec![f64::NAN; len];
    if period < 2 || period > len {
        return result;
    }
    let mean = sma(values, period);
    for i in period - 1..len {
        let mean_i = mean[i];
        if !mean_i.is_finite() {
            continue;
        }
        let slice = &values[i + 1 - period..=i];
        let variance = slice.iter().map(|x| (x - mean_i).powi(2)).sum::<f64>()
            / (period as f64 - 1.0);
        result[i] = variance.sqrt();
    }
    result
}

/// Bollinger %B with k = 2: position of the close inside the band,
/// `(c - lower) / (upper - lower)`. A degenerate band (zero width) maps to
/// the midpoint.
fn percent_b(close: &[f64], period: usize) -> Vec<f64> {
    let mid = sma(close, period);
    let sd = rolling_std(close, period);
    close
        .iter()
        .zip(mid.iter().zip(sd.iter()))
        .map(|(&c, (&m, &s))| {
            if !m.is_finite() || !s.is_finite() {
                f64::NAN
            } else if s.abs() < f64::EPSILON {
                0.5
            } else {
                let lower = m - 2.0 * s;
                (c - lower) / (4.0 * s)
            }
        })
        .collect()
}

fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let len = close.len();
    let mut tr = vec![0.0; len];
    for i in 0..len {
        let hl = high[i] - low[i];
        if i == 0 {
            tr[i] = hl;
        } else {
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            tr[i] = hl.max(hc).max(lc);
        }
    }
    tr
}

/// Wilder ATR: seeded with the simple mean of the first `period` true
/// ranges, then `(prev·(w-1) + tr)/w`.
fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return result;
    }
    let tr = true_range(high, low, close);
    let mut prev = tr[1..=period].iter().sum::<f64>() / period as f64;
    result[period] = prev;
    for i in period + 1..len {
        prev = (prev * (period as f64 - 1.0) + tr[i]) / period as f64;
        result[i] = prev;
    }
    result
}

fn williams_r(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    for i in period - 1..len {
        let window = i + 1 - period..=i;
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        result[i] = if range.abs() < f64::EPSILON {
            -50.0
        } else {
            -100.0 * (hh - close[i]) / range
        };
    }
    result
}

fn cci(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    let tp: Vec<f64> = (0..len).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    let tp_mean = sma(&tp, period);
    for i in period - 1..len {
        let mean_i = tp_mean[i];
        if !mean_i.is_finite() {
            continue;
        }
        let slice = &tp[i + 1 - period..=i];
        let mean_dev = slice.iter().map(|x| (x - mean_i).abs()).sum::<f64>() / period as f64;
        result[i] = if mean_dev.abs() < f64::EPSILON {
            0.0
        } else {
            (tp[i] - mean_i) / (0.015 * mean_dev)
        };
    }
    result
}

fn stoch_k(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || period > len {
        return result;
    }
    for i in period - 1..len {
        let window = i + 1 - period..=i;
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        result[i] = if range.abs() < f64::EPSILON {
            50.0
        } else {
            100.0 * (close[i] - ll) / range
        };
    }
    result
}

/// Wilder ADX over +DI/-DI. Directional movement and true range are
/// Wilder-smoothed over `period`, DX = 100·|DI+ - DI-|/(DI+ + DI-), and ADX
/// is the Wilder smoothing of DX (seeded with its first `period` mean).
fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len <= 2 * period {
        return result;
    }

    let tr = true_range(high, low, close);
    let mut plus_dm = vec![0.0; len];
    let mut minus_dm = vec![0.0; len];
    for i in 1..len {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    let w = period as f64;
    let mut sm_tr = tr[1..=period].iter().sum::<f64>();
    let mut sm_plus = plus_dm[1..=period].iter().sum::<f64>();
    let mut sm_minus = minus_dm[1..=period].iter().sum::<f64>();

    let mut dx = vec![f64::NAN; len];
    dx[period] = dx_value(sm_plus, sm_minus, sm_tr);
    for i in period + 1..len {
        sm_tr = sm_tr - sm_tr / w + tr[i];
        sm_plus = sm_plus - sm_plus / w + plus_dm[i];
        sm_minus = sm_minus - sm_minus / w + minus_dm[i];
        dx[i] = dx_value(sm_plus, sm_minus, sm_tr);
    }

    let mut adx_prev = dx[period..=2 * period - 1].iter().sum::<f64>() / w;
    result[2 * period - 1] = adx_prev;
    for i in 2 * period..len {
        adx_prev = (adx_prev * (w - 1.0) + dx[i]) / w;
        result[i] = adx_prev;
    }
    result
}

fn dx_value(sm_plus: f64, sm_minus: f64, sm_tr: f64) -> f64 {
    if sm_tr.abs() < f64::EPSILON {
        return 0.0;
    }
    let di_plus = 100.0 * sm_plus / sm_tr;
    let di_minus = 100.0 * sm_minus / sm_tr;
    let di_sum = di_plus + di_minus;
    if di_sum.abs() < f64::EPSILON {
        0.0
    } else {
        100.0 * (di_plus - di_minus).abs() / di_sum
    }
}

/// MACD histogram where `w` parameterizes the signal-line EMA over the
/// classic 12/26 MACD line; `w = 9` reproduces the textbook indicator.
fn macd_hist(close: &[f64], signal_period: usize) -> Vec<f64> {
    const FAST: usize = 12;
    const SLOW: usize = 26;

    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if signal_period == 0 || len < SLOW + signal_period {
        return result;
    }

    let fast = ema(close, FAST);
    let slow = ema(close, SLOW);
    // MACD line defined from the slow EMA's first value onward.
    let macd: Vec<f64> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| if f.is_finite() && s.is_finite() { f - s } else { f64::NAN })
        .collect();

    let start = SLOW - 1;
    let signal_tail = ema(&macd[start..], signal_period);
    for (offset, signal) in signal_tail.into_iter().enumerate() {
        let i = start + offset;
        if signal.is_finite() && macd[i].is_finite() {
            result[i] = macd[i] - signal;
        }
    }
    result
}

/// Aroon oscillator: `100·(bars_since_low - bars_since_high)/w` over a
/// `w+1`-bar window, positive when the recent high is fresher than the
/// recent low.
fn aroon(high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let len = high.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return result;
    }
    for i in period..len {
        let start = i - period;
        let mut hi_idx = start;
        let mut lo_idx = start;
        for j in start..=i {
            if high[j] >= high[hi_idx] {
                hi_idx = j;
            }
            if low[j] <= low[lo_idx] {
                lo_idx = j;
            }
        }
        let up = 100.0 * (period - (i - hi_idx)) as f64 / period as f64;
        let down = 100.0 * (period - (i - lo_idx)) as f64 / period as f64;
        result[i] = up - down;
    }
    result
}

fn mfi(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if period == 0 || len <= period {
        return result;
    }
    let tp: Vec<f64> = (0..len).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    let mut pos_flow = vec![0.0; len];
    let mut neg_flow = vec![0.0; len];
    for i in 1..len {
        let flow = tp[i] * volume[i];
        if tp[i] > tp[i - 1] {
            pos_flow[i] = flow;
        } else if tp[i] < tp[i - 1] {
            neg_flow[i] = flow;
        }
    }
    let mut pos_sum: f64 = pos_flow[1..=period].iter().sum();
    let mut neg_sum: f64 = neg_flow[1..=period].iter().sum();
    result[period] = mfi_value(pos_sum, neg_sum);
    for i in period + 1..len {
        pos_sum += pos_flow[i] - pos_flow[i - period];
        neg_sum += neg_flow[i] - neg_flow[i - period];
        result[i] = mfi_value(pos_sum, neg_sum);
    }
    result
}

fn mfi_value(pos_sum: f64, neg_sum: f64) -> f64 {
    if neg_sum.abs() < f64::EPSILON {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + pos_sum / neg_sum)
    }
}

/// On-balance volume, accumulated from the first close-to-close change.
fn obv(close: &[f64], volume: &[f64]) -> Vec<f64> {
    let len = close.len();
    let mut result = vec![f64::NAN; len];
    if len < 2 {
        return result;
    }
    let mut total = 0.0;
    for i in 1..len {
        if close[i] > close[i - 1] {
            total += volume[i];
        } else if close[i] < close[i - 1] {
            total -= volume[i];
        }
        result[i] = total;
    }
    result
}
