use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// The twelve per-partition performance metrics.
///
/// `tim`, `cagr`, `max_dd` and the drawdown percentiles are percentages;
/// drawdowns are non-positive. `timar = 100·cagr/tim`, `timar_dd =
/// timar/|max_dd|`. A flat (never-long) partition yields the all-zero
/// tuple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricTuple {
    pub tim: f64,
    pub cagr: f64,
    pub timar: f64,
    pub max_dd: f64,
    pub timar_dd: f64,
    pub trades: u32,
    pub avg_hold: f64,
    pub sharpe: f64,
    pub dd3: f64,
    pub dd50: f64,
    pub dd95: f64,
    pub timar3: f64,
}

impl MetricTuple {
    pub fn zeroed() -> Self {
        Self {
            tim: 0.0,
            cagr: 0.0,
            timar: 0.0,
            max_dd: 0.0,
            timar_dd: 0.0,
            trades: 0,
            avg_hold: 0.0,
            sharpe: 0.0,
            dd3: 0.0,
            dd50: 0.0,
            dd95: 0.0,
            timar3: 0.0,
        }
    }
}

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const CALENDAR_DAYS_PER_YEAR: f64 = 365.25;

/// Compute the metric tuple for the bars selected by `mask` at or past
/// `valid_from` (the indicator warm-up). Selected bars are compacted
/// preserving temporal order; annualization uses the calendar days spanned
/// by the selection, not the bar count.
pub fn compute(
    position: &[bool],
    strat_returns: &[f64],
    dates: &[NaiveDate],
    mask: &[bool],
    valid_from: usize,
) -> MetricTuple {
    let len = position.len();
    assert_eq!(strat_returns.len(), len, "strat_returns length mismatch");
    assert_eq!(dates.len(), len, "dates length mismatch");
    assert_eq!(mask.len(), len, "mask length mismatch");

    // Compaction. Warm-up bars are excluded from both partitions so they
    // neither contribute trades nor bias TIM.
    let mut sel_position: Vec<bool> = Vec::new();
    let mut sel_returns: Vec<f64> = Vec::new();
    let mut sel_dates: Vec<NaiveDate> = Vec::new();
    for i in valid_from..len {
        if mask[i] {
            sel_position.push(position[i]);
            sel_returns.push(strat_returns[i]);
            sel_dates.push(dates[i]);
        }
    }
    let n = sel_position.len();
    if n == 0 {
        return MetricTuple::zeroed();
    }

    let long_bars = sel_position.iter().filter(|&&p| p).count();
    let tim = 100.0 * long_bars as f64 / n as f64;

    // Equity, prefix equity, and the pointwise drawdown series in one pass.
    let mut prefix_equity = Vec::with_capacity(n + 1);
    prefix_equity.push(1.0);
    let mut drawdowns = Vec::with_capacity(n);
    let mut equity = 1.0;
    let mut running_max = 1.0;
    let mut max_dd = 0.0f64;
    for &ret in &sel_returns {
        equity *= 1.0 + ret;
        prefix_equity.push(equity);
        if equity > running_max {
            running_max = equity;
        }
        let dd = 100.0 * (equity / running_max - 1.0);
        drawdowns.push(dd);
        if dd < max_dd {
            max_dd = dd;
        }
    }
    let final_equity = equity;

    let span_days = (sel_dates[n - 1] - sel_dates[0]).num_days() as f64;
    let years = span_days / CALENDAR_DAYS_PER_YEAR;
    let cagr = annualized_growth_pct(final_equity, years);

    let timar = if tim > 0.0 { 100.0 * cagr / tim } else { 0.0 };
    let timar_dd = if max_dd.abs() > 0.0 {
        timar / max_dd.abs()
    } else {
        0.0
    };

    let (trades, avg_hold) = trades_over(&sel_position);
    let sharpe = sharpe_ratio(&sel_returns);

    let mut sorted_dd = drawdowns;
    sorted_dd.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let dd3 = percentile_sorted(&sorted_dd, 0.03);
    let dd50 = percentile_sorted(&sorted_dd, 0.50);
    let dd95 = percentile_sorted(&sorted_dd, 0.95);

    let timar3 = worst_three_year_timar(&sel_position, &sel_dates, &prefix_equity);

    MetricTuple {
        tim,
        cagr,
        timar,
        max_dd,
        timar_dd,
        trades,
        avg_hold,
        sharpe,
        dd3,
        dd50,
        dd95,
        timar3,
    }
}

fn annualized_growth_pct(final_equity: f64, years: f64) -> f64 {
    if years <= 0.0 || final_equity <= 0.0 {
        return 0.0;
    }
    (final_equity.powf(1.0 / years) - 1.0) * 100.0
}

/// Trade count and mean hold over a compacted position series. A position
/// already long at the selection start counts as an open trade; a position
/// still long at the end is closed there.
fn trades_over(position: &[bool]) -> (u32, f64) {
    let mut trades = 0u32;
    let mut total_hold = 0usize;
    let mut entry: Option<usize> = None;
    for (i, &pos) in position.iter().enumerate() {
        match (pos, entry) {
            (true, None) => entry = Some(i),
            (false, Some(start)) => {
                trades += 1;
                total_hold += i - start;
                entry = None;
            }
            _ => {}
        }
    }
    if let Some(start) = entry {
        trades += 1;
        total_hold += position.len() - start;
    }
    let avg_hold = if trades > 0 {
        total_hold as f64 / trades as f64
    } else {
        0.0
    };
    (trades, avg_hold)
}

fn sharpe_ratio(returns: &[f64]) -> f64 {
    let n = returns.len();
    if n < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / n as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n as f64;
    let std = variance.sqrt();
    if std < 1e-15 {
        return 0.0;
    }
    (mean / std) * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Linear-interpolation percentile over an ascending-sorted slice.
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let clamped = q.clamp(0.0, 1.0);
    let pos = clamped * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
    }
}

/// Minimum TIMAR over all windows spanning three calendar years inside the
/// selection; 0 when the selection is shorter than three years. Uses the
/// equity and long-bar prefix arrays, so the scan is linear in the number
/// of selected bars.
fn worst_three_year_timar(
    position: &[bool],
    dates: &[NaiveDate],
    prefix_equity: &[f64],
) -> f64 {
    let n = position.len();
    if n == 0 {
        return 0.0;
    }

    let mut prefix_long = Vec::with_capacity(n + 1);
    prefix_long.push(0usize);
    for &pos in position {
        prefix_long.push(prefix_long.last().unwrap() + usize::from(pos));
    }

    let mut worst: Option<f64> = None;
    let mut end = 0usize;
    for start in 0..n {
        let Some(cutoff) = dates[start].checked_add_months(Months::new(36)) else {
            break;
        };
        if end < start + 1 {
            end = start + 1;
        }
        while end < n && dates[end] < cutoff {
            end += 1;
        }
        // The window must actually reach three years; once it cannot, no
        // later start can either.
        if end >= n && dates[n - 1] < cutoff {
            break;
        }

        let base = prefix_equity[start];
        let growth = if base > 0.0 {
            prefix_equity[end] / base
        } else {
            0.0
        };
        let cagr_w = annualized_growth_pct(growth, 3.0);
        let bars = end - start;
        let tim_w = 100.0 * (prefix_long[end] - prefix_long[start]) as f64 / bars as f64;
        let timar_w = if tim_w > 0.0 { 100.0 * cagr_w / tim_w } else { 0.0 };
        worst = Some(match worst {
            Some(current) => current.min(timar_w),
            None => timar_w,
        });
    }
    worst.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    fn daily_dates(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
        (0..n).map(|i| start + Days::new(i as u64)).collect()
    }

    #[test]
    fn flat_signal_yields_the_zero_tuple() {
        let n = 10;
        let position = vec![false; n];
        let strat_returns = vec![0.0; n];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), n);
        let mask = vec![true; n];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert_eq!(m.tim, 0.0);
        assert_eq!(m.cagr, 0.0);
        assert_eq!(m.timar, 0.0);
        assert_eq!(m.max_dd, 0.0);
        assert_eq!(m.trades, 0);
        assert_eq!(m.sharpe, 0.0);
    }

    #[test]
    fn tim_counts_only_masked_non_warmup_bars() {
        let position = vec![true, true, true, false, false, false];
        let strat_returns = vec![0.0; 6];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 6);
        let mask = vec![true; 6];

        // Warm-up excludes the first two bars, so 1 of 4 selected bars is long.
        let m = compute(&position, &strat_returns, &dates, &mask, 2);
        assert!((m.tim - 25.0).abs() < 1e-12);
    }

    #[test]
    fn equity_and_drawdown_match_hand_computation() {
        let position = vec![true; 4];
        let strat_returns = vec![0.10, -0.20, 0.05, 0.0];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 4);
        let mask = vec![true; 4];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        // Equity: 1.10, 0.88, 0.924, 0.924; running max stays 1.10.
        let expected_max_dd = 100.0 * (0.88 / 1.10 - 1.0);
        assert!((m.max_dd - expected_max_dd).abs() < 1e-9);
        assert_eq!(m.trades, 1);
        assert_eq!(m.avg_hold, 4.0);
    }

    #[test]
    fn cagr_uses_calendar_days_not_bar_count() {
        // Two bars exactly one calendar year apart, 10% total growth.
        let position = vec![true, true];
        let strat_returns = vec![0.0, 0.10];
        let dates = vec![
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
        ];
        let mask = vec![true, true];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        let years = 366.0 / 365.25;
        let expected = (1.10f64.powf(1.0 / years) - 1.0) * 100.0;
        assert!((m.cagr - expected).abs() < 1e-9);
    }

    #[test]
    fn trades_split_by_flat_gaps() {
        let position = vec![true, false, true, true, false, true];
        let strat_returns = vec![0.0; 6];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 6);
        let mask = vec![true; 6];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert_eq!(m.trades, 3);
        // Holds: 1, 2, and 1 (open at end).
        assert!((m.avg_hold - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn sharpe_is_zero_for_constant_returns() {
        let position = vec![true; 5];
        let strat_returns = vec![0.01; 5];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 5);
        let mask = vec![true; 5];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert_eq!(m.sharpe, 0.0);
    }

    #[test]
    fn drawdown_percentiles_are_ordered() {
        let position = vec![true; 40];
        let strat_returns: Vec<f64> = (0..40)
            .map(|i| if i % 5 == 0 { -0.03 } else { 0.01 })
            .collect();
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), 40);
        let mask = vec![true; 40];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert!(m.dd3 <= m.dd50);
        assert!(m.dd50 <= m.dd95);
        assert!(m.dd3 >= m.max_dd);
        assert!(m.dd95 <= 0.0);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [-10.0, -5.0, 0.0];
        assert!((percentile_sorted(&sorted, 0.5) + 5.0).abs() < 1e-12);
        assert!((percentile_sorted(&sorted, 0.25) + 7.5).abs() < 1e-12);
        assert_eq!(percentile_sorted(&sorted, 0.0), -10.0);
        assert_eq!(percentile_sorted(&sorted, 1.0), 0.0);
    }

    #[test]
    fn timar3_is_zero_under_three_years() {
        let n = 300;
        let position = vec![true; n];
        let strat_returns = vec![0.001; n];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), n);
        let mask = vec![true; n];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert_eq!(m.timar3, 0.0);
    }

    #[test]
    fn timar3_picks_the_worst_three_year_window() {
        // Four years of daily bars: strong first year, weak later years.
        let n = 4 * 365;
        let position = vec![true; n];
        let strat_returns: Vec<f64> = (0..n)
            .map(|i| if i < 365 { 0.001 } else { 0.0001 })
            .collect();
        let dates = daily_dates(NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(), n);
        let mask = vec![true; n];

        let m = compute(&position, &strat_returns, &dates, &mask, 0);
        assert!(m.timar3 > 0.0);
        // The worst window excludes the strong first year, so it must trail
        // the whole-period TIMAR.
        assert!(m.timar3 < m.timar);
    }

    #[test]
    fn masked_partitions_cover_the_unmasked_total() {
        // Alternating mask: IS and OOS bar counts add up to the whole.
        let n = 20;
        let position: Vec<bool> = (0..n).map(|i| i % 3 != 0).collect();
        let strat_returns = vec![0.0; n];
        let dates = daily_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(), n);
        let is_mask: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
        let oos_mask: Vec<bool> = is_mask.iter().map(|v| !v).collect();
        let all_mask = vec![true; n];

        let m_is = compute(&position, &strat_returns, &dates, &is_mask, 0);
        let m_oos = compute(&position, &strat_returns, &dates, &oos_mask, 0);
        let m_all = compute(&position, &strat_returns, &dates, &all_mask, 0);

        let weighted = (m_is.tim * 10.0 + m_oos.tim * 10.0) / 20.0;
        assert!((weighted - m_all.tim).abs() < 1e-9);
    }
}
