use crate::config::Comparator;

/// One round trip: position opened at `entry_index`, closed at `exit_index`
/// (exclusive), or at the end of the series when still open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeRecord {
    pub entry_index: usize,
    pub exit_index: usize,
    pub hold_days: usize,
    pub trade_return: f64,
}

/// Inputs for the long/flat backtest kernel.
///
/// The kernel is strategy-agnostic: callers provide the precomputed raw
/// signal (already combined across condition levels) and the daily return
/// series aligned with it.
pub struct BacktestInputs<'a> {
    pub raw_signal: &'a [bool],
    pub returns: &'a [f64],
    /// Flat per-entry transaction cost in basis points.
    pub cost_bps: f64,
    /// Bars between observing a signal and holding the position. The
    /// default of 1 means the signal seen at bar `i` is held during bar
    /// `i+1`, which rules out look-ahead on daily bars.
    pub execution_lag: usize,
}

pub struct BacktestOutputs {
    pub position: Vec<bool>,
    pub strat_returns: Vec<f64>,
    pub trades: Vec<TradeRecord>,
}

/// Raw threshold signal for one condition. NaN indicator values (warm-up or
/// numeric anomalies) compare false under both operators, so those bars can
/// never be long.
pub fn threshold_signal(indicator: &[f64], comparator: Comparator, threshold: f64) -> Vec<bool> {
    match comparator {
        Comparator::Gt => indicator.iter().map(|&v| v > threshold).collect(),
        Comparator::Lt => indicator.iter().map(|&v| v < threshold).collect(),
    }
}

/// AND a second condition level into an existing raw signal, in place. The
/// combination happens before the execution lag is applied.
pub fn and_signal(signal: &mut [bool], other: &[bool]) {
    assert_eq!(signal.len(), other.len(), "signal length mismatch");
    for (dst, src) in signal.iter_mut().zip(other.iter()) {
        *dst = *dst && *src;
    }
}

/// Run the vectorized long/flat backtest: lag the raw signal into a
/// position series, accumulate position-gated returns with an entry-side
/// cost, and extract the trade log — all in one pass over the arrays with
/// no per-bar allocation.
pub fn run_backtest(inputs: &BacktestInputs) -> BacktestOutputs {
    let len = inputs.returns.len();
    assert_eq!(
        inputs.raw_signal.len(),
        len,
        "raw_signal length mismatch"
    );

    let lag = inputs.execution_lag;
    let entry_cost = inputs.cost_bps / 10_000.0;

    let mut position = vec![false; len];
    let mut strat_returns = vec![0.0; len];
    let mut trades = Vec::new();

    let mut prev_position = false;
    let mut entry_index = 0usize;
    let mut trade_growth = 1.0;

    for i in 0..len {
        let pos = i >= lag && inputs.raw_signal[i - lag];
        position[i] = pos;

        let mut ret = if pos { inputs.returns[i] } else { 0.0 };
        if pos && !prev_position {
            ret -= entry_cost;
            entry_index = i;
            trade_growth = 1.0;
        }
        strat_returns[i] = ret;

        if pos {
            trade_growth *= 1.0 + ret;
        } else if prev_position {
            trades.push(TradeRecord {
                entry_index,
                exit_index: i,
                hold_days: i - entry_index,
                trade_return: trade_growth - 1.0,
            });
        }
        prev_position = pos;
    }

    // Close any trade still open at the end of the series.
    if prev_position {
        trades.push(TradeRecord {
            entry_index,
            exit_index: len,
            hold_days: len - entry_index,
            trade_return: trade_growth - 1.0,
        });
    }

    BacktestOutputs {
        position,
        strat_returns,
        trades,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_indicator_values_never_signal() {
        let indicator = [f64::NAN, f64::NAN, 50.0, 10.0];
        let gt = threshold_signal(&indicator, Comparator::Gt, 20.0);
        assert_eq!(gt, vec![false, false, true, false]);
        let lt = threshold_signal(&indicator, Comparator::Lt, 20.0);
        assert_eq!(lt, vec![false, false, false, true]);
    }

    #[test]
    fn position_lags_signal_by_one_bar() {
        let raw = [true, true, false, true];
        let returns = [0.01, 0.02, 0.03, 0.04];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 0.0,
            execution_lag: 1,
        });
        assert_eq!(out.position, vec![false, true, true, false]);
        assert_eq!(out.strat_returns, vec![0.0, 0.02, 0.03, 0.0]);
    }

    #[test]
    fn position_zero_is_always_flat() {
        let raw = [true; 5];
        let returns = [0.01; 5];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 0.0,
            execution_lag: 1,
        });
        assert!(!out.position[0]);
        assert!(out.position[1..].iter().all(|&p| p));
    }

    #[test]
    fn trade_log_captures_hold_and_compound_return() {
        // Long during bars 1 and 2, flat after.
        let raw = [true, true, false, false, false];
        let returns = [0.0, 0.10, 0.10, 0.05, 0.05];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 0.0,
            execution_lag: 1,
        });
        assert_eq!(out.trades.len(), 1);
        let trade = out.trades[0];
        assert_eq!(trade.entry_index, 1);
        assert_eq!(trade.exit_index, 3);
        assert_eq!(trade.hold_days, 2);
        assert!((trade.trade_return - (1.10_f64 * 1.10 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn open_trade_is_closed_at_series_end() {
        let raw = [false, true, true, true];
        let returns = [0.0, 0.0, 0.01, 0.02];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 0.0,
            execution_lag: 1,
        });
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].exit_index, 4);
        assert_eq!(out.trades[0].hold_days, 2);
    }

    #[test]
    fn entry_cost_is_charged_once_per_trade() {
        let raw = [true, false, true, false];
        let returns = [0.0, 0.0, 0.0, 0.0];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 10.0,
            execution_lag: 1,
        });
        // Entries at bars 1 and 3; cost 10bps = 0.001 each.
        assert!((out.strat_returns[1] + 0.001).abs() < 1e-12);
        assert_eq!(out.strat_returns[2], 0.0);
        assert!((out.strat_returns[3] + 0.001).abs() < 1e-12);
    }

    #[test]
    fn l2_combination_is_an_intersection() {
        let mut first = vec![true, true, false, true];
        let second = [true, false, false, true];
        and_signal(&mut first, &second);
        assert_eq!(first, vec![true, false, false, true]);
    }

    #[test]
    fn flat_signal_produces_no_trades_and_zero_returns() {
        let raw = [false; 6];
        let returns = [0.01, -0.02, 0.03, -0.01, 0.02, 0.01];
        let out = run_backtest(&BacktestInputs {
            raw_signal: &raw,
            returns: &returns,
            cost_bps: 5.0,
            execution_lag: 1,
        });
        assert!(out.trades.is_empty());
        assert!(out.strat_returns.iter().all(|&r| r == 0.0));
        assert!(out.position.iter().all(|&p| !p));
    }
}
