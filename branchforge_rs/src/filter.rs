use crate::config::FilterLimits;
use crate::metrics::MetricTuple;

/// Apply the in-sample quality bars. Short-circuits on the first failed
/// bar; OOS metrics are never consulted here.
pub fn passes(metrics: &MetricTuple, limits: &FilterLimits) -> bool {
    metrics.tim >= limits.min_tim
        && metrics.timar >= limits.min_timar
        && metrics.max_dd.abs() <= limits.max_dd
        && metrics.trades >= limits.min_trades
        && metrics.timar_dd >= limits.min_timar_dd
}
