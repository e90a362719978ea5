use crate::backtest::{and_signal, threshold_signal};
use crate::config::Comparator;
use crate::enumerate::Branch;
use crate::indicator::{IndicatorCache, IndicatorFamily};
use crate::price::PriceSeries;

/// A single indicator expression: family plus optional window. This pair,
/// together with [`Condition`], is the interface the richer tree-compiler
/// strategy front-end targets; the simple grid search compiles each branch
/// down to one or two of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorExpr {
    pub family: IndicatorFamily,
    pub window: Option<u32>,
}

/// One boolean condition column: an indicator expression compared against a
/// scalar threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Condition {
    pub expr: IndicatorExpr,
    pub comparator: Comparator,
    pub threshold: f64,
}

impl Condition {
    pub fn new(
        family: IndicatorFamily,
        window: Option<u32>,
        comparator: Comparator,
        threshold: f64,
    ) -> Self {
        Self {
            expr: IndicatorExpr { family, window },
            comparator,
            threshold,
        }
    }
}

/// The condition set for one branch: the L1 clause plus the optional L2
/// clause.
pub fn branch_conditions(branch: &Branch) -> Vec<Condition> {
    let mut conditions = vec![Condition::new(
        branch.family,
        branch.window,
        branch.comparator,
        branch.threshold,
    )];
    if let Some(l2) = &branch.l2 {
        conditions.push(Condition::new(
            l2.family,
            l2.window,
            l2.comparator,
            l2.threshold,
        ));
    }
    conditions
}

/// Compile a condition set into one raw entry signal: the AND of every
/// condition's threshold column. Warm-up and anomaly bars are NaN in the
/// indicator arrays and therefore false in every column.
pub fn entry_signal(
    conditions: &[Condition],
    cache: &mut IndicatorCache,
    series: &PriceSeries,
) -> Vec<bool> {
    let mut combined: Option<Vec<bool>> = None;
    for condition in conditions {
        let indicator = cache.get(series, condition.expr.family, condition.expr.window);
        let column = threshold_signal(&indicator, condition.comparator, condition.threshold);
        match combined.as_mut() {
            Some(signal) => and_signal(signal, &column),
            None => combined = Some(column),
        }
    }
    combined.unwrap_or_else(|| vec![false; series.len()])
}

/// Largest warm-up across a condition set; bars below this index can never
/// be long and are excluded from both partitions at metric time.
pub fn warmup_of(conditions: &[Condition]) -> usize {
    conditions
        .iter()
        .map(|c| c.expr.family.warmup(c.expr.window))
        .max()
        .unwrap_or(0)
}
