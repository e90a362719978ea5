use anyhow::Result;

use crate::config::{Comparator, JobConfig};
use crate::indicator::IndicatorFamily;

/// Optional second condition attached to a branch, ANDed into the entry
/// signal before the execution lag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchL2 {
    pub family: IndicatorFamily,
    pub window: Option<u32>,
    pub comparator: Comparator,
    pub threshold: f64,
}

/// One point in the search Cartesian product. Created by the enumerator,
/// consumed by exactly one worker, and emitted as a result row when it
/// passes the in-sample filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub ticker_index: usize,
    pub family: IndicatorFamily,
    pub window: Option<u32>,
    pub comparator: Comparator,
    pub threshold: f64,
    pub l2: Option<BranchL2>,
}

/// One condition axis of the product: a family, its window range, the
/// comparator expansion, and the threshold grid. Iteration order within an
/// axis is window ascending, then comparator (`lt` before `gt` under BOTH),
/// then threshold ascending.
#[derive(Debug, Clone)]
struct ConditionAxis {
    family: IndicatorFamily,
    windows: Vec<Option<u32>>,
    comparators: Vec<Comparator>,
    thresholds: Vec<f64>,
}

impl ConditionAxis {
    fn new(
        family: IndicatorFamily,
        period_min: u32,
        period_max: u32,
        comparators: &[Comparator],
        threshold_min: f64,
        threshold_max: f64,
        threshold_step: f64,
    ) -> Self {
        let windows: Vec<Option<u32>> = if family.is_windowless() {
            vec![None]
        } else {
            (period_min..=period_max).map(Some).collect()
        };
        let count = threshold_count(threshold_min, threshold_max, threshold_step);
        let thresholds = (0..count)
            .map(|i| threshold_min + i as f64 * threshold_step)
            .collect();
        Self {
            family,
            windows,
            comparators: comparators.to_vec(),
            thresholds,
        }
    }

    fn len(&self) -> u64 {
        self.windows.len() as u64 * self.comparators.len() as u64 * self.thresholds.len() as u64
    }

    fn decode(&self, index: u64) -> (Option<u32>, Comparator, f64) {
        let thresholds = self.thresholds.len() as u64;
        let comparators = self.comparators.len() as u64;
        let threshold = self.thresholds[(index % thresholds) as usize];
        let comparator = self.comparators[((index / thresholds) % comparators) as usize];
        let window = self.windows[(index / (thresholds * comparators)) as usize];
        (window, comparator, threshold)
    }

    fn max_window(&self) -> u32 {
        self.windows.iter().flatten().copied().max().unwrap_or(1)
    }
}

/// Closed-form threshold count: `floor((max - min)/step) + 1`. The epsilon
/// absorbs float error so an exactly-divisible range keeps its endpoint.
pub fn threshold_count(min: f64, max: f64, step: f64) -> u64 {
    ((max - min) / step + 1e-9).floor() as u64 + 1
}

/// The job's full search space. Reports its total size in closed form
/// before any branch is produced, decodes any global index in O(1), and
/// hands out per-ticker sub-spaces for sharding.
#[derive(Debug, Clone)]
pub struct BranchSpace {
    tickers: Vec<String>,
    l1: ConditionAxis,
    l2: Option<ConditionAxis>,
}

impl BranchSpace {
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        config.validate()?;
        let l1 = ConditionAxis::new(
            config.indicator,
            config.period_min,
            config.period_max,
            config.comparator.comparators(),
            config.threshold_min,
            config.threshold_max,
            config.threshold_step,
        );
        let l2 = config.l2.as_ref().map(|l2| {
            ConditionAxis::new(
                l2.indicator,
                l2.period_min,
                l2.period_max,
                l2.comparator.comparators(),
                l2.threshold_min,
                l2.threshold_max,
                l2.threshold_step,
            )
        });
        Ok(Self {
            tickers: config.tickers.clone(),
            l1,
            l2,
        })
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn branches_per_ticker(&self) -> u64 {
        self.l1.len() * self.l2.as_ref().map_or(1, ConditionAxis::len)
    }

    pub fn total_branches(&self) -> u64 {
        self.tickers.len() as u64 * self.branches_per_ticker()
    }

    /// Largest look-back window across both condition levels. A ticker with
    /// fewer than this + 1 usable bars is degenerate and all its branches
    /// are skipped.
    pub fn max_window(&self) -> u32 {
        let l1 = self.l1.max_window();
        let l2 = self.l2.as_ref().map_or(1, ConditionAxis::max_window);
        l1.max(l2)
    }

    fn decode(&self, global: u64) -> Option<Branch> {
        if global >= self.total_branches() {
            return None;
        }
        let per_ticker = self.branches_per_ticker();
        let ticker_index = (global / per_ticker) as usize;
        let mut rest = global % per_ticker;

        let l2 = self.l2.as_ref().map(|axis| {
            let l2_index = rest % axis.len();
            rest /= axis.len();
            let (window, comparator, threshold) = axis.decode(l2_index);
            BranchL2 {
                family: axis.family,
                window,
                comparator,
                threshold,
            }
        });
        let (window, comparator, threshold) = self.l1.decode(rest);

        Some(Branch {
            ticker_index,
            family: self.l1.family,
            window,
            comparator,
            threshold,
            l2,
        })
    }

    /// Iterate the whole space in enumeration order.
    pub fn iter(&self) -> BranchIter<'_> {
        self.starting_at(0)
    }

    /// Restart iteration from an arbitrary global index in O(1).
    pub fn starting_at(&self, offset: u64) -> BranchIter<'_> {
        BranchIter {
            space: self,
            next: offset,
            end: self.total_branches(),
        }
    }

    /// One ticker's slice of the space, in enumeration order. Shards are
    /// disjoint: ticker `i` owns global indices
    /// `[i·per_ticker, (i+1)·per_ticker)`.
    pub fn ticker_branches(&self, ticker_index: usize) -> BranchIter<'_> {
        let per_ticker = self.branches_per_ticker();
        let start = ticker_index as u64 * per_ticker;
        BranchIter {
            space: self,
            next: start,
            end: start + per_ticker,
        }
    }
}

pub struct BranchIter<'a> {
    space: &'a BranchSpace,
    next: u64,
    end: u64,
}

impl Iterator for BranchIter<'_> {
    type Item = Branch;

    fn next(&mut self) -> Option<Branch> {
        if self.next >= self.end {
            return None;
        }
        let branch = self.space.decode(self.next);
        self.next += 1;
        branch
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BranchIter<'_> {}
