use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::aggregate::{Aggregator, WorkerReport};
use crate::backtest::{BacktestInputs, run_backtest};
use crate::compose::{branch_conditions, entry_signal, warmup_of};
use crate::config::JobConfig;
use crate::enumerate::BranchSpace;
use crate::filter;
use crate::indicator::IndicatorCache;
use crate::job::{JobCounters, JobId};
use crate::metrics;
use crate::partition::{SplitPolicy, partition};
use crate::price::PriceStore;
use crate::progress::{DEFAULT_PUBLISH_EVERY, ProgressSink, PublishCadence};
use crate::storage::{ResultRow, ResultsSink};

/// Cooperative cancellation flag, checked by workers between branches. A
/// branch in flight always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub const DEFAULT_RESULT_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub num_workers: usize,
    pub result_buffer_capacity: usize,
    pub publish_every: u64,
    pub price_cache_capacity: usize,
}

impl SchedulerOptions {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            result_buffer_capacity: DEFAULT_RESULT_BUFFER,
            publish_every: DEFAULT_PUBLISH_EVERY,
            price_cache_capacity: crate::price::DEFAULT_PRICE_CACHE_CAPACITY,
        }
    }
}

/// Run one job's search space to completion (or cancellation).
///
/// Tickers are sharded round-robin across worker threads, so each worker
/// owns a disjoint set of tickers and therefore a disjoint price store and
/// indicator cache; residual workers stay idle when tickers are fewer than
/// workers. Results and progress deltas flow over one channel to a single
/// aggregator thread that owns the sink.
///
/// Returns an error when a worker panics or the sink fails; both fail the
/// job.
pub fn run_scheduler(
    job_id: JobId,
    config: Arc<JobConfig>,
    space: &BranchSpace,
    sink: Box<dyn ResultsSink>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancelToken,
    counters: Arc<JobCounters>,
    options: SchedulerOptions,
) -> Result<()> {
    let policy = SplitPolicy::from_config(config.split_strategy, config.oos_start_date)
        .ok_or_else(|| anyhow!("split strategy requires an OOS start date"))?;

    let ticker_count = space.tickers().len();
    let worker_count = options.num_workers.min(ticker_count).max(1);
    let mut shards: Vec<Vec<usize>> = vec![Vec::new(); worker_count];
    for ticker_index in 0..ticker_count {
        shards[ticker_index % worker_count].push(ticker_index);
    }

    info!(
        job_id,
        workers = worker_count,
        tickers = ticker_count,
        total_branches = space.total_branches(),
        "scheduler starting"
    );

    let (tx, rx) = mpsc::sync_channel::<WorkerReport>(worker_count * 2);

    let aggregator = Aggregator::new(
        job_id,
        space.total_branches(),
        sink,
        progress,
        Arc::clone(&counters),
    );
    let aggregator_handle = thread::Builder::new()
        .name("forge-aggregator".to_string())
        .spawn(move || aggregator.run(rx))
        .context("failed to spawn aggregator thread")?;

    let mut worker_handles = Vec::with_capacity(worker_count);
    for (worker_id, shard) in shards.into_iter().enumerate() {
        let config = Arc::clone(&config);
        let space = space.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("forge-worker-{worker_id}"))
            .spawn(move || {
                run_worker(
                    worker_id, job_id, &config, &space, policy, shard, &tx, &cancel, options,
                )
            })
            .context("failed to spawn worker thread")?;
        worker_handles.push(handle);
    }
    drop(tx);

    let mut crash: Option<String> = None;
    for handle in worker_handles {
        if let Err(panic) = handle.join() {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            warn!(job_id, %message, "worker crashed; stopping remaining workers");
            // Ask the remaining workers to stop; their buffered results
            // still drain through the aggregator.
            cancel.cancel();
            crash.get_or_insert(message);
        }
    }

    let aggregate_result = aggregator_handle
        .join()
        .map_err(|_| anyhow!("aggregator thread panicked"))?;
    aggregate_result.context("results aggregation failed")?;

    if let Some(message) = crash {
        return Err(anyhow!("worker crashed: {message}"));
    }
    Ok(())
}

struct WorkerState<'a> {
    worker_id: usize,
    job_id: JobId,
    tx: &'a SyncSender<WorkerReport>,
    buffer: Vec<ResultRow>,
    buffer_capacity: usize,
    cadence: PublishCadence,
    passing_pending: u64,
    errored_pending: u64,
}

impl WorkerState<'_> {
    fn record_completed(&mut self) -> bool {
        self.cadence.record()
    }

    fn record_errored(&mut self, count: u64) {
        self.cadence.record_many(count);
        self.errored_pending += count;
    }

    fn record_passing(&mut self, row: ResultRow) -> bool {
        self.buffer.push(row);
        self.passing_pending += 1;
        self.buffer.len() >= self.buffer_capacity
    }

    fn publish(&mut self, final_flush: bool) {
        let completed_delta = self.cadence.take();
        let batch = std::mem::take(&mut self.buffer);
        if completed_delta == 0 && batch.is_empty() && !final_flush {
            return;
        }
        let report = WorkerReport {
            worker_id: self.worker_id,
            completed_delta,
            passing_delta: std::mem::take(&mut self.passing_pending),
            errored_delta: std::mem::take(&mut self.errored_pending),
            batch,
            final_flush,
        };
        // The aggregator outlives every worker sender; a send failure only
        // happens if it already tore down due to a sink error, in which
        // case dropping the report is correct.
        let _ = self.tx.send(report);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    worker_id: usize,
    job_id: JobId,
    config: &JobConfig,
    space: &BranchSpace,
    policy: SplitPolicy,
    shard: Vec<usize>,
    tx: &SyncSender<WorkerReport>,
    cancel: &CancelToken,
    options: SchedulerOptions,
) {
    let mut price_store = PriceStore::with_capacity(&config.data_dir, options.price_cache_capacity);
    let mut indicator_cache = IndicatorCache::new();
    let per_ticker = space.branches_per_ticker();
    let min_bars = space.max_window() as usize + 1;

    let mut state = WorkerState {
        worker_id,
        job_id,
        tx,
        buffer: Vec::with_capacity(options.result_buffer_capacity),
        buffer_capacity: options.result_buffer_capacity.max(1),
        cadence: PublishCadence::new(options.publish_every),
        passing_pending: 0,
        errored_pending: 0,
    };

    'shard: for ticker_index in shard {
        if cancel.is_cancelled() {
            break;
        }
        let ticker = &space.tickers()[ticker_index];

        let series = match price_store.load(ticker) {
            Ok(series) => series,
            Err(error) => {
                warn!(
                    job_id = state.job_id,
                    ticker = %ticker,
                    %error,
                    "missing price data; skipping ticker"
                );
                state.record_errored(per_ticker);
                state.publish(false);
                continue;
            }
        };

        if series.len() < min_bars {
            warn!(
                job_id = state.job_id,
                ticker = %ticker,
                bars = series.len(),
                required = min_bars,
                "degenerate series; skipping ticker"
            );
            state.record_errored(per_ticker);
            state.publish(false);
            continue;
        }

        let (is_mask, oos_mask) = partition(&series.dates, policy);

        for branch in space.ticker_branches(ticker_index) {
            if cancel.is_cancelled() {
                break 'shard;
            }

            let conditions = branch_conditions(&branch);
            let valid_from = warmup_of(&conditions);
            let raw_signal = entry_signal(&conditions, &mut indicator_cache, &series);
            let backtest = run_backtest(&BacktestInputs {
                raw_signal: &raw_signal,
                returns: &series.returns,
                cost_bps: config.cost_bps,
                execution_lag: 1,
            });

            let is_metrics = metrics::compute(
                &backtest.position,
                &backtest.strat_returns,
                &series.dates,
                &is_mask,
                valid_from,
            );
            let oos_metrics = metrics::compute(
                &backtest.position,
                &backtest.strat_returns,
                &series.dates,
                &oos_mask,
                valid_from,
            );

            let mut flush_due = state.record_completed();
            if filter::passes(&is_metrics, &config.filter()) {
                let row =
                    ResultRow::from_branch(state.job_id, ticker, &branch, is_metrics, oos_metrics);
                flush_due |= state.record_passing(row);
            }
            if flush_due {
                state.publish(false);
            }
        }
    }

    state.publish(true);
}
