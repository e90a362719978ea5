use std::sync::Arc;
use std::sync::mpsc::Receiver;

use anyhow::Result;

use crate::job::{JobCounters, JobId, JobStatus};
use crate::progress::{ProgressSink, ProgressSnapshot};
use crate::storage::{ResultRow, ResultsSink};

/// One message from a worker: additive counter deltas plus any buffered
/// result rows. `final_flush` marks the worker's last message for its
/// shard (or its cancellation flush), which releases pending rows below
/// the minimum write size.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub completed_delta: u64,
    pub passing_delta: u64,
    pub errored_delta: u64,
    pub batch: Vec<ResultRow>,
    pub final_flush: bool,
}

/// Minimum rows per sink write, matching the result-buffer default.
pub const DEFAULT_MIN_WRITE_ROWS: usize = 100;

/// Single-threaded consumer of worker reports. Owns the results sink and
/// the job counters: deltas are additive, so the final counts are correct
/// in any arrival order, and every published snapshot is monotonic.
pub struct Aggregator {
    job_id: JobId,
    total_branches: u64,
    sink: Box<dyn ResultsSink>,
    progress: Arc<dyn ProgressSink>,
    counters: Arc<JobCounters>,
    min_write_rows: usize,
    pending: Vec<ResultRow>,
}

impl Aggregator {
    pub fn new(
        job_id: JobId,
        total_branches: u64,
        sink: Box<dyn ResultsSink>,
        progress: Arc<dyn ProgressSink>,
        counters: Arc<JobCounters>,
    ) -> Self {
        Self {
            job_id,
            total_branches,
            sink,
            progress,
            counters,
            min_write_rows: DEFAULT_MIN_WRITE_ROWS,
            pending: Vec::new(),
        }
    }

    pub fn with_min_write_rows(mut self, min_write_rows: usize) -> Self {
        self.min_write_rows = min_write_rows.max(1);
        self
    }

    /// Drain reports until every worker sender is gone, then flush the sink.
    pub fn run(mut self, reports: Receiver<WorkerReport>) -> Result<()> {
        for report in reports {
            self.apply(report)?;
        }
        if !self.pending.is_empty() {
            let rows = std::mem::take(&mut self.pending);
            self.sink.append(&rows)?;
        }
        self.sink.flush()
    }

    fn apply(&mut self, report: WorkerReport) -> Result<()> {
        self.counters.add(
            report.completed_delta,
            report.passing_delta,
            report.errored_delta,
        );

        self.pending.extend(report.batch);
        if !self.pending.is_empty()
            && (report.final_flush || self.pending.len() >= self.min_write_rows)
        {
            let rows = std::mem::take(&mut self.pending);
            self.sink.append(&rows)?;
        }

        self.progress.publish(&ProgressSnapshot {
            job_id: self.job_id,
            completed: self.counters.completed(),
            total: self.total_branches,
            passing: self.counters.passing(),
            errored: self.counters.errored(),
            status: JobStatus::Running,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgressSink;
    use crate::storage::MemorySink;
    use std::sync::mpsc;

    fn report(worker_id: usize, completed: u64, rows: Vec<ResultRow>, final_flush: bool) -> WorkerReport {
        WorkerReport {
            worker_id,
            completed_delta: completed,
            passing_delta: rows.len() as u64,
            errored_delta: 0,
            batch: rows,
            final_flush,
        }
    }

    fn sample_rows(n: usize) -> Vec<ResultRow> {
        use crate::config::Comparator;
        use crate::enumerate::Branch;
        use crate::indicator::IndicatorFamily;
        use crate::metrics::MetricTuple;

        (0..n)
            .map(|i| {
                let branch = Branch {
                    ticker_index: 0,
                    family: IndicatorFamily::Rsi,
                    window: Some(14),
                    comparator: Comparator::Lt,
                    threshold: 10.0 + i as f64,
                    l2: None,
                };
                ResultRow::from_branch(1, "SPY", &branch, MetricTuple::zeroed(), MetricTuple::zeroed())
            })
            .collect()
    }

    #[test]
    fn deltas_sum_in_any_arrival_order() {
        let counters = Arc::new(JobCounters::new());
        let sink = MemorySink::new();
        let aggregator = Aggregator::new(
            1,
            100,
            Box::new(sink),
            Arc::new(NullProgressSink),
            Arc::clone(&counters),
        );

        let (tx, rx) = mpsc::sync_channel(8);
        tx.send(report(1, 30, Vec::new(), false)).unwrap();
        tx.send(report(0, 20, Vec::new(), false)).unwrap();
        tx.send(report(1, 25, Vec::new(), true)).unwrap();
        tx.send(report(0, 25, Vec::new(), true)).unwrap();
        drop(tx);

        aggregator.run(rx).unwrap();
        assert_eq!(counters.completed(), 100);
    }

    #[test]
    fn small_batches_are_held_until_the_minimum() {
        let counters = Arc::new(JobCounters::new());
        let sink = MemorySink::new();
        let rows_handle = sink.rows();
        let aggregator = Aggregator::new(
            1,
            100,
            Box::new(sink),
            Arc::new(NullProgressSink),
            Arc::clone(&counters),
        )
        .with_min_write_rows(10);

        let (tx, rx) = mpsc::sync_channel(8);
        let agg_thread = std::thread::spawn(move || aggregator.run(rx));

        tx.send(report(0, 3, sample_rows(3), false)).unwrap();
        tx.send(report(0, 4, sample_rows(4), false)).unwrap();
        // 7 rows so far: below the minimum, nothing written yet. The final
        // flush releases them regardless of size.
        tx.send(report(0, 2, sample_rows(2), true)).unwrap();
        drop(tx);
        agg_thread.join().unwrap().unwrap();

        assert_eq!(rows_handle.lock().unwrap().len(), 9);
        assert_eq!(counters.passing(), 9);
    }

    #[test]
    fn leftover_rows_are_written_at_shutdown() {
        let counters = Arc::new(JobCounters::new());
        let sink = MemorySink::new();
        let rows_handle = sink.rows();
        let aggregator = Aggregator::new(
            1,
            10,
            Box::new(sink),
            Arc::new(NullProgressSink),
            Arc::clone(&counters),
        )
        .with_min_write_rows(100);

        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(report(0, 5, sample_rows(5), false)).unwrap();
        drop(tx);
        aggregator.run(rx).unwrap();
        assert_eq!(rows_handle.lock().unwrap().len(), 5);
    }
}
