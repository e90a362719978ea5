use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tempfile::tempdir;

use branchforge_rs::config::{ComparatorChoice, JobConfig, SplitStrategy};
use branchforge_rs::indicator::IndicatorFamily;
use branchforge_rs::job::{JobController, JobStatus};
use branchforge_rs::progress::NullProgressSink;
use branchforge_rs::schedule::SchedulerOptions;
use branchforge_rs::storage::MemorySink;

fn write_series(dir: &Path, ticker: &str, bars: usize) {
    let mut file = File::create(dir.join(format!("{ticker}.csv"))).unwrap();
    writeln!(file, "Date,Open,High,Low,Close,Volume").unwrap();
    let start = NaiveDate::from_ymd_opt(2005, 1, 1).unwrap();
    for i in 0..bars {
        let date = start + chrono::Days::new(i as u64);
        let close = 100.0 + (i as f64 * 0.07).sin() * 10.0 + i as f64 * 0.005;
        writeln!(
            file,
            "{date},{:.4},{:.4},{:.4},{close:.4},{}",
            close - 0.2,
            close + 1.0,
            close - 1.0,
            1_000 + i
        )
        .unwrap();
    }
}

/// A 1000-branch job on one worker, cancelled once at least 50 branches
/// have completed: the terminal status is `cancelled`, the completed count
/// sits strictly inside [50, 1000), and every persisted row is a whole
/// result.
#[test]
fn cancellation_converges_to_a_terminal_status() {
    let dir = tempdir().unwrap();
    write_series(dir.path(), "SLOW", 5_000);

    let config = JobConfig {
        data_dir: dir.path().to_path_buf(),
        indicator: IndicatorFamily::Rsi,
        period_min: 10,
        period_max: 19,
        tickers: vec!["SLOW".to_string()],
        comparator: ComparatorChoice::Both,
        threshold_min: 5.0,
        threshold_max: 29.5,
        threshold_step: 0.5,
        min_tim: 0.0,
        min_timar: 0.0,
        max_dd: 100.0,
        min_trades: 0,
        min_timar_dd: 0.0,
        split_strategy: SplitStrategy::EvenOddMonth,
        oos_start_date: None,
        num_workers: 1,
        cost_bps: 0.0,
        l2: None,
    };

    let controller = JobController::new(11, config).unwrap();
    assert_eq!(controller.total_branches(), 1_000);

    // Publish frequently so the observer sees completion counts early.
    let options = SchedulerOptions {
        num_workers: 1,
        result_buffer_capacity: 100,
        publish_every: 10,
        price_cache_capacity: 8,
    };
    let controller = controller.with_options(options);
    let handle = controller.handle();

    let sink = MemorySink::new();
    let rows = sink.rows();
    let runner = std::thread::spawn(move || {
        controller.run(Box::new(sink), Arc::new(NullProgressSink))
    });

    // Cancel once at least 50 branches are visible.
    let deadline = Instant::now() + Duration::from_secs(30);
    while handle.completed() < 50 {
        assert!(Instant::now() < deadline, "job made no progress");
        std::thread::yield_now();
    }
    handle.cancel();

    let job = runner.join().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_branches >= 50);
    assert!(job.completed_branches < 1_000);
    assert!(job.passing_branches <= job.completed_branches);

    // The cancellation flush drained whole rows only.
    let rows = rows.lock().unwrap();
    assert_eq!(rows.len() as u64, job.passing_branches);
    for row in rows.iter() {
        assert_eq!(row.signal_ticker, "SLOW");
        assert_eq!(row.indicator, "RSI");
        assert!(row.period.is_some());
        assert!(row.threshold >= 5.0 && row.threshold <= 29.5);
    }
}

/// Cancelling before the run starts still converges: workers observe the
/// token at their first between-branch check and drain immediately.
#[test]
fn cancel_before_start_drains_immediately() {
    let dir = tempdir().unwrap();
    write_series(dir.path(), "SLOW", 1_000);

    let config = JobConfig {
        data_dir: dir.path().to_path_buf(),
        indicator: IndicatorFamily::Sma,
        period_min: 5,
        period_max: 14,
        tickers: vec!["SLOW".to_string()],
        comparator: ComparatorChoice::Both,
        threshold_min: 80.0,
        threshold_max: 120.0,
        threshold_step: 1.0,
        min_tim: 0.0,
        min_timar: 0.0,
        max_dd: 100.0,
        min_trades: 0,
        min_timar_dd: 0.0,
        split_strategy: SplitStrategy::EvenOddYear,
        oos_start_date: None,
        num_workers: 1,
        cost_bps: 0.0,
        l2: None,
    };

    let controller = JobController::new(12, config).unwrap();
    let handle = controller.handle();
    handle.cancel();

    let job = controller.run(Box::new(MemorySink::new()), Arc::new(NullProgressSink));
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_branches < job.total_branches);
}
