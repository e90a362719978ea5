use std::fs::File;
use std::io::Write;
use std::process::Command;

use tempfile::tempdir;

fn write_sample_prices(dir: &std::path::Path, ticker: &str, bars: usize) {
    let mut file = File::create(dir.join(format!("{ticker}.csv"))).unwrap();
    writeln!(file, "Date,Open,High,Low,Close,Volume").unwrap();
    let start = chrono::NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
    for i in 0..bars {
        let date = start + chrono::Days::new(i as u64);
        let close = 100.0 + (i as f64 * 0.13).sin() * 6.0;
        writeln!(
            file,
            "{date},{:.4},{:.4},{:.4},{close:.4},{}",
            close - 0.2,
            close + 1.0,
            close - 1.0,
            2_000 + i
        )
        .unwrap();
    }
}

#[test]
fn plan_reports_the_branch_count() {
    let data_dir = tempdir().unwrap();
    write_sample_prices(data_dir.path(), "SPY", 200);
    let out_dir = tempdir().unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_branchforge"))
        .args([
            "plan",
            "--data-dir",
            data_dir.path().to_str().unwrap(),
            "--indicator",
            "RSI",
            "--period-min",
            "10",
            "--period-max",
            "15",
            "--tickers",
            "SPY",
            "--threshold-min",
            "20",
            "--threshold-max",
            "80",
            "--threshold-step",
            "5",
            "--workers",
            "1",
            "--output-dir",
            out_dir.path().to_str().unwrap(),
        ])
        .status()
        .expect("failed to spawn branchforge");
    assert!(status.success(), "branchforge plan exited with {status:?}");
}

#[test]
fn run_produces_result_parts_and_a_catalog() {
    let data_dir = tempdir().unwrap();
    write_sample_prices(data_dir.path(), "SPY", 400);
    let out_dir = tempdir().unwrap();
    let output = out_dir.path().join("forge_output");

    let status = Command::new(env!("CARGO_BIN_EXE_branchforge"))
        .args([
            "run",
            "--data-dir",
            data_dir.path().to_str().unwrap(),
            "--indicator",
            "SMA",
            "--period-min",
            "5",
            "--period-max",
            "6",
            "--tickers",
            "SPY",
            "--threshold-min",
            "95",
            "--threshold-max",
            "105",
            "--threshold-step",
            "5",
            "--workers",
            "1",
            "--output-dir",
            output.to_str().unwrap(),
        ])
        .status()
        .expect("failed to spawn branchforge");
    assert!(status.success(), "branchforge run exited with {status:?}");

    assert!(output.join("results.duckdb").exists());
    assert!(output.join("results_parquet").exists());
}
