mod cli;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};

use branchforge_rs::enumerate::BranchSpace;
use branchforge_rs::job::{JobController, JobStatus};
use branchforge_rs::price::fingerprint_tickers;
use branchforge_rs::progress::LogProgressSink;
use branchforge_rs::storage::ResultStore;
use cli::{Cli, Commands, RunArgs};

fn init_tracing(log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (writer, guard) = non_blocking(file);
        // Leak the guard so the non-blocking writer stays alive for the
        // duration of the process without additional plumbing.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer().with_writer(writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn plan(args: &RunArgs) -> Result<()> {
    let config = args.job_config()?;
    let space = BranchSpace::from_config(&config)?;
    info!(
        indicator = %config.indicator,
        tickers = config.tickers.len(),
        branches_per_ticker = space.branches_per_ticker(),
        total_branches = space.total_branches(),
        max_window = space.max_window(),
        "job plan"
    );
    Ok(())
}

fn run(args: &RunArgs) -> Result<JobStatus> {
    let config = args.job_config()?;
    let fingerprints = fingerprint_tickers(&config.data_dir, &config.tickers);
    let fingerprints_json = serde_json::to_value(
        fingerprints
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<std::collections::BTreeMap<String, String>>(),
    )?;

    let job_id = chrono::Utc::now().timestamp_millis() as u64;
    let controller = JobController::new(job_id, config.clone())?;
    info!(
        job_id,
        total_branches = controller.total_branches(),
        workers = config.num_workers,
        output = %args.output_dir.display(),
        "starting branch-generation job"
    );

    let sink = ResultStore::open(&args.output_dir)?;
    let progress = Arc::new(LogProgressSink);
    let job = controller.run(Box::new(sink), progress);

    // A fresh handle for metadata and reporting; the sink handle was
    // consumed by the run.
    let store = ResultStore::open(&args.output_dir)?;
    store.record_job(&job, &config, &fingerprints_json)?;

    info!(
        job_id = job.id,
        status = ?job.status,
        completed = job.completed_branches,
        passing = job.passing_branches,
        errored = job.errored_branches,
        "job finished"
    );
    if let Some(message) = &job.error {
        error!(job_id = job.id, %message, "job error");
    }

    if args.report_top > 0 && job.passing_branches > 0 {
        for (rank, row) in store.top_results(args.report_top)?.iter().enumerate() {
            info!(
                rank = rank + 1,
                ticker = %row.signal_ticker,
                indicator = %row.indicator,
                period = row.period,
                comparator = %row.comparator,
                threshold = row.threshold,
                is_timar = row.is_timar,
                is_cagr = row.is_cagr,
                is_max_dd = row.is_max_dd,
                is_trades = row.is_trades,
                oos_timar = row.oos_timar,
                "top result"
            );
        }
    }

    Ok(job.status)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Commands::Run(args) | Commands::Plan(args) => args.log_file.clone(),
    };
    if let Err(err) = init_tracing(log_file) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    let outcome = match &cli.command {
        Commands::Plan(args) => plan(args).map(|()| JobStatus::Completed),
        Commands::Run(args) => run(args),
    };

    match outcome {
        Ok(JobStatus::Completed) => ExitCode::SUCCESS,
        Ok(JobStatus::Cancelled) => ExitCode::from(2),
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
