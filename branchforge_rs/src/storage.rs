use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use polars::io::parquet::{ParquetCompression, ParquetWriter};
use polars::prelude::*;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::enumerate::Branch;
use crate::job::Job;
use crate::metrics::MetricTuple;

/// One persisted passing branch: the branch coordinates plus both metric
/// tuples. Appended once, never mutated.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub job_id: u64,
    pub signal_ticker: String,
    pub invest_ticker: String,
    pub indicator: String,
    pub period: Option<u32>,
    pub comparator: String,
    pub threshold: f64,
    pub l2_indicator: Option<String>,
    pub l2_period: Option<u32>,
    pub l2_comparator: Option<String>,
    pub l2_threshold: Option<f64>,
    pub is_metrics: MetricTuple,
    pub oos_metrics: MetricTuple,
    pub created_at: DateTime<Utc>,
}

impl ResultRow {
    /// Build a row from a passing branch. The invest ticker defaults to the
    /// signal ticker.
    pub fn from_branch(
        job_id: u64,
        ticker: &str,
        branch: &Branch,
        is_metrics: MetricTuple,
        oos_metrics: MetricTuple,
    ) -> Self {
        Self {
            job_id,
            signal_ticker: ticker.to_string(),
            invest_ticker: ticker.to_string(),
            indicator: branch.family.name().to_string(),
            period: branch.window,
            comparator: branch.comparator.label().to_string(),
            threshold: branch.threshold,
            l2_indicator: branch.l2.map(|l2| l2.family.name().to_string()),
            l2_period: branch.l2.and_then(|l2| l2.window),
            l2_comparator: branch.l2.map(|l2| l2.comparator.label().to_string()),
            l2_threshold: branch.l2.map(|l2| l2.threshold),
            is_metrics,
            oos_metrics,
            created_at: Utc::now(),
        }
    }
}

/// Append-only destination for passing branches. The aggregator is the only
/// writer; implementations do not need interior synchronization.
pub trait ResultsSink: Send {
    fn append(&mut self, rows: &[ResultRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// In-memory sink for tests and embedding callers.
#[derive(Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<ResultRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle onto the collected rows, readable while the job runs.
    pub fn rows(&self) -> Arc<Mutex<Vec<ResultRow>>> {
        Arc::clone(&self.rows)
    }
}

impl ResultsSink for MemorySink {
    fn append(&mut self, rows: &[ResultRow]) -> Result<()> {
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Compact row used by the inspection query.
#[derive(Debug, Clone)]
pub struct TopResult {
    pub signal_ticker: String,
    pub indicator: String,
    pub period: Option<u32>,
    pub comparator: String,
    pub threshold: f64,
    pub is_timar: f64,
    pub is_cagr: f64,
    pub is_max_dd: f64,
    pub is_trades: u32,
    pub oos_timar: f64,
}

/// Durable results store: one Zstd Parquet part per appended batch under
/// `results_parquet/`, a DuckDB catalog with job metadata, and a `results`
/// view unioning the parts for ad-hoc inspection.
pub struct ResultStore {
    results_dir: PathBuf,
    conn: Connection,
    batch_counter: usize,
}

impl ResultStore {
    pub fn open(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("unable to create {}", output_dir.display()))?;
        let results_dir = output_dir.join("results_parquet");
        fs::create_dir_all(&results_dir)
            .with_context(|| format!("unable to create {}", results_dir.display()))?;

        let db_path = output_dir.join("results.duckdb");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("unable to open {}", db_path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id BIGINT PRIMARY KEY,
                status TEXT NOT NULL,
                total_branches BIGINT NOT NULL,
                completed_branches BIGINT NOT NULL,
                passing_branches BIGINT NOT NULL,
                errored_branches BIGINT NOT NULL,
                error TEXT,
                config TEXT NOT NULL,
                price_fingerprints TEXT NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT
            )",
            [],
        )?;

        let batch_counter = existing_batch_count(&results_dir)?;
        let store = Self {
            results_dir,
            conn,
            batch_counter,
        };
        store.refresh_view()?;
        Ok(store)
    }

    /// Record or update one job's metadata. Called when the job starts and
    /// again at its terminal status.
    pub fn record_job(
        &self,
        job: &Job,
        config: &JobConfig,
        price_fingerprints: &serde_json::Value,
    ) -> Result<()> {
        let config_json = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO jobs (
                job_id, status, total_branches, completed_branches,
                passing_branches, errored_branches, error, config,
                price_fingerprints, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                job.id as i64,
                format!("{:?}", job.status).to_lowercase(),
                job.total_branches as i64,
                job.completed_branches as i64,
                job.passing_branches as i64,
                job.errored_branches as i64,
                job.error.as_deref(),
                config_json,
                price_fingerprints.to_string(),
                job.created_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Inspection query over the cumulative surface, best in-sample TIMAR
    /// first.
    pub fn top_results(&self, limit: usize) -> Result<Vec<TopResult>> {
        if limit == 0 || !has_parquet_files(&self.results_dir)? {
            return Ok(Vec::new());
        }
        self.refresh_view()?;

        let mut stmt = self.conn.prepare(
            "SELECT signal_ticker, indicator, period, comparator, threshold,
                    is_timar, is_cagr, is_max_dd, is_trades, oos_timar
             FROM results
             ORDER BY is_timar DESC
             LIMIT ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(TopResult {
                signal_ticker: row.get(0)?,
                indicator: row.get(1)?,
                period: row.get::<_, Option<i64>>(2)?.map(|p| p as u32),
                comparator: row.get(3)?,
                threshold: row.get(4)?,
                is_timar: row.get(5)?,
                is_cagr: row.get(6)?,
                is_max_dd: row.get(7)?,
                is_trades: row.get::<_, i64>(8)? as u32,
                oos_timar: row.get(9)?,
            });
        }
        Ok(out)
    }

    /// Rebuild the `results` view over every readable Parquet part.
    fn refresh_view(&self) -> Result<()> {
        if !has_parquet_files(&self.results_dir)? {
            return Ok(());
        }

        let mut parts: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.results_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("part-") && name.ends_with(".parquet") {
                parts.push(entry.path());
            }
        }
        parts.sort();

        let mut selects: Vec<String> = Vec::new();
        for path in parts {
            let path_display = path.display().to_string();
            let escaped = path_display.replace('\'', "''");
            let probe = format!("SELECT COUNT(*) FROM read_parquet('{escaped}')");
            match self.conn.prepare(&probe)?.query([]) {
                Ok(_) => selects.push(format!("SELECT * FROM read_parquet('{escaped}')")),
                Err(error) => {
                    warn!(file = %path_display, ?error, "skipping unreadable Parquet part");
                }
            }
        }
        if selects.is_empty() {
            return Ok(());
        }

        let view_sql = format!(
            "CREATE OR REPLACE VIEW results AS {}",
            selects.join(" UNION ALL ")
        );
        self.conn.execute(&view_sql, [])?;
        Ok(())
    }
}

impl ResultsSink for ResultStore {
    fn append(&mut self, rows: &[ResultRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut df = build_batch_frame(rows)?;

        let filename = format!("part-{:016}.parquet", self.batch_counter);
        let file_path = self.results_dir.join(&filename);
        self.batch_counter += 1;

        let mut file = File::create(&file_path)
            .with_context(|| format!("unable to create {}", file_path.display()))?;
        ParquetWriter::new(&mut file)
            .with_compression(ParquetCompression::Zstd(None))
            .finish(&mut df)
            .context("failed to write Parquet batch")?;

        info!(rows = rows.len(), part = %filename, "appended result batch");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.refresh_view()?;
        self.conn.execute("CHECKPOINT", [])?;
        Ok(())
    }
}

fn build_batch_frame(rows: &[ResultRow]) -> Result<DataFrame> {
    let mut columns = vec![
        Series::new(
            "job_id",
            rows.iter().map(|r| r.job_id as i64).collect::<Vec<i64>>(),
        ),
        Series::new(
            "signal_ticker",
            rows.iter()
                .map(|r| r.signal_ticker.as_str())
                .collect::<Vec<&str>>(),
        ),
        Series::new(
            "invest_ticker",
            rows.iter()
                .map(|r| r.invest_ticker.as_str())
                .collect::<Vec<&str>>(),
        ),
        Series::new(
            "indicator",
            rows.iter()
                .map(|r| r.indicator.as_str())
                .collect::<Vec<&str>>(),
        ),
        Series::new(
            "period",
            rows.iter()
                .map(|r| r.period.map(|p| p as i64))
                .collect::<Vec<Option<i64>>>(),
        ),
        Series::new(
            "comparator",
            rows.iter()
                .map(|r| r.comparator.as_str())
                .collect::<Vec<&str>>(),
        ),
        Series::new(
            "threshold",
            rows.iter().map(|r| r.threshold).collect::<Vec<f64>>(),
        ),
        Series::new(
            "l2_indicator",
            rows.iter()
                .map(|r| r.l2_indicator.clone())
                .collect::<Vec<Option<String>>>(),
        ),
        Series::new(
            "l2_period",
            rows.iter()
                .map(|r| r.l2_period.map(|p| p as i64))
                .collect::<Vec<Option<i64>>>(),
        ),
        Series::new(
            "l2_comparator",
            rows.iter()
                .map(|r| r.l2_comparator.clone())
                .collect::<Vec<Option<String>>>(),
        ),
        Series::new(
            "l2_threshold",
            rows.iter()
                .map(|r| r.l2_threshold)
                .collect::<Vec<Option<f64>>>(),
        ),
    ];
    columns.extend(metric_columns("is", rows, |r| &r.is_metrics));
    columns.extend(metric_columns("oos", rows, |r| &r.oos_metrics));
    columns.push(Series::new(
        "created_at",
        rows.iter()
            .map(|r| r.created_at.to_rfc3339())
            .collect::<Vec<String>>(),
    ));

    DataFrame::new(columns).context("failed to assemble result batch frame")
}

fn metric_columns<'a>(
    prefix: &str,
    rows: &'a [ResultRow],
    select: impl Fn(&'a ResultRow) -> &'a MetricTuple,
) -> Vec<Series> {
    let collect = |f: &dyn Fn(&MetricTuple) -> f64| -> Vec<f64> {
        rows.iter().map(|r| f(select(r))).collect()
    };
    vec![
        Series::new(&format!("{prefix}_tim"), collect(&|m| m.tim)),
        Series::new(&format!("{prefix}_cagr"), collect(&|m| m.cagr)),
        Series::new(&format!("{prefix}_timar"), collect(&|m| m.timar)),
        Series::new(&format!("{prefix}_max_dd"), collect(&|m| m.max_dd)),
        Series::new(&format!("{prefix}_timar_dd"), collect(&|m| m.timar_dd)),
        Series::new(
            &format!("{prefix}_trades"),
            rows.iter()
                .map(|r| select(r).trades as i64)
                .collect::<Vec<i64>>(),
        ),
        Series::new(&format!("{prefix}_avg_hold"), collect(&|m| m.avg_hold)),
        Series::new(&format!("{prefix}_sharpe"), collect(&|m| m.sharpe)),
        Series::new(&format!("{prefix}_dd3"), collect(&|m| m.dd3)),
        Series::new(&format!("{prefix}_dd50"), collect(&|m| m.dd50)),
        Series::new(&format!("{prefix}_dd95"), collect(&|m| m.dd95)),
        Series::new(&format!("{prefix}_timar3"), collect(&|m| m.timar3)),
    ]
}

fn has_parquet_files(results_dir: &Path) -> Result<bool> {
    Ok(existing_batch_count(results_dir)? > 0)
}

fn existing_batch_count(results_dir: &Path) -> Result<usize> {
    if !results_dir.exists() {
        return Ok(0);
    }
    let mut count = 0usize;
    for entry in fs::read_dir(results_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("part-") && name.ends_with(".parquet") {
            count += 1;
        }
    }
    Ok(count)
}
