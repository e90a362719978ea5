use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::JobConfig;
use crate::enumerate::BranchSpace;
use crate::progress::{ProgressSink, ProgressSnapshot};
use crate::schedule::{CancelToken, SchedulerOptions, run_scheduler};
use crate::storage::ResultsSink;

pub type JobId = u64;

/// Job lifecycle: `pending -> running -> {completed, cancelled, failed}`.
/// Terminal states are final; there is no resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Monotonic per-job counters, owned by the aggregator. Workers publish
/// deltas and never read these.
#[derive(Debug, Default)]
pub struct JobCounters {
    completed: AtomicU64,
    passing: AtomicU64,
    errored: AtomicU64,
}

impl JobCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, completed: u64, passing: u64, errored: u64) {
        self.completed.fetch_add(completed, Ordering::Relaxed);
        self.passing.fetch_add(passing, Ordering::Relaxed);
        self.errored.fetch_add(errored, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn passing(&self) -> u64 {
        self.passing.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }
}

/// Terminal record of one job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub total_branches: u64,
    pub completed_branches: u64,
    pub passing_branches: u64,
    pub errored_branches: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Cloneable handle for observing and cancelling a running job from another
/// thread.
#[derive(Clone)]
pub struct JobHandle {
    job_id: JobId,
    total_branches: u64,
    cancel: CancelToken,
    counters: Arc<JobCounters>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed()
    }

    pub fn passing(&self) -> u64 {
        self.counters.passing()
    }

    pub fn total_branches(&self) -> u64 {
        self.total_branches
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Owns one job from config acceptance to terminal status. Construction
/// validates the config and sizes the search space; [`JobController::run`]
/// blocks until the scheduler drains.
pub struct JobController {
    id: JobId,
    config: Arc<JobConfig>,
    space: BranchSpace,
    cancel: CancelToken,
    counters: Arc<JobCounters>,
    options: SchedulerOptions,
    created_at: DateTime<Utc>,
}

impl JobController {
    pub fn new(id: JobId, config: JobConfig) -> Result<Self> {
        config.validate()?;
        let space = BranchSpace::from_config(&config)?;
        let options = SchedulerOptions::from_config(&config);
        Ok(Self {
            id,
            config: Arc::new(config),
            space,
            cancel: CancelToken::new(),
            counters: Arc::new(JobCounters::new()),
            options,
            created_at: Utc::now(),
        })
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn total_branches(&self) -> u64 {
        self.space.total_branches()
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id,
            total_branches: self.space.total_branches(),
            cancel: self.cancel.clone(),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Drive the job to a terminal status. A worker crash or sink failure
    /// yields `failed`; a cancellation observed by the token yields
    /// `cancelled` once all workers have drained; otherwise the job
    /// completes with `completed == total`.
    pub fn run(self, sink: Box<dyn ResultsSink>, progress: Arc<dyn ProgressSink>) -> Job {
        let total = self.space.total_branches();
        progress.publish(&ProgressSnapshot {
            job_id: self.id,
            completed: 0,
            total,
            passing: 0,
            errored: 0,
            status: JobStatus::Running,
        });

        let outcome = run_scheduler(
            self.id,
            Arc::clone(&self.config),
            &self.space,
            sink,
            Arc::clone(&progress),
            self.cancel.clone(),
            Arc::clone(&self.counters),
            self.options,
        );

        let completed = self.counters.completed();
        let (status, error) = match outcome {
            Err(error) => (JobStatus::Failed, Some(format!("{error:#}"))),
            Ok(()) if self.cancel.is_cancelled() => (JobStatus::Cancelled, None),
            Ok(()) if completed != total => (
                JobStatus::Failed,
                Some(format!(
                    "scheduler exited with {completed} of {total} branches accounted for"
                )),
            ),
            Ok(()) => (JobStatus::Completed, None),
        };

        let job = Job {
            id: self.id,
            status,
            total_branches: total,
            completed_branches: completed,
            passing_branches: self.counters.passing(),
            errored_branches: self.counters.errored(),
            error,
            created_at: self.created_at,
            finished_at: Some(Utc::now()),
        };

        progress.publish(&ProgressSnapshot {
            job_id: job.id,
            completed: job.completed_branches,
            total: job.total_branches,
            passing: job.passing_branches,
            errored: job.errored_branches,
            status: job.status,
        });
        job
    }
}
