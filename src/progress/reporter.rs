//! Per-job progress and usage reporting.
//!
//! A reporter is handed to each job and passed down to whatever code makes
//! metered calls, so leaf code can account for usage without the scheduler
//! knowing about it.

use crate::models::{FinishedCall, ModelCallHandle, ModelCallRequest, UsageChunk};
use crate::progress::StatusBoard;
use crate::usage::UsageLedger;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Identity of one started stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle(u64);

/// Progress and usage channel for one job.
pub trait ProgressReporter: Send + Sync {
    /// Id of the job this reporter belongs to.
    fn job_id(&self) -> &str;

    /// Free-form diagnostic text.
    fn log(&self, message: &str);

    /// Mark a named phase as running.
    fn start_stage(&self, name: &str) -> StageHandle;

    /// Mark a phase as done. Unknown handles are ignored.
    fn finish_stage(&self, handle: StageHandle);

    /// Override the displayed running phases; `None` goes back to tracked stages.
    fn set_active_stages(&self, names: Option<&[String]>);

    /// Register an in-flight metered call.
    fn start_model_call(&self, request: ModelCallRequest) -> ModelCallHandle;

    /// Merge usage observed so far for a call.
    fn record_model_usage(&self, handle: ModelCallHandle, chunk: &UsageChunk);

    /// Close a call and account for it. `None` if it was not open.
    fn finish_model_call(&self, handle: ModelCallHandle) -> Option<FinishedCall>;

    /// Count generated characters (informational, not billed).
    fn report_chars(&self, n: u64);
}

/// Consumption attributed to one job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobUsage {
    pub calls: u64,
    pub cost_usd: f64,
    pub chars: u64,
}

#[derive(Default)]
struct StageTracker {
    running: Vec<(StageHandle, String)>,
    display_override: Option<Vec<String>>,
}

impl StageTracker {
    fn displayed(&self) -> Vec<String> {
        match &self.display_override {
            Some(names) => names.clone(),
            None => self.running.iter().map(|(_, name)| name.clone()).collect(),
        }
    }
}

struct JobInner {
    job_id: String,
    ledger: Arc<UsageLedger>,
    board: Arc<StatusBoard>,
    next_stage: AtomicU64,
    stages: Mutex<StageTracker>,
    usage: Mutex<JobUsage>,
}

/// Reporter the scheduler gives to each job.
///
/// Forwards call accounting to the shared ledger and activity to the status
/// board. Cloning is cheap and clones report for the same job.
#[derive(Clone)]
pub struct JobReporter {
    inner: Arc<JobInner>,
}

impl JobReporter {
    pub fn new(
        job_id: impl Into<String>,
        ledger: Arc<UsageLedger>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                job_id: job_id.into(),
                ledger,
                board,
                next_stage: AtomicU64::new(1),
                stages: Mutex::new(StageTracker::default()),
                usage: Mutex::new(JobUsage::default()),
            }),
        }
    }

    /// Shared ledger this job reports into.
    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.inner.ledger
    }

    /// Calls, cost and characters reported by this job so far.
    pub fn usage(&self) -> JobUsage {
        *self.inner.usage.lock()
    }

    fn push_stages(&self, tracker: &StageTracker) {
        self.inner
            .board
            .job_stages(&self.inner.job_id, &tracker.displayed());
    }
}

impl ProgressReporter for JobReporter {
    fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    fn log(&self, message: &str) {
        self.inner.board.job_log(&self.inner.job_id, message);
    }

    fn start_stage(&self, name: &str) -> StageHandle {
        let handle = StageHandle(self.inner.next_stage.fetch_add(1, Ordering::Relaxed));
        let mut tracker = self.inner.stages.lock();
        tracker.running.push((handle, name.to_string()));
        self.push_stages(&tracker);
        debug!(job = %self.inner.job_id, stage = name, "Stage started");
        handle
    }

    fn finish_stage(&self, handle: StageHandle) {
        let mut tracker = self.inner.stages.lock();
        if let Some(pos) = tracker.running.iter().position(|(h, _)| *h == handle) {
            let (_, name) = tracker.running.remove(pos);
            debug!(job = %self.inner.job_id, stage = %name, "Stage finished");
            self.push_stages(&tracker);
        }
    }

    fn set_active_stages(&self, names: Option<&[String]>) {
        let mut tracker = self.inner.stages.lock();
        tracker.display_override = names.map(<[String]>::to_vec);
        self.push_stages(&tracker);
    }

    fn start_model_call(&self, request: ModelCallRequest) -> ModelCallHandle {
        self.inner.ledger.start_call(request)
    }

    fn record_model_usage(&self, handle: ModelCallHandle, chunk: &UsageChunk) {
        self.inner.ledger.record_usage(handle, chunk);
    }

    fn finish_model_call(&self, handle: ModelCallHandle) -> Option<FinishedCall> {
        let finished = self.inner.ledger.finish_call(handle)?;
        {
            let mut usage = self.inner.usage.lock();
            usage.calls = usage.calls.saturating_add(1);
            usage.cost_usd += finished.cost_usd;
        }
        self.inner
            .board
            .job_cost(&self.inner.job_id, finished.cost_usd);
        Some(finished)
    }

    fn report_chars(&self, n: u64) {
        self.inner.ledger.add_chars(n);
        let mut usage = self.inner.usage.lock();
        usage.chars = usage.chars.saturating_add(n);
    }
}

/// Reporter that accounts for nothing.
///
/// Hands out handles so call sites work unchanged, but never records usage
/// and never finishes anything.
pub struct NoopReporter {
    job_id: String,
    next: AtomicU64,
}

impl NoopReporter {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl ProgressReporter for NoopReporter {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn log(&self, _message: &str) {}

    fn start_stage(&self, _name: &str) -> StageHandle {
        StageHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn finish_stage(&self, _handle: StageHandle) {}

    fn set_active_stages(&self, _names: Option<&[String]>) {}

    fn start_model_call(&self, _request: ModelCallRequest) -> ModelCallHandle {
        ModelCallHandle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn record_model_usage(&self, _handle: ModelCallHandle, _chunk: &UsageChunk) {}

    fn finish_model_call(&self, _handle: ModelCallHandle) -> Option<FinishedCall> {
        None
    }

    fn report_chars(&self, _n: u64) {}
}
