//! Bounded job scheduler.
//!
//! Runs one handler invocation per item with at most `concurrency` alive at
//! once. Each job gets its own reporter. Results come back index-aligned with
//! the input regardless of completion order.

use crate::models::{Result, SchedulerConfig, StagerunError, StatusMode};
use crate::progress::{JobReporter, ProgressReporter, StatusBoard};
use crate::usage::UsageLedger;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

const NO_FAILURE: usize = usize::MAX;

/// A batch of items to run.
pub struct JobSpec<T> {
    /// Items, dispatched in order
    pub items: Vec<T>,
    /// Max handlers alive at once
    pub concurrency: usize,
    /// Run label for the status display
    pub label: String,
    /// How job activity is shown
    pub status_mode: StatusMode,
    /// Ledger every job reports usage into
    pub ledger: Arc<UsageLedger>,
}

impl<T> JobSpec<T> {
    pub fn new(label: impl Into<String>, items: Vec<T>, ledger: Arc<UsageLedger>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            items,
            concurrency: defaults.concurrency,
            label: label.into(),
            status_mode: defaults.status,
            ledger,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_status_mode(mut self, status_mode: StatusMode) -> Self {
        self.status_mode = status_mode;
        self
    }

    /// Apply `[scheduler]` settings from config.
    pub fn with_config(self, config: &SchedulerConfig) -> Self {
        self.with_concurrency(config.concurrency)
            .with_status_mode(config.status)
    }

    /// Concurrency actually used: within `[1, max(1, items)]`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, self.items.len().max(1))
    }
}

/// Run `handler` over every item of `spec`.
///
/// On the first failing item (first by time) no further items are
/// dispatched; jobs already running finish, then that item's error is
/// returned as-is. A fatal error ([`StagerunError::is_fatal`]) aborts the
/// jobs still running and is returned at once. A panicking handler fails its
/// item with [`StagerunError::JobPanicked`].
pub async fn run_jobs<T, R, G, H, Fut>(
    spec: JobSpec<T>,
    get_id: G,
    handler: H,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    G: Fn(&T) -> String,
    H: Fn(T, JobReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let total = spec.items.len();
    if total == 0 {
        debug!(run = %spec.label, "No items to run");
        return Ok(Vec::new());
    }

    let concurrency = spec.effective_concurrency();
    let board = Arc::new(StatusBoard::new(spec.label.clone(), spec.status_mode, total));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let handler = Arc::new(handler);
    let first_failure = Arc::new(AtomicUsize::new(NO_FAILURE));

    debug!(run = %spec.label, items = total, concurrency, "Starting jobs");

    let mut ids = Vec::with_capacity(total);
    let mut tasks = JoinSet::new();

    for (index, item) in spec.items.into_iter().enumerate() {
        if first_failure.load(Ordering::SeqCst) != NO_FAILURE {
            break;
        }

        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|_| StagerunError::Internal("Semaphore closed".to_string()))?;

        // A failing job flags itself before releasing its permit
        if first_failure.load(Ordering::SeqCst) != NO_FAILURE {
            break;
        }

        let id = get_id(&item);
        ids.push(id.clone());

        let handler = Arc::clone(&handler);
        let board = Arc::clone(&board);
        let ledger = Arc::clone(&spec.ledger);
        let first_failure = Arc::clone(&first_failure);

        tasks.spawn(async move {
            let _permit = permit;
            board.job_started(&id);
            let reporter = JobReporter::new(id.clone(), ledger, Arc::clone(&board));

            let job = {
                let reporter = reporter.clone();
                async move { handler(item, reporter).await }
            };
            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(StagerunError::JobPanicked { id: id.clone() }),
            };

            match &outcome {
                Ok(_) => board.job_finished(&id),
                Err(e) => {
                    reporter.log(&format!("failed: {e}"));
                    board.job_failed(&id, &e.to_string());
                    let _ = first_failure.compare_exchange(
                        NO_FAILURE,
                        index,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
            (index, outcome)
        });
    }

    let started = ids.len();
    let mut results: Vec<Option<R>> = (0..started).map(|_| None).collect();
    let mut errors: HashMap<usize, StagerunError> = HashMap::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(value))) => results[index] = Some(value),
            Ok((index, Err(e))) if e.is_fatal() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                for id in board.active_jobs() {
                    board.job_failed(&id, "aborted");
                }
                board.finish("aborted");
                debug!(
                    run = %spec.label,
                    item = %ids[index],
                    started,
                    "Run aborted on fatal error"
                );
                return Err(e);
            }
            Ok((index, Err(e))) => {
                errors.insert(index, e);
            }
            Err(e) => debug!(run = %spec.label, error = %e, "Job task did not complete"),
        }
    }

    let failed_at = first_failure.load(Ordering::SeqCst);
    if failed_at != NO_FAILURE {
        board.finish("failed");
        debug!(
            run = %spec.label,
            item = %ids[failed_at],
            started,
            skipped = total - started,
            "Run aborted"
        );
        return Err(errors
            .remove(&failed_at)
            .unwrap_or_else(|| StagerunError::item(ids[failed_at].clone(), "job failed")));
    }

    board.finish("done");
    let values: Option<Vec<R>> = results.into_iter().collect();
    let values =
        values.ok_or_else(|| StagerunError::Internal("Job result missing".to_string()))?;
    if values.len() != total {
        return Err(StagerunError::Internal(format!(
            "Dispatched {started} of {total} items without a failure"
        )));
    }

    let summary = spec.ledger.summary();
    debug!(
        run = %spec.label,
        items = total,
        calls = summary.totals.calls,
        cost = format!("${:.4}", summary.totals.cost_usd),
        "All jobs finished"
    );
    Ok(values)
}
