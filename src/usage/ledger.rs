//! Shared usage ledger for metered model calls.
//!
//! Invariants:
//! - Handles come from one counter and are never reused
//! - Finishing an unknown or already finished handle changes nothing
//! - `calls` and `cost_usd` only grow

use crate::checkpoint::write_atomic;
use crate::models::{
    CallUsage, FinishedCall, ModelCallHandle, ModelCallRequest, Result, StagerunError,
    UsageChunk, UsageSummary, UsageTotals,
};
use crate::usage::CostEstimator;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

/// Working record for one open call.
#[derive(Debug)]
struct CallState {
    request: ModelCallRequest,
    usage: CallUsage,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct LedgerState {
    open: HashMap<ModelCallHandle, CallState>,
    totals: UsageTotals,
    models: BTreeMap<String, UsageTotals>,
}

impl LedgerState {
    fn snapshot(&self) -> UsageSummary {
        UsageSummary {
            generated_at: Utc::now(),
            totals: self.totals.clone(),
            models: self.models.clone(),
        }
    }
}

/// Aggregates consumption of every metered call in a run.
///
/// One instance is shared (behind `Arc`) by all jobs. All map and totals
/// updates go through a single mutex.
pub struct UsageLedger {
    next_handle: AtomicU64,
    state: Mutex<LedgerState>,
    chars: AtomicU64,
    estimator: Arc<dyn CostEstimator>,
    updates: watch::Sender<UsageSummary>,
}

impl UsageLedger {
    /// Create a ledger that prices calls with `estimator`.
    pub fn new(estimator: Arc<dyn CostEstimator>) -> Self {
        let (updates, _) = watch::channel(UsageSummary::default());
        Self {
            next_handle: AtomicU64::new(1),
            state: Mutex::new(LedgerState::default()),
            chars: AtomicU64::new(0),
            estimator,
            updates,
        }
    }

    /// Register a new in-flight call.
    pub fn start_call(&self, request: ModelCallRequest) -> ModelCallHandle {
        let handle = ModelCallHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            %handle,
            model = %request.model_id,
            upload_bytes = request.upload_bytes,
            "Model call started"
        );

        self.state.lock().open.insert(
            handle,
            CallState {
                request,
                usage: CallUsage::default(),
                started_at: Instant::now(),
            },
        );
        handle
    }

    /// Merge a usage chunk into an open call.
    ///
    /// Returns false if the handle is not open.
    pub fn record_usage(&self, handle: ModelCallHandle, chunk: &UsageChunk) -> bool {
        match self.state.lock().open.get_mut(&handle) {
            Some(call) => {
                call.usage.merge(chunk);
                true
            }
            None => {
                debug!(%handle, "Usage recorded for a call that is not open");
                false
            }
        }
    }

    /// Close a call and fold its cost and tokens into the totals.
    ///
    /// Returns `None` if the handle is unknown or already finished.
    pub fn finish_call(&self, handle: ModelCallHandle) -> Option<FinishedCall> {
        let call = self.state.lock().open.remove(&handle)?;

        let model_id = call
            .usage
            .model_version
            .clone()
            .unwrap_or_else(|| call.request.model_id.clone());
        let tokens = call.usage.token_totals();
        let cost_usd = self
            .estimator
            .estimate_cost(
                &model_id,
                tokens.as_ref(),
                call.usage.response_images,
                call.request.image_size.as_deref(),
            )
            .max(0.0);

        {
            let mut state = self.state.lock();
            state.totals.fold(cost_usd, tokens.as_ref());
            state
                .models
                .entry(model_id.clone())
                .or_default()
                .fold(cost_usd, tokens.as_ref());
            // Published under the lock: snapshots reach subscribers in fold order
            self.updates.send_replace(state.snapshot());
        }

        debug!(%handle, model = %model_id, cost_usd, "Model call finished");

        Some(FinishedCall {
            handle,
            requested_model: call.request.model_id,
            model_id,
            tokens,
            response_images: call.usage.response_images,
            cost_usd,
            duration: call.started_at.elapsed(),
        })
    }

    /// Count generated characters. Not billed.
    pub fn add_chars(&self, n: u64) {
        self.chars.fetch_add(n, Ordering::Relaxed);
    }

    /// Generated characters reported so far.
    pub fn chars(&self) -> u64 {
        self.chars.load(Ordering::Relaxed)
    }

    /// Number of calls started but not finished.
    pub fn open_calls(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Point-in-time snapshot of all totals.
    pub fn summary(&self) -> UsageSummary {
        self.state.lock().snapshot()
    }

    /// Receive a fresh summary after every finished call.
    pub fn subscribe(&self) -> watch::Receiver<UsageSummary> {
        self.updates.subscribe()
    }

    /// Write the current summary to `path`.
    pub async fn write_summary(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.summary())
            .map_err(|e| StagerunError::Internal(format!("Serializing usage summary: {e}")))?;
        write_atomic(path, content.as_bytes()).await
    }
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("open_calls", &self.open_calls())
            .field("chars", &self.chars())
            .finish()
    }
}
