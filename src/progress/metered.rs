//! Lifecycle guard for one metered call.

use crate::models::{FinishedCall, ModelCallHandle, ModelCallRequest, UsageChunk};
use crate::progress::ProgressReporter;
use tracing::debug;

/// An open metered call.
///
/// The call is finished exactly once: either explicitly through
/// [`MeteredCall::finish`] or when the guard is dropped. Dropping covers
/// errors returned with `?`, timeouts and cancelled futures, so the ledger
/// never keeps an orphaned open call.
pub struct MeteredCall<'a> {
    reporter: &'a dyn ProgressReporter,
    handle: ModelCallHandle,
    finished: bool,
}

impl<'a> MeteredCall<'a> {
    /// Start a call through `reporter`.
    pub fn start(reporter: &'a dyn ProgressReporter, request: ModelCallRequest) -> Self {
        let handle = reporter.start_model_call(request);
        Self {
            reporter,
            handle,
            finished: false,
        }
    }

    pub fn handle(&self) -> ModelCallHandle {
        self.handle
    }

    /// Merge usage observed so far.
    pub fn record(&self, chunk: &UsageChunk) {
        self.reporter.record_model_usage(self.handle, chunk);
    }

    /// Finish the call and account for it.
    pub fn finish(mut self) -> Option<FinishedCall> {
        self.finished = true;
        self.reporter.finish_model_call(self.handle)
    }
}

impl Drop for MeteredCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                job = self.reporter.job_id(),
                handle = %self.handle,
                "Metered call released without explicit finish"
            );
            self.reporter.finish_model_call(self.handle);
        }
    }
}
