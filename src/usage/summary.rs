//! Background persistence of the usage summary.
//!
//! The ledger publishes a snapshot after every finished call; the writer task
//! persists the latest one so a crashed run still leaves a partial cost report.

use crate::checkpoint::write_atomic;
use crate::models::{Result, StagerunError, UsageSummary};
use std::path::{Path, PathBuf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes usage summaries to a JSON file off the job tasks.
pub struct SummaryWriter {
    path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

async fn persist(path: &Path, summary: &UsageSummary) -> Result<()> {
    let content = serde_json::to_string_pretty(summary)
        .map_err(|e| StagerunError::Internal(format!("Serializing usage summary: {e}")))?;
    write_atomic(path, content.as_bytes()).await
}

impl SummaryWriter {
    /// Spawn the writer on the current runtime.
    pub fn spawn(path: PathBuf, mut updates: watch::Receiver<UsageSummary>) -> Self {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let task_path = path.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let summary = updates.borrow_and_update().clone();
                        if let Err(e) = persist(&task_path, &summary).await {
                            warn!(
                                path = %task_path.display(),
                                error = %e,
                                "Failed to write usage summary"
                            );
                        }
                    }
                    _ = &mut stop => break,
                }
            }

            let summary = updates.borrow().clone();
            match persist(&task_path, &summary).await {
                Ok(()) => debug!(path = %task_path.display(), "Usage summary flushed"),
                Err(e) => warn!(
                    path = %task_path.display(),
                    error = %e,
                    "Final usage summary write failed"
                ),
            }
        });

        Self {
            path,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Path the summary is written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer after a final flush.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| StagerunError::Internal(format!("Summary writer task failed: {e}")))
    }
}
