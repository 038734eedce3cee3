//! stagerun - Resumable, cost-accounted batch runs over generative models.
//!
//! ## Architecture
//!
//! - **Scheduler**: Runs one job per item under a concurrency cap
//! - **Progress Reporter**: Per-job channel for logs, stage markers and
//!   metered-call accounting
//! - **Usage Ledger**: Shared aggregation of token usage and cost per model
//! - **Stage Chain**: Named stages resolved from checkpoints when possible,
//!   generated (dependencies first) when not
//!
//! ## Pipelines
//!
//! - **Draft Pipeline**: prompt → draft → summary, checkpointed per item

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod usage;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, Stage, StageChain, StageResult, StageSource};
pub use client::{LlmClient, ModelClient};
pub use models::{Config, Result, StagerunError, StatusMode, UsageSummary};
pub use pipeline::DraftPipeline;
pub use pool::{JobSpec, run_jobs};
pub use progress::{JobReporter, MeteredCall, NoopReporter, ProgressReporter};
pub use usage::{CostEstimator, PriceTable, SummaryWriter, UsageLedger};
