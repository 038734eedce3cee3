//! Checkpoint module for resumable stage execution.
//!
//! Provides:
//! - `CheckpointStore`: Atomic per-stage persistence with validation on read
//! - `StageChain`: Dependency-ordered stage resolution backed by the store

mod chain;
mod store;

pub use chain::*;
pub use store::*;
pub(crate) use store::write_atomic;
