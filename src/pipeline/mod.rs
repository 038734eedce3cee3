//! Pipeline module - checkpointed generation pipelines.

mod draft;

pub use draft::*;
