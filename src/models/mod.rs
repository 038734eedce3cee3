//! Core data models for stagerun.

mod config;
mod error;
mod usage;

pub use config::*;
pub use error::*;
pub use usage::*;
