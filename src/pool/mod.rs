//! Pool module - bounded job scheduling.

mod scheduler;

pub use scheduler::*;
