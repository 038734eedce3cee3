//! Progress module - per-job reporters, status display and metered calls.

mod metered;
mod reporter;
mod status;

pub use crate::models::StatusMode;
pub use metered::*;
pub use reporter::*;
pub use status::*;
