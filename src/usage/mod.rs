//! Usage module - ledger, pricing and summary persistence.

mod ledger;
mod pricing;
mod summary;

pub use ledger::*;
pub use pricing::*;
pub use summary::*;
