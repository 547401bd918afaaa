//! Resilience primitives wrapped around upstream calls.

pub mod coalesce;
pub mod retry;

pub use coalesce::RequestCoalescer;
pub use retry::{RetryExecutor, RetryPolicy};
