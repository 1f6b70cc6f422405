//! Reliability patterns for activity calls
//!
//! - [`RetryPolicy`] - bounded retries with exponential backoff

mod retry;

pub use retry::RetryPolicy;
