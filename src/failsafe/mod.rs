//! Failsafe mechanisms: admission control and bounded retry

mod rate_limiter;
mod retry;

pub use rate_limiter::{AdmissionController, QueryClass};
pub use retry::with_read_retry;
