//! Sliding-window rate limiting over a shared window store.

mod interval;
mod key;
mod limiter;
mod policy;
mod status;
mod token;

pub use interval::IntervalGuard;
pub use key::KeyResolver;
pub use limiter::{Grant, RateLimiter, RateLimiterBuilder};
pub use policy::{Admission, AdmissionMode};
pub use status::{RetryPivot, Status};
pub use token::{SequentialTokens, TokenGenerator, UuidTokens};
