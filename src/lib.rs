//! Windowgate - Distributed Sliding-Window Rate Limiting
//!
//! This crate limits how many operations may occur within a sliding time
//! window across many processes. State lives in a shared ordered key-value
//! store (Redis sorted sets), where each admitted operation is one entry
//! scored by its timestamp. An in-memory store with the same semantics is
//! provided for tests and single-process use.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{LimitExceeded, LimiterError, Result};
pub use ratelimit::{AdmissionMode, Grant, KeyResolver, RateLimiter, RetryPivot, Status};
pub use store::{MemoryWindowStore, RedisWindowStore, WindowStore};
