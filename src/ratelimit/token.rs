//! Unique member tokens for window entries.
//!
//! Entries recorded in the same millisecond share a score, so each one needs
//! a member that is unique within the key.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Produces members for new window entries.
pub trait TokenGenerator: Send + Sync {
    /// Return a token not previously returned by this generator.
    fn next_token(&self) -> String;

    /// Return `count` fresh tokens.
    fn tokens(&self, count: u64) -> Vec<String> {
        (0..count).map(|_| self.next_token()).collect()
    }
}

/// Random UUID v4 tokens, safe to use from many processes at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokens;

impl TokenGenerator for UuidTokens {
    fn next_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic `<prefix>-<n>` tokens.
///
/// Only unique within one generator; meant for tests and single-process use.
#[derive(Debug, Default)]
pub struct SequentialTokens {
    prefix: String,
    next: AtomicU64,
}

impl SequentialTokens {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }
}

impl TokenGenerator for SequentialTokens {
    fn next_token(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
