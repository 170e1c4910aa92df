//! Core sliding-window rate limiter.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::interval::IntervalGuard;
use super::key::KeyResolver;
use super::policy::{Admission, AdmissionMode};
use super::status::{retry_after_ms, RetryPivot, Status};
use super::token::{TokenGenerator, UuidTokens};
use crate::clock::{Clock, SystemClock};
use crate::config::{Quota, QuotaConfig, RejectionConfig};
use crate::error::{LimiterError, Result, StoreError};
use crate::store::{settle, Batch, Reply, WindowStore};

/// Position of the in-window count in the grant batch.
const GRANT_IN_WINDOW: usize = 3;
/// Position of the spacing-window count in the grant batch, when present.
const GRANT_IN_SPACING: usize = 4;
/// Position of the in-window count in the status batch.
const STATUS_IN_WINDOW: usize = 1;

/// The result of a successful grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Entries in the window after this call
    pub total: u64,
    /// Entries admitted by this call
    pub acknowledged: u64,
    /// Capacity left before the limit is reached
    pub remaining: u64,
}

/// A distributed sliding-window rate limiter.
///
/// Every call records its entries in the window store first and then decides,
/// from the resulting count, how many of them to keep. Rejected entries are
/// removed in a second round trip, so concurrent callers on the same key can
/// briefly observe a count above the limit.
///
/// The limiter holds no mutable state and can be shared freely.
pub struct RateLimiter<I: ?Sized = ()> {
    store: Arc<dyn WindowStore>,
    key: KeyResolver<I>,
    quota: Quota,
    interval: Option<IntervalGuard>,
    tokens: Arc<dyn TokenGenerator>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Start building a limiter over a fixed key.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Consume `times` units of quota.
    pub async fn grant(&self, times: u64) -> Result<Grant> {
        self.grant_for(&(), times).await
    }

    /// Report current usage without consuming quota.
    pub async fn status(&self) -> Result<Status> {
        self.status_for(&()).await
    }
}

impl<I: ?Sized> RateLimiter<I> {
    /// Start building a limiter whose key is derived from a per-call identifier.
    pub fn keyed_builder() -> RateLimiterBuilder<I> {
        RateLimiterBuilder::new()
    }

    /// The validated quota this limiter enforces.
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Consume `times` units of quota on the key derived from `id`.
    pub async fn grant_for(&self, id: &I, times: u64) -> Result<Grant> {
        if times == 0 {
            return Err(LimiterError::Config(
                "times must be a positive integer".to_string(),
            ));
        }

        let key = self.key.resolve(id)?;
        let now = self.clock.now_ms();
        let min = self.quota.window_start(now);
        let members = self.tokens.tokens(times);

        trace!(key = %key, times = times, "Checking rate limit");

        let mut batch = Batch::new();
        batch
            .remove_below(min)
            .add(now, &members)
            .expire(self.quota.ttl_ms())
            .count(min, now);
        if let Some(guard) = &self.interval {
            batch.count(guard.window_start(now), now);
        }

        let replies = settle(self.store.execute(&key, &batch).await?)?;
        let in_window = count_at(&replies, GRANT_IN_WINDOW)?;

        if let Some(guard) = &self.interval {
            let in_spacing = count_at(&replies, GRANT_IN_SPACING)?;
            if guard.is_violated(in_spacing, times) {
                debug!(
                    key = %key,
                    difference_ms = guard.difference_ms(),
                    "Grant too close to the previous one"
                );
                let mut cleanup = Batch::new();
                cleanup.remove(&members);
                self.compensate(&key, &cleanup).await?;
                return Err(self.quota.rejection().into());
            }
        }

        let limit = self.quota.limit();
        let original = in_window.saturating_sub(times);
        let admission = self.quota.mode().decide(original, times, limit);

        match admission {
            Admission::Full => {}
            Admission::Partial(kept) => {
                debug!(
                    key = %key,
                    original = original,
                    limit = limit,
                    acknowledged = kept,
                    "Rate limit partially filled"
                );
                let kept = usize::try_from(kept).map_or(members.len(), |k| k.min(members.len()));
                let mut cleanup = Batch::new();
                cleanup.remove(&members[kept..]);
                self.compensate(&key, &cleanup).await?;
            }
            Admission::Reject => {
                debug!(
                    key = %key,
                    original = original,
                    limit = limit,
                    times = times,
                    "Rate limit exceeded"
                );
                let mut cleanup = Batch::new();
                cleanup.remove_below(min).remove(&members);
                self.compensate(&key, &cleanup).await?;
                return Err(self.quota.rejection().into());
            }
        }

        let acknowledged = admission.acknowledged(times);
        let total = original + acknowledged;

        Ok(Grant {
            total,
            acknowledged,
            remaining: limit.saturating_sub(total),
        })
    }

    /// Report current usage of the key derived from `id` without consuming quota.
    ///
    /// Expired entries are pruned; nothing is inserted.
    pub async fn status_for(&self, id: &I) -> Result<Status> {
        let key = self.key.resolve(id)?;
        let now = self.clock.now_ms();
        let min = self.quota.window_start(now);

        trace!(key = %key, "Checking rate limit status");

        let mut batch = Batch::new();
        batch.remove_below(min).count(min, now);
        let replies = settle(self.store.execute(&key, &batch).await?)?;

        let limit = self.quota.limit();
        let total = count_at(&replies, STATUS_IN_WINDOW)?;
        let remaining = limit.saturating_sub(total);

        if remaining > 0 {
            return Ok(Status {
                total,
                remaining,
                retry_after_ms: 0,
            });
        }

        let rank = self.quota.retry_pivot().rank(limit);
        let mut ranked = Batch::new();
        ranked.rev_range_with_scores(rank, rank);
        let replies = settle(self.store.execute(&key, &ranked).await?)?;

        // The pivot can be missing if a concurrent caller's cleanup ran in between
        let retry_after_ms = match replies.into_iter().next() {
            Some(reply) => reply
                .into_entries()?
                .first()
                .map_or(0, |entry| retry_after_ms(entry.score, self.quota.duration_ms(), now)),
            None => 0,
        };

        Ok(Status {
            total,
            remaining,
            retry_after_ms,
        })
    }

    /// Run a cleanup batch; its failure supersedes the decision that triggered it.
    async fn compensate(&self, key: &str, batch: &Batch) -> std::result::Result<(), StoreError> {
        let result = match self.store.execute(key, batch).await {
            Ok(outcomes) => settle(outcomes).map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(
                key = %key,
                error = %e,
                "Failed to remove rejected entries; they stay in the window until they expire"
            );
        }

        result
    }
}

impl<I: ?Sized> fmt::Debug for RateLimiter<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key", &self.key)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

fn count_at(replies: &[Reply], index: usize) -> std::result::Result<u64, StoreError> {
    replies
        .get(index)
        .ok_or_else(|| StoreError::UnexpectedReply(format!("missing reply {}", index)))?
        .as_count()
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<I: ?Sized = ()> {
    store: Option<Arc<dyn WindowStore>>,
    key: Option<KeyResolver<I>>,
    quota: QuotaConfig,
    tokens: Option<Arc<dyn TokenGenerator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<I: ?Sized> RateLimiterBuilder<I> {
    /// Create a builder with default quota options.
    pub fn new() -> Self {
        Self {
            store: None,
            key: None,
            quota: QuotaConfig::default(),
            tokens: None,
            clock: None,
        }
    }

    /// The window store shared by every process enforcing this limit.
    pub fn store<S: WindowStore + 'static>(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn key(mut self, key: impl Into<KeyResolver<I>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace every quota option at once.
    pub fn quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.quota.limit = limit;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.quota.duration_ms = duration_ms;
        self
    }

    pub fn difference_ms(mut self, difference_ms: u64) -> Self {
        self.quota.difference_ms = difference_ms;
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.quota.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn mode(mut self, mode: AdmissionMode) -> Self {
        self.quota.mode = mode;
        self
    }

    pub fn error(mut self, error: RejectionConfig) -> Self {
        self.quota.error = error;
        self
    }

    pub fn retry_pivot(mut self, retry_pivot: RetryPivot) -> Self {
        self.quota.retry_pivot = retry_pivot;
        self
    }

    /// Override how entry members are generated.
    pub fn tokens<T: TokenGenerator + 'static>(mut self, tokens: Arc<T>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Override the clock used to score entries.
    pub fn clock<C: Clock + 'static>(mut self, clock: Arc<C>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the options and build the limiter.
    pub fn build(self) -> Result<RateLimiter<I>> {
        let store = self
            .store
            .ok_or_else(|| LimiterError::Config("store is required".to_string()))?;
        let key = self
            .key
            .ok_or_else(|| LimiterError::Config("key is required".to_string()))?;
        if matches!(&key, KeyResolver::Fixed(k) if k.is_empty()) {
            return Err(LimiterError::Config("key must not be empty".to_string()));
        }

        let quota = self.quota.validate()?;
        let interval = IntervalGuard::new(quota.difference_ms());

        debug!(
            key = ?key,
            limit = quota.limit(),
            duration_ms = quota.duration_ms(),
            mode = %quota.mode(),
            "Rate limiter configured"
        );

        Ok(RateLimiter {
            store,
            key,
            quota,
            interval,
            tokens: self.tokens.unwrap_or_else(|| Arc::new(UuidTokens)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

impl<I: ?Sized> Default for RateLimiterBuilder<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::SequentialTokens;
    use crate::store::MemoryWindowStore;

    const KEY: &str = "windowgate:test";
    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryWindowStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(T0));
            let store = Arc::new(MemoryWindowStore::with_clock(clock.clone()));
            Self { clock, store }
        }

        fn builder(&self) -> RateLimiterBuilder {
            RateLimiter::builder()
                .store(self.store.clone())
                .key(KEY)
                .clock(self.clock.clone())
                .tokens(Arc::new(SequentialTokens::new("t")))
        }
    }

    #[tokio::test]
    async fn test_sequential_grants_within_limit() {
        let fx = Fixture::new();
        let limiter = fx.builder().limit(3).duration_ms(1000).build().unwrap();

        for i in 1..=3 {
            let grant = limiter.grant(1).await.unwrap();
            assert_eq!(
                grant,
                Grant {
                    total: i,
                    acknowledged: 1,
                    remaining: 3 - i
                }
            );
        }

        let err = limiter.grant(1).await.unwrap_err();
        assert!(err.is_limit_exceeded());
        assert_eq!(err.to_string(), "Too Many Requests");
        assert_eq!(fx.store.cardinality(KEY), 3);
    }

    #[tokio::test]
    async fn test_zero_times_is_rejected_before_store_access() {
        let fx = Fixture::new();
        let limiter = fx.builder().build().unwrap();

        let err = limiter.grant(0).await.unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
        assert_eq!(fx.store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_nary_partial_fill_removes_tail() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(10)
            .duration_ms(300)
            .mode(AdmissionMode::Nary)
            .build()
            .unwrap();

        for _ in 0..3 {
            limiter.grant(3).await.unwrap();
        }

        let grant = limiter.grant(3).await.unwrap();
        assert_eq!(
            grant,
            Grant {
                total: 10,
                acknowledged: 1,
                remaining: 0
            }
        );
        assert_eq!(fx.store.cardinality(KEY), 10);

        // The head of the batch was kept, the tail removed
        let mut probe = Batch::new();
        probe.count(T0, T0).rev_range_with_scores(0, 20);
        let replies = settle(fx.store.execute(KEY, &probe).await.unwrap()).unwrap();
        let members: Vec<String> = replies[1]
            .clone()
            .into_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert!(members.contains(&"t-9".to_string()));
        assert!(!members.contains(&"t-10".to_string()));
        assert!(!members.contains(&"t-11".to_string()));
    }

    #[tokio::test]
    async fn test_expired_entries_are_pruned() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(2)
            .duration_ms(1000)
            .ttl_ms(60_000)
            .build()
            .unwrap();

        limiter.grant(2).await.unwrap();
        assert!(limiter.grant(1).await.is_err());

        fx.clock.advance(1001);
        let grant = limiter.grant(1).await.unwrap();
        assert_eq!(grant.total, 1);
        assert_eq!(fx.store.cardinality(KEY), 1);
    }

    #[tokio::test]
    async fn test_entry_at_window_edge_still_counts() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(1)
            .duration_ms(1000)
            .ttl_ms(60_000)
            .build()
            .unwrap();

        limiter.grant(1).await.unwrap();

        // Scores in [now - duration, now] are inside the window
        fx.clock.advance(1000);
        assert!(limiter.grant(1).await.is_err());

        fx.clock.advance(1);
        assert!(limiter.grant(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_grant_refreshes_ttl() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(5)
            .duration_ms(1000)
            .ttl_ms(5000)
            .build()
            .unwrap();

        limiter.grant(1).await.unwrap();
        assert_eq!(fx.store.pttl(KEY), Some(5000));

        fx.clock.advance(2000);
        limiter.grant(1).await.unwrap();
        assert_eq!(fx.store.pttl(KEY), Some(5000));
    }

    #[tokio::test]
    async fn test_interval_guard_rejects_close_grants() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(10)
            .duration_ms(300_000)
            .difference_ms(300)
            .build()
            .unwrap();

        limiter.grant(1).await.unwrap();

        fx.clock.advance(100);
        assert!(limiter.grant(1).await.unwrap_err().is_limit_exceeded());
        assert_eq!(fx.store.cardinality(KEY), 1);

        fx.clock.advance(300);
        let grant = limiter.grant(1).await.unwrap();
        assert_eq!(grant.total, 2);
    }

    #[tokio::test]
    async fn test_interval_boundary_is_inclusive() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(10)
            .duration_ms(300_000)
            .difference_ms(300)
            .build()
            .unwrap();

        limiter.grant(1).await.unwrap();

        // A grant exactly `difference_ms` later still sees the previous one
        fx.clock.advance(300);
        assert!(limiter.grant(1).await.unwrap_err().is_limit_exceeded());
        assert_eq!(fx.store.cardinality(KEY), 1);

        fx.clock.advance(1);
        assert_eq!(limiter.grant(1).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_quota_reflects_builder_options() {
        let fx = Fixture::new();
        let limiter = fx
            .builder()
            .limit(4)
            .duration_ms(2000)
            .mode(AdmissionMode::Uniform)
            .build()
            .unwrap();

        let quota = limiter.quota();
        assert_eq!(quota.limit(), 4);
        assert_eq!(quota.duration_ms(), 2000);
        assert_eq!(quota.ttl_ms(), 2000);
        assert_eq!(quota.mode(), AdmissionMode::Uniform);
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let fx = Fixture::new();
        let limiter = fx.builder().limit(10).build().unwrap();

        limiter.grant(3).await.unwrap();
        for _ in 0..3 {
            let status = limiter.status().await.unwrap();
            assert_eq!(
                status,
                Status {
                    total: 3,
                    remaining: 7,
                    retry_after_ms: 0
                }
            );
        }
        assert_eq!(limiter.grant(1).await.unwrap().total, 4);
    }

    #[tokio::test]
    async fn test_status_retry_pivots() {
        for (pivot, expected) in [
            (RetryPivot::LimitMinusTwo, 800),
            (RetryPivot::LimitMinusOne, 700),
        ] {
            let fx = Fixture::new();
            let limiter = fx
                .builder()
                .limit(3)
                .duration_ms(1000)
                .retry_pivot(pivot)
                .build()
                .unwrap();

            for _ in 0..3 {
                limiter.grant(1).await.unwrap();
                fx.clock.advance(100);
            }

            // Entries at T0, T0+100, T0+200; now is T0+300
            let status = limiter.status().await.unwrap();
            assert_eq!(status.total, 3);
            assert_eq!(status.remaining, 0);
            assert_eq!(status.retry_after_ms, expected, "{:?}", pivot);
        }
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_key() {
        let err = RateLimiter::builder().key(KEY).build().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: store is required");

        let err = RateLimiter::builder()
            .store(Arc::new(MemoryWindowStore::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: key is required");

        let err = RateLimiter::builder()
            .store(Arc::new(MemoryWindowStore::new()))
            .key("")
            .build()
            .unwrap_err();
        assert!(matches!(err, LimiterError::Config(_)));
    }
}
