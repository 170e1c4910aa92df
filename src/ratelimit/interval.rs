//! Minimum spacing between grants on the same key.

/// Rejects a batch when another grant landed within `difference_ms` of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGuard {
    difference_ms: u64,
}

impl IntervalGuard {
    /// Build a guard; a zero spacing disables the check.
    pub fn new(difference_ms: u64) -> Option<Self> {
        (difference_ms > 0).then_some(Self { difference_ms })
    }

    /// Lower score bound of the spacing window ending at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(i64::try_from(self.difference_ms).unwrap_or(i64::MAX))
    }

    /// Whether the spacing window holds anything besides the batch just inserted.
    pub fn is_violated(&self, in_spacing_window: u64, batch: u64) -> bool {
        in_spacing_window > batch
    }

    pub fn difference_ms(&self) -> u64 {
        self.difference_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_difference_disables_guard() {
        assert!(IntervalGuard::new(0).is_none());
        assert!(IntervalGuard::new(300).is_some());
    }

    #[test]
    fn test_window_start() {
        let guard = IntervalGuard::new(300).unwrap();
        assert_eq!(guard.window_start(1_000), 700);
    }

    #[test]
    fn test_only_own_batch_is_not_a_violation() {
        let guard = IntervalGuard::new(300).unwrap();
        assert!(!guard.is_violated(3, 3));
        assert!(guard.is_violated(4, 3));
    }
}
