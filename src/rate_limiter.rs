use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::config_validator::ConfigValidator;
use crate::error::{Error, Result, StoreError, StoreOp};
use crate::metrics::DecisionMetrics;
use crate::store::{AtomicStateStore, StateStore};
use crate::token_bucket::{refill_allowance, wait_for_next_permit, BucketState};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A permit was consumed; `remaining` permits are left in the bucket.
    Allowed { remaining: i64 },
    /// No permit available; retry after roughly `retry_after`.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Zero when allowed, otherwise the retry hint.
    pub fn wait(&self) -> Duration {
        match self {
            Decision::Allowed { .. } => Duration::ZERO,
            Decision::Denied { retry_after } => *retry_after,
        }
    }
}

/// Token-bucket rate limiter whose per-key state lives in a [`StateStore`].
///
/// The limiter keeps no bucket state and takes no locks. Concurrent
/// [`allow`](Self::allow) calls for one key may both read the same state
/// and both consume, transiently admitting more than `burst`; use
/// [`allow_exact`](Self::allow_exact) with an [`AtomicStateStore`] when that
/// matters.
pub struct RateLimiter<S, C = SystemClock> {
    config: LimiterConfig,
    interval_ns: i64,
    store: S,
    clock: C,
    metrics: DecisionMetrics,
}

impl<S: StateStore> RateLimiter<S, SystemClock> {
    /// Create a limiter granting `rate` permits per `interval`, holding at
    /// most `burst`.
    pub fn new(rate: i64, interval: Duration, burst: i64, store: S) -> Result<Self> {
        Self::from_config(LimiterConfig::new(rate, interval, burst), store)
    }

    pub fn from_config(config: LimiterConfig, store: S) -> Result<Self> {
        config.validate_config()?;

        debug!(
            rate = config.rate,
            interval = ?config.interval,
            burst = config.burst,
            "Creating rate limiter"
        );

        Ok(Self {
            interval_ns: config.interval_ns(),
            config,
            store,
            clock: SystemClock,
            metrics: DecisionMetrics::new(),
        })
    }
}

impl<S: StateStore, C: Clock> RateLimiter<S, C> {
    /// Replace the time source.
    pub fn with_clock<K: Clock>(self, clock: K) -> RateLimiter<S, K> {
        RateLimiter {
            config: self.config,
            interval_ns: self.interval_ns,
            store: self.store,
            clock,
            metrics: self.metrics,
        }
    }

    pub fn rate(&self) -> i64 {
        self.config.rate
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn burst(&self) -> i64 {
        self.config.burst
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &DecisionMetrics {
        &self.metrics
    }

    /// Check `key`, consuming a permit if one is available.
    ///
    /// Returns `Duration::ZERO` when permitted, otherwise a positive estimate
    /// of how long to wait. Never waits itself.
    pub async fn allow(&self, key: &str) -> Result<Duration> {
        Ok(self.decide(key).await?.wait())
    }

    /// Like [`allow`](Self::allow) but reports the remaining allowance.
    pub async fn decide(&self, key: &str) -> Result<Decision> {
        ConfigValidator::validate_key(key)?;

        let result = self.read_compute_write(key).await;
        self.observe(key, &result);
        result
    }

    async fn read_compute_write(&self, key: &str) -> Result<Decision> {
        let previous = self.read(key).await?;
        let (next, decision) = self.evaluate(self.clock.now_ns(), previous);

        self.store
            .set_state(key, next)
            .await
            .map_err(|e| store_failure(StoreOp::Write, key, e))?;

        trace!(
            key = %key,
            allowance = next.allowance,
            last_accessed_ns = next.last_accessed_ns,
            "Persisted bucket state"
        );

        Ok(decision)
    }

    async fn read(&self, key: &str) -> Result<BucketState> {
        self.store
            .get_state(key)
            .await
            .map_err(|e| store_failure(StoreOp::Read, key, e))
    }

    /// Refill `previous` as of `now_ns` and try to consume one permit.
    fn evaluate(&self, now_ns: i64, previous: BucketState) -> (BucketState, Decision) {
        let refilled = refill_allowance(
            now_ns,
            previous,
            self.config.burst,
            self.interval_ns,
            self.config.rate,
        );

        if refilled.allowance >= 1 {
            // Stored state can exceed a burst that was lowered since it was written.
            let next = BucketState::new(refilled.allowance.min(self.config.burst) - 1, now_ns);
            (
                next,
                Decision::Allowed {
                    remaining: next.allowance,
                },
            )
        } else {
            let retry_after =
                wait_for_next_permit(refilled.allowance, self.interval_ns, self.config.rate);
            (refilled, Decision::Denied { retry_after })
        }
    }

    fn observe(&self, key: &str, result: &Result<Decision>) {
        match result {
            Ok(decision) => {
                self.metrics.record_decision(decision);
                if let Decision::Denied { retry_after } = decision {
                    debug!(key = %key, retry_after = ?retry_after, "Rate limit exceeded");
                }
            }
            Err(_) => self.metrics.record_failure(),
        }
    }
}

impl<S: AtomicStateStore, C: Clock> RateLimiter<S, C> {
    /// Like [`allow`](Self::allow), but the write only lands if no other
    /// caller changed the bucket since it was read.
    ///
    /// Lost races re-run the whole cycle, up to `max_cas_attempts` times.
    pub async fn allow_exact(&self, key: &str) -> Result<Duration> {
        Ok(self.decide_exact(key).await?.wait())
    }

    pub async fn decide_exact(&self, key: &str) -> Result<Decision> {
        ConfigValidator::validate_key(key)?;

        let result = self.read_compute_compare_and_set(key).await;
        self.observe(key, &result);
        result
    }

    async fn read_compute_compare_and_set(&self, key: &str) -> Result<Decision> {
        let attempts = self.config.max_cas_attempts;

        for attempt in 1..=attempts {
            let previous = self.read(key).await?;
            let (next, decision) = self.evaluate(self.clock.now_ns(), previous);

            let written = self
                .store
                .compare_and_set(key, previous, next)
                .await
                .map_err(|e| store_failure(StoreOp::Write, key, e))?;

            if written {
                return Ok(decision);
            }

            self.metrics.record_conflict();
            debug!(key = %key, attempt = attempt, "Bucket changed concurrently, retrying");
        }

        warn!(key = %key, attempts = attempts, "Giving up after conflicting writes");
        Err(Error::ContentionExhausted {
            key: key.to_string(),
            attempts,
        })
    }
}

fn store_failure(op: StoreOp, key: &str, source: StoreError) -> Error {
    warn!(key = %key, op = %op, error = %source, "State store operation failed");
    Error::store(op, key, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    const SECOND: i64 = 1_000_000_000;
    const NOW: i64 = 1_700_000_000 * SECOND;

    fn limiter(store: MemoryStore, clock: &ManualClock) -> RateLimiter<MemoryStore, ManualClock> {
        RateLimiter::new(1, Duration::from_secs(1), 10, store)
            .unwrap()
            .with_clock(clock.clone())
    }

    /// Store whose reads or writes fail, counting the calls it sees.
    #[derive(Default)]
    struct FailingStore {
        fail_reads: bool,
        corrupt_reads: bool,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get_state(&self, key: &str) -> std::result::Result<BucketState, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.corrupt_reads {
                return Err(StoreError::corrupt(key, "non integer allowance 'abc'"));
            }
            if self.fail_reads {
                return Err(StoreError::Unsupported("get_state"));
            }
            Ok(BucketState::NEVER_SEEN)
        }

        async fn set_state(
            &self,
            _key: &str,
            _state: BucketState,
        ) -> std::result::Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unsupported("set_state"))
        }
    }

    /// Memory store that loses the first `conflicts` compare-and-set calls.
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl StateStore for ContendedStore {
        async fn get_state(&self, key: &str) -> std::result::Result<BucketState, StoreError> {
            self.inner.get_state(key).await
        }

        async fn set_state(
            &self,
            key: &str,
            state: BucketState,
        ) -> std::result::Result<(), StoreError> {
            self.inner.set_state(key, state).await
        }
    }

    #[async_trait]
    impl AtomicStateStore for ContendedStore {
        async fn compare_and_set(
            &self,
            key: &str,
            expected: BucketState,
            next: BucketState,
        ) -> std::result::Result<bool, StoreError> {
            let lost = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Ok(false);
            }
            self.inner.compare_and_set(key, expected, next).await
        }
    }

    #[test]
    fn test_invalid_configuration() {
        for (rate, interval, burst) in [
            (0, Duration::from_secs(1), 10),
            (1, Duration::ZERO, 10),
            (1, Duration::from_secs(1), 0),
            (-1, Duration::from_secs(1), -1),
        ] {
            let result = RateLimiter::new(rate, interval, burst, MemoryStore::new());
            assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_accessors() {
        let limiter = RateLimiter::new(5, Duration::from_millis(500), 7, MemoryStore::new()).unwrap();
        assert_eq!(limiter.rate(), 5);
        assert_eq!(limiter.interval(), Duration::from_millis(500));
        assert_eq!(limiter.burst(), 7);
    }

    #[tokio::test]
    async fn test_burst_then_denials() {
        let clock = ManualClock::new(NOW);
        let limiter = limiter(MemoryStore::new(), &clock);

        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..15 {
            let wait = limiter.allow("benjamin").await.unwrap();
            if wait.is_zero() {
                allowed += 1;
            } else {
                assert_eq!(wait, Duration::from_secs(1));
                denied += 1;
            }
        }

        assert_eq!(allowed, 10);
        assert_eq!(denied, 5);
    }

    #[tokio::test]
    async fn test_first_decision_is_deterministic() {
        let clock = ManualClock::new(NOW);
        let store = MemoryStore::new();
        let limiter = limiter(store.clone(), &clock);

        let decision = limiter.decide("fresh").await.unwrap();
        assert_eq!(decision, Decision::Allowed { remaining: 9 });
        assert_eq!(
            store.get_state("fresh").await.unwrap(),
            BucketState::new(9, NOW)
        );
    }

    #[tokio::test]
    async fn test_fresh_key_at_epoch_is_denied() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::new();
        let limiter = limiter(store.clone(), &clock);

        let decision = limiter.decide("fresh").await.unwrap();
        assert_eq!(
            decision,
            Decision::Denied {
                retry_after: Duration::from_secs(1)
            }
        );
        assert!(store.get_state("fresh").await.unwrap().is_never_seen());
    }

    #[tokio::test]
    async fn test_limit_eases_after_wait() {
        let clock = ManualClock::new(NOW);
        let limiter = limiter(MemoryStore::new(), &clock);

        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..20 {
            let wait = limiter.allow("bar").await.unwrap();
            if wait.is_zero() {
                allowed += 1;
                continue;
            }
            denied += 1;
            clock.advance(wait);
        }

        assert_eq!(allowed, 15);
        assert_eq!(denied, 5);
    }

    #[tokio::test]
    async fn test_denial_keeps_refill_timestamp() {
        let clock = ManualClock::new(NOW);
        let store = MemoryStore::new();
        let limiter = limiter(store.clone(), &clock);
        store.set_state("k", BucketState::new(0, NOW)).await.unwrap();

        clock.advance(Duration::from_millis(600));
        assert!(!limiter.allow("k").await.unwrap().is_zero());
        assert_eq!(store.get_state("k").await.unwrap(), BucketState::new(0, NOW));

        clock.advance(Duration::from_millis(400));
        assert!(limiter.allow("k").await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = ManualClock::new(NOW);
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 1, MemoryStore::new())
            .unwrap()
            .with_clock(clock);

        assert!(limiter.allow("a").await.unwrap().is_zero());
        assert!(!limiter.allow("a").await.unwrap().is_zero());
        assert!(limiter.allow("b").await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_allowance_stays_within_bounds() {
        let clock = ManualClock::new(NOW);
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(3, Duration::from_secs(1), 5, store.clone())
            .unwrap()
            .with_clock(clock.clone());

        for step in 0..100u64 {
            limiter.allow("k").await.unwrap();
            let state = store.get_state("k").await.unwrap();
            assert!((0..=5).contains(&state.allowance), "step {step}: {state:?}");
            clock.advance(Duration::from_millis(step % 7 * 90));
        }
    }

    #[tokio::test]
    async fn test_lowered_burst_caps_stored_allowance() {
        let clock = ManualClock::new(NOW);
        let store = MemoryStore::new();
        store.set_state("k", BucketState::new(8, NOW)).await.unwrap();
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 5, store.clone())
            .unwrap()
            .with_clock(clock);

        let decision = limiter.decide("k").await.unwrap();
        assert_eq!(decision, Decision::Allowed { remaining: 4 });
        assert_eq!(store.get_state("k").await.unwrap(), BucketState::new(4, NOW));
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 10, store.clone()).unwrap();

        assert!(matches!(limiter.allow("").await, Err(Error::EmptyKey)));
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_error_propagates_without_write() {
        let store = Arc::new(FailingStore {
            fail_reads: true,
            ..Default::default()
        });
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 10, store.clone()).unwrap();

        let err = limiter.allow("k").await.unwrap_err();
        assert!(matches!(err, Error::StoreReadFailed { .. }));
        assert!(matches!(
            err.store_error(),
            Some(StoreError::Unsupported("get_state"))
        ));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.metrics().snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_write_error_propagates() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 10, store.clone()).unwrap();

        let err = limiter.allow("k").await.unwrap_err();
        assert_eq!(err.store_op(), Some(StoreOp::Write));
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_surfaced() {
        let store = Arc::new(FailingStore {
            corrupt_reads: true,
            ..Default::default()
        });
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 10, store.clone()).unwrap();

        let err = limiter.allow("k").await.unwrap_err();
        assert!(err.is_state_corrupt());
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_track_decisions() {
        let clock = ManualClock::new(NOW);
        let limiter = limiter(MemoryStore::new(), &clock);

        for _ in 0..12 {
            limiter.allow("k").await.unwrap();
        }

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.total_requests, 12);
        assert_eq!(snapshot.allowed_requests, 10);
        assert_eq!(snapshot.denied_requests, 2);
    }

    #[tokio::test]
    async fn test_allow_exact_retries_lost_races() {
        let clock = ManualClock::new(NOW);
        let store = ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(3),
        };
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 10, store)
            .unwrap()
            .with_clock(clock);

        let decision = limiter.decide_exact("k").await.unwrap();
        assert_eq!(decision, Decision::Allowed { remaining: 9 });
        assert_eq!(limiter.metrics().snapshot().cas_conflicts, 3);
        assert_eq!(
            limiter.store().inner.get_state("k").await.unwrap(),
            BucketState::new(9, NOW)
        );
    }

    #[tokio::test]
    async fn test_allow_exact_gives_up() {
        let config = LimiterConfig::new(1, Duration::from_secs(1), 10).with_max_cas_attempts(2);
        let store = ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(5),
        };
        let limiter = RateLimiter::from_config(config, store).unwrap();

        let err = limiter.allow_exact("k").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ContentionExhausted { attempts: 2, .. }
        ));
        assert!(limiter.store().inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_allow_exact_never_over_admits() {
        let clock = ManualClock::new(NOW);
        let config = LimiterConfig::new(1, Duration::from_secs(1), 10).with_max_cas_attempts(1_000);
        let limiter = Arc::new(
            RateLimiter::from_config(config, MemoryStore::new())
                .unwrap()
                .with_clock(clock),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0;
                for _ in 0..5 {
                    if limiter.allow_exact("shared").await.unwrap().is_zero() {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 10);
    }
}
