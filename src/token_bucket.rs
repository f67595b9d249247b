use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persisted state of a single bucket.
///
/// `last_accessed_ns == 0` marks a key that has never been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketState {
    pub allowance: i64,
    pub last_accessed_ns: i64,
}

impl BucketState {
    /// What a store reports for a key it has no record of.
    pub const NEVER_SEEN: BucketState = BucketState::new(0, 0);

    pub const fn new(allowance: i64, last_accessed_ns: i64) -> Self {
        Self {
            allowance,
            last_accessed_ns,
        }
    }

    pub fn is_never_seen(&self) -> bool {
        *self == Self::NEVER_SEEN
    }
}

/// Nanoseconds it takes for one permit to accrue.
///
/// Truncating division; a rate finer than one permit per nanosecond is
/// floored to a one nanosecond slice.
pub fn permit_slice_ns(interval_ns: i64, rate: i64) -> i64 {
    interval_ns.checked_div(rate).unwrap_or(i64::MAX).max(1)
}

/// Replenish `previous` as of `now_ns`.
///
/// Buckets already at or above `burst` are returned untouched, timestamp
/// included. Otherwise one permit is added per whole slice elapsed since
/// the last refill, capped at `burst`; if not even one slice has elapsed the
/// state is returned untouched so partial progress keeps accumulating.
/// A never-seen bucket measures elapsed time from the epoch.
pub fn refill_allowance(
    now_ns: i64,
    previous: BucketState,
    burst: i64,
    interval_ns: i64,
    rate: i64,
) -> BucketState {
    if previous.allowance >= burst {
        return previous;
    }

    let elapsed = now_ns.saturating_sub(previous.last_accessed_ns);
    let refill = elapsed / permit_slice_ns(interval_ns, rate);
    if refill <= 0 {
        return previous;
    }

    BucketState {
        allowance: previous.allowance.saturating_add(refill).min(burst),
        last_accessed_ns: now_ns,
    }
}

/// Estimated delay until `allowance` reaches one permit:
/// `ceil((1 - allowance) * interval / rate)`. Zero if a permit is available.
pub fn wait_for_next_permit(allowance: i64, interval_ns: i64, rate: i64) -> Duration {
    if allowance >= 1 {
        return Duration::ZERO;
    }

    let deficit = 1i128 - i128::from(allowance);
    let numerator = deficit * i128::from(interval_ns);
    let rate = i128::from(rate.max(1));
    let wait_ns = ((numerator + rate - 1) / rate).max(1);

    Duration::from_nanos(u64::try_from(wait_ns).unwrap_or(u64::MAX))
}
