//! Per-sender token buckets.
use crate::zfx_id::Id;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use std::num::NonZeroU32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Largest burst of messages accepted from one sender.
    pub bucket_size: u32,
    /// Tokens added back to each bucket per second.
    pub refill_per_second: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings { bucket_size: 256, refill_per_second: 128 }
    }
}

pub struct SenderRateLimiter {
    limiter: RateLimiter<Id, DefaultKeyedStateStore<Id>, DefaultClock>,
}

impl SenderRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(settings.refill_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(settings.bucket_size).unwrap_or(NonZeroU32::MIN));
        SenderRateLimiter { limiter: RateLimiter::keyed(quota) }
    }

    /// Takes one token from `sender`'s bucket. Returns `false` once the bucket is empty.
    pub fn check(&self, sender: &Id) -> bool {
        self.limiter.check_key(sender).is_ok()
    }

    /// Drops buckets that have refilled completely.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_per_sender() {
        let limiter =
            SenderRateLimiter::new(RateLimitSettings { bucket_size: 2, refill_per_second: 1 });
        assert!(limiter.check(&Id::one()));
        assert!(limiter.check(&Id::one()));
        assert!(!limiter.check(&Id::one()));
        assert!(limiter.check(&Id::two()));
        limiter.prune();
    }
}
