use rand::Rng;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(8);
const MAX_ATTEMPTS: u32 = 5;

/// One backoff policy shared by every retried request: exponential growth
/// from the base, capped, with jitter in the upper half of the window so
/// repeated failures never synchronize.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            cap: MAX_DELAY,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Jittered delay for a 1-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let uncapped = self.base.saturating_mul(1u32 << exponent);
        let capped = uncapped.min(self.cap);
        let millis = capped.as_millis() as u64;
        let jittered = millis / 2 + rand::thread_rng().gen_range(0..=millis.div_ceil(2));
        Duration::from_millis(jittered)
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..=20 {
            assert!(policy.delay(attempt) <= MAX_DELAY);
        }
    }

    #[test]
    fn first_delay_stays_near_base() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= BASE_DELAY / 2);
            assert!(delay <= BASE_DELAY);
        }
    }

    proptest! {
        #[test]
        fn delay_window_is_half_to_full_of_capped_exponential(attempt in 1u32..16) {
            let policy = RetryPolicy::default();
            let capped = (BASE_DELAY * 2u32.pow((attempt - 1).min(10))).min(MAX_DELAY);
            let delay = policy.delay(attempt);
            prop_assert!(delay >= capped / 2);
            prop_assert!(delay <= capped + Duration::from_millis(1));
        }
    }
}
