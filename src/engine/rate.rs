//! Process-global token-bucket rate limiter.
//!
//! A governor task adds permits to a shared semaphore every `tick`,
//! carrying the fractional remainder across ticks so the long-term average
//! matches the configured rate exactly. Workers acquire one permit per
//! submission and forget it; the governor alone refills the bucket, capped
//! at one second of burst.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;

/// The semaphore implementation reserves a few bits of usize for flags;
/// anything above this would panic inside tokio.
const MAX_TOKENS: usize = usize::MAX >> 3;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Shared limiter handle. `rate == 0` builds a disabled limiter whose
/// `acquire` returns immediately.
pub struct RateLimiter {
    tokens: Option<Arc<Semaphore>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl RateLimiter {
    /// Starts the governor task on the current runtime.
    pub fn start(rate: u64, tick: Duration) -> Self {
        if rate == 0 {
            return Self { tokens: None, shutdown: None };
        }
        let tokens = Arc::new(Semaphore::new(0));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(governor_task(Arc::clone(&tokens), rate, tick, rx));
        Self { tokens: Some(tokens), shutdown: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tokens: None, shutdown: None }
    }

    /// Blocks the caller until one token is available.
    pub async fn acquire(&self) {
        if let Some(tokens) = &self.tokens {
            // the governor never closes the semaphore
            if let Ok(permit) = tokens.clone().acquire_owned().await {
                permit.forget();
            }
        }
    }

    /// Like `acquire`, but gives up after `timeout`.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        let Some(tokens) = &self.tokens else {
            return true;
        };
        match tokio::time::timeout(timeout, tokens.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    /// Stops the governor; outstanding tokens remain acquirable.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.shutdown {
            let _ = tx.send(true);
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Refills the bucket every `tick` until shut down. Available permits never
/// exceed `rate` (one second of burst).
async fn governor_task(
    tokens: Arc<Semaphore>,
    rate: u64,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let capacity = (rate as usize).min(MAX_TOKENS);
    tracing::debug!(rate, ?tick, "rate governor started");
    let refill = async {
        let mut fractional = 0.0;
        let mut next_tick = Instant::now();
        loop {
            next_tick += tick;
            let (add, carry) = tokens_for_tick(rate as f64, fractional, tick);
            fractional = carry;
            if add > 0 {
                let available = tokens.available_permits();
                if available < capacity {
                    tokens.add_permits(add.min(capacity - available));
                }
            }
            tokio::time::sleep_until(next_tick).await;
        }
    };
    tokio::select! {
        _ = refill => {}
        _ = shutdown.wait_for(|stop| *stop) => {
            tracing::debug!("rate governor shut down");
        }
    }
}

/// Pure per-tick accounting: tokens to add now plus the fractional part
/// carried into the next tick, capped at the semaphore's hard limit.
pub(crate) fn tokens_for_tick(rate: f64, fractional: f64, tick: Duration) -> (usize, f64) {
    let add_f = rate * tick.as_secs_f64();
    let total = (add_f + fractional).floor();
    let carry = (add_f + fractional) - total;
    let add = if total >= MAX_TOKENS as f64 {
        MAX_TOKENS
    } else if total < 0.0 {
        0
    } else {
        total as usize
    };
    (add, carry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_rates_leave_no_carry() {
        let (add, carry) = tokens_for_tick(1_000.0, 0.0, Duration::from_millis(100));
        assert_eq!(add, 100);
        assert_eq!(carry, 0.0);
    }

    #[test]
    fn fractional_tokens_accumulate_across_ticks() {
        // 12.5 ops/s at 100ms ticks: 1.25 tokens per tick
        let mut carry = 0.0;
        let expected = [(1, 0.25), (1, 0.5), (1, 0.75), (2, 0.0)];
        for (i, (want_add, want_carry)) in expected.iter().cycle().take(12).enumerate() {
            let (add, next) = tokens_for_tick(12.5, carry, Duration::from_millis(100));
            carry = next;
            assert_eq!(add, *want_add, "tick {i}");
            assert!((carry - want_carry).abs() < 1e-9, "tick {i}");
        }
    }

    #[test]
    fn extreme_rates_cap_at_the_semaphore_limit() {
        let (add, carry) = tokens_for_tick(f64::MAX, 0.0, Duration::from_secs(1));
        assert_eq!(add, MAX_TOKENS);
        assert_eq!(carry, 0.0);
    }

    #[test]
    fn negative_rates_add_nothing() {
        let (add, _) = tokens_for_tick(-100.0, 0.0, Duration::from_millis(100));
        assert_eq!(add, 0);
    }

    #[tokio::test]
    async fn disabled_limiter_never_blocks() {
        let limiter = RateLimiter::disabled();
        for _ in 0..10_000 {
            limiter.acquire().await;
        }
        assert!(limiter.try_acquire(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_paces_to_the_configured_rate() {
        let limiter = RateLimiter::start(1_000, DEFAULT_TICK);
        let start = Instant::now();
        for _ in 0..250 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        // 250 tokens at 100/tick arrive on the third tick
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_times_out_on_an_empty_bucket() {
        let limiter = RateLimiter::start(10, DEFAULT_TICK);
        assert!(!limiter.try_acquire(Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire(Duration::from_millis(10)).await);
    }
}
