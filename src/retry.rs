//! Centralized retry/backoff helper.
//!
//! Per the design note in spec §9, exponential-backoff loops are not
//! scattered across the blob store, summarizer, and extraction executor —
//! each calls [`retry_with_backoff`] with its own retry predicate and delay
//! schedule. Modeled on the retry loop in the teacher's
//! `embedding::embed_openai` (exponential backoff, retry only on a
//! caller-supplied predicate, bail immediately otherwise).

use std::future::Future;
use std::time::Duration;

/// Classifies an error as retryable or not. Returning `false` aborts the
/// retry loop immediately and propagates the error.
pub trait RetryPredicate<E> {
    fn should_retry(&self, err: &E) -> bool;
}

impl<E, F: Fn(&E) -> bool> RetryPredicate<E> for F {
    fn should_retry(&self, err: &E) -> bool {
        self(err)
    }
}

/// A backoff schedule: delay before the Nth retry (N is zero-indexed, so
/// `delay(0)` is the wait before the *first* retry, i.e. after the initial
/// attempt failed).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Additive jitter upper bound, deterministic per call (no RNG
    /// dependency — seeded from a caller-supplied salt).
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn delay_for(&self, attempt: u32, salt: u64) -> Duration {
        let exp = 1u64.checked_shl(attempt.min(10)).unwrap_or(u64::MAX);
        let scaled = self.base.saturating_mul(exp as u32).min(self.cap);
        if self.jitter.is_zero() {
            return scaled;
        }
        let jitter_frac = xorshift(salt.wrapping_add(attempt as u64)) % 1000;
        let jitter = self.jitter.mul_f64(jitter_frac as f64 / 1000.0);
        scaled + jitter
    }
}

/// A cheap, dependency-free pseudo-random stream for jitter. Not
/// cryptographic; only used to avoid synchronized retry storms.
fn xorshift(mut x: u64) -> u64 {
    if x == 0 {
        x = 0x9E3779B97F4A7C15;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Run `attempt` up to `max_attempts` times total. Between attempts, sleeps
/// per `backoff`. `retryable` decides whether a given error is worth
/// retrying at all; non-retryable errors return immediately on the first
/// occurrence. `salt` seeds the jitter term (pass something call-specific,
/// e.g. a chunk id hash, so concurrent callers don't all wake at once).
pub async fn retry_with_backoff<T, E, Fut, A, R>(
    max_attempts: u32,
    backoff: Backoff,
    salt: u64,
    retryable: R,
    mut attempt: A,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    A: FnMut(u32) -> Fut,
    R: RetryPredicate<E>,
{
    let mut last_err = None;
    for i in 0..max_attempts.max(1) {
        if i > 0 {
            tokio::time::sleep(backoff.delay_for(i - 1, salt)).await;
        }
        match attempt(i).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !retryable.should_retry(&e) {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("max_attempts >= 1 guarantees at least one error"))
}
