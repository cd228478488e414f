//! Bounded retry with exponential backoff, applied explicitly at call
//! sites instead of hiding control flow behind a wrapper type.

use core::{fmt::Display, future::Future, time::Duration};

/// A retry policy: total attempt count, initial delay and backoff
/// multiplier. `attempts` counts the first try, so `attempts: 3` means one
/// try plus two retries.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(attempts: u32, base_delay: Duration, backoff: f64) -> Self {
        Self {
            attempts,
            base_delay,
            backoff,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.backoff.powi(attempt as i32))
    }

    /// Runs `op` until it succeeds or the attempt budget is exhausted,
    /// sleeping on the tokio timer between attempts. The last error
    /// surfaces to the caller.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < self.attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        target: "retry",
                        "{what} failed: {e}, retrying in {:.1}s ({}/{})",
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.attempts,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(target: "retry", "{what} failed after {} attempts", self.attempts);
                    return Err(e);
                }
            }
        }
    }

    /// Synchronous variant for blocking call sites (the IMAP session).
    pub fn run_blocking<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < self.attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        target: "retry",
                        "{what} failed: {e}, retrying in {:.1}s ({}/{})",
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.attempts,
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(target: "retry", "{what} failed after {} attempts", self.attempts);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::ZERO, 2.0);

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let r: Result<&str, &str> = FAST
            .run("op", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 { Err("transient") } else { Ok("done") }
                }
            })
            .await;
        assert_eq!(r, Ok("done"));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_on_exhaustion() {
        let calls = Cell::new(0);
        let r: Result<(), String> = FAST
            .run("op", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Err(format!("boom {n}")) }
            })
            .await;
        assert_eq!(r, Err("boom 3".to_owned()));
    }

    #[test]
    fn blocking_variant_counts_attempts() {
        let mut calls = 0;
        let r: Result<(), &str> = FAST.run_blocking("op", || {
            calls += 1;
            Err("nope")
        });
        assert!(r.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn delays_grow_by_backoff() {
        let p = RetryPolicy::new(4, Duration::from_secs(2), 2.0);
        assert_eq!(p.delay_for(0), Duration::from_secs(2));
        assert_eq!(p.delay_for(1), Duration::from_secs(4));
        assert_eq!(p.delay_for(2), Duration::from_secs(8));
    }
}
