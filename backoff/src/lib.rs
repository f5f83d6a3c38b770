//! Backoff functionality.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::warn;
use rand::prelude::*;
use std::time::Duration;

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(500),
            base: 3.,
        }
    }
}

/// Error after giving up retrying.
#[derive(Debug)]
pub struct RetriesExhausted<E> {
    /// The error returned by the final attempt.
    pub last_error: E,

    /// How many attempts were made in total.
    pub attempts: usize,
}

impl<E: std::fmt::Display> std::fmt::Display for RetriesExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retries exhausted after {} attempts, last error: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetriesExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval, growing exponentially with jitter until the maximum is reached.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for
    fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation, retrying every error with backoff until
    /// it succeeds. Never gives up.
    pub async fn retry_all_errors<F, F1, B, E>(&mut self, task_name: &str, mut do_stuff: F) -> B
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        loop {
            // first obtain the future and then await it, so `F` need not be `Sync`.
            let fut = do_stuff();

            let e = match fut.await {
                Ok(r) => break r,
                Err(e) => e,
            };

            let backoff = self.next();
            warn!(
                error=%e,
                task_name,
                backoff_secs = backoff.as_secs(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Perform an async operation, retrying errors with backoff for at most
    /// `max_attempts` attempts. The final error is surfaced as
    /// [`RetriesExhausted`].
    pub async fn retry_with_limit<F, F1, B, E>(
        &mut self,
        task_name: &str,
        max_attempts: usize,
        mut do_stuff: F,
    ) -> Result<B, RetriesExhausted<E>>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        assert!(max_attempts > 0);

        for attempt in 1..=max_attempts {
            let fut = do_stuff();

            let e = match fut.await {
                Ok(r) => return Ok(r),
                Err(e) => e,
            };

            if attempt == max_attempts {
                return Err(RetriesExhausted {
                    last_error: e,
                    attempts: attempt,
                });
            }

            let backoff = self.next();
            warn!(
                error=%e,
                task_name,
                attempt,
                backoff_secs = backoff.as_secs(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }

        unreachable!("loop returns on final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_progression() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 500.;
        let base = 3.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        // A static rng that always takes the minimum of the range
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for _ in 0..20 {
            assert_eq!(backoff.next().as_secs_f64(), init_backoff_secs);
        }

        // A static rng that always takes the maximum of the range
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }
    }

    #[tokio::test]
    async fn retry_all_errors_eventually_succeeds() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 1.1,
        };

        let calls = AtomicUsize::new(0);
        let got = Backoff::new(&config)
            .retry_all_errors("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err("boom")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(got, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_with_limit_gives_up() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 1.1,
        };

        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = Backoff::new(&config)
            .retry_with_limit("test", 3, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("always fails") }
            })
            .await;

        let err = res.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
