//! Bounded retry with an incremental backoff.

use crate::context::Context;
use crate::error::Error;
use std::time::Duration;

/// Outcome of a failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Try again after the backoff.
    Retry(E),
    /// Give up immediately.
    Abort(E),
}

/// Retry schedule: up to `max_attempts` attempts within `max_timeout`, waiting `k * step` before
/// the `k`-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub max_attempts: u32,
    pub max_timeout: Duration,
    pub step: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            max_timeout: Duration::from_secs(60),
            step: Duration::from_secs(2),
        }
    }
}

impl Retry {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Delay slept before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.step.saturating_mul(retry)
    }

    /// Run `attempt` until it succeeds, aborts, or the attempt or time budget runs out.
    ///
    /// `attempt` receives the 1-based attempt number. Running out of attempts or of
    /// `max_timeout` after a failure yields [Error::TooManyAttempts] wrapping the last failure.
    /// [Error::ContextEnded] is returned as is when `ctx` itself ended or nothing was attempted.
    pub fn run<T, F>(&self, ctx: &Context, mut attempt: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Result<T, Attempt<Error>>,
    {
        let budget = ctx.child(self.max_timeout);
        let max_attempts = self.max_attempts.max(1);
        let mut last = None;

        for n in 1..=max_attempts {
            if let Err(ended) = budget.check() {
                return Err(exhausted(ctx, ended, n - 1, last));
            }
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(Attempt::Abort(err)) => return Err(err),
                Err(Attempt::Retry(err)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt = n, max_attempts, error = %err, "attempt failed");
                    last = Some(err);
                    if n < max_attempts {
                        if let Err(ended) = budget.sleep(self.backoff(n)) {
                            return Err(exhausted(ctx, ended, n, last));
                        }
                    }
                }
            }
        }

        Err(Error::TooManyAttempts {
            attempts: max_attempts,
            source: Box::new(
                last.unwrap_or_else(|| Error::Generic("no attempt was made".to_string())),
            ),
        })
    }
}

/// The error for a budget that ran out after `attempts` failed attempts.
fn exhausted(ctx: &Context, ended: Error, attempts: u32, last: Option<Error>) -> Error {
    match last {
        Some(last) if ctx.check().is_ok() => Error::TooManyAttempts {
            attempts,
            source: Box::new(last),
        },
        _ => ended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextEnd;
    use std::time::Instant;

    fn quick() -> Retry {
        Retry::default()
            .with_max_attempts(5)
            .with_step(Duration::from_millis(1))
    }

    #[test]
    fn defaults() {
        let retry = Retry::default();
        assert_eq!(retry.max_attempts, 100);
        assert_eq!(retry.max_timeout, Duration::from_secs(60));
        assert_eq!(retry.step, Duration::from_secs(2));
    }

    #[test]
    fn backoff_is_incremental() {
        let retry = Retry::default().with_step(Duration::from_millis(10));
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(3), Duration::from_millis(30));
    }

    #[test]
    fn returns_first_success() {
        let mut seen = Vec::new();
        let value = quick()
            .run(&Context::background(), |n| {
                seen.push(n);
                if n < 3 {
                    Err(Attempt::Retry(Error::Generic("not yet".into())))
                } else {
                    Ok(n * 10)
                }
            })
            .unwrap();
        assert_eq!(value, 30);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn abort_stops_immediately() {
        let mut calls = 0;
        let err = quick()
            .run(&Context::background(), |_| -> Result<(), _> {
                calls += 1;
                Err(Attempt::Abort(Error::Generic("fatal".into())))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Generic(msg) if msg == "fatal"));
    }

    #[test]
    fn too_many_attempts_keeps_last_cause() {
        let err = quick()
            .run(&Context::background(), |n| -> Result<(), _> {
                Err(Attempt::Retry(Error::Generic(format!("failure {n}"))))
            })
            .unwrap_err();
        match err {
            Error::TooManyAttempts { attempts, source } => {
                assert_eq!(attempts, 5);
                assert_eq!(source.to_string(), "failure 5");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ended_context_aborts_before_first_attempt() {
        let ctx = Context::background();
        ctx.cancel();
        let mut calls = 0;
        let err = quick()
            .run(&ctx, |_| -> Result<(), _> {
                calls += 1;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(calls, 0);
        assert!(matches!(err, Error::ContextEnded(ContextEnd::Cancelled)));
    }

    #[test]
    fn max_timeout_keeps_last_cause() {
        let retry = Retry::default()
            .with_max_attempts(100)
            .with_step(Duration::from_secs(5))
            .with_max_timeout(Duration::from_millis(30));
        let started = Instant::now();
        let err = retry
            .run(&Context::background(), |_| -> Result<(), _> {
                Err(Attempt::Retry(Error::Generic("down".into())))
            })
            .unwrap_err();
        match err {
            Error::TooManyAttempts { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.to_string(), "down");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn caller_cancel_during_backoff_is_reported_as_is() {
        let ctx = Context::background();
        let err = Retry::default()
            .with_step(Duration::from_secs(5))
            .run(&ctx, |_| -> Result<(), _> {
                ctx.cancel();
                Err(Attempt::Retry(Error::Generic("down".into())))
            })
            .unwrap_err();
        assert!(matches!(err, Error::ContextEnded(ContextEnd::Cancelled)));
    }

    #[test]
    fn huge_step_does_not_overflow() {
        let retry = Retry::default()
            .with_step(Duration::from_secs(u64::MAX))
            .with_max_timeout(Duration::from_millis(20));
        let err = retry
            .run(&Context::background(), |_| -> Result<(), _> {
                Err(Attempt::Retry(Error::Generic("down".into())))
            })
            .unwrap_err();
        assert!(matches!(err, Error::TooManyAttempts { attempts: 1, .. }));
    }
}
