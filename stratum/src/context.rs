//! Operation-wide deadline and cancellation.

use crate::error::{ContextEnd, Error};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Carries the deadline and cancellation signal of one operation.
///
/// Clones and children share the cancellation signal: cancelling any of them ends all of them.
/// Nothing is ever sent on the channel; cancellation drops the only sender, which wakes every
/// blocked receiver.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    done: Receiver<()>,
    cancel: Arc<Mutex<Option<Sender<()>>>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context without deadline that ends only when cancelled.
    pub fn background() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            deadline: None,
            done: rx,
            cancel: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        let mut ctx = Self::background();
        ctx.deadline = Some(deadline);
        ctx
    }

    /// A context ending `timeout` from now, or earlier if this one ends first.
    pub fn child(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, candidate) {
            (Some(current), Some(candidate)) => Some(current.min(candidate)),
            (current, None) => current,
            (None, candidate) => candidate,
        };
        Self {
            deadline,
            done: self.done.clone(),
            cancel: Arc::clone(&self.cancel),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        if let Ok(mut sender) = self.cancel.lock() {
            sender.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Fail with [Error::ContextEnded] if the context was cancelled or its deadline passed.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::ContextEnded(ContextEnd::Cancelled));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Error::ContextEnded(ContextEnd::DeadlineExceeded))
            }
            _ => Ok(()),
        }
    }

    /// Block for `duration`, returning early with an error if the context ends first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.check()?;
        let until = match (Instant::now().checked_add(duration), self.deadline) {
            (Some(wake), Some(deadline)) => Some(wake.min(deadline)),
            (wake, deadline) => wake.or(deadline),
        };
        let woken = match until {
            Some(until) => self.done.recv_deadline(until),
            None => self.done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match woken {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ContextEnded(ContextEnd::Cancelled))
            }
            Err(RecvTimeoutError::Timeout) => self.check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn background_never_expires() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn deadline_is_reported() {
        let ctx = Context::with_deadline(Instant::now());
        assert!(matches!(
            ctx.check(),
            Err(Error::ContextEnded(ContextEnd::DeadlineExceeded))
        ));
    }

    #[test]
    fn child_keeps_the_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        let tighter = Context::with_timeout(Duration::from_secs(60)).child(Duration::from_millis(1));
        assert!(tighter.remaining().unwrap() <= Duration::from_millis(1));
    }

    #[test]
    fn cancel_is_shared_with_children() {
        let parent = Context::background();
        let child = parent.child(Duration::from_secs(60));
        child.cancel();
        assert!(parent.is_cancelled());
        assert!(matches!(
            parent.check(),
            Err(Error::ContextEnded(ContextEnd::Cancelled))
        ));
    }

    #[test]
    fn sleep_stops_at_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(10));
        assert!(matches!(
            result,
            Err(Error::ContextEnded(ContextEnd::DeadlineExceeded))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(10));
        handle.join().unwrap();
        assert!(matches!(
            result,
            Err(Error::ContextEnded(ContextEnd::Cancelled))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unbounded_sleep_stops_at_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(5));
        assert!(matches!(
            ctx.sleep(Duration::MAX),
            Err(Error::ContextEnded(ContextEnd::DeadlineExceeded))
        ));
    }

    #[test]
    fn unbounded_sleep_wakes_on_cancel() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let result = ctx.sleep(Duration::MAX);
        handle.join().unwrap();
        assert!(matches!(
            result,
            Err(Error::ContextEnded(ContextEnd::Cancelled))
        ));
    }

    #[test]
    fn short_sleep_completes() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(1)).is_ok());
    }
}
