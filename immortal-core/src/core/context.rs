//! Cancellation scopes with optional deadlines
//!
//! A [`Context`] is handed to every operation that may block on the network:
//! `connect`, `force_reconnect`, `wait_for_connection`, and the caller's
//! [`Reconnector`](crate::pipe::Reconnector). Cancelling a context cancels every
//! context derived from it.
//!
//! ```
//! use immortal_core::Context;
//! use std::time::Duration;
//!
//! let root = Context::background();
//! let ctx = root.with_timeout(Duration::from_millis(5));
//! assert!(ctx.sleep(Duration::from_secs(1)).is_err());
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a context is done
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// `cancel()` was called on the context or one of its ancestors
    #[error("context canceled")]
    Canceled,

    /// The context deadline elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cheap-to-clone cancellation scope
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    parent: Option<Context>,
    deadline: Option<Instant>,
    canceled: Mutex<bool>,
    cond: Condvar,
    children: Mutex<Vec<Weak<ContextInner>>>,
}

impl Context {
    /// Root context: never canceled unless `cancel()` is called on it
    pub fn background() -> Self {
        Self::build(None, None)
    }

    fn build(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let inner = Arc::new(ContextInner {
            parent,
            deadline,
            canceled: Mutex::new(false),
            cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
        });

        if let Some(parent) = &inner.parent {
            let mut children = parent.inner.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&inner));
        }

        Self { inner }
    }

    /// Derive a child that is canceled with this context, or on its own
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), self.inner.deadline)
    }

    /// Derive a child that expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that expires at `deadline` (or the parent's, if earlier)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self::build(Some(self.clone()), Some(deadline))
    }

    /// Derive a child that ends when either `self` or `other` ends
    ///
    /// The deadline is the earlier of the two.
    pub fn merge(&self, other: &Context) -> Self {
        let merged = match other.deadline() {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        };

        {
            let mut children = other.inner.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&merged.inner));
        }
        // `other` may have been canceled before we registered
        if other.err() == Some(ContextError::Canceled) {
            merged.cancel();
        }

        merged
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Error describing why the context is done, `None` while still live
    pub fn err(&self) -> Option<ContextError> {
        if *self.inner.canceled.lock() {
            return Some(ContextError::Canceled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(ContextError::DeadlineExceeded);
            }
        }
        self.inner.parent.as_ref().and_then(Context::err)
    }

    /// Whether the context is canceled or expired
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline (`None` when there is no deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamp a wait slice so it never sleeps past the deadline
    pub(crate) fn wait_slice(&self, max: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(max),
            None => max,
        }
    }

    /// Sleep for `duration`, returning early with an error if the context ends
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let wake_at = Instant::now() + duration;
        let mut canceled = self.inner.canceled.lock();
        loop {
            if *canceled {
                return Err(ContextError::Canceled);
            }
            // Ancestors propagate cancellation down, so only deadlines need polling here
            if let Some(err) = self.inner.parent.as_ref().and_then(Context::err) {
                return Err(err);
            }
            let now = Instant::now();
            if let Some(deadline) = self.inner.deadline {
                if now >= deadline {
                    return Err(ContextError::DeadlineExceeded);
                }
            }
            if now >= wake_at {
                return Ok(());
            }

            let until = match self.inner.deadline {
                Some(deadline) if deadline < wake_at => deadline,
                _ => wake_at,
            };
            self.inner.cond.wait_until(&mut canceled, until);
        }
    }
}

impl ContextInner {
    fn cancel(&self) {
        {
            let mut canceled = self.canceled.lock();
            if *canceled {
                return;
            }
            *canceled = true;
            self.cond.notify_all();
        }

        let children: Vec<_> = self.children.lock().drain(..).collect();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        root.cancel();

        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(grandchild.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let root = Context::background();
        let child = root.child();
        child.cancel();

        assert!(root.err().is_none());
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_merge_ends_with_either_side() {
        let pipe = Context::background().child();
        let caller = Context::background().child();

        let merged = pipe.merge(&caller);
        caller.cancel();
        assert_eq!(merged.err(), Some(ContextError::Canceled));
        assert!(pipe.err().is_none());

        let merged = pipe.merge(&Context::background());
        pipe.cancel();
        assert_eq!(merged.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_merge_takes_earlier_deadline() {
        let caller = Context::background().with_timeout(Duration::from_millis(20));
        let merged = Context::background().merge(&caller);
        assert_eq!(merged.deadline(), caller.deadline());

        let canceled = Context::background().child();
        canceled.cancel();
        assert!(Context::background().merge(&canceled).is_done());
    }

    #[test]
    fn test_sleep_completes() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(5)).is_ok());
    }

    #[test]
    fn test_sleep_interrupted_by_cancel() {
        let ctx = Context::background().child();
        let canceler = ctx.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceler.cancel();
        });

        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(30));
        handle.join().unwrap();

        assert_eq!(result, Err(ContextError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sleep_interrupted_by_parent_cancel() {
        let root = Context::background();
        let ctx = root.child();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            root.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(30));
        handle.join().unwrap();
        assert_eq!(result, Err(ContextError::Canceled));
    }

    #[test]
    fn test_sleep_stops_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let result = ctx.sleep(Duration::from_secs(30));
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
    }
}
