//! Collapse concurrent calls into one execution
//!
//! The first caller becomes the leader and runs the work; callers arriving
//! while it runs wait for the leader's result and receive a clone of it.
//! Waiters stop waiting when their own [`Context`] ends, without affecting
//! the leader.

use crate::core::{Context, ContextError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often a waiter re-checks its context
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct Call<T> {
    result: Mutex<Option<T>>,
    done: Condvar,
    waiters: AtomicUsize,
}

/// Single-flight group for one kind of work
pub struct SingleFlight<T> {
    slot: Mutex<Option<Arc<Call<T>>>>,
}

/// Clears the slot even if the leader's work panics
struct LeaderGuard<'a, T> {
    group: &'a SingleFlight<T>,
    call: &'a Arc<Call<T>>,
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        let mut slot = self.group.slot.lock();
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, self.call)) {
            *slot = None;
        }
        drop(slot);
        self.call.done.notify_all();
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Run `work`, or join the execution already in flight
    ///
    /// Returns `Err` only for a joiner whose context ended before the leader
    /// finished (or if the leader panicked, reported as `Canceled`).
    pub fn run<F>(&self, ctx: &Context, work: F) -> Result<T, ContextError>
    where
        F: FnOnce() -> T,
    {
        let (call, leader) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(call) => (call.clone(), false),
                None => {
                    let call = Arc::new(Call {
                        result: Mutex::new(None),
                        done: Condvar::new(),
                        waiters: AtomicUsize::new(0),
                    });
                    *slot = Some(call.clone());
                    (call, true)
                }
            }
        };

        if leader {
            let _guard = LeaderGuard {
                group: self,
                call: &call,
            };
            let value = work();
            *call.result.lock() = Some(value.clone());
            return Ok(value);
        }

        call.waiters.fetch_add(1, Ordering::SeqCst);
        let outcome = self.wait(ctx, &call);
        call.waiters.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn wait(&self, ctx: &Context, call: &Arc<Call<T>>) -> Result<T, ContextError> {
        let mut result = call.result.lock();
        loop {
            if let Some(value) = result.as_ref() {
                return Ok(value.clone());
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if !self.is_current(call) {
                // Leader finished without storing a result: it panicked
                return Err(ContextError::Canceled);
            }
            call.done.wait_for(&mut result, ctx.wait_slice(WAIT_SLICE));
        }
    }

    fn is_current(&self, call: &Arc<Call<T>>) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, call))
    }

    /// Whether an execution is running
    pub fn in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Callers currently waiting on the in-flight execution
    pub fn waiters(&self) -> usize {
        self.slot
            .lock()
            .as_ref()
            .map_or(0, |call| call.waiters.load(Ordering::SeqCst))
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}
