// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Blocking wait primitives used between caller context and the bottom half

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Default)]
struct CompletionState {
    done: u32,
    aborted: bool,
}

/// Counting completion signalled from interrupt context
///
/// `complete` never blocks. `abort` is used on teardown: any current or
/// future waiter fails with `IoError` instead of sleeping until its timeout.
#[derive(Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop completions left over from a previous round trip
    pub fn reinit(&self) {
        self.state.lock().done = 0;
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.done = state.done.saturating_add(1);
        self.cond.notify_one();
    }

    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done > 0
    }

    /// Consume one completion, waiting at most `timeout`
    ///
    /// A timeout too large to form a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(Error::IoError);
            }
            if state.done > 0 {
                state.done -= 1;
                return Ok(());
            }
            let Some(deadline) = deadline else {
                self.cond.wait(&mut state);
                continue;
            };
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.done > 0 && !state.aborted {
                    state.done -= 1;
                    return Ok(());
                }
                return Err(if state.aborted { Error::IoError } else { Error::Timeout });
            }
        }
    }
}

/// Wait queue for conditions owned by someone else
///
/// The condition is evaluated with the queue lock held and `wake_up` takes
/// the same lock, so a wake-up between check and sleep is never lost.
/// Callers must not hold the lock guarding the condition when calling
/// `wake_up`.
#[derive(Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the final value of `condition`. A timeout too large to form
    /// a deadline waits until the condition holds.
    pub fn wait_event_timeout<F>(&self, mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock.lock();
        loop {
            if condition() {
                return true;
            }
            let Some(deadline) = deadline else {
                self.cond.wait(&mut guard);
                continue;
            };
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return condition();
            }
        }
    }

    pub fn wake_up(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}
