//! Synchronization between per-role tasks.
//!
//! Each role runs on its own thread. A task announces that it has finished through a [`Gate`],
//! and tasks that depend on it block on the same gate until then. [`Permits`] bounds how many
//! tasks talk to remote hosts at once.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Done,
    Failed,
}

/// What a task waiting on its prerequisites should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    Proceed,
    /// The named prerequisite failed.
    Blocked(String),
    Cancelled,
}

#[derive(Default)]
struct GateState {
    signals: HashMap<String, Signal>,
    cancelled: bool,
}

#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, role: &str, signal: Signal) {
        lock(&self.state).signals.insert(role.to_owned(), signal);
        self.cv.notify_all();
    }

    /// Wake every waiter and make all further waits return [`Wait::Cancelled`].
    pub fn cancel(&self) {
        lock(&self.state).cancelled = true;
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Block until every role in `roles` has signalled [`Signal::Done`], one of them has failed,
    /// or the gate is cancelled.
    pub fn wait_for<S: AsRef<str>>(&self, roles: &[S]) -> Wait {
        let mut state = lock(&self.state);
        loop {
            if state.cancelled {
                return Wait::Cancelled;
            }

            let mut all_done = true;
            for role in roles.iter().map(AsRef::as_ref) {
                match state.signals.get(role) {
                    Some(Signal::Done) => {}
                    Some(Signal::Failed) => return Wait::Blocked(role.to_owned()),
                    None => all_done = false,
                }
            }
            if all_done {
                return Wait::Proceed;
            }

            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Sleep for `d`, waking early if the gate is cancelled. Returns `false` if it was.
    pub fn sleep(&self, d: Duration) -> bool {
        let until = crate::deadline_in(d);
        let mut state = lock(&self.state);
        loop {
            if state.cancelled {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            state = self
                .cv
                .wait_timeout(state, until - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Signals `role` on the gate when dropped, even if the task panicked before settling.
pub struct Settle<'g> {
    gate: &'g Gate,
    role: String,
    signal: Signal,
}

impl<'g> Settle<'g> {
    /// `signal` is what gets sent unless [`Settle::set`] changes it.
    pub fn new(gate: &'g Gate, role: &str, signal: Signal) -> Self {
        Settle {
            gate,
            role: role.to_owned(),
            signal,
        }
    }

    pub fn set(&mut self, signal: Signal) {
        self.signal = signal;
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.gate.signal(&self.role, self.signal);
    }
}

/// A counting semaphore.
pub struct Permits {
    available: Mutex<usize>,
    cv: Condvar,
}

impl Permits {
    pub fn new(n: usize) -> Self {
        assert!(n > 0);
        Permits {
            available: Mutex::new(n),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Permit<'_> {
        let mut available = lock(&self.available);
        while *available == 0 {
            available = self
                .cv
                .wait(available)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *available -= 1;
        Permit(self)
    }
}

pub struct Permit<'p>(&'p Permits);

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *lock(&self.0.available) += 1;
        self.0.cv.notify_one();
    }
}
