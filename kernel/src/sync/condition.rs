//! Condition variables
//!
//! A [`Condition`] is a named FIFO of waiting threads. `wait` must be
//! called with interrupts disabled; it parks the calling thread and
//! re-enables interrupts for the duration of the sleep. `broadcast` wakes
//! every parked thread and is safe to call from interrupt handlers.

extern crate alloc;

use alloc::collections::VecDeque;

use spin::Mutex;

use crate::sched::{self, Tid};

/// A FIFO wait queue keyed by a name (used in diagnostics).
pub struct Condition {
    name: &'static str,
    waiters: Mutex<VecDeque<Tid>>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Park the calling thread until the next [`broadcast`].
    ///
    /// Must be entered with interrupts disabled; the scheduler re-enables
    /// them while the thread sleeps and they are disabled again when this
    /// returns.
    ///
    /// [`broadcast`]: Condition::broadcast
    pub fn wait(&self) {
        debug_assert!(
            !crate::sync::intr::enabled(),
            "condition {}: wait with interrupts enabled",
            self.name
        );
        let tid = sched::current_tid();
        self.waiters.lock().push_back(tid);
        sched::block_current();
    }

    /// Wake every thread parked on this condition.
    pub fn broadcast(&self) {
        crate::sync::intr::with_disabled(|| {
            let mut waiters = self.waiters.lock();
            while let Some(tid) = waiters.pop_front() {
                sched::unpark(tid);
            }
        });
    }
}
