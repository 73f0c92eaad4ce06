//! Manager lifecycle state machine
//!
//! The state only moves forward within one start/stop cycle:
//! `WaitingForInterfaces → WaitingForThreads → Running → Stopping → Stopped`.
//! Transitions are driven by two countdown latches: one counts reactor
//! threads that have yet to enter their loop, the other counts threads that
//! have yet to leave it.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Lifecycle states in strict progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IomgrState {
    /// `start()` was called; interface registrations are being collected.
    WaitingForInterfaces,
    /// All expected interfaces registered; reactor threads are spawning.
    WaitingForThreads,
    /// Every spawned reactor entered its loop; global fds may be added.
    Running,
    /// `stop()` was called; reactors are draining out of their loops.
    Stopping,
    /// All reactors exited and registries are cleared.
    Stopped,
}

impl fmt::Display for IomgrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IomgrState::WaitingForInterfaces => "waiting_for_interfaces",
            IomgrState::WaitingForThreads => "waiting_for_threads",
            IomgrState::Running => "running",
            IomgrState::Stopping => "stopping",
            IomgrState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Current state plus a condition for waiters.
pub(crate) struct StateCell {
    state: Mutex<IomgrState>,
    cond: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(IomgrState::Stopped),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> IomgrState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, new: IomgrState) {
        let mut guard = self.state.lock();
        tracing::info!(from = %*guard, to = %new, "IO manager state transition");
        *guard = new;
    }

    /// Set the state and wake every thread blocked in [`wait_for`].
    ///
    /// [`wait_for`]: StateCell::wait_for
    pub(crate) fn set_and_notify(&self, new: IomgrState) {
        {
            let mut guard = self.state.lock();
            tracing::info!(from = %*guard, to = %new, "IO manager state transition");
            *guard = new;
        }
        self.cond.notify_all();
    }

    /// Block until the predicate holds, returning the state that satisfied it.
    pub(crate) fn wait_for(&self, pred: impl Fn(IomgrState) -> bool) -> IomgrState {
        let mut guard = self.state.lock();
        while !pred(*guard) {
            self.cond.wait(&mut guard);
        }
        *guard
    }
}

/// Signed countdown latch with decrement-and-test semantics.
pub(crate) struct Countdown(AtomicI64);

impl Countdown {
    pub(crate) fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub(crate) fn set(&self, v: i64) {
        self.0.store(v, Ordering::Release);
    }

    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement and report whether the count reached zero.
    pub(crate) fn decrement_testz(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_ordering() {
        assert!(IomgrState::WaitingForInterfaces < IomgrState::WaitingForThreads);
        assert!(IomgrState::WaitingForThreads < IomgrState::Running);
        assert!(IomgrState::Running < IomgrState::Stopping);
        assert!(IomgrState::Stopping < IomgrState::Stopped);
    }

    #[test]
    fn test_wait_for_notified() {
        let cell = Arc::new(StateCell::new());
        cell.set(IomgrState::WaitingForInterfaces);

        let waiter = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.wait_for(|s| s >= IomgrState::Running))
        };

        std::thread::sleep(Duration::from_millis(10));
        cell.set_and_notify(IomgrState::Running);
        assert_eq!(waiter.join().unwrap(), IomgrState::Running);
    }

    #[test]
    fn test_countdown_latch() {
        let latch = Countdown::new();
        latch.set(2);
        assert!(!latch.decrement_testz());
        assert!(latch.decrement_testz());

        // The pre-increment/decrement pattern used by stop() with no threads.
        latch.set(0);
        latch.increment();
        assert!(latch.decrement_testz());
    }
}
