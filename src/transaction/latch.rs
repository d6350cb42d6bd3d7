// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The single-shot suspension token a parked transaction waits on.
///
/// When a transaction retries, a latch is registered on every ref in its
/// read log. The first writer publishing any of those refs signals it.
/// Signalling is level-triggered at registration time, so a latch can never
/// miss a publication that happened while it was being attached.
///
/// Be careful when using this directly; it is easy to create deadlocks.
#[derive(Debug)]
pub(crate) struct RetryLatch {
    /// True until the latch has been signalled.
    ///
    /// Kept outside the mutex so that a writer draining the waiter lists of
    /// many refs never blocks on a thread that is just about to park.
    blocked: AtomicBool,

    /// Set by `interrupt`; only honoured by interruptible waits.
    interrupted: AtomicBool,

    /// Lock for the condition variable.
    lock: Mutex<()>,

    /// Parks and wakes the owning thread.
    cvar: Condvar,
}

/// Why `await_signal` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Signalled,
    TimedOut,
    Interrupted,
}

impl RetryLatch {
    pub fn new() -> RetryLatch {
        RetryLatch {
            blocked: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Inform the latch that a watched ref has changed.
    ///
    /// Called from writer threads; may run before the owner even parks.
    pub fn signal(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        self.cvar.notify_one();
    }

    /// Deliver an interrupt. Ignored unless the owner waits interruptibly.
    #[allow(dead_code)]
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cvar.notify_one();
    }

    pub fn is_signalled(&self) -> bool {
        !self.blocked.load(Ordering::SeqCst)
    }

    /// Park until signalled, the deadline elapses, or an interrupt arrives
    /// (when `interruptible`). May return immediately.
    pub fn await_signal(&self, timeout: Option<Duration>, interruptible: bool) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock.lock();
        loop {
            if !self.blocked.load(Ordering::SeqCst) {
                return WaitOutcome::Signalled;
            }
            if interruptible && self.interrupted.load(Ordering::SeqCst) {
                return WaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut guard, deadline).timed_out()
                        && self.blocked.load(Ordering::SeqCst)
                    {
                        return WaitOutcome::TimedOut;
                    }
                }
                None => self.cvar.wait(&mut guard),
            }
        }
    }
}
