// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The executor: runs a closure under a transaction, handles the control
//! signals, retries on conflict, escalates speculation, parks on retry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_utils::Backoff;
use tracing::debug;

use crate::config::{Propagation, TxConfig};
use crate::error::{Control, Stm, TxError};
use crate::transaction::latch::WaitOutcome;
use crate::transaction::log::Shape;
use crate::transaction::Transaction;

thread_local! {
    /// The transaction currently running on this thread, installed by the
    /// executor on entry and cleared on exit. Nested executes join it;
    /// ambient operations find it through [`with_tx`].
    static ACTIVE: RefCell<Option<Rc<Transaction>>> = const { RefCell::new(None) };

    /// Set while an `atomic_checked` block runs; tracks which refs the
    /// block's atomic operations touched.
    static ATOMIC_SCOPE: Cell<Option<AtomicScope>> = const { Cell::new(None) };
}

#[derive(Clone, Copy)]
struct AtomicScope {
    first: Option<u64>,
    violated: bool,
}

/// Run `f` against the transaction active on this thread.
///
/// This is the ambient form of the explicit-transaction API: it lifts on
/// the context the executor installed, and fails with
/// [`TxError::TransactionMandatory`] when called outside one.
///
/// ```
/// use vstm::{atomically, with_tx, TRef};
///
/// let var = TRef::new(1);
/// let x = atomically(|_| with_tx(|tx| var.get(tx)));
/// assert_eq!(x, 1);
/// ```
pub fn with_tx<T>(f: impl FnOnce(&Transaction) -> Stm<T>) -> Stm<T> {
    let tx = ACTIVE.with(|slot| slot.borrow().clone());
    match tx {
        Some(tx) => f(&tx),
        None => Err(Control::Fatal(TxError::TransactionMandatory)),
    }
}

/// Record that an atomic operation touched `id`, for `atomic_checked`.
pub(crate) fn note_atomic_touch(id: u64) {
    ATOMIC_SCOPE.with(|slot| {
        if let Some(mut scope) = slot.get() {
            match scope.first {
                None => scope.first = Some(id),
                Some(first) if first != id => scope.violated = true,
                Some(_) => {}
            }
            slot.set(Some(scope));
        }
    });
}

/// Run `f` without a transaction, verifying that it stays atomic.
///
/// The closure may use the `atomic_*` family freely on a single ref; the
/// moment it touches a second ref the call fails with
/// [`TxError::AtomicBlockViolation`], because two independent single-ref
/// commits are not one atomic step.
pub fn atomic_checked<T>(f: impl FnOnce() -> T) -> Result<T, TxError> {
    if ACTIVE.with(|slot| slot.borrow().is_some()) {
        return Err(TxError::TransactionNotAllowed);
    }

    struct ScopeGuard;
    impl Drop for ScopeGuard {
        fn drop(&mut self) {
            ATOMIC_SCOPE.with(|slot| slot.set(None));
        }
    }

    ATOMIC_SCOPE.with(|slot| {
        slot.set(Some(AtomicScope {
            first: None,
            violated: false,
        }))
    });
    let guard = ScopeGuard;
    let value = f();
    let scope = ATOMIC_SCOPE.with(|slot| slot.get());
    drop(guard);

    match scope {
        Some(scope) if scope.violated => Err(TxError::AtomicBlockViolation),
        _ => Ok(value),
    }
}

/// Clears the thread-local slot when an attempt ends, and aborts the
/// transaction when the closure unwinds, so a panic can never leak locks
/// or tentative state.
struct SlotGuard {
    tx: Rc<Transaction>,
    armed: bool,
}

impl SlotGuard {
    fn install(tx: Rc<Transaction>) -> SlotGuard {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            debug_assert!(slot.is_none(), "an attempt is already installed");
            *slot = Some(tx.clone());
        });
        SlotGuard { tx, armed: true }
    }

    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.borrow_mut().take());
        if self.armed {
            self.tx.abort();
        }
    }
}

/// Restores a stashed outer transaction after a `RequiresNew` scope.
struct StashGuard(Option<Rc<Transaction>>);

impl Drop for StashGuard {
    fn drop(&mut self) {
        ACTIVE.with(|slot| *slot.borrow_mut() = self.0.take());
    }
}

/// Run `f` as a transaction under the default configuration.
///
/// Retries transparently until the closure both completes and commits.
/// Panics if the executor itself gives up (for example
/// [`TxError::TooManyRetries`]); use [`execute`] for the checked form.
///
/// ```
/// use vstm::{atomically, TRef};
///
/// let var = TRef::new(0);
///
/// let x = atomically(|tx| {
///     var.set(tx, 42)?;
///     var.get(tx)
/// });
///
/// assert_eq!(x, 42);
/// ```
pub fn atomically<T>(f: impl Fn(&Transaction) -> Stm<T>) -> T {
    match execute(&TxConfig::default(), f) {
        Ok(value) => value,
        Err(e) => panic!("vstm: transaction failed: {e}"),
    }
}

/// Run `f` as a transaction under `config`.
///
/// The closure may run many times; it must be free of side effects other
/// than ref operations. How the call composes with a transaction already
/// active on this thread is governed by `config.propagation`; by default it
/// joins it (flattened nesting, no inner retry scope).
pub fn execute<T>(
    config: &TxConfig,
    f: impl Fn(&Transaction) -> Stm<T>,
) -> Result<T, TxError> {
    execute_with(config, &f, None)
}

fn execute_with<T>(
    config: &TxConfig,
    f: &impl Fn(&Transaction) -> Stm<T>,
    learned: Option<&AtomicU8>,
) -> Result<T, TxError> {
    let active = ACTIVE.with(|slot| slot.borrow().clone());
    match (config.propagation, active) {
        (Propagation::Mandatory, None) => Err(TxError::TransactionMandatory),
        (Propagation::Never, Some(_)) => Err(TxError::TransactionNotAllowed),
        (Propagation::RequiresNew, Some(_)) => {
            let _stash = StashGuard(ACTIVE.with(|slot| slot.borrow_mut().take()));
            run_loop(config, f, learned)
        }
        (_, Some(tx)) => join(&tx, f),
        (_, None) => run_loop(config, f, learned),
    }
}

/// Flattened nesting: run the closure against the already-active context.
///
/// A control signal raised here belongs to the *outer* retry scope, so it
/// dooms the shared context and the enclosing executor re-raises it. The
/// `InnerConflict` placeholder only exists to satisfy this frame's return
/// type; swallowing it changes nothing.
fn join<T>(tx: &Transaction, f: &impl Fn(&Transaction) -> Stm<T>) -> Result<T, TxError> {
    match f(tx) {
        Ok(value) if tx.doomed().is_none() => Ok(value),
        Ok(_) => Err(TxError::InnerConflict),
        Err(Control::Fatal(e)) => {
            tx.doom(Control::Fatal(e.clone()));
            Err(e)
        }
        Err(signal) => {
            tx.doom(signal);
            Err(TxError::InnerConflict)
        }
    }
}

fn initial_shape(config: &TxConfig, learned: Option<&AtomicU8>) -> Shape {
    if !config.speculative {
        return Shape::Fat;
    }
    match learned {
        Some(learned) if learned.load(Ordering::Relaxed) > Shape::Lean as u8 => Shape::Fat,
        _ => Shape::Lean,
    }
}

fn run_loop<T>(
    config: &TxConfig,
    f: &impl Fn(&Transaction) -> Stm<T>,
    learned: Option<&AtomicU8>,
) -> Result<T, TxError> {
    let mut shape = initial_shape(config, learned);
    let mut attempt: u64 = 0;
    let backoff = Backoff::new();

    loop {
        let tx = Rc::new(Transaction::new(config.clone(), shape, attempt));
        let guard = SlotGuard::install(tx.clone());

        let mut result = f(&tx);
        // A joined inner execute may have doomed the context; its signal
        // wins over whatever the closure returned.
        if let Some(signal) = tx.doomed() {
            result = Err(signal);
        }
        let outcome = match result {
            Ok(value) => tx.commit().map(|()| value),
            Err(signal) => Err(signal),
        };
        guard.complete();

        match outcome {
            Ok(value) => return Ok(value),
            Err(Control::ReadConflict)
            | Err(Control::WriteConflict)
            | Err(Control::LockNotFree) => {
                tx.abort();
                attempt += 1;
                if attempt > config.max_retries {
                    return Err(TxError::TooManyRetries(attempt));
                }
                debug!(attempt, "conflict, backing off");
                backoff.snooze();
            }
            Err(Control::Speculative) => {
                // Escalate without burning a retry.
                tx.abort();
                shape = Shape::Fat;
                if let Some(learned) = learned {
                    learned.store(Shape::Fat as u8, Ordering::Relaxed);
                }
                debug!("context shape too small, escalating");
            }
            Err(Control::Retry) => {
                if !config.blocking_allowed {
                    tx.abort();
                    return Err(TxError::RetryNotAllowed);
                }
                let registration = tx.register_retry();
                tx.abort();
                let (latch, watched) = match registration {
                    Ok(r) => r,
                    Err(e) => return Err(e),
                };
                debug!("parking until a read ref changes");
                let outcome = latch.await_signal(config.timeout, config.interruptible);
                for block in &watched {
                    block.waiter_gone();
                }
                match outcome {
                    WaitOutcome::Signalled => backoff.reset(),
                    WaitOutcome::TimedOut => return Err(TxError::RetryTimeout),
                    WaitOutcome::Interrupted => return Err(TxError::RetryInterrupted),
                }
            }
            Err(Control::Fatal(e)) => {
                tx.abort();
                return Err(e);
            }
        }
    }
}

/// A reusable transaction factory.
///
/// Besides bundling a configuration, the factory remembers what the
/// speculative ladder learned: once a closure outgrows the lean shape, all
/// later transactions from this factory start fat and skip the doomed
/// attempt.
pub struct TxExecutor {
    config: TxConfig,
    learned: AtomicU8,
}

impl TxExecutor {
    pub fn new(config: TxConfig) -> TxExecutor {
        TxExecutor {
            learned: AtomicU8::new(Shape::Lean as u8),
            config,
        }
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Run `f` like [`execute`], with the factory's configuration and
    /// learned speculation level.
    pub fn execute<T>(&self, f: impl Fn(&Transaction) -> Stm<T>) -> Result<T, TxError> {
        execute_with(&self.config, &f, Some(&self.learned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::run_async;
    use crate::tref::TRef;
    use crate::{guard, retry};
    use std::cell::Cell as StdCell;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn atomically_commits() {
        let var = TRef::new(0);
        let x = atomically(|tx| {
            var.set(tx, 42)?;
            var.get(tx)
        });
        assert_eq!(x, 42);
        assert_eq!(var.atomic_get(), 42);
    }

    /// A thread blocks on `retry` until another commits a change.
    #[test]
    fn retry_wakes_on_write() {
        let var = TRef::new(0);
        let varc = var.clone();

        let x = run_async(
            800,
            move || {
                atomically(|tx| {
                    let x = varc.get(tx)?;
                    guard(x != 0)?;
                    Ok(x)
                })
            },
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| var.set(tx, 42));
            },
        )
        .unwrap();

        assert_eq!(x, 42);
    }

    /// A transaction that raced a writer reruns and commits cleanly.
    #[test]
    fn conflicting_update_reruns() {
        let var = TRef::new(0);
        let varc = var.clone();

        let t = thread::spawn(move || {
            atomically(|tx| {
                let x = varc.get(tx)?;
                thread::sleep(Duration::from_millis(300));
                varc.set(tx, x + 10)
            });
        });

        thread::sleep(Duration::from_millis(100));
        atomically(|tx| var.set(tx, 32));

        t.join().unwrap();
        assert_eq!(var.atomic_get(), 42);
    }

    /// A nested execute joins the active transaction: same context, one
    /// commit.
    #[test]
    fn nested_execute_joins() {
        let var = TRef::new(0);
        let x = atomically(|tx| {
            execute(&TxConfig::default(), |inner| var.set(inner, 1)).unwrap();
            // The inner write is visible right here, pre-commit.
            var.get(tx)
        });
        assert_eq!(x, 1);
        assert_eq!(var.atomic_get(), 1);
    }

    /// A control signal inside a joined execute dooms the outer attempt,
    /// even when the closure swallows the inner result.
    #[test]
    fn doomed_join_restarts_outer() {
        let var = TRef::new(0);
        let poisoned = StdCell::new(true);

        let attempts = StdCell::new(0u64);
        let x = atomically(|tx| {
            attempts.set(attempts.get() + 1);
            if poisoned.replace(false) {
                // Swallowing the error makes no difference.
                let _ = execute(&TxConfig::default(), |_| -> Stm<()> {
                    Err(Control::ReadConflict)
                });
            }
            var.get(tx)
        });

        assert_eq!(x, 0);
        assert_eq!(attempts.get(), 2);
    }

    /// `RequiresNew` runs its own transaction and commits independently.
    #[test]
    fn requires_new_commits_inside() {
        let inner_var = TRef::new(0);
        let config = TxConfig::default().with_propagation(Propagation::RequiresNew);

        atomically(|_| {
            execute(&config, |tx| inner_var.set(tx, 5)).unwrap();
            // Already published, while the outer transaction is still open.
            assert_eq!(inner_var.atomic_get(), 5);
            Ok(())
        });
    }

    #[test]
    fn mandatory_needs_a_transaction() {
        let config = TxConfig::default().with_propagation(Propagation::Mandatory);
        let r: Result<(), _> = execute(&config, |_| Ok(()));
        assert_eq!(r.unwrap_err(), TxError::TransactionMandatory);
    }

    #[test]
    fn never_refuses_nesting() {
        let config = TxConfig::default().with_propagation(Propagation::Never);
        let outcome = atomically(|_| {
            let r: Result<(), _> = execute(&config, |_| Ok(()));
            Ok(r)
        });
        assert_eq!(outcome.unwrap_err(), TxError::TransactionNotAllowed);
    }

    #[test]
    fn with_tx_outside_fails() {
        assert_eq!(
            with_tx(|_| Ok(())),
            Err(Control::Fatal(TxError::TransactionMandatory))
        );
    }

    /// The retry budget is enforced.
    #[test]
    fn too_many_retries() {
        let config = TxConfig::default().with_max_retries(2);
        let r: Result<(), _> = execute(&config, |_| Err(Control::ReadConflict));
        assert_eq!(r.unwrap_err(), TxError::TooManyRetries(3));
    }

    /// `retry` under `blocking_allowed = false` is a user error.
    #[test]
    fn blocking_disabled_refuses_retry() {
        let var = TRef::new(0);
        let config = TxConfig::default().with_blocking_allowed(false);
        let r: Result<i32, _> = execute(&config, |tx| {
            var.get(tx)?;
            retry()
        });
        assert_eq!(r.unwrap_err(), TxError::RetryNotAllowed);
    }

    /// `retry` with an empty read log has nothing to wait on.
    #[test]
    fn retry_without_reads_fails() {
        let r: Result<(), _> = execute(&TxConfig::default(), |_| retry());
        assert_eq!(r.unwrap_err(), TxError::NoRetryPossible);
    }

    /// A parked retry times out at roughly the configured deadline.
    #[test]
    fn retry_times_out() {
        let var = TRef::new(0);
        let config = TxConfig::default().with_timeout(Duration::from_millis(10));

        let started = Instant::now();
        let r: Result<i32, _> = execute(&config, |tx| {
            let v = var.get(tx)?;
            guard(v != 0)?;
            Ok(v)
        });

        assert_eq!(r.unwrap_err(), TxError::RetryTimeout);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    /// Speculation starts lean, escalates on commute, and does not count
    /// the escalation as a retry.
    #[test]
    fn speculation_escalates_for_commute() {
        let counter = TRef::new(0);
        let shapes = StdCell::new(0u32);

        let r = execute(&TxConfig::default(), |tx| {
            shapes.set(shapes.get() + 1);
            assert_eq!(tx.attempt(), 0);
            counter.commute(tx, |v| v + 1)
        });

        assert!(r.is_ok());
        assert_eq!(shapes.get(), 2);
        assert_eq!(counter.atomic_get(), 1);
    }

    /// A factory remembers the escalation and skips the lean attempt.
    #[test]
    fn factory_learns_shape() {
        let counter = TRef::new(0);
        let factory = TxExecutor::new(TxConfig::default());
        let runs = StdCell::new(0u32);

        factory
            .execute(|tx| {
                runs.set(runs.get() + 1);
                counter.commute(tx, |v| v + 1)
            })
            .unwrap();
        assert_eq!(runs.get(), 2);

        runs.set(0);
        factory
            .execute(|tx| {
                runs.set(runs.get() + 1);
                counter.commute(tx, |v| v + 1)
            })
            .unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(counter.atomic_get(), 2);
    }

    /// A panic inside the closure aborts cleanly; the refs stay usable.
    #[test]
    fn panic_aborts_and_releases() {
        let var = TRef::new(0);
        let varc = var.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            atomically(|tx| {
                varc.set(tx, 99)?;
                panic!("user bug");
                #[allow(unreachable_code)]
                Ok(())
            })
        }));
        assert!(result.is_err());

        assert_eq!(var.atomic_get(), 0);
        atomically(|tx| var.set(tx, 1));
        assert_eq!(var.atomic_get(), 1);
    }

    /// `atomic_checked` accepts single-ref usage and refuses a second ref.
    #[test]
    fn atomic_checked_polices_refs() {
        let a = TRef::new(0);
        let b = TRef::new(0);

        let ok = atomic_checked(|| {
            a.atomic_set(1);
            a.atomic_alter_and_get(|v| v + 1)
        });
        assert_eq!(ok.unwrap(), 2);

        let bad = atomic_checked(|| {
            a.atomic_set(3);
            b.atomic_set(4);
        });
        assert_eq!(bad.unwrap_err(), TxError::AtomicBlockViolation);
    }
}
