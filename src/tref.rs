// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};

use crate::clock::{Version, CLOCK};
use crate::error::Stm;
use crate::executor::{self, with_tx};
use crate::lockword::{LockMode, LockWord};
use crate::transaction::latch::RetryLatch;
use crate::transaction::Transaction;

/// Values live behind `Arc<dyn Any>` so that heterogeneous refs can share
/// one transaction log.
pub(crate) type ArcAny = Arc<dyn Any + Send + Sync>;

/// Clone a value out of its erased slot.
///
/// The type is pinned by the `TRef<T>` handle, so a mismatch is a bug.
pub(crate) fn downcast<T: Any + Send + Sync + Clone>(value: &ArcAny) -> T {
    match value.downcast_ref::<T>() {
        Some(v) => v.clone(),
        None => unreachable!("TRef holds a value of the wrong type"),
    }
}

/// The untyped core of a ref, shared between all clones of its handle and
/// accessed from any thread.
///
/// `TRef<T>` is just the typesafe projection; everything the transaction
/// machinery needs lives here.
pub(crate) struct RefBlock {
    /// Stable identity; the canonical lock-acquisition order.
    pub(crate) id: u64,

    /// Packed lock mode, reader count and publication version.
    pub(crate) word: LockWord,

    /// The committed value. Replaced only while the publisher holds
    /// `Exclusive` on the word, which is what makes the double-load read
    /// protocol sound.
    pub(crate) value: RwLock<ArcAny>,

    /// Latches of transactions that read this ref and then chose to block.
    waiters: Mutex<Vec<Weak<RetryLatch>>>,

    /// Counts abandoned latches. When enough pile up on a ref that is read
    /// often but written rarely, the list is pruned.
    dead_waiters: AtomicUsize,
}

impl RefBlock {
    pub(crate) fn new(value: ArcAny) -> Arc<RefBlock> {
        static IDS: AtomicU64 = AtomicU64::new(0);

        Arc::new(RefBlock {
            id: IDS.fetch_add(1, Ordering::Relaxed),
            word: LockWord::new(0),
            value: RwLock::new(value),
            waiters: Mutex::new(Vec::new()),
            dead_waiters: AtomicUsize::new(0),
        })
    }

    /// One optimistic attempt at a consistent `(value, version)` pair.
    ///
    /// Fails when a publication is in flight or raced the read.
    pub(crate) fn try_snapshot(&self) -> Option<(ArcAny, Version)> {
        let before = self.word.load(Ordering::Acquire);
        if before.mode == LockMode::Exclusive {
            return None;
        }
        let value = self.value.read().clone();
        let after = self.word.load(Ordering::Acquire);
        if before.same_as(&after) {
            Some((value, before.version))
        } else {
            None
        }
    }

    /// A consistent `(value, version)` pair, spinning through publications.
    pub(crate) fn snapshot(&self) -> (ArcAny, Version) {
        let backoff = Backoff::new();
        loop {
            if let Some(pair) = self.try_snapshot() {
                return pair;
            }
            backoff.snooze();
        }
    }

    /// Attach a latch to this ref's waiter list.
    ///
    /// Level-triggered: if the ref has already been published past
    /// `observed`, the latch is signalled on the spot instead of being
    /// registered. Together with writers draining the list under the same
    /// mutex after publishing, this rules out lost wakeups.
    pub(crate) fn register_waiter(&self, latch: &Arc<RetryLatch>, observed: Version) {
        let mut waiters = self.waiters.lock();
        if self.word.load(Ordering::Acquire).version > observed {
            drop(waiters);
            latch.signal();
            return;
        }
        waiters.push(Arc::downgrade(latch));
    }

    /// Signal every registered latch and empty the list.
    pub(crate) fn wake_waiters(&self) {
        let drained = {
            let mut waiters = self.waiters.lock();
            std::mem::take(&mut *waiters)
        };
        for latch in drained.iter().filter_map(Weak::upgrade) {
            latch.signal();
        }
    }

    /// Note that a latch registered here will never be awaited again.
    ///
    /// Too many dead entries trigger a prune, so a ref that is read often
    /// but written rarely does not accumulate stale registrations.
    pub(crate) fn waiter_gone(&self) {
        let dead = self.dead_waiters.fetch_add(1, Ordering::Relaxed);
        if dead >= 64 {
            let mut waiters = self.waiters.lock();
            self.dead_waiters.store(0, Ordering::SeqCst);
            waiters.retain(|w| w.upgrade().map_or(false, |l| !l.is_signalled()));
        }
    }

    /// Install a new committed value at `version` and wake the waiters.
    ///
    /// The caller must hold `Exclusive`; the word store doubles as the
    /// unlock.
    pub(crate) fn publish_value(&self, value: ArcAny, version: Version) {
        *self.value.write() = value;
        self.word.publish(version);
        self.wake_waiters();
    }

    /// Spin until this ref can be locked for a single-ref atomic commit.
    ///
    /// Lock holders never park (they are mid-commit), so the wait is short
    /// and unbounded spinning is safe.
    fn lock_exclusive(&self) {
        let backoff = Backoff::new();
        while !self.word.try_acquire(LockMode::None, LockMode::Exclusive) {
            backoff.snooze();
        }
    }
}

impl Debug for RefBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefBlock")
            .field("id", &self.id)
            .field("word", &self.word)
            .finish()
    }
}

/// A transactional memory cell.
///
/// `TRef` is a cheap cloneable handle; clones refer to the same cell.
/// Reading and writing go through a [`Transaction`], except for the
/// `atomic_*` family which runs each call as its own tiny commit.
///
/// # Example
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
#[derive(Clone)]
pub struct TRef<T> {
    pub(crate) block: Arc<RefBlock>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> TRef<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Create a new ref holding `value`, committed at version 0.
    pub fn new(value: T) -> TRef<T> {
        TRef {
            block: RefBlock::new(Arc::new(value)),
            _marker: PhantomData,
        }
    }

    /// Create a new ref inside a running transaction.
    ///
    /// The ref is known to be unshared until the transaction commits, so it
    /// enters the write log without any read bookkeeping or validation; the
    /// commit locks it uncontended.
    pub fn new_in(tx: &Transaction, value: T) -> Stm<TRef<T>> {
        let this = TRef {
            block: RefBlock::new(Arc::new(value.clone())),
            _marker: PhantomData,
        };
        tx.open_for_construction(&this.block, Arc::new(value))?;
        Ok(this)
    }

    /// Read the current value.
    pub fn get(&self, tx: &Transaction) -> Stm<T> {
        tx.read(&self.block).map(|v| downcast(&v))
    }

    /// Read the current value and hold at least `mode` on the ref until the
    /// transaction ends. The held lock is never downgraded.
    pub fn get_and_lock(&self, tx: &Transaction, mode: LockMode) -> Stm<T> {
        tx.read_with_mode(&self.block, mode).map(|v| downcast(&v))
    }

    /// Replace the value. The write stays tentative until commit.
    pub fn set(&self, tx: &Transaction, value: T) -> Stm<()> {
        tx.write(&self.block, Arc::new(value))
    }

    /// Replace the value and hold at least `mode` on the ref.
    pub fn set_and_lock(&self, tx: &Transaction, value: T, mode: LockMode) -> Stm<()> {
        tx.write_with_mode(&self.block, Arc::new(value), mode)
    }

    /// Replace the value, returning the previous one.
    pub fn get_and_set(&self, tx: &Transaction, value: T) -> Stm<T> {
        let old = self.get(tx)?;
        self.set(tx, value)?;
        Ok(old)
    }

    /// [`get_and_set`](Self::get_and_set) with a lock.
    pub fn get_and_set_and_lock(&self, tx: &Transaction, value: T, mode: LockMode) -> Stm<T> {
        let old = self.get_and_lock(tx, mode)?;
        self.set(tx, value)?;
        Ok(old)
    }

    /// Apply `f` to the value, returning the new value.
    pub fn alter_and_get(&self, tx: &Transaction, f: impl FnOnce(T) -> T) -> Stm<T> {
        let new = f(self.get(tx)?);
        self.set(tx, new.clone())?;
        Ok(new)
    }

    /// Apply `f` to the value, returning the old value.
    pub fn get_and_alter(&self, tx: &Transaction, f: impl FnOnce(T) -> T) -> Stm<T> {
        let old = self.get(tx)?;
        self.set(tx, f(old.clone()))?;
        Ok(old)
    }

    /// Queue `f` as a deferred, reorderable update.
    ///
    /// As long as this transaction has no read or write dependency on the
    /// ref, `f` is applied to the then-committed value at commit time and
    /// concurrent commuters never conflict with each other. Once a
    /// dependency exists the call degrades to an ordinary
    /// read-modify-write.
    pub fn commute(&self, tx: &Transaction, f: impl Fn(T) -> T + 'static) -> Stm<()> {
        tx.commute(
            &self.block,
            Arc::new(move |value: ArcAny| -> ArcAny { Arc::new(f(downcast::<T>(&value))) }),
        )
    }

    /// Set the value to `new` if it currently equals `expected`.
    pub fn compare_and_swap(&self, tx: &Transaction, expected: &T, new: T) -> Stm<bool>
    where
        T: PartialEq,
    {
        if self.get(tx)? == *expected {
            self.set(tx, new)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Block until the ref holds `expected`.
    pub fn await_value(&self, tx: &Transaction, expected: &T) -> Stm<()>
    where
        T: PartialEq,
    {
        self.await_until(tx, |v| v == expected)
    }

    /// Block until `pred` holds for the ref's value.
    pub fn await_until(&self, tx: &Transaction, pred: impl FnOnce(&T) -> bool) -> Stm<()> {
        let value = self.get(tx)?;
        if pred(&value) {
            Ok(())
        } else {
            crate::retry()
        }
    }

    /// Check if two refs are the same cell.
    pub fn ref_eq(this: &TRef<T>, other: &TRef<T>) -> bool {
        Arc::ptr_eq(&this.block, &other.block)
    }

    // The `atomic_*` family bypasses the transaction machinery: each call is
    // a self-contained single-ref commit.

    /// Read the committed value outside any transaction.
    ///
    /// Equivalent to an `atomically` that just reads, but much cheaper.
    pub fn atomic_get(&self) -> T {
        executor::note_atomic_touch(self.block.id);
        downcast(&self.block.snapshot().0)
    }

    /// Read the value with no ordering guarantee at all.
    ///
    /// The returned value was committed at some point, but the load is not
    /// ordered against concurrent publications.
    pub fn atomic_weak_get(&self) -> T {
        executor::note_atomic_touch(self.block.id);
        downcast(&self.block.value.read().clone())
    }

    /// Replace the value in its own single-ref commit; returns the new
    /// value. Waiters parked on this ref are woken.
    pub fn atomic_set(&self, value: T) -> T {
        self.atomic_update(|_| Some(value.clone()));
        value
    }

    /// Single-ref compare-and-set.
    pub fn atomic_compare_and_set(&self, expected: &T, new: T) -> bool
    where
        T: PartialEq,
    {
        self.atomic_update(|old| (old == *expected).then(|| new.clone()))
            .is_some()
    }

    /// Apply `f` in its own single-ref commit; returns the new value.
    pub fn atomic_alter_and_get(&self, f: impl Fn(T) -> T) -> T {
        let (_, new) = self.atomic_alter(f);
        new
    }

    /// Apply `f` in its own single-ref commit; returns the old value.
    pub fn atomic_get_and_alter(&self, f: impl Fn(T) -> T) -> T {
        let (old, _) = self.atomic_alter(f);
        old
    }

    fn atomic_alter(&self, f: impl Fn(T) -> T) -> (T, T) {
        let mut pair = None;
        self.atomic_update(|old| {
            let new = f(old.clone());
            pair = Some((old, new.clone()));
            Some(new)
        });
        pair.expect("atomic_update always calls the closure once")
    }

    /// Lock, read, decide, publish. `decide` returning `None` leaves the
    /// committed value untouched and skips the clock tick.
    fn atomic_update(&self, decide: impl FnOnce(T) -> Option<T>) -> Option<T> {
        executor::note_atomic_touch(self.block.id);
        self.block.lock_exclusive();
        let old = downcast::<T>(&self.block.value.read().clone());
        match decide(old) {
            Some(new) => {
                let version = CLOCK.tick();
                self.block.publish_value(Arc::new(new.clone()), version);
                Some(new)
            }
            None => {
                self.block.word.release(LockMode::Exclusive);
                None
            }
        }
    }
}

impl<T> TRef<T>
where
    T: Any + Send + Sync + Clone + Add<Output = T>,
{
    /// Add `delta` to the value, returning the new value.
    pub fn incr(&self, tx: &Transaction, delta: T) -> Stm<T> {
        self.alter_and_get(tx, |v| v + delta)
    }
}

impl<T> TRef<T>
where
    T: Any + Send + Sync + Clone + Sub<Output = T>,
{
    /// Subtract `delta` from the value, returning the new value.
    pub fn decr(&self, tx: &Transaction, delta: T) -> Stm<T> {
        self.alter_and_get(tx, |v| v - delta)
    }
}

impl<T> Default for TRef<T>
where
    T: Any + Send + Sync + Clone + Default,
{
    fn default() -> TRef<T> {
        TRef::new(T::default())
    }
}

/// Note that this does not print the cell atomically with anything else;
/// concurrent commits may already have replaced the value by the time the
/// output is rendered.
impl<T> Debug for TRef<T>
where
    T: Any + Send + Sync + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef")
            .field("value", &self.atomic_get())
            .finish()
    }
}

/// Ambient-transaction forms of the hot operations, lifting on the
/// transaction the executor installed for the current thread.
impl<T> TRef<T>
where
    T: Any + Send + Sync + Clone,
{
    /// [`get`](Self::get) on the thread's active transaction.
    pub fn read_here(&self) -> Stm<T> {
        with_tx(|tx| self.get(tx))
    }

    /// [`set`](Self::set) on the thread's active transaction.
    pub fn write_here(&self, value: T) -> Stm<()> {
        with_tx(|tx| self.set(tx, value))
    }
}
