// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The transaction context and the versioned read/write protocol.
//!
//! A [`Transaction`] tracks every ref the closure touched. Reads are
//! optimistic and validated against the snapshot version taken at begin;
//! writes stay tentative in the log until commit publishes them under the
//! refs' locks. The context is thread-bound and never reused once it
//! reaches a terminal status.

pub(crate) mod latch;
pub(crate) mod log;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_utils::Backoff;
use tracing::trace;

use crate::clock::{Version, CLOCK};
use crate::config::{IsolationLevel, TxConfig};
use crate::error::{Control, Stm, TxError};
use crate::lockword::LockMode;
use crate::tref::{ArcAny, RefBlock};

use self::latch::RetryLatch;
use self::log::{CommuteFn, ReadEntry, ReadLog, Shape, WriteEntry, WritePayload};

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Prepared,
    Committed,
    Aborted,
}

pub(crate) struct TxState {
    status: TxStatus,
    read_version: Version,
    shape: Shape,
    read_log: ReadLog,
    write_log: BTreeMap<u64, WriteEntry>,
    /// A control signal raised inside a joined inner `execute`. Re-raised
    /// by every subsequent operation and checked before commit.
    doom: Option<Control>,
}

/// A running transaction.
///
/// Handed to the closure by [`atomically`](crate::atomically) and
/// [`execute`](crate::execute); also reachable through
/// [`with_tx`](crate::with_tx) while the closure runs. All ref access goes
/// through it.
pub struct Transaction {
    config: TxConfig,
    attempt: u64,
    state: RefCell<TxState>,
}

impl Transaction {
    pub(crate) fn new(config: TxConfig, shape: Shape, attempt: u64) -> Transaction {
        Transaction {
            config,
            attempt,
            state: RefCell::new(TxState {
                status: TxStatus::Active,
                read_version: CLOCK.read(),
                shape,
                read_log: ReadLog::new(),
                write_log: BTreeMap::new(),
                doom: None,
            }),
        }
    }

    /// The configuration this transaction runs under.
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn status(&self) -> TxStatus {
        self.state.borrow().status
    }

    /// Which attempt of the executor's retry loop this context belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The snapshot version all reads are validated against.
    pub fn read_version(&self) -> Version {
        self.state.borrow().read_version
    }

    /// Combine two alternatives: run `first`, and if it retries, roll its
    /// effects back and run `second` instead.
    ///
    /// If both retry, the transaction blocks on the union of both branches'
    /// reads, so a change to either side wakes it. Any other failure of a
    /// branch fails the whole composition.
    ///
    /// # Example
    ///
    /// ```
    /// use vstm::{atomically, retry, TRef};
    ///
    /// let var = TRef::new(42);
    ///
    /// let x = atomically(|tx| {
    ///     tx.or(|_| retry(), |tx| var.get(tx))
    /// });
    ///
    /// assert_eq!(x, 42);
    /// ```
    pub fn or<T>(
        &self,
        first: impl Fn(&Transaction) -> Stm<T>,
        second: impl Fn(&Transaction) -> Stm<T>,
    ) -> Stm<T> {
        let (read_snap, write_snap) = {
            let state = self.state.borrow();
            (state.read_log.clone(), state.write_log.clone())
        };

        match first(self) {
            Err(Control::Retry) => {
                self.rollback_branch(read_snap, write_snap);
                second(self)
            }
            other => other,
        }
    }

    /// Undo everything a retried `or` branch did: release the locks it
    /// acquired, restore the logs, and keep its reads as watch-only entries
    /// so a later retry still wakes on them.
    fn rollback_branch(&self, read_snap: ReadLog, write_snap: BTreeMap<u64, WriteEntry>) {
        let state = &mut *self.state.borrow_mut();

        let mut before: BTreeMap<u64, LockMode> = BTreeMap::new();
        for entry in &read_snap {
            let mode = before.entry(entry.block.id).or_default();
            *mode = (*mode).max(entry.mode);
        }
        for entry in write_snap.values() {
            let mode = before.entry(entry.block.id).or_default();
            *mode = (*mode).max(entry.mode);
        }

        let release = |block: &RefBlock, held: LockMode| {
            let kept = before.get(&block.id).copied().unwrap_or(LockMode::None);
            if held > kept {
                block.word.downgrade(held, kept);
            }
        };
        for entry in state.write_log.values() {
            release(&entry.block, entry.mode);
        }
        for entry in &state.read_log {
            release(&entry.block, entry.mode);
        }

        let branch_reads: Vec<(Arc<RefBlock>, Version, ArcAny)> = state
            .read_log
            .iter()
            .map(|e| (e.block.clone(), e.observed, e.value.clone()))
            .collect();

        state.read_log = read_snap;
        state.write_log = write_snap;

        for (block, observed, value) in branch_reads {
            if !state.read_log.iter().any(|e| e.block.id == block.id) {
                state.read_log.push(ReadEntry {
                    block,
                    observed,
                    value,
                    mode: LockMode::None,
                    watch_only: true,
                });
            }
        }
    }

    /// Read a ref, entering it into the read log.
    pub(crate) fn read(&self, block: &Arc<RefBlock>) -> Stm<ArcAny> {
        self.read_with_mode(block, self.config.read_lock_mode)
    }

    /// Read a ref and hold at least `want` on it. Held modes only go up.
    pub(crate) fn read_with_mode(&self, block: &Arc<RefBlock>, want: LockMode) -> Stm<ArcAny> {
        let state = &mut *self.state.borrow_mut();
        ensure_active(state)?;
        let read_version = state.read_version;

        // A tentative write shadows the committed value.
        if let Some(entry) = state.write_log.get_mut(&block.id) {
            if want > entry.mode {
                if !block.word.try_acquire(entry.mode, want) {
                    return Err(Control::LockNotFree);
                }
                entry.mode = want;
            }
            let value = match &mut entry.payload {
                WritePayload::Set(value) => value.clone(),
                WritePayload::Commute(fns) => {
                    // Reading a commuted ref creates the dependency the
                    // commute was avoiding: materialise it as a validated
                    // read plus the queued functions.
                    let (committed, observed) = validated_load(block, read_version)?;
                    let value = fns.iter().fold(committed, |v, f| f(v));
                    entry.payload = WritePayload::Set(value.clone());
                    entry.observed = Some(observed);
                    value
                }
            };
            return Ok(value);
        }

        if let Some(entry) = state.read_log.iter_mut().find(|e| e.block.id == block.id) {
            if want > entry.mode {
                if !block.word.try_acquire(entry.mode, want) {
                    return Err(Control::LockNotFree);
                }
                entry.mode = want;
            }
            if entry.watch_only {
                let (value, observed) = validated_load(block, read_version)?;
                entry.value = value;
                entry.observed = observed;
                entry.watch_only = false;
            }
            return Ok(entry.value.clone());
        }

        // Fresh read. A lean log that is full escalates before touching
        // anything.
        if let Some(cap) = state.shape.read_capacity() {
            if state.read_log.len() >= cap {
                return Err(Control::Speculative);
            }
        }
        if want > LockMode::None && !block.word.try_acquire(LockMode::None, want) {
            return Err(Control::LockNotFree);
        }
        match validated_load(block, read_version) {
            Ok((value, observed)) => {
                state.read_log.push(ReadEntry {
                    block: block.clone(),
                    observed,
                    value: value.clone(),
                    mode: want,
                    watch_only: false,
                });
                Ok(value)
            }
            Err(e) => {
                block.word.release(want);
                Err(e)
            }
        }
    }

    /// Write a tentative value, entering the ref into the write log.
    pub(crate) fn write(&self, block: &Arc<RefBlock>, value: ArcAny) -> Stm<()> {
        self.write_with_mode(block, value, self.config.write_lock_mode)
    }

    pub(crate) fn write_with_mode(
        &self,
        block: &Arc<RefBlock>,
        value: ArcAny,
        want: LockMode,
    ) -> Stm<()> {
        let state = &mut *self.state.borrow_mut();
        ensure_active(state)?;
        ensure_writable(state, &self.config)?;

        if let Some(entry) = state.write_log.get_mut(&block.id) {
            if want > entry.mode {
                if !block.word.try_acquire(entry.mode, want) {
                    return Err(Control::LockNotFree);
                }
                entry.mode = want;
            }
            // A plain set supersedes queued commute functions; their result
            // would be overwritten anyway.
            entry.payload = WritePayload::Set(value);
            return Ok(());
        }

        // A previous read hands its lock and its validation anchor over to
        // the write entry.
        let dependency = state
            .read_log
            .iter_mut()
            .find(|e| e.block.id == block.id && !e.watch_only)
            .map(|entry| {
                let held = entry.mode;
                entry.mode = LockMode::None;
                (held, entry.observed)
            });

        let (held, observed) = match dependency {
            Some((held, observed)) => (held, Some(observed)),
            None => (LockMode::None, None),
        };
        if want > held && !block.word.try_acquire(held, want) {
            // Hand the lock back to the read entry before failing.
            if let Some(entry) = state
                .read_log
                .iter_mut()
                .find(|e| e.block.id == block.id && !e.watch_only)
            {
                entry.mode = held;
            }
            return Err(Control::LockNotFree);
        }
        state.write_log.insert(
            block.id,
            WriteEntry {
                block: block.clone(),
                payload: WritePayload::Set(value),
                mode: want.max(held),
                observed,
            },
        );
        Ok(())
    }

    /// Queue a deferred functional update on a ref.
    ///
    /// Degrades to an ordinary read-modify-write once this transaction has
    /// any dependency on the ref.
    pub(crate) fn commute(&self, block: &Arc<RefBlock>, f: CommuteFn) -> Stm<()> {
        let state = &mut *self.state.borrow_mut();
        ensure_active(state)?;
        ensure_writable(state, &self.config)?;

        if !state.shape.supports_commute() {
            return Err(Control::Speculative);
        }

        if let Some(entry) = state.write_log.get_mut(&block.id) {
            match &mut entry.payload {
                // An explicit tentative value is already a dependency;
                // apply in place.
                WritePayload::Set(value) => *value = f(value.clone()),
                WritePayload::Commute(fns) => fns.push(f),
            }
            return Ok(());
        }

        if let Some(entry) = state
            .read_log
            .iter_mut()
            .find(|e| e.block.id == block.id && !e.watch_only)
        {
            // Read dependency: degrade to alter.
            let value = f(entry.value.clone());
            let held = entry.mode;
            let observed = entry.observed;
            entry.mode = LockMode::None;
            state.write_log.insert(
                block.id,
                WriteEntry {
                    block: block.clone(),
                    payload: WritePayload::Set(value),
                    mode: held,
                    observed: Some(observed),
                },
            );
            return Ok(());
        }

        state.write_log.insert(
            block.id,
            WriteEntry {
                block: block.clone(),
                payload: WritePayload::Commute(vec![f]),
                mode: LockMode::None,
                observed: None,
            },
        );
        Ok(())
    }

    /// Enter a freshly allocated, still unshared ref into the write log.
    ///
    /// Skips the read log and takes no lock: nobody else can reach the ref
    /// before this transaction publishes it.
    pub(crate) fn open_for_construction(&self, block: &Arc<RefBlock>, value: ArcAny) -> Stm<()> {
        let state = &mut *self.state.borrow_mut();
        ensure_active(state)?;
        ensure_writable(state, &self.config)?;
        state.write_log.insert(
            block.id,
            WriteEntry {
                block: block.clone(),
                payload: WritePayload::Set(value),
                mode: LockMode::None,
                observed: None,
            },
        );
        Ok(())
    }

    pub(crate) fn doom(&self, signal: Control) {
        self.state.borrow_mut().doom = Some(signal);
    }

    pub(crate) fn doomed(&self) -> Option<Control> {
        self.state.borrow().doom.clone()
    }

    /// Create a latch and register it on every ref in the read log.
    ///
    /// Called by the executor when the closure retried, while the locks are
    /// still held; the abort that follows releases them. Returns the latch
    /// and the watched refs (for pruning after the wakeup).
    pub(crate) fn register_retry(&self) -> Result<(Arc<RetryLatch>, Vec<Arc<RefBlock>>), TxError> {
        let watched: Vec<(Arc<RefBlock>, Version)> = {
            let state = self.state.borrow();
            state
                .read_log
                .iter()
                .map(|e| (e.block.clone(), e.observed))
                .collect()
        };
        if watched.is_empty() {
            return Err(TxError::NoRetryPossible);
        }

        let latch = Arc::new(RetryLatch::new());
        for (block, observed) in &watched {
            block.register_waiter(&latch, *observed);
        }
        Ok((latch, watched.into_iter().map(|(b, _)| b).collect()))
    }

    /// Abort: release every held lock, clear the logs, go terminal.
    /// Idempotent.
    pub(crate) fn abort(&self) {
        abort_in_place(&mut self.state.borrow_mut());
    }

    /// Run the commit pipeline: prepare, finalise commutes, tick, validate
    /// the read set, publish, release.
    pub(crate) fn commit(&self) -> Stm<()> {
        let state = &mut *self.state.borrow_mut();

        if let Some(signal) = state.doom.take() {
            abort_in_place(state);
            return Err(signal);
        }
        if state.status != TxStatus::Active {
            return Err(Control::Fatal(TxError::DeadTransaction));
        }
        state.status = TxStatus::Prepared;

        // Read-only commits are free: every read was validated against the
        // snapshot when it was made, so the whole transaction already saw a
        // consistent state. No tick.
        if state.write_log.is_empty() {
            for entry in state.read_log.iter().rev() {
                entry.block.word.release(entry.mode);
            }
            for entry in &mut state.read_log {
                entry.mode = LockMode::None;
            }
            state.status = TxStatus::Committed;
            return Ok(());
        }

        // Prepare. The write log iterates in ref-id order, which is the
        // canonical acquisition order shared by all transactions.
        //
        // A transaction that enters prepare holding no locks at all (pure
        // commutes, no read or eager write locks) acquires exclusively in
        // that canonical order, so it can wait out each holder instead of
        // failing fast: holders never park, and every other unbounded
        // waiter follows the same order. This is what keeps commute-only
        // commits free of lock conflicts. Everything else holds locks taken
        // in program order and must stay on the bounded fail-fast path.
        let ordered_only = state
            .write_log
            .values()
            .all(|e| matches!(e.payload, WritePayload::Commute(_)) && e.mode == LockMode::None)
            && state.read_log.iter().all(|e| e.mode == LockMode::None);

        let mut failure: Option<Control> = None;
        for entry in state.write_log.values_mut() {
            if entry.mode < LockMode::Write {
                let backoff = Backoff::new();
                loop {
                    if entry.block.word.try_acquire(entry.mode, LockMode::Write) {
                        entry.mode = LockMode::Write;
                        break;
                    }
                    if !ordered_only && backoff.is_completed() {
                        failure = Some(Control::LockNotFree);
                        break;
                    }
                    backoff.snooze();
                }
                if failure.is_some() {
                    break;
                }
            }
            if let Some(observed) = entry.observed {
                if entry.block.word.load(Ordering::Acquire).version != observed {
                    failure = Some(Control::WriteConflict);
                    break;
                }
            }
        }
        if let Some(signal) = failure {
            abort_in_place(state);
            return Err(signal);
        }

        // Finalise commutes: the committed value is stable under our write
        // lock, so the queued functions apply to the newest state.
        for entry in state.write_log.values_mut() {
            if let WritePayload::Commute(fns) = &entry.payload {
                let committed = entry.block.value.read().clone();
                let value = fns.iter().fold(committed, |v, f| f(v));
                entry.payload = WritePayload::Set(value);
            }
        }

        let write_version = CLOCK.tick();

        // Serialized isolation revalidates the whole read set once more;
        // snapshot isolation trusts the begin-time validation.
        if self.config.isolation == IsolationLevel::Serialized {
            for entry in &state.read_log {
                if entry.watch_only || state.write_log.contains_key(&entry.block.id) {
                    continue;
                }
                let word = entry.block.word.load(Ordering::Acquire);
                let foreign_writer = entry.mode == LockMode::None && word.mode >= LockMode::Write;
                if word.version != entry.observed || foreign_writer {
                    failure = Some(Control::ReadConflict);
                    break;
                }
            }
            if let Some(signal) = failure {
                abort_in_place(state);
                return Err(signal);
            }
        }

        // Publish. The word store inside `publish_value` releases the lock
        // and carries the new version in the same release-ordered write.
        for entry in state.write_log.values_mut() {
            let acquired = entry.block.word.try_acquire(entry.mode, LockMode::Exclusive);
            debug_assert!(acquired, "exclusive upgrade cannot fail under a held write lock");
            let WritePayload::Set(value) = entry.payload.clone() else {
                unreachable!("commutes were finalised before publication")
            };
            entry.block.publish_value(value, write_version);
            entry.mode = LockMode::None;
        }

        for entry in state.read_log.iter().rev() {
            entry.block.word.release(entry.mode);
        }
        for entry in &mut state.read_log {
            entry.mode = LockMode::None;
        }

        state.status = TxStatus::Committed;
        trace!(version = write_version, "transaction committed");
        Ok(())
    }
}

/// One optimistic attempt at reading a consistent `(value, version)` pair
/// no newer than the snapshot.
fn validated_load(block: &RefBlock, read_version: Version) -> Result<(ArcAny, Version), Control> {
    match block.try_snapshot() {
        Some((value, version)) if version <= read_version => Ok((value, version)),
        _ => Err(Control::ReadConflict),
    }
}

fn ensure_active(state: &mut TxState) -> Result<(), Control> {
    if let Some(signal) = &state.doom {
        return Err(signal.clone());
    }
    match state.status {
        TxStatus::Active => Ok(()),
        TxStatus::Prepared => {
            abort_in_place(state);
            Err(Control::Fatal(TxError::PreparedTransaction))
        }
        _ => Err(Control::Fatal(TxError::DeadTransaction)),
    }
}

fn ensure_writable(state: &mut TxState, config: &TxConfig) -> Result<(), Control> {
    if config.readonly {
        abort_in_place(state);
        Err(Control::Fatal(TxError::ReadonlyViolation))
    } else {
        Ok(())
    }
}

fn abort_in_place(state: &mut TxState) {
    if state.status == TxStatus::Committed || state.status == TxStatus::Aborted {
        return;
    }
    // Reverse-acquisition order: writes by descending id, then reads.
    for entry in state.write_log.values().rev() {
        entry.block.word.release(entry.mode);
    }
    for entry in state.read_log.iter().rev() {
        entry.block.word.release(entry.mode);
    }
    state.write_log.clear();
    state.read_log.clear();
    state.status = TxStatus::Aborted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tref::TRef;

    fn fat_tx() -> Transaction {
        Transaction::new(TxConfig::default(), Shape::Fat, 0)
    }

    /// A read returns the committed value and caches it.
    #[test]
    fn read_caches() {
        let tx = fat_tx();
        let var = TRef::new(vec![1, 2, 3]);

        assert_eq!(var.get(&tx).unwrap(), vec![1, 2, 3]);
        assert_eq!(var.get(&tx).unwrap(), vec![1, 2, 3]);
        assert_eq!(tx.state.borrow().read_log.len(), 1);
        tx.abort();
    }

    /// A write shadows the committed value for later reads but leaves the
    /// cell untouched until commit.
    #[test]
    fn write_read_roundtrip() {
        let tx = fat_tx();
        let var = TRef::new(1);

        var.set(&tx, 2).unwrap();
        assert_eq!(var.get(&tx).unwrap(), 2);
        assert_eq!(var.atomic_weak_get(), 1);

        tx.commit().unwrap();
        assert_eq!(var.atomic_get(), 2);
        assert_eq!(tx.status(), TxStatus::Committed);
    }

    /// Read-only commits publish nothing: the ref keeps its version.
    #[test]
    fn readonly_commit_publishes_nothing() {
        let var = TRef::new(5);
        let before = var.block.word.load(Ordering::Relaxed).version;

        let tx = fat_tx();
        var.get(&tx).unwrap();
        tx.commit().unwrap();

        assert_eq!(var.block.word.load(Ordering::Relaxed).version, before);
        assert_eq!(tx.status(), TxStatus::Committed);
    }

    /// A concurrent publication to a read ref fails the commit of a writer.
    #[test]
    fn stale_read_fails_commit() {
        let a = TRef::new(0);
        let b = TRef::new(0);

        let tx = fat_tx();
        a.get(&tx).unwrap();
        a.atomic_set(1); // another committer wins
        b.set(&tx, 1).unwrap();

        assert_eq!(tx.commit(), Err(Control::ReadConflict));
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(b.atomic_get(), 0);
    }

    /// Snapshot isolation skips exactly that revalidation.
    #[test]
    fn snapshot_isolation_allows_stale_reads() {
        let a = TRef::new(0);
        let b = TRef::new(0);

        let tx = Transaction::new(
            TxConfig::default().with_isolation(IsolationLevel::Snapshot),
            Shape::Fat,
            0,
        );
        a.get(&tx).unwrap();
        a.atomic_set(1);
        b.set(&tx, 1).unwrap();

        tx.commit().unwrap();
        assert_eq!(b.atomic_get(), 1);
    }

    /// A stale version under a read-write dependency is caught at prepare.
    #[test]
    fn stale_read_write_fails_prepare() {
        let a = TRef::new(0);

        let tx = Transaction::new(
            TxConfig::default().with_write_lock_mode(LockMode::None),
            Shape::Fat,
            0,
        );
        a.get(&tx).unwrap();
        a.atomic_set(7);
        a.set(&tx, 1).unwrap();

        assert_eq!(tx.commit(), Err(Control::WriteConflict));
        assert_eq!(a.atomic_get(), 7);
    }

    /// With the default eager write lock, a second writer fails fast.
    #[test]
    fn eager_write_lock_conflicts_fast() {
        let a = TRef::new(0);

        let tx1 = fat_tx();
        a.set(&tx1, 1).unwrap();

        let tx2 = fat_tx();
        assert_eq!(a.set(&tx2, 2), Err(Control::LockNotFree));

        tx2.abort();
        tx1.commit().unwrap();
        assert_eq!(a.atomic_get(), 1);
    }

    /// An aborted transaction leaves no tentative state behind.
    #[test]
    fn abort_discards_writes_and_locks() {
        let a = TRef::new(0);

        let tx = fat_tx();
        a.set(&tx, 42).unwrap();
        tx.abort();

        assert_eq!(a.atomic_get(), 0);
        // The eager write lock is gone: another tx can write immediately.
        let tx2 = fat_tx();
        a.set(&tx2, 1).unwrap();
        tx2.commit().unwrap();
        assert_eq!(a.atomic_get(), 1);
    }

    /// Operations on a terminal context report it dead.
    #[test]
    fn dead_transaction_is_refused() {
        let a = TRef::new(0);
        let tx = fat_tx();
        tx.commit().unwrap();

        assert_eq!(a.get(&tx), Err(Control::Fatal(TxError::DeadTransaction)));
        assert_eq!(a.set(&tx, 1), Err(Control::Fatal(TxError::DeadTransaction)));
    }

    /// A write under `readonly` aborts the transaction.
    #[test]
    fn readonly_violation_aborts() {
        let a = TRef::new(0);
        let tx = Transaction::new(TxConfig::default().with_readonly(true), Shape::Fat, 0);

        a.get(&tx).unwrap();
        assert_eq!(a.set(&tx, 1), Err(Control::Fatal(TxError::ReadonlyViolation)));
        assert_eq!(tx.status(), TxStatus::Aborted);
    }

    /// Commutes on an untouched ref defer; the functions run at commit
    /// against the then-committed value.
    #[test]
    fn commute_applies_at_commit() {
        let counter = TRef::new(10);

        let tx = fat_tx();
        counter.commute(&tx, |v| v + 1).unwrap();
        counter.commute(&tx, |v| v * 2).unwrap();

        // Someone else moves the ref before we commit; no conflict.
        counter.atomic_set(100);

        tx.commit().unwrap();
        assert_eq!(counter.atomic_get(), (100 + 1) * 2);
    }

    /// A prior read degrades a commute into an ordinary read-modify-write.
    #[test]
    fn commute_after_read_degrades() {
        let counter = TRef::new(10);

        let tx = fat_tx();
        counter.get(&tx).unwrap();
        counter.commute(&tx, |v| v + 1).unwrap();

        counter.atomic_set(100);
        assert!(tx.commit().is_err());
        assert_eq!(counter.atomic_get(), 100);
    }

    /// Reading a commuted ref materialises the queued functions.
    #[test]
    fn read_of_commute_materialises() {
        let counter = TRef::new(10);

        let tx = fat_tx();
        counter.commute(&tx, |v| v + 1).unwrap();
        assert_eq!(counter.get(&tx).unwrap(), 11);
        tx.commit().unwrap();
        assert_eq!(counter.atomic_get(), 11);
    }

    /// A set supersedes queued commute functions.
    #[test]
    fn set_supersedes_commute() {
        let counter = TRef::new(10);

        let tx = fat_tx();
        counter.commute(&tx, |v| v + 1).unwrap();
        counter.set(&tx, 5).unwrap();
        tx.commit().unwrap();
        assert_eq!(counter.atomic_get(), 5);
    }

    /// A lean context escalates on commute instead of failing.
    #[test]
    fn lean_shape_escalates_on_commute() {
        let counter = TRef::new(0);
        let tx = Transaction::new(TxConfig::default(), Shape::Lean, 0);
        assert_eq!(counter.commute(&tx, |v| v + 1), Err(Control::Speculative));
        tx.abort();
    }

    /// A lean context escalates when its read log would overflow.
    #[test]
    fn lean_shape_escalates_on_overflow() {
        let refs: Vec<TRef<i32>> = (0..=log::LEAN_READ_CAP as i32).map(TRef::new).collect();
        let tx = Transaction::new(TxConfig::default(), Shape::Lean, 0);
        let mut last = Ok(0);
        for var in &refs {
            last = var.get(&tx);
        }
        assert_eq!(last, Err(Control::Speculative));
        tx.abort();
    }

    /// `or` rolls back the first branch and runs the second.
    #[test]
    fn or_discards_first_branch_writes() {
        let var = TRef::new(42);

        let tx = fat_tx();
        let x = tx
            .or(
                |tx| {
                    var.set(tx, 23)?;
                    crate::retry()
                },
                |tx| var.get(tx),
            )
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(x, 42);
        assert_eq!(var.atomic_get(), 42);
    }

    /// Retrying on both branches watches the union of their reads.
    #[test]
    fn or_watches_union_of_reads() {
        let a = TRef::new(0);
        let b = TRef::new(0);

        let tx = fat_tx();
        let r: Stm<()> = tx.or(
            |tx| {
                a.get(tx)?;
                crate::retry()
            },
            |tx| {
                b.get(tx)?;
                crate::retry()
            },
        );
        assert_eq!(r, Err(Control::Retry));

        let (latch, watched) = tx.register_retry().unwrap();
        assert_eq!(watched.len(), 2);
        tx.abort();

        // A publication on the abandoned branch's ref wakes the latch.
        a.atomic_set(1);
        assert!(latch.is_signalled());
    }

    /// `retry` with nothing read has nothing to wait on.
    #[test]
    fn retry_without_reads_is_refused() {
        let tx = fat_tx();
        assert_eq!(tx.register_retry().unwrap_err(), TxError::NoRetryPossible);
        tx.abort();
    }

    /// Construction inside a transaction publishes with the rest.
    #[test]
    fn construction_commits_with_transaction() {
        let tx = fat_tx();
        let var = TRef::new_in(&tx, 7).unwrap();
        assert_eq!(var.get(&tx).unwrap(), 7);
        var.set(&tx, 8).unwrap();
        tx.commit().unwrap();
        assert_eq!(var.atomic_get(), 8);
    }
}
