// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated STM, with a versioned commit protocol.
//!
//! With locks, the sequential composition of two threadsafe actions is no
//! longer threadsafe, because other threads may interfere in between.
//! Protecting both with a third lock invites deadlocks. Transactional
//! memory composes instead: all reads and writes inside a transaction go
//! into a log, and when the closure finishes, the log is committed as a
//! single atomic step against a consistent snapshot of memory - or the
//! whole computation repeats.
//!
//! Every ref carries a publication version taken from a global commit
//! clock, packed into one atomic word together with its lock state. Reads
//! validate against the snapshot version the transaction started with, so
//! even a transaction that is doomed to abort only ever observes consistent
//! state.
//!
//! # Usage
//!
//! Run a transaction with [`atomically`]; the closure receives the
//! [`Transaction`] and accesses [`TRef`]s through it. Use `?` to propagate
//! the [`Stm`] result of every operation - never handle the error yourself.
//!
//! ```
//! use vstm::{atomically, TRef};
//!
//! let var = TRef::new(0);
//!
//! let x = atomically(|tx| {
//!     var.set(tx, 42)?;
//!     var.get(tx)
//! });
//!
//! assert_eq!(x, 42);
//! ```
//!
//! [`retry`] abandons the attempt and parks the thread until another
//! transaction changes one of the refs read so far.
//! [`Transaction::or`] combines alternatives: when the first branch
//! retries, the second runs instead. [`execute`] is the configurable,
//! checked form of [`atomically`]: lock modes, blocking, timeouts,
//! isolation, propagation and retry budgets all live in [`TxConfig`].
//!
//! # Transaction safety
//!
//! * Don't run code with side effects, especially no IO. Transactions
//!   repeat on conflict; return a closure if you have to.
//! * Don't handle [`Control`] yourself. Use [`Transaction::or`] to combine
//!   alternative paths and [`optionally`] to probe a branch, and always
//!   propagate with `?`.
//! * Don't mix locks and transactions; the commit machinery takes its own
//!   locks and the combination deadlocks easily.
//! * Don't use inner mutability to change the content of a [`TRef`].
//!
//! Panicking in a transaction is transaction-safe: the transaction aborts,
//! all tentative state is discarded, all locks are released, and the panic
//! propagates. No poisoning, no half-written refs.
//!
//! # Speed
//!
//! Keep atomic blocks small. The more refs a transaction touches and the
//! longer it runs, the more likely it collides with other threads. Reads
//! look the ref up in the log every time, so the number of distinct refs
//! matters more than the number of operations. For a single shared counter
//! prefer [`TRef::commute`] or the `atomic_*` family over a read-modify-
//! write transaction.

mod clock;
mod config;
mod error;
mod executor;
mod lockword;
mod transaction;
mod tref;

pub mod collections;


pub use clock::Version;
pub use config::{IsolationLevel, Propagation, TxConfig};
pub use error::{Control, Stm, TxError};
pub use executor::{atomic_checked, atomically, execute, with_tx, TxExecutor};
pub use lockword::LockMode;
pub use transaction::{Transaction, TxStatus};
pub use tref::TRef;

/// Abandon the transaction and run it again after one of the refs read so
/// far has changed.
///
/// Semantically `retry` allows spin-lock-like waiting, but the library
/// parks the thread until a watched ref is published, keeping CPU usage
/// low.
///
/// # Example
///
/// ```no_run
/// use vstm::{atomically, retry, TRef};
///
/// let gate = TRef::new(false);
/// let _: i32 = atomically(|tx| {
///     if !gate.get(tx)? {
///         return retry();
///     }
///     Ok(42)
/// });
/// ```
#[inline]
pub fn retry<T>() -> Stm<T> {
    Err(Control::Retry)
}

/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// use vstm::{atomically, guard, TRef};
///
/// let var = TRef::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.get(tx)?;
///     guard(v == 42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
#[inline]
pub fn guard(cond: bool) -> Stm<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

/// Unwrap an `Option` or retry if it is `None`.
///
/// The inverse of [`optionally`].
#[inline]
pub fn unwrap_or_retry<T>(option: Option<T>) -> Stm<T> {
    match option {
        Some(x) => Ok(x),
        None => retry(),
    }
}

/// Run `f`, and if it retries, return `None` instead of blocking the whole
/// transaction.
///
/// The inverse of [`unwrap_or_retry`].
///
/// # Example
///
/// ```
/// use vstm::{atomically, optionally, retry};
///
/// let x: Option<i32> = atomically(|tx| optionally(tx, |_| retry()));
/// assert_eq!(x, None);
/// ```
#[inline]
pub fn optionally<T>(
    tx: &Transaction,
    f: impl Fn(&Transaction) -> Stm<T>,
) -> Stm<Option<T>> {
    tx.or(|tx| f(tx).map(Some), |_| Ok(None))
}
