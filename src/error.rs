// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

/// Control-flow signals consumed by the executor.
///
/// Closures running inside a transaction return [`Stm`] and propagate these
/// with `?`. Do not handle them yourself: recovering from a conflict or a
/// retry outside the executor breaks the atomicity and wakeup guarantees.
/// Use [`Transaction::or`](crate::Transaction::or) to combine alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// A ref read by this transaction no longer matches the snapshot.
    ReadConflict,
    /// A ref this transaction wants to publish was changed underneath it.
    WriteConflict,
    /// A ref lock could not be acquired within the spin bound.
    LockNotFree,
    /// The speculative context shape was too small for the closure.
    /// The executor re-runs with a richer shape; this never counts as a retry.
    Speculative,
    /// `retry` was called: park until a read ref changes, then re-run.
    Retry,
    /// Unrecoverable failure. The executor aborts and hands the error to the
    /// caller of `execute`.
    Fatal(TxError),
}

/// The result of a single step of a transactional computation.
pub type Stm<T> = Result<T, Control>;

impl From<TxError> for Control {
    fn from(e: TxError) -> Control {
        Control::Fatal(e)
    }
}

/// Failures surfaced to the caller of [`execute`](crate::execute).
///
/// Unlike [`Control`] these are ordinary errors: inspecting them is fine.
/// Whenever one is returned the transaction is guaranteed to have been
/// aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// The operation needs an active transaction on this thread.
    #[error("operation requires an active transaction")]
    TransactionMandatory,

    /// `Propagation::Never` was used while a transaction is active.
    #[error("a transaction is already active on this thread")]
    TransactionNotAllowed,

    /// `retry` was called before anything was read; there is nothing to
    /// wait on and the transaction would sleep forever.
    #[error("retry is not possible without reads to wait on")]
    NoRetryPossible,

    /// `retry` was called with `blocking_allowed = false`.
    #[error("retry called, but blocking is not allowed by the configuration")]
    RetryNotAllowed,

    /// The configured deadline elapsed while parked on a retry.
    #[error("timed out while waiting for a ref to change")]
    RetryTimeout,

    /// The latch was interrupted while parked with `interruptible = true`.
    #[error("interrupted while waiting for a ref to change")]
    RetryInterrupted,

    /// The conflict retry budget is exhausted.
    #[error("transaction failed after {0} attempts")]
    TooManyRetries(u64),

    /// The operation ran against an aborted or committed transaction.
    #[error("operation on an aborted or committed transaction")]
    DeadTransaction,

    /// A mutating operation ran against a prepared transaction.
    #[error("mutating operation on a prepared transaction")]
    PreparedTransaction,

    /// A write was attempted with `readonly = true`.
    #[error("write attempted in a readonly transaction")]
    ReadonlyViolation,

    /// Placeholder returned by a joined inner `execute` whose closure raised
    /// a control signal. The signal itself travels via the shared context and
    /// is re-raised by the enclosing executor.
    #[error("control signal raised inside a joined inner transaction")]
    InnerConflict,

    /// An `atomic_checked` block touched more than one ref.
    #[error("atomic block touched more than one ref")]
    AtomicBlockViolation,
}
