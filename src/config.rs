// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

use crate::lockword::LockMode;

/// What commit-time validation a transaction performs on its read set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Revalidate every read at commit. Even doomed transactions only ever
    /// observe consistent snapshots.
    #[default]
    Serialized,
    /// Skip the commit-time read revalidation. Reads are still consistent
    /// with the begin snapshot; write skew becomes possible.
    Snapshot,
}

/// How an `execute` composes with a transaction already active on the
/// current thread. Nesting is always flattened: a joined inner execute
/// shares the outer context and has no retry scope of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Join the active transaction, or start a new one.
    #[default]
    Requires,
    /// Always run a fresh transaction, even inside an active one.
    RequiresNew,
    /// Join the active transaction; fail with `TransactionMandatory` if
    /// there is none.
    Mandatory,
    /// Fail with `TransactionNotAllowed` if a transaction is active,
    /// otherwise run a new one.
    Never,
    /// Same as `Requires`.
    Supports,
}

/// Immutable per-transaction knobs.
///
/// A `TxConfig` is taken by [`execute`](crate::execute) and copied into every
/// attempt's context. The setters chain:
///
/// ```
/// use vstm::{TxConfig, LockMode};
/// use std::time::Duration;
///
/// let config = TxConfig::default()
///     .with_read_lock_mode(LockMode::Read)
///     .with_timeout(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Lock every ref acquires on first read. Default `None` (optimistic).
    pub read_lock_mode: LockMode,
    /// Lock acquired on first write. Default `Write`: write-write conflicts
    /// fail fast instead of at commit. `None` defers locking to commit.
    pub write_lock_mode: LockMode,
    /// Whether `retry` may park the thread. Default `true`.
    pub blocking_allowed: bool,
    /// Maximum parked time on a retry latch. Default `None` (unbounded).
    pub timeout: Option<Duration>,
    /// Whether a parked latch obeys an interrupt. Default `false`.
    pub interruptible: bool,
    /// Cap on conflict retries. Default 1000.
    pub max_retries: u64,
    /// Start with a minimal context shape and upgrade on demand.
    /// Default `true`.
    pub speculative: bool,
    /// Default `Serialized`.
    pub isolation: IsolationLevel,
    /// Default `Requires`.
    pub propagation: Propagation,
    /// Disallow writes; validated at the first write attempt.
    /// Default `false`.
    pub readonly: bool,
}

impl Default for TxConfig {
    fn default() -> TxConfig {
        TxConfig {
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::Write,
            blocking_allowed: true,
            timeout: None,
            interruptible: false,
            max_retries: 1000,
            speculative: true,
            isolation: IsolationLevel::Serialized,
            propagation: Propagation::Requires,
            readonly: false,
        }
    }
}

impl TxConfig {
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}
