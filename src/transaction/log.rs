// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Log entry types and the speculative context shapes.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::clock::Version;
use crate::lockword::LockMode;
use crate::tref::{ArcAny, RefBlock};

/// Inline capacity of the lean read log.
pub(crate) const LEAN_READ_CAP: usize = 16;

/// A deferred commute function, erased over the ref's value type.
pub(crate) type CommuteFn = Arc<dyn Fn(ArcAny) -> ArcAny>;

/// The read log. Lean transactions never spill past the inline capacity;
/// they escalate instead.
pub(crate) type ReadLog = SmallVec<[ReadEntry; LEAN_READ_CAP]>;

/// One ref this transaction has read.
#[derive(Clone)]
pub(crate) struct ReadEntry {
    pub block: Arc<RefBlock>,
    /// The version the value was observed at; the validation anchor.
    pub observed: Version,
    /// Cached so repeated reads never touch shared memory again.
    pub value: ArcAny,
    /// The lock this transaction holds on the ref, if any.
    pub mode: LockMode,
    /// Left behind by an abandoned `or` branch: register a retry listener,
    /// never validate. A real read refreshes the entry.
    pub watch_only: bool,
}

/// What a write-log entry will publish.
#[derive(Clone)]
pub(crate) enum WritePayload {
    /// An explicit tentative value.
    Set(ArcAny),
    /// Deferred functions, applied to the committed value under the commit
    /// lock, in registration order.
    Commute(Vec<CommuteFn>),
}

/// One ref this transaction will publish.
#[derive(Clone)]
pub(crate) struct WriteEntry {
    pub block: Arc<RefBlock>,
    pub payload: WritePayload,
    /// The lock this transaction holds on the ref right now. Strengthened
    /// to at least `Write` during prepare.
    pub mode: LockMode,
    /// `Some` when the tentative value depends on a read: the committed
    /// version must still match at prepare. Blind writes and commutes
    /// carry `None`.
    pub observed: Option<Version>,
}

/// The speculative shape of a transaction context.
///
/// The executor starts with the cheapest shape that might work and
/// reinstantiates with a richer one when the closure outgrows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Shape {
    /// Fixed-capacity inline read log, no commute support.
    Lean,
    /// Growable logs, full feature set.
    Fat,
}

impl Shape {
    pub fn read_capacity(self) -> Option<usize> {
        match self {
            Shape::Lean => Some(LEAN_READ_CAP),
            Shape::Fat => None,
        }
    }

    pub fn supports_commute(self) -> bool {
        self == Shape::Fat
    }
}
