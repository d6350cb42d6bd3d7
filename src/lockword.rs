// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The packed per-ref lock/version word.
//!
//! A single `AtomicU64` holds everything a ref needs for synchronisation:
//!
//! ```text
//! bits 63..16   publication version (48 bits)
//! bits 15..2    reader count (14 bits)
//! bits  1..0    lock mode: 0 = None, 1 = Read, 2 = Write, 3 = Exclusive
//! ```
//!
//! The value slot of a ref may only be replaced while `Exclusive` is held,
//! so loading the word twice around a value read yields a consistent
//! `(value, version)` pair whenever both loads agree.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::Version;

const MODE_BITS: u64 = 0b11;
const READERS_SHIFT: u64 = 2;
const READERS_BITS: u64 = (1 << 14) - 1;
const VERSION_SHIFT: u64 = 16;

/// The lock a transaction holds (or wants) on a ref.
///
/// Modes are ordered by strength; within a transaction a ref's held mode
/// only ever goes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    /// No lock; reads are optimistic.
    #[default]
    None = 0,
    /// Shared read lock. Any number of readers, no writers.
    Read = 1,
    /// Single pending writer. The committed value is still readable.
    Write = 2,
    /// Publication in progress; all access is refused.
    Exclusive = 3,
}

impl LockMode {
    fn from_bits(bits: u64) -> LockMode {
        match bits & MODE_BITS {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Exclusive,
        }
    }
}

/// A decoded copy of the word at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WordState {
    raw: u64,
    pub version: Version,
    pub readers: u32,
    pub mode: LockMode,
}

impl WordState {
    fn decode(raw: u64) -> WordState {
        WordState {
            raw,
            version: raw >> VERSION_SHIFT,
            readers: ((raw >> READERS_SHIFT) & READERS_BITS) as u32,
            mode: LockMode::from_bits(raw),
        }
    }

    /// True when the two states come from the very same word value.
    pub fn same_as(&self, other: &WordState) -> bool {
        self.raw == other.raw
    }
}

const fn pack(version: Version, readers: u64, mode: LockMode) -> u64 {
    (version << VERSION_SHIFT) | (readers << READERS_SHIFT) | mode as u64
}

#[derive(Debug)]
pub(crate) struct LockWord(AtomicU64);

impl LockWord {
    pub const fn new(version: Version) -> LockWord {
        LockWord(AtomicU64::new(pack(version, 0, LockMode::None)))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> WordState {
        WordState::decode(self.0.load(order))
    }

    /// Try to strengthen the lock held by the calling transaction from
    /// `held` to `want` in a single logical step.
    ///
    /// Returns `false` when another transaction is in the way. The caller
    /// asserts `held` truthfully: the word itself does not remember owners,
    /// the per-transaction log does.
    pub fn try_acquire(&self, held: LockMode, want: LockMode) -> bool {
        if want <= held {
            return true;
        }
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let cur = WordState::decode(raw);
                match (held, want) {
                    (LockMode::None, LockMode::Read) => match cur.mode {
                        LockMode::None | LockMode::Read
                            if (cur.readers as u64) < READERS_BITS =>
                        {
                            Some(pack(cur.version, cur.readers as u64 + 1, LockMode::Read))
                        }
                        _ => None,
                    },
                    (LockMode::None, LockMode::Write) | (LockMode::None, LockMode::Exclusive) => {
                        if cur.mode == LockMode::None && cur.readers == 0 {
                            Some(pack(cur.version, 0, want))
                        } else {
                            None
                        }
                    }
                    (LockMode::Read, LockMode::Write) | (LockMode::Read, LockMode::Exclusive) => {
                        // Only the sole reader may upgrade.
                        if cur.mode == LockMode::Read && cur.readers == 1 {
                            Some(pack(cur.version, 0, want))
                        } else {
                            None
                        }
                    }
                    (LockMode::Write, LockMode::Exclusive) => {
                        debug_assert_eq!(cur.mode, LockMode::Write);
                        Some(pack(cur.version, 0, LockMode::Exclusive))
                    }
                    _ => unreachable!("invalid lock transition {held:?} -> {want:?}"),
                }
            })
            .is_ok()
    }

    /// Drop whatever the calling transaction holds.
    ///
    /// A reader decrements the count (the mode falls back to `None` with the
    /// last reader); a writer clears the mode. The version is preserved.
    pub fn release(&self, held: LockMode) {
        if held == LockMode::None {
            return;
        }
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let cur = WordState::decode(raw);
            Some(match held {
                LockMode::Read => {
                    debug_assert!(cur.mode == LockMode::Read && cur.readers > 0);
                    let readers = cur.readers as u64 - 1;
                    let mode = if readers == 0 { LockMode::None } else { LockMode::Read };
                    pack(cur.version, readers, mode)
                }
                _ => {
                    debug_assert!(cur.mode >= LockMode::Write);
                    pack(cur.version, 0, LockMode::None)
                }
            })
        });
    }

    /// Atomically weaken the lock held by the calling transaction from
    /// `held` down to `to`, without ever letting the ref go unlocked in
    /// between. Used when an `or` branch is rolled back to its pre-branch
    /// lock mode.
    pub fn downgrade(&self, held: LockMode, to: LockMode) {
        debug_assert!(held > to);
        if to == LockMode::None {
            self.release(held);
            return;
        }
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let cur = WordState::decode(raw);
            debug_assert_eq!(cur.mode, held);
            Some(match to {
                LockMode::Read => pack(cur.version, 1, LockMode::Read),
                _ => pack(cur.version, 0, to),
            })
        });
    }

    /// Publish a new version and unlock in one release-ordered store.
    ///
    /// The caller must hold `Exclusive` and must have installed the new
    /// value beforehand.
    pub fn publish(&self, version: Version) {
        debug_assert_eq!(self.load(Ordering::Relaxed).mode, LockMode::Exclusive);
        self.0.store(pack(version, 0, LockMode::None), Ordering::Release);
    }
}
