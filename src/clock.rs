// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};

/// A commit version taken from the global clock.
pub type Version = u64;

/// Versions are packed into 48 bits of the per-ref lock word.
pub(crate) const MAX_VERSION: Version = (1 << 48) - 1;

/// The process-wide commit clock.
///
/// Every transaction takes its snapshot version from `read` when it begins.
/// Every commit that publishes at least one ref advances the clock with
/// `tick`; read-only commits never touch it.
#[derive(Debug)]
pub struct GlobalClock(AtomicU64);

/// The one clock all transactions in this process share.
pub static CLOCK: GlobalClock = GlobalClock::new();

impl GlobalClock {
    const fn new() -> GlobalClock {
        // Refs are born at version 0, so the first tick must return 1.
        GlobalClock(AtomicU64::new(0))
    }

    /// The current commit version.
    #[inline]
    pub fn read(&self) -> Version {
        self.0.load(Ordering::Acquire)
    }

    /// Advance the clock and return the post-increment value.
    ///
    /// The returned version is only made visible to readers once the writer
    /// stores it into a ref's lock word on publication, so snapshots taken
    /// before this tick can never observe a ref published with it.
    #[inline]
    pub fn tick(&self) -> Version {
        let version = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(version < MAX_VERSION, "commit clock approaching overflow");
        version
    }
}
