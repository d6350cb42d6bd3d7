// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::Stm;
use crate::optionally;
use crate::transaction::Transaction;
use crate::tref::TRef;

/// A counting semaphore on top of transactional memory.
///
/// Unlike an OS semaphore it composes: a transaction that takes tokens
/// from two semaphores gets both or neither, a batch [`acquire`] takes all
/// of its tokens in one atomic step, and an aborted transaction returns
/// everything it took.
///
/// [`acquire`]: Semaphore::acquire
#[derive(Clone, Debug)]
pub struct Semaphore {
    tokens: TRef<u32>,
}

impl Semaphore {
    /// Create a new semaphore with `tokens` initial tokens.
    pub fn new(tokens: u32) -> Semaphore {
        Semaphore {
            tokens: TRef::new(tokens),
        }
    }

    /// Take `n` tokens, blocking until all of them are available at once.
    ///
    /// Partial availability takes nothing: the transaction parks until the
    /// count covers the whole batch.
    pub fn acquire(&self, tx: &Transaction, n: u32) -> Stm<()> {
        self.tokens.await_until(tx, |have| *have >= n)?;
        self.tokens.decr(tx, n)?;
        Ok(())
    }

    /// Take a single token, blocking while none are left.
    pub fn wait(&self, tx: &Transaction) -> Stm<()> {
        self.acquire(tx, 1)
    }

    /// Take a token if one is available right now, without blocking.
    pub fn try_wait(&self, tx: &Transaction) -> Stm<bool> {
        let taken = optionally(tx, |tx| self.wait(tx))?;
        Ok(taken.is_some())
    }

    /// Put `n` tokens back.
    pub fn release(&self, tx: &Transaction, n: u32) -> Stm<()> {
        self.tokens.incr(tx, n)?;
        Ok(())
    }

    /// Free a single token.
    pub fn signal(&self, tx: &Transaction) -> Stm<()> {
        self.release(tx, 1)
    }

    /// The number of tokens currently available.
    pub fn available(&self, tx: &Transaction) -> Stm<u32> {
        self.tokens.get(tx)
    }
}
