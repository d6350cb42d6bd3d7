// Copyright 2026 vstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;

use crate::error::Stm;
use crate::transaction::Transaction;
use crate::tref::TRef;
use crate::unwrap_or_retry;

/// An unbounded, threadsafe FIFO queue.
///
/// The queue is built from two refs holding vectors: `push` appends to the
/// write side, `pop` takes from the read side and swaps in the reversed
/// write side when it runs dry. All operations are amortized constant time,
/// and reads mostly do not conflict with writes.
///
/// Unlike a channel, an aborted transaction undoes its queue operations.
///
/// # Example
///
/// ```
/// use vstm::atomically;
/// use vstm::collections::Queue;
///
/// let queue = Queue::new();
/// let x = atomically(|tx| {
///     queue.push(tx, 42)?;
///     queue.pop(tx)
/// });
/// assert_eq!(x, 42);
/// ```
#[derive(Clone)]
pub struct Queue<T> {
    read: TRef<Vec<T>>,
    write: TRef<Vec<T>>,
}

impl<T> Queue<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Create a new, empty queue.
    pub fn new() -> Queue<T> {
        Queue {
            read: TRef::new(Vec::new()),
            write: TRef::new(Vec::new()),
        }
    }

    /// Add an element to the back of the queue.
    pub fn push(&self, tx: &Transaction, value: T) -> Stm<()> {
        self.write.alter_and_get(tx, |mut v| {
            v.push(value);
            v
        })?;
        Ok(())
    }

    /// Remove the front element, or `None` when the queue is empty.
    pub fn try_pop(&self, tx: &Transaction) -> Stm<Option<T>> {
        // The read side stores elements in reverse, so the front is last.
        let mut rv = self.read.get(tx)?;
        if let Some(value) = rv.pop() {
            self.read.set(tx, rv)?;
            return Ok(Some(value));
        }
        let mut wv = self.write.get(tx)?;
        if wv.is_empty() {
            return Ok(None);
        }
        wv.reverse();
        let value = wv.pop();
        self.read.set(tx, wv)?;
        self.write.set(tx, Vec::new())?;
        Ok(value)
    }

    /// Remove the front element, blocking while the queue is empty.
    pub fn pop(&self, tx: &Transaction) -> Stm<T> {
        unwrap_or_retry(self.try_pop(tx)?)
    }

    /// Return the front element without removing it, blocking while the
    /// queue is empty.
    pub fn peek(&self, tx: &Transaction) -> Stm<T> {
        let value = self.pop(tx)?;
        let front = value.clone();
        self.read.alter_and_get(tx, |mut v| {
            v.push(front);
            v
        })?;
        Ok(value)
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self, tx: &Transaction) -> Stm<bool> {
        Ok(self.read.get(tx)?.is_empty() && self.write.get(tx)?.is_empty())
    }
}

impl<T> Default for Queue<T>
where
    T: Any + Send + Sync + Clone,
{
    fn default() -> Self {
        Queue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::run_async;
    use crate::{atomically, TxConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Push and pop inside one transaction round-trip.
    #[test]
    fn push_pop() {
        let queue = Queue::new();
        let x = atomically(|tx| {
            queue.push(tx, 42)?;
            queue.pop(tx)
        });
        assert_eq!(42, x);
    }

    /// The queue is a FIFO within a single transaction.
    #[test]
    fn push_pop_order() {
        let queue = Queue::new();
        let x = atomically(|tx| {
            queue.push(tx, 1)?;
            queue.push(tx, 2)?;
            queue.push(tx, 3)?;
            Ok((queue.pop(tx)?, queue.pop(tx)?, queue.pop(tx)?))
        });
        assert_eq!((1, 2, 3), x);
    }

    /// The order also holds across transactions.
    #[test]
    fn order_across_transactions() {
        let queue = Queue::new();
        atomically(|tx| {
            queue.push(tx, 1)?;
            queue.push(tx, 2)
        });
        atomically(|tx| queue.push(tx, 3));

        let x = atomically(|tx| Ok((queue.pop(tx)?, queue.pop(tx)?, queue.pop(tx)?)));
        assert_eq!((1, 2, 3), x);

        let empty = atomically(|tx| queue.is_empty(tx));
        assert!(empty);
    }

    #[test]
    fn peek_leaves_element() {
        let queue = Queue::new();
        atomically(|tx| queue.push(tx, 7));
        assert_eq!(7, atomically(|tx| queue.peek(tx)));
        assert_eq!(7, atomically(|tx| queue.pop(tx)));
    }

    /// A pop on an empty queue parks until a push arrives.
    #[test]
    fn pop_blocks_until_push() {
        let queue = Queue::new();
        let queue2 = queue.clone();

        let x = run_async(
            800,
            move || atomically(|tx| queue2.pop(tx)),
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| queue.push(tx, 42));
            },
        );
        assert_eq!(Some(42), x);
    }

    /// Two producers and two consumers: every pushed value is popped
    /// exactly once and no pop observes a partial enqueue.
    #[test]
    fn producers_consumers() {
        const OPS: usize = 2500;

        let queue: Queue<(usize, usize)> = Queue::new();
        let popped = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for producer in 0..2 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..OPS {
                    atomically(|tx| queue.push(tx, (producer, i)));
                }
            }));
        }
        for _ in 0..2 {
            let queue = queue.clone();
            let popped = popped.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..OPS {
                    let item = atomically(|tx| queue.pop(tx));
                    popped.lock().push(item);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut popped = Arc::try_unwrap(popped).unwrap().into_inner();
        assert_eq!(popped.len(), 2 * OPS);
        popped.sort_unstable();
        popped.dedup();
        assert_eq!(popped.len(), 2 * OPS);
        assert!(atomically(|tx| queue.is_empty(tx)));
    }

    /// `or` over two empty queues parks on both and returns from whichever
    /// gets an element first.
    #[test]
    fn or_takes_from_either_queue() {
        let q1: Queue<i32> = Queue::new();
        let q2: Queue<i32> = Queue::new();
        let (q1c, q2c) = (q1.clone(), q2.clone());

        let x = run_async(
            800,
            move || atomically(|tx| tx.or(|tx| q1c.pop(tx), |tx| q2c.pop(tx))),
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| q2.push(tx, 23));
            },
        );
        assert_eq!(Some(23), x);

        // The other way around as well.
        let (q1c, q2c) = (q1.clone(), q2.clone());
        let x = run_async(
            800,
            move || atomically(|tx| tx.or(|tx| q1c.pop(tx), |tx| q2c.pop(tx))),
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| q1.push(tx, 24));
            },
        );
        assert_eq!(Some(24), x);
    }

    /// Queue operations respect `readonly`.
    #[test]
    fn push_refused_readonly() {
        use crate::{execute, TxError};

        let queue: Queue<i32> = Queue::new();
        let r = execute(&TxConfig::default().with_readonly(true), |tx| {
            queue.push(tx, 1)
        });
        assert_eq!(r.unwrap_err(), TxError::ReadonlyViolation);
    }
}
