//! The epoch refcount ring.
//!
//! Epochs are dense 64-bit counters; epoch `e` uses slot `e % capacity`.
//! `back` is the newest epoch and the one new pins attach to; `front` is
//! the oldest epoch that may still have readers. The window between them
//! can only grow to `capacity - 1` slots, after which advancement waits
//! for the frontier.
//!
//! Lock discipline, which the safety of reclamation hangs on: `pin`
//! holds the back lock shared while it reads `back` and bumps that
//! slot's refcount, and the advancer holds it exclusively while bumping
//! `back`. A pin therefore lands on an epoch that is still current, and
//! the advancer never observes a half-taken pin. `unpin` touches only
//! the refcount and needs no lock. `front` belongs to the advancer
//! thread alone.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

pub(crate) struct EpochQueue {
    front: AtomicU64,
    back: RwLock<u64>,
    ref_counts: Box<[AtomicU32]>,
}

impl EpochQueue {
    pub(crate) fn new(initial_epoch: u64, queue_size: u32) -> Self {
        assert!(queue_size > 0, "epoch queue size must be positive");
        let ref_counts = std::iter::repeat_with(|| AtomicU32::new(0))
            .take(queue_size as usize)
            .collect();
        Self {
            front: AtomicU64::new(initial_epoch),
            back: RwLock::new(initial_epoch),
            ref_counts,
        }
    }

    fn slot(&self, epoch: u64) -> &AtomicU32 {
        &self.ref_counts[(epoch % self.ref_counts.len() as u64) as usize]
    }

    /// Takes a reference on the current epoch and returns it.
    pub(crate) fn pin(&self) -> u64 {
        let back = self.back.read();
        let epoch = *back;
        self.slot(epoch).fetch_add(1, Ordering::Relaxed);
        epoch
    }

    /// Releases a reference taken by [`pin`](Self::pin).
    pub(crate) fn unpin(&self, epoch: u64) -> Result<()> {
        self.slot(epoch)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map(|_| ())
            .map_err(|_| Error::InvalidRefCount(epoch))
    }

    /// Moves `front` past every unreferenced epoch and returns it. Must
    /// only be called from the advancer thread.
    pub(crate) fn reclaim_frontier(&self) -> u64 {
        let back = *self.back.read();
        let mut front = self.front.load(Ordering::Relaxed);
        while back > front && self.slot(front).load(Ordering::Acquire) == 0 {
            front += 1;
        }
        self.front.store(front, Ordering::Relaxed);
        front
    }

    /// Opens the next epoch. `current` is bumped inside the exclusive
    /// section, before `back`, so an action stamped while this runs can
    /// never land behind a pin taken on the new epoch.
    ///
    /// Fails without advancing when the ring is full, i.e. the oldest
    /// epoch still has readers after a whole lap.
    pub(crate) fn advance(&self, current: &AtomicU64) -> Result<u64> {
        let mut back = self.back.write();
        let front = self.front.load(Ordering::Relaxed);
        if *back - front >= self.ref_counts.len() as u64 - 1 {
            return Err(Error::EpochQueueExhausted);
        }
        current.fetch_add(1, Ordering::Release);
        *back += 1;
        Ok(*back)
    }

    #[cfg(test)]
    pub(crate) fn back(&self) -> u64 {
        *self.back.read()
    }
}
