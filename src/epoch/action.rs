//! Sharded queues of deferred actions, keyed by the epoch that stamped
//! them.

use std::collections::BTreeMap;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::epoch::Action;

static DETECTED_PARALLELISM: Lazy<usize> = Lazy::new(|| {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
});

/// Registration spreads actions over a power-of-two number of shards
/// with a round-robin counter, purely to keep writers from contending on
/// one mutex. Draining visits every shard.
pub(crate) struct ActionQueues {
    shards: Box<[Mutex<BTreeMap<u64, Vec<Action>>>]>,
    next_shard: AtomicU32,
}

impl ActionQueues {
    /// `num_queues` is rounded up to the next power of two; zero selects
    /// the detected parallelism of the host.
    pub(crate) fn new(num_queues: usize) -> Self {
        let requested = if num_queues == 0 {
            *DETECTED_PARALLELISM
        } else {
            num_queues
        };
        let shards = std::iter::repeat_with(|| Mutex::new(BTreeMap::new()))
            .take(requested.next_power_of_two())
            .collect();
        Self {
            shards,
            next_shard: AtomicU32::new(0),
        }
    }

    pub(crate) fn register(&self, epoch: u64, action: Action) {
        let shard =
            self.next_shard.fetch_add(1, Ordering::Relaxed) as usize & (self.shards.len() - 1);
        self.shards[shard]
            .lock()
            .entry(epoch)
            .or_default()
            .push(action);
    }

    /// Runs every action stamped strictly below `up_to` and returns how
    /// many ran. Actions are collected under each shard's lock but run
    /// with no lock held.
    pub(crate) fn perform(&self, up_to: u64) -> u64 {
        let mut to_run: Vec<Action> = Vec::new();
        for shard in self.shards.iter() {
            let mut queue = shard.lock();
            let newer = queue.split_off(&up_to);
            let drained = mem::replace(&mut *queue, newer);
            drop(queue);
            to_run.extend(drained.into_values().flatten());
        }

        let performed = to_run.len() as u64;
        for action in to_run {
            action();
        }
        performed
    }
}
