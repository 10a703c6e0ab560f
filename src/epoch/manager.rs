//! The epoch manager: the current-epoch counter, the refcount ring, the
//! deferred-action shards, and the background thread that ties them
//! together.
//!
//! Reclamation correctness in one paragraph: a context pins the epoch
//! `back` held at pin time. Every retirement is stamped with `current`,
//! and `current` is always at or ahead of `back`, so a retirement
//! registered after the pin carries an epoch at least as large as the
//! pinned one. The advancer only runs actions stamped strictly below the
//! frontier, and the frontier cannot pass an epoch whose refcount is
//! nonzero. A pinned reader therefore outlives every record it could
//! have observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::EpochManagerConfig;
use crate::epoch::action::ActionQueues;
use crate::epoch::queue::EpochQueue;
use crate::epoch::{Action, ActionRegistry};
use crate::error::Result;
use crate::perf::{StoreCounter, StorePerfData};

struct Shared {
    current: AtomicU64,
    queue: EpochQueue,
    actions: ActionQueues,
    perf: Arc<StorePerfData>,
}

impl Shared {
    /// One advancer cycle: reclaim the frontier, run what fell behind
    /// it, then open the next epoch.
    fn run_cycle(&self) {
        let front = self.queue.reclaim_frontier();
        let performed = self.actions.perform(front);

        self.perf
            .sub(StoreCounter::PendingActionsCount, performed as i64);
        self.perf
            .set(StoreCounter::LastPerformedActionsCount, performed as i64);
        self.perf
            .set(StoreCounter::OldestEpochInQueue, front as i64);

        if let Err(err) = self.queue.advance(&self.current) {
            // A reader has held its context for a whole lap of the ring.
            // Nothing is lost; the epoch just cannot move until it lets
            // go.
            log::warn!("delaying epoch advance: {err}");
        }
        self.perf.set(
            StoreCounter::LatestEpochInQueue,
            self.current.load(Ordering::Relaxed) as i64,
        );
    }
}

/// Owns epoch state and the advancer thread. Tables talk to it through
/// [`ActionRegistry`]; contexts through [`pin`](Self::pin) and
/// [`unpin`](Self::unpin).
pub(crate) struct EpochManager {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    advancer: Option<JoinHandle<()>>,
}

impl EpochManager {
    pub(crate) fn new(config: &EpochManagerConfig, perf: Arc<StorePerfData>) -> Self {
        let shared = Arc::new(Shared {
            current: AtomicU64::new(0),
            queue: EpochQueue::new(0, config.epoch_queue_size),
            actions: ActionQueues::new(config.num_action_queues),
            perf,
        });

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let advancer = spawn_advancer(
            Arc::clone(&shared),
            stop_rx,
            config.epoch_processing_interval,
        );

        Self {
            shared,
            stop_tx,
            advancer: Some(advancer),
        }
    }

    /// Pins the current epoch for a context and returns it.
    pub(crate) fn pin(&self) -> u64 {
        self.shared.queue.pin()
    }

    /// Releases a pinned epoch.
    pub(crate) fn unpin(&self, epoch: u64) -> Result<()> {
        self.shared.queue.unpin(epoch)
    }

    #[cfg(test)]
    pub(crate) fn current_epoch(&self) -> u64 {
        self.shared.current.load(Ordering::Acquire)
    }
}

impl ActionRegistry for EpochManager {
    fn register_action(&self, action: Action) {
        let epoch = self.shared.current.load(Ordering::Acquire);
        self.shared.actions.register(epoch, action);
        self.shared.perf.increment(StoreCounter::PendingActionsCount);
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(advancer) = self.advancer.take() {
            if advancer.join().is_err() {
                log::error!("epoch advancer thread panicked");
            }
        }
        // Tables are gone and no context can exist, so whatever is still
        // queued can run regardless of its epoch.
        let drained = self.shared.actions.perform(u64::MAX);
        self.shared
            .perf
            .sub(StoreCounter::PendingActionsCount, drained as i64);
    }
}

fn spawn_advancer(
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
    interval: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("larder-epoch-advancer".into())
        .spawn(move || {
            log::debug!("epoch advancer started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => shared.run_cycle(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("epoch advancer stopped");
        })
        .expect("failed to spawn the epoch advancer thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn fast_manager() -> (EpochManager, Arc<StorePerfData>) {
        let perf = Arc::new(StorePerfData::default());
        let config =
            EpochManagerConfig::default().epoch_processing_interval(Duration::from_millis(5));
        (EpochManager::new(&config, Arc::clone(&perf)), perf)
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn epochs_advance_in_the_background() {
        let (manager, perf) = fast_manager();
        assert!(wait_until(Duration::from_secs(5), || manager.current_epoch() > 3));
        assert!(perf.get(StoreCounter::LatestEpochInQueue) > 0);
        drop(manager);
    }

    #[test]
    fn actions_run_once_the_epoch_falls_behind_the_frontier() {
        let (manager, perf) = fast_manager();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        manager.register_action(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(wait_until(Duration::from_secs(5), || ran
            .load(Ordering::SeqCst)));
        assert!(wait_until(Duration::from_secs(1), || perf
            .get(StoreCounter::PendingActionsCount)
            == 0));
    }

    #[test]
    fn a_pinned_epoch_blocks_reclamation() {
        let (manager, _perf) = fast_manager();

        let pinned = manager.pin();
        // Let the advancer move well past the pinned epoch.
        assert!(wait_until(Duration::from_secs(5), || manager.current_epoch()
            > pinned + 3));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        manager.register_action(Box::new(move || flag.store(true, Ordering::SeqCst)));

        // The action is stamped ahead of the pin, so it must stay queued
        // while the pin is held.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));

        manager.unpin(pinned).unwrap();
        assert!(wait_until(Duration::from_secs(5), || ran
            .load(Ordering::SeqCst)));
    }

    #[test]
    fn dropping_the_manager_drains_pending_actions() {
        let (manager, perf) = fast_manager();

        let pinned = manager.pin();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        manager.register_action(Box::new(move || flag.store(true, Ordering::SeqCst)));

        // Leak the pin on purpose; teardown must still run the action.
        let _ = pinned;
        drop(manager);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(perf.get(StoreCounter::PendingActionsCount), 0);
    }

    #[test]
    fn unpin_of_an_unpinned_epoch_is_rejected() {
        let (manager, _perf) = fast_manager();
        let epoch = manager.pin();
        manager.unpin(epoch).unwrap();
        assert!(manager.unpin(epoch).is_err());
    }
}
