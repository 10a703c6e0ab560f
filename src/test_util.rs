//! Shared helpers for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::epoch::{Action, ActionRegistry};

/// An action registry that records registrations and runs them only on
/// demand, standing in for the epoch manager in table tests.
#[derive(Default)]
pub(crate) struct MockRegistry {
    actions: Mutex<Vec<Action>>,
    registered: AtomicUsize,
}

impl MockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// How many actions have been registered so far.
    pub(crate) fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Runs and discards every held action.
    pub(crate) fn run_all(&self) {
        let actions: Vec<Action> = std::mem::take(&mut *self.actions.lock());
        for action in actions {
            action();
        }
    }
}

impl ActionRegistry for MockRegistry {
    fn register_action(&self, action: Action) {
        self.registered.fetch_add(1, Ordering::SeqCst);
        self.actions.lock().push(action);
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        // Free whatever the tests retired but never drained.
        for action in self.actions.get_mut().drain(..) {
            action();
        }
    }
}
