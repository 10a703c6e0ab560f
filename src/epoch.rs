pub(crate) mod action;
pub(crate) mod manager;
pub(crate) mod queue;

/// A deferred destructor, run once its epoch falls behind the frontier.
pub(crate) type Action = Box<dyn FnOnce() + Send>;

/// Where tables hand the records they retire.
///
/// The store wires this to the epoch manager; restore and unit tests
/// substitute registries with immediate or recorded execution.
pub(crate) trait ActionRegistry: Send + Sync {
    fn register_action(&self, action: Action);
}
