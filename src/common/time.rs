use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// The source of the wall-clock seconds stored in cache record metadata.
///
/// The default clock reads `SystemTime`. Tests replace it with a mocked
/// source so TTL expiry and eviction can be driven deterministically.
#[derive(Clone, Default)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    Standard,
    #[cfg(test)]
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    fn default() -> Self {
        ClockType::Standard
    }
}

impl Clock {
    /// Creates a `Clock` backed by a mocked source of time, along with a
    /// handle for moving that time forward.
    #[cfg(test)]
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time as whole seconds since the Unix epoch.
    pub(crate) fn now_seconds(&self) -> u64 {
        match &self.ty {
            ClockType::Standard => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            #[cfg(test)]
            ClockType::Mocked { mock } => mock.now_seconds(),
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct Mock {
    now: AtomicU64,
}

#[cfg(test)]
impl Mock {
    pub(crate) fn now_seconds(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, seconds: u64) {
        self.now.store(seconds, Ordering::Relaxed);
    }

    pub(crate) fn increment(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::Relaxed);
    }
}
