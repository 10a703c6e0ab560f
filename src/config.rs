use std::fmt;
use std::io::Read;
use std::time::Duration;

/// Configuration for a single named table.
///
/// ```
/// use std::time::Duration;
/// use larder::{CacheConfig, TableConfig};
///
/// let plain = TableConfig::new("sessions", 4096).buckets_per_mutex(8);
/// let cached = TableConfig::new("assets", 4096)
///     .cache(CacheConfig::new(64 * 1024 * 1024, Duration::from_secs(600)));
/// # let _ = (plain, cached);
/// ```
pub struct TableConfig {
    pub(crate) name: String,
    pub(crate) num_buckets: u32,
    pub(crate) num_buckets_per_mutex: u32,
    pub(crate) fixed_key_size: u16,
    pub(crate) fixed_value_size: u32,
    pub(crate) cache: Option<CacheConfig>,
    pub(crate) restore: Option<Box<dyn Read + Send>>,
}

impl TableConfig {
    /// Creates a configuration for a table with the given name and bucket
    /// count. Names are compared case-insensitively when tables are looked
    /// up or registered.
    pub fn new(name: impl Into<String>, num_buckets: u32) -> Self {
        Self {
            name: name.into(),
            num_buckets,
            num_buckets_per_mutex: 1,
            fixed_key_size: 0,
            fixed_value_size: 0,
            cache: None,
            restore: None,
        }
    }

    /// Sets how many buckets share one writer lock. Larger values reduce
    /// memory at the cost of more writer contention. Defaults to 1.
    pub fn buckets_per_mutex(mut self, num_buckets: u32) -> Self {
        self.num_buckets_per_mutex = num_buckets.max(1);
        self
    }

    /// Requires every key to have exactly this length, which drops the
    /// per-record key length prefix. Zero (the default) means variable.
    pub fn fixed_key_size(mut self, size: u16) -> Self {
        self.fixed_key_size = size;
        self
    }

    /// Requires every value to have exactly this length, which drops the
    /// per-record value length prefix. Zero (the default) means variable.
    pub fn fixed_value_size(mut self, size: u32) -> Self {
        self.fixed_value_size = size;
        self
    }

    /// Turns the table into a cache with a byte budget and per-record TTL.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Restores the table's initial contents from a snapshot stream
    /// previously produced by [`TableRef::dump`](crate::TableRef::dump).
    /// The bucket count and fixed sizes are taken from the stream.
    /// Not supported together with [`cache`](Self::cache).
    pub fn restore_from(mut self, reader: impl Read + Send + 'static) -> Self {
        self.restore = Some(Box::new(reader));
        self
    }
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("name", &self.name)
            .field("num_buckets", &self.num_buckets)
            .field("num_buckets_per_mutex", &self.num_buckets_per_mutex)
            .field("fixed_key_size", &self.fixed_key_size)
            .field("fixed_value_size", &self.fixed_value_size)
            .field("cache", &self.cache)
            .field("restore", &self.restore.is_some())
            .finish()
    }
}

/// Cache behavior for a table: a byte budget enforced by CLOCK eviction
/// and a time-to-live applied to every record.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub(crate) max_bytes: u64,
    pub(crate) ttl: Duration,
    pub(crate) force_time_based_eviction: bool,
}

impl CacheConfig {
    /// Creates a cache configuration with the given byte budget and
    /// record time-to-live.
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            max_bytes,
            ttl,
            force_time_based_eviction: false,
        }
    }

    /// When enabled, every insert first sweeps the target bucket and
    /// drops records whose TTL has passed, bounding staleness at the cost
    /// of a little work per write. Disabled by default.
    pub fn force_time_based_eviction(mut self, enabled: bool) -> Self {
        self.force_time_based_eviction = enabled;
        self
    }
}

/// Configuration for the epoch manager owned by a [`Store`](crate::Store).
#[derive(Clone, Debug)]
pub struct EpochManagerConfig {
    pub(crate) epoch_queue_size: u32,
    pub(crate) epoch_processing_interval: Duration,
    pub(crate) num_action_queues: usize,
}

impl Default for EpochManagerConfig {
    fn default() -> Self {
        Self {
            epoch_queue_size: 1000,
            epoch_processing_interval: Duration::from_millis(1000),
            num_action_queues: 1,
        }
    }
}

impl EpochManagerConfig {
    /// Sets the capacity of the epoch refcount ring. Must be positive.
    /// A context that stays pinned for more than this many processing
    /// intervals stalls epoch advancement.
    pub fn epoch_queue_size(mut self, size: u32) -> Self {
        self.epoch_queue_size = size;
        self
    }

    /// Sets how long the background advancer sleeps between cycles.
    pub fn epoch_processing_interval(mut self, interval: Duration) -> Self {
        self.epoch_processing_interval = interval;
        self
    }

    /// Sets the number of sharded registration queues for deferred
    /// actions, rounded up to a power of two. Zero selects the detected
    /// parallelism of the host.
    pub fn num_action_queues(mut self, count: usize) -> Self {
        self.num_action_queues = count;
        self
    }
}
