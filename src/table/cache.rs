//! The cache layer: per-record TTL metadata and CLOCK eviction on top of
//! the plain read/write table.
//!
//! Every cached record carries a 4-byte metadata prefix between the key
//! and the value. On little-endian layout:
//!
//! - bits 0..=30 hold the record's creation time in whole seconds,
//! - bit 31 (the top bit of the last byte) is the CLOCK access bit, set
//!   on every hit and cleared by the eviction cursor.
//!
//! The prefix lives inside published record buffers that concurrent
//! readers may be scanning, so all accesses go through per-byte atomic
//! views. Only the byte holding the access bit is ever written in place.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::common::time::Clock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::perf::TableCounter;
use crate::table::iter::Iter;
use crate::table::raw::{Entry, RawTable, SLOTS_PER_ENTRY};
use crate::table::read_write::ReadWriteTable;

/// Size of the metadata prefix in bytes.
pub(crate) const META_SIZE: usize = 4;

const EPOCH_TIME_MASK: u32 = 0x7FFF_FFFF;
const ACCESS_BIT_BYTE: usize = 3;
const ACCESS_BIT_MASK: u8 = 1 << 7;

/// A view over the 4 metadata bytes at the start of a stored value.
///
/// Works at any alignment: the bytes are read individually through
/// `AtomicU8`, and only the access-bit byte is ever stored to.
pub(crate) struct Metadata {
    ptr: *const u8,
}

impl Metadata {
    /// `value` must be the stored value slice of a cache record, whose
    /// first [`META_SIZE`] bytes are the metadata prefix.
    pub(crate) fn new(value: &[u8]) -> Self {
        debug_assert!(value.len() >= META_SIZE);
        Self {
            ptr: value.as_ptr(),
        }
    }

    /// Encodes an initial prefix: the creation time with the access bit
    /// clear.
    pub(crate) fn encode(now_seconds: u64) -> [u8; META_SIZE] {
        ((now_seconds as u32) & EPOCH_TIME_MASK).to_le_bytes()
    }

    fn byte(&self, index: usize) -> &AtomicU8 {
        // The record buffer is a live allocation and AtomicU8 is layout
        // compatible with u8, so the cast view is sound.
        unsafe { &*(self.ptr.add(index) as *const AtomicU8) }
    }

    pub(crate) fn epoch_seconds(&self) -> u64 {
        let mut raw = [0u8; META_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = self.byte(i).load(Ordering::Relaxed);
        }
        (u32::from_le_bytes(raw) & EPOCH_TIME_MASK) as u64
    }

    pub(crate) fn is_expired(&self, now_seconds: u64, ttl_seconds: u64) -> bool {
        now_seconds.saturating_sub(self.epoch_seconds()) > ttl_seconds
    }

    pub(crate) fn is_accessed(&self) -> bool {
        self.byte(ACCESS_BIT_BYTE).load(Ordering::Relaxed) & ACCESS_BIT_MASK != 0
    }

    /// Sets or clears the access bit and returns its previous state.
    /// The store is skipped when the bit already has the wanted value so
    /// hot read paths do not keep dirtying the line.
    pub(crate) fn update_access(&self, set: bool) -> bool {
        let was_accessed = self.is_accessed();
        if set != was_accessed {
            if set {
                self.byte(ACCESS_BIT_BYTE).fetch_or(ACCESS_BIT_MASK, Ordering::Relaxed);
            } else {
                self.byte(ACCESS_BIT_BYTE).fetch_and(!ACCESS_BIT_MASK, Ordering::Relaxed);
            }
        }
        was_accessed
    }
}

/// A table with a byte budget and per-record TTL.
///
/// Reads go through the plain table and then filter on the metadata;
/// inserts first make room by sweeping expired and cold records with a
/// CLOCK cursor.
pub(crate) struct CacheTable {
    inner: ReadWriteTable,
    max_bytes: u64,
    ttl_seconds: u64,
    force_time_based_eviction: bool,
    /// Persistent CLOCK cursor. Its mutex doubles as the eviction lock,
    /// which serializes evictors without ever blocking readers or
    /// non-evicting writers.
    evict_cursor: Mutex<u64>,
    clock: Clock,
}

impl CacheTable {
    pub(crate) fn new(inner: ReadWriteTable, config: &CacheConfig, clock: Clock) -> Self {
        debug_assert_eq!(inner.raw().codec().meta_size(), META_SIZE);
        Self {
            inner,
            max_bytes: config.max_bytes,
            ttl_seconds: config.ttl.as_secs(),
            force_time_based_eviction: config.force_time_based_eviction,
            evict_cursor: Mutex::new(0),
            clock,
        }
    }

    pub(crate) fn raw(&self) -> &RawTable {
        self.inner.raw()
    }

    /// Looks up `key`, treating expired records as misses. A hit marks
    /// the record as recently used and returns the value without its
    /// metadata prefix.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let result = self.get_unexpired(key);
        self.raw().perf().increment(if result.is_some() {
            TableCounter::CacheHitCount
        } else {
            TableCounter::CacheMissCount
        });
        result
    }

    fn get_unexpired(&self, key: &[u8]) -> Option<&[u8]> {
        let value = self.inner.get(key)?;
        debug_assert!(value.len() >= META_SIZE);

        let metadata = Metadata::new(value);
        if metadata.is_expired(self.clock.now_seconds(), self.ttl_seconds) {
            return None;
        }
        metadata.update_access(true);
        Some(&value[META_SIZE..])
    }

    /// Inserts or overwrites `key`, evicting first so the budget holds.
    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.force_time_based_eviction {
            self.evict_expired_in_bucket(key);
        }

        self.evict((key.len() + value.len() + META_SIZE) as u64);

        let meta = Metadata::encode(self.clock.now_seconds());
        self.inner.add_with_meta(key, &meta, value)
    }

    pub(crate) fn remove(&self, key: &[u8]) -> bool {
        self.inner.remove(key)
    }

    /// Iterates the unexpired records, with metadata stripped. Expiry is
    /// judged against the clock at the time the iterator was created.
    pub(crate) fn iter(&self) -> CacheIter<'_> {
        CacheIter {
            inner: self.inner.iter(),
            now_seconds: self.clock.now_seconds(),
            ttl_seconds: self.ttl_seconds,
        }
    }

    /// Drops every expired record in the bucket `key` maps to. Bounding
    /// the sweep to one bucket keeps the cost of an insert predictable.
    fn evict_expired_in_bucket(&self, key: &[u8]) {
        let raw = self.inner.raw();
        let (bucket_index, _) = raw.bucket_and_tag(key);
        let now = self.clock.now_seconds();

        let _guard = raw.mutex_for(bucket_index).write();

        let mut current: *const Entry = raw.bucket(bucket_index);
        while !current.is_null() {
            let entry = unsafe { &*current };
            for slot in 0..SLOTS_PER_ENTRY {
                let data = entry.slot(slot).load(Ordering::Relaxed);
                if !data.is_null() {
                    let record = unsafe { raw.codec().decode(data) };
                    if Metadata::new(record.value).is_expired(now, self.ttl_seconds) {
                        self.inner.remove_in_entry(entry, slot);
                        raw.perf().increment(TableCounter::EvictedRecordsCount);
                    }
                }
            }
            current = entry.next().load(Ordering::Relaxed);
        }
    }

    /// CLOCK eviction. Walks buckets from the persistent cursor, dropping
    /// records that are expired or not recently used and giving accessed
    /// records a second chance, until the deficit is covered.
    fn evict(&self, required_bytes: u64) {
        if self.bytes_to_free(required_bytes) == 0 {
            return;
        }

        let mut cursor = self.evict_cursor.lock();

        // Another evictor may have freed enough while we waited.
        let mut needed = self.bytes_to_free(required_bytes);
        if needed == 0 {
            return;
        }

        let raw = self.inner.raw();
        let codec = *raw.codec();
        let now = self.clock.now_seconds();
        let num_buckets = raw.num_buckets() as u64;

        // Two full passes bound the sweep: the first pass may only clear
        // access bits, the second is then free to evict.
        let mut iterations_remaining = num_buckets * 2;

        while needed > 0 && iterations_remaining > 0 {
            iterations_remaining -= 1;
            let bucket_index = (*cursor % num_buckets) as usize;
            *cursor = cursor.wrapping_add(1);

            let _guard = raw.mutex_for(bucket_index).write();

            let mut current: *const Entry = raw.bucket(bucket_index);
            while !current.is_null() {
                let entry = unsafe { &*current };
                for slot in 0..SLOTS_PER_ENTRY {
                    let data = entry.slot(slot).load(Ordering::Relaxed);
                    if data.is_null() {
                        continue;
                    }
                    let record = unsafe { codec.decode(data) };
                    let metadata = Metadata::new(record.value);

                    if metadata.is_expired(now, self.ttl_seconds) || !metadata.update_access(false)
                    {
                        let freed =
                            (record.key.len() + record.value.len() - META_SIZE) as u64;
                        needed = needed.saturating_sub(freed);
                        self.inner.remove_in_entry(entry, slot);
                        raw.perf().increment(TableCounter::EvictedRecordsCount);
                    }
                }
                current = entry.next().load(Ordering::Relaxed);
            }
        }
    }

    /// Translates the byte budget into a deficit for this insert. A total
    /// above the budget is possible when concurrent inserts consume bytes
    /// another evictor just freed, so the overshoot is added back in.
    fn bytes_to_free(&self, required_bytes: u64) -> u64 {
        let perf = self.raw().perf();
        let total = (perf.get(TableCounter::TotalKeySize)
            + perf.get(TableCounter::TotalValueSize)
            + perf.get(TableCounter::TotalIndexSize)) as u64;

        if required_bytes < self.max_bytes && total + required_bytes <= self.max_bytes {
            return 0;
        }
        if total > self.max_bytes {
            total - self.max_bytes + required_bytes
        } else {
            required_bytes
        }
    }
}

/// Iterator over a cache table's unexpired records.
pub(crate) struct CacheIter<'a> {
    inner: Iter<'a>,
    now_seconds: u64,
    ttl_seconds: u64,
}

impl<'a> Iterator for CacheIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        for (key, value) in self.inner.by_ref() {
            if !Metadata::new(value).is_expired(self.now_seconds, self.ttl_seconds) {
                return Some((key, &value[META_SIZE..]));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::Mock;
    use crate::epoch::ActionRegistry;
    use crate::perf::TableCounter::*;
    use crate::table::raw::Setting;
    use crate::test_util::MockRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    fn new_cache(
        num_buckets: u32,
        max_bytes: u64,
        ttl: Duration,
        force_time_based_eviction: bool,
    ) -> (CacheTable, Arc<Mock>) {
        let setting = Setting {
            num_buckets,
            num_buckets_per_mutex: 1,
            fixed_key_size: 0,
            fixed_value_size: 0,
        };
        let inner = ReadWriteTable::new(
            RawTable::new(setting, META_SIZE as u16),
            Arc::new(MockRegistry::new()) as Arc<dyn ActionRegistry>,
        );
        let (clock, mock) = Clock::mock();
        let config =
            CacheConfig::new(max_bytes, ttl).force_time_based_eviction(force_time_based_eviction);
        (CacheTable::new(inner, &config, clock), mock)
    }

    #[test]
    fn metadata_bit_layout() {
        // Walk the prefix across every alignment within a buffer.
        for offset in 0..8usize {
            let mut buffer = vec![0u8; 16];
            let created = 0x7FAB_CDEFu64;
            buffer[offset..offset + META_SIZE].copy_from_slice(&Metadata::encode(created));

            let metadata = Metadata::new(&buffer[offset..]);
            assert_eq!(metadata.epoch_seconds(), created);

            let now = created + 10;
            assert!(!metadata.is_expired(now, 15));
            assert!(!metadata.is_expired(now, 10));
            assert!(metadata.is_expired(now, 5));

            assert!(!metadata.is_accessed());
            assert!(!metadata.update_access(true));
            assert!(metadata.is_accessed());
            // The stored time is untouched by the access bit.
            assert_eq!(metadata.epoch_seconds(), created);
            assert!(metadata.update_access(false));
            assert!(!metadata.is_accessed());
        }
    }

    #[test]
    fn records_expire_by_ttl() {
        let (cache, mock) = new_cache(100, u64::MAX, Duration::from_secs(20), false);
        let pairs: Vec<(String, String)> = (1..=5)
            .map(|i| (format!("key{i}"), format!("value{i}")))
            .collect();

        // Creation times land at 10, 20, 30, 40 and 50 seconds.
        for (key, value) in &pairs {
            mock.increment(10);
            cache.add(key.as_bytes(), value.as_bytes()).unwrap();
            assert_eq!(cache.get(key.as_bytes()), Some(value.as_bytes()));
        }
        let perf = cache.raw().perf();
        assert_eq!(perf.get(CacheHitCount), 5);

        // At 50 seconds with a 20-second TTL the first two are gone.
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i < 2 {
                assert_eq!(cache.get(key.as_bytes()), None);
            } else {
                assert_eq!(cache.get(key.as_bytes()), Some(value.as_bytes()));
            }
        }
        assert_eq!(perf.get(CacheHitCount), 8);
        assert_eq!(perf.get(CacheMissCount), 2);

        mock.increment(100);
        for (key, _) in &pairs {
            assert_eq!(cache.get(key.as_bytes()), None);
        }
        assert_eq!(perf.get(CacheHitCount), 8);
        assert_eq!(perf.get(CacheMissCount), 7);
    }

    #[test]
    fn ttl_boundary_is_inclusive() {
        let (cache, mock) = new_cache(16, u64::MAX, Duration::from_secs(20), false);
        mock.set(100);
        cache.add(b"key", b"value").unwrap();

        mock.set(120);
        assert_eq!(cache.get(b"key"), Some(&b"value"[..]));
        mock.set(121);
        assert_eq!(cache.get(b"key"), None);
    }

    #[test]
    fn iterator_skips_expired_records() {
        let (cache, mock) = new_cache(100, u64::MAX, Duration::from_secs(20), false);
        let keys: Vec<String> = (1..=5).map(|i| format!("key{i}")).collect();
        let values: Vec<String> = (1..=5).map(|i| format!("val{i}")).collect();

        for (key, value) in keys.iter().zip(&values) {
            mock.increment(3);
            cache.add(key.as_bytes(), value.as_bytes()).unwrap();
        }

        let all: Vec<_> = cache.iter().collect();
        assert_eq!(all.len(), 5);
        for (key, value) in &all {
            assert!(keys.iter().any(|k| k.as_bytes() == *key));
            assert!(values.iter().any(|v| v.as_bytes() == *value));
        }

        // At 30 seconds the records created at 3, 6 and 9 have expired.
        mock.increment(15);
        let survivors: Vec<_> = cache.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(survivors.len(), 2);
        for key in survivors {
            assert!(key == b"key4" || key == b"key5");
        }

        mock.increment(10);
        assert_eq!(cache.iter().count(), 0);
    }

    #[test]
    fn forced_time_based_eviction_sweeps_the_bucket() {
        // One bucket so every record is swept by any insert.
        let (cache, mock) = new_cache(1, u64::MAX, Duration::from_secs(10), true);
        let pairs: Vec<(String, String)> = (1..=5)
            .map(|i| (format!("key{i}"), format!("value{i}")))
            .collect();

        for (key, value) in &pairs {
            cache.add(key.as_bytes(), value.as_bytes()).unwrap();
            assert_eq!(cache.get(key.as_bytes()), Some(value.as_bytes()));
        }
        let perf = cache.raw().perf();
        assert_eq!(perf.get(RecordsCount), 5);
        assert_eq!(perf.get(EvictedRecordsCount), 0);

        mock.increment(20);
        for (key, _) in &pairs {
            assert_eq!(cache.get(key.as_bytes()), None);
        }
        // Expired records linger until a write sweeps them out.
        assert_eq!(perf.get(RecordsCount), 5);

        let (key, value) = &pairs[0];
        cache.add(key.as_bytes(), value.as_bytes()).unwrap();
        assert_eq!(perf.get(RecordsCount), 1);
        assert_eq!(perf.get(EvictedRecordsCount), 5);
    }

    #[test]
    fn oversized_insert_evicts_everything_else() {
        let setting = Setting {
            num_buckets: 100,
            num_buckets_per_mutex: 1,
            fixed_key_size: 0,
            fixed_value_size: 0,
        };
        let initial_index_size =
            RawTable::new(setting, META_SIZE as u16).perf().get(TotalIndexSize) as u64;

        let (cache, _mock) = new_cache(
            100,
            initial_index_size + 500,
            Duration::from_secs(5),
            false,
        );
        let perf = cache.raw().perf();

        let pairs: Vec<(String, String)> = (1..=5)
            .map(|i| (format!("key{i}"), format!("value{i}")))
            .collect();
        for (key, value) in &pairs {
            cache.add(key.as_bytes(), value.as_bytes()).unwrap();
        }
        assert_eq!(perf.get(RecordsCount), 5);
        assert_eq!(perf.get(EvictedRecordsCount), 0);

        // Mark everything as recently used; under real pressure even
        // accessed records must go.
        for (key, value) in &pairs {
            assert_eq!(cache.get(key.as_bytes()), Some(value.as_bytes()));
        }

        let big_key = vec![b'k'; 10];
        let big_value = vec![b'v'; 500];
        cache.add(&big_key, &big_value).unwrap();

        for (key, _) in &pairs {
            assert_eq!(cache.get(key.as_bytes()), None);
        }
        assert_eq!(cache.get(&big_key), Some(&big_value[..]));
        assert_eq!(perf.get(RecordsCount), 1);
        assert_eq!(perf.get(EvictedRecordsCount), 5);
    }

    #[test]
    fn accessed_records_get_a_second_chance() {
        // One bucket keeps the sweep order deterministic.
        let setting = Setting {
            num_buckets: 1,
            num_buckets_per_mutex: 1,
            fixed_key_size: 0,
            fixed_value_size: 0,
        };
        let initial_index_size =
            RawTable::new(setting, META_SIZE as u16).perf().get(TotalIndexSize) as u64;

        // Three records of 110 footprint bytes each (4 key + 100 value +
        // 6 overhead) fit; the budget leaves no room for a fourth.
        let (cache, _mock) = new_cache(
            1,
            initial_index_size + 340,
            Duration::from_secs(1000),
            false,
        );
        let perf = cache.raw().perf();

        let value = vec![b'v'; 100];
        for key in [&b"key1"[..], &b"key2"[..], &b"key3"[..]] {
            cache.add(key, &value).unwrap();
        }
        assert_eq!(perf.get(RecordsCount), 3);

        // Only key1 is recently used when the next insert must evict.
        assert_eq!(cache.get(b"key1"), Some(&value[..]));

        cache.add(b"key4", &value).unwrap();

        assert_eq!(cache.get(b"key1"), Some(&value[..]));
        assert_eq!(cache.get(b"key4"), Some(&value[..]));
        assert_eq!(cache.get(b"key2"), None);
        assert_eq!(cache.get(b"key3"), None);
        assert!(perf.get(EvictedRecordsCount) >= 1);
    }

    #[test]
    fn remove_delegates_to_the_plain_table() {
        let (cache, _mock) = new_cache(16, u64::MAX, Duration::from_secs(60), false);
        cache.add(b"key", b"value").unwrap();
        assert!(cache.remove(b"key"));
        assert!(!cache.remove(b"key"));
        assert_eq!(cache.get(b"key"), None);
    }
}
