//! The plain read/write table: lock-free lookups, stripe-locked writes.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::epoch::ActionRegistry;
use crate::error::Result;
use crate::perf::TableCounter;
use crate::record::RecordBuf;
use crate::table::iter::Iter;
use crate::table::raw::{Entry, RawTable, SLOTS_PER_ENTRY};

/// A hash table of opaque byte records with lock-free point lookups.
///
/// Writers serialize per bucket stripe; a removed or overwritten record
/// is handed to the action registry and freed only once every epoch that
/// could still observe it has drained.
pub(crate) struct ReadWriteTable {
    raw: RawTable,
    registry: Arc<dyn ActionRegistry>,
}

/// Write-path bookkeeping mirrored into the perf counters after the
/// stripe lock is released.
#[derive(Default)]
struct AddStat {
    chain_index: u32,
    new_entry: bool,
}

impl ReadWriteTable {
    pub(crate) fn new(raw: RawTable, registry: Arc<dyn ActionRegistry>) -> Self {
        Self { raw, registry }
    }

    pub(crate) fn raw(&self) -> &RawTable {
        &self.raw
    }

    pub(crate) fn into_raw(self) -> RawTable {
        self.raw
    }

    /// Looks up `key` and returns the stored value bytes, including the
    /// metadata prefix when the table carries one.
    ///
    /// The walk takes no lock. Slot and chain pointers are acquire-loaded
    /// so everything the publishing writer released (the record contents,
    /// a fresh chain entry) is visible. The returned slice stays valid
    /// for the caller's borrow because retired buffers outlive every
    /// epoch pinned before the retirement.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let codec = self.raw.codec();
        let (bucket_index, tag) = self.raw.bucket_and_tag(key);

        let mut current: *const Entry = self.raw.bucket(bucket_index);
        while !current.is_null() {
            let entry = unsafe { &*current };
            for slot in 0..SLOTS_PER_ENTRY {
                if entry.tag(slot) == tag {
                    let data = entry.slot(slot).load(Ordering::Acquire);
                    if !data.is_null() {
                        let record = unsafe { codec.decode(data) };
                        if record.key == key {
                            return Some(record.value);
                        }
                    }
                }
            }
            current = entry.next().load(Ordering::Acquire);
        }
        None
    }

    /// Inserts or overwrites `key` with a value carrying no metadata.
    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_with_meta(key, &[], value)
    }

    /// Inserts or overwrites `key`, placing `meta` between the key and
    /// value bytes. `meta` must match the codec's configured prefix size.
    pub(crate) fn add_with_meta(&self, key: &[u8], meta: &[u8], value: &[u8]) -> Result<()> {
        let codec = *self.raw.codec();
        let mut buf = RecordBuf::alloc(codec.buffer_size(key.len(), value.len()));
        codec.encode(key, meta, value, buf.as_mut_slice())?;
        self.add_record(buf);
        Ok(())
    }

    /// Publishes an already encoded record.
    pub(crate) fn add_record(&self, buf: RecordBuf) {
        let codec = *self.raw.codec();
        let meta_size = codec.meta_size();

        let record = unsafe { codec.decode(buf.as_ptr()) };
        let key_len = record.key.len();
        let user_value_len = record.value.len() - meta_size;
        let (bucket_index, tag) = self.raw.bucket_and_tag(record.key);
        let key = record.key;

        let mut stat = AddStat::default();
        let mut target: Option<(&Entry, usize)> = None;
        let mut old_user_value_len: Option<usize> = None;

        let guard = self.raw.mutex_for(bucket_index).write();

        // Walk the whole chain: remember the first free slot, but keep
        // looking for an existing record with this key. Loads under the
        // stripe lock can be relaxed since only writers store here.
        let mut current: *const Entry = self.raw.bucket(bucket_index);
        while !current.is_null() {
            let entry = unsafe { &*current };
            stat.chain_index += 1;

            let mut found_key = false;
            for slot in 0..SLOTS_PER_ENTRY {
                let data = entry.slot(slot).load(Ordering::Relaxed);
                if data.is_null() {
                    if target.is_none() {
                        target = Some((entry, slot));
                    }
                } else if entry.tag(slot) == tag {
                    let existing = unsafe { codec.decode(data) };
                    if existing.key == key {
                        target = Some((entry, slot));
                        old_user_value_len = Some(existing.value.len() - meta_size);
                        found_key = true;
                        break;
                    }
                }
            }
            if found_key {
                break;
            }

            // At the tail with nowhere to put the record: extend the
            // chain. The stripe lock is held, so a plain allocation plus
            // a release store suffices.
            if target.is_none() && entry.next().load(Ordering::Relaxed).is_null() {
                let fresh = Box::into_raw(Box::new(Entry::default()));
                entry.next().store(fresh, Ordering::Release);
                stat.new_entry = true;
            }

            current = entry.next().load(Ordering::Relaxed);
        }

        let (entry, slot) = match target {
            Some(found) => found,
            // The chain walk above either finds a slot or grows the tail.
            None => unreachable!("bucket chain walk did not yield a slot"),
        };

        let old = entry.slot(slot).load(Ordering::Relaxed);
        entry.slot(slot).store(buf.into_raw(), Ordering::Release);
        entry.set_tag(slot, tag);

        drop(guard);

        let perf = self.raw.perf();
        if let Some(old_len) = old_user_value_len {
            // Same key overwritten: only the value footprint moved.
            perf.add(
                TableCounter::TotalValueSize,
                user_value_len as i64 - old_len as i64,
            );
        } else {
            perf.add(TableCounter::TotalKeySize, key_len as i64);
            perf.add(TableCounter::TotalValueSize, user_value_len as i64);
            perf.add(
                TableCounter::TotalIndexSize,
                codec.record_overhead() as i64
                    + if stat.new_entry {
                        std::mem::size_of::<Entry>() as i64
                    } else {
                        0
                    },
            );
            perf.min(TableCounter::MinKeySize, key_len as i64);
            perf.max(TableCounter::MaxKeySize, key_len as i64);
            perf.increment(TableCounter::RecordsCount);

            if stat.new_entry {
                perf.increment(TableCounter::ChainingEntriesCount);
                if stat.chain_index > 1 {
                    perf.max(TableCounter::MaxBucketChainLength, stat.chain_index as i64);
                }
            }
        }
        perf.min(TableCounter::MinValueSize, user_value_len as i64);
        perf.max(TableCounter::MaxValueSize, user_value_len as i64);

        self.retire(old);
    }

    /// Removes `key`, returning whether a record was present. The min and
    /// max size counters are monotonic and deliberately left untouched.
    pub(crate) fn remove(&self, key: &[u8]) -> bool {
        let codec = self.raw.codec();
        let (bucket_index, tag) = self.raw.bucket_and_tag(key);

        let _guard = self.raw.mutex_for(bucket_index).write();

        let mut current: *const Entry = self.raw.bucket(bucket_index);
        while !current.is_null() {
            let entry = unsafe { &*current };
            for slot in 0..SLOTS_PER_ENTRY {
                if entry.tag(slot) == tag {
                    let data = entry.slot(slot).load(Ordering::Relaxed);
                    if !data.is_null() {
                        let record = unsafe { codec.decode(data) };
                        if record.key == key {
                            self.remove_in_entry(entry, slot);
                            return true;
                        }
                    }
                }
            }
            current = entry.next().load(Ordering::Relaxed);
        }
        false
    }

    /// Clears one slot and retires its record. The caller must hold the
    /// stripe lock covering the entry's bucket.
    pub(crate) fn remove_in_entry(&self, entry: &Entry, slot: usize) {
        let codec = *self.raw.codec();
        let old = entry.slot(slot).load(Ordering::Relaxed);
        debug_assert!(!old.is_null());
        if old.is_null() {
            return;
        }

        entry.slot(slot).store(ptr::null_mut(), Ordering::Release);
        entry.set_tag(slot, 0);

        let record = unsafe { codec.decode(old) };
        let perf = self.raw.perf();
        perf.decrement(TableCounter::RecordsCount);
        perf.sub(TableCounter::TotalKeySize, record.key.len() as i64);
        perf.sub(
            TableCounter::TotalValueSize,
            (record.value.len() - codec.meta_size()) as i64,
        );
        perf.sub(TableCounter::TotalIndexSize, codec.record_overhead() as i64);

        self.retire(old);
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter::new(&self.raw)
    }

    /// Hands an unpublished record buffer to the epoch manager. The
    /// buffer is freed once the epoch frontier passes the current epoch.
    fn retire(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let codec = *self.raw.codec();
        let len = unsafe {
            let record = codec.decode(ptr);
            codec.stored_len(&record)
        };
        let buf = unsafe { RecordBuf::from_raw(ptr, len) };
        self.registry.register_action(Box::new(move || drop(buf)));
    }
}
