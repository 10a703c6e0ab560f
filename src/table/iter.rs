//! Bucket-order iteration over a table's records.

use std::ptr;
use std::sync::atomic::Ordering;

use crate::table::raw::{Entry, RawTable, SLOTS_PER_ENTRY};

/// Iterates every record of a table in bucket order, slot by slot along
/// each chain.
///
/// The iterator borrows the table through the pinning context, so the
/// record slices it yields stay valid for the context's lifetime.
/// Iteration concurrent with writers is allowed but unordered: a record
/// published or removed mid-walk may or may not be observed.
pub(crate) struct Iter<'a> {
    raw: &'a RawTable,
    next_bucket: usize,
    entry: *const Entry,
    next_slot: usize,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(raw: &'a RawTable) -> Self {
        Self {
            raw,
            next_bucket: 0,
            entry: ptr::null(),
            next_slot: 0,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let codec = self.raw.codec();
        loop {
            if self.entry.is_null() {
                if self.next_bucket >= self.raw.num_buckets() {
                    return None;
                }
                self.entry = self.raw.bucket(self.next_bucket);
                self.next_bucket += 1;
                self.next_slot = 0;
            }

            let entry = unsafe { &*self.entry };
            while self.next_slot < SLOTS_PER_ENTRY {
                let slot = self.next_slot;
                self.next_slot += 1;
                let data = entry.slot(slot).load(Ordering::Acquire);
                if !data.is_null() {
                    let record = unsafe { codec.decode(data) };
                    return Some((record.key, record.value));
                }
            }

            self.entry = entry.next().load(Ordering::Acquire);
            self.next_slot = 0;
        }
    }
}
