use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// A closed set of counter identifiers that indexes into a dense
/// [`PerfCounters`] array.
pub trait CounterKind: Copy + Eq + 'static {
    /// Every counter of the set, in index order.
    const ALL: &'static [Self];

    /// The dense index of this counter.
    fn index(self) -> usize;

    /// A stable display name for reports.
    fn name(self) -> &'static str;
}

/// Per-table counters.
///
/// The `Min*`/`Max*` counters are monotonic: removing the record that set
/// a bound does not restore the previous bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableCounter {
    RecordsCount,
    BucketsCount,
    TotalKeySize,
    TotalValueSize,
    TotalIndexSize,
    ChainingEntriesCount,
    MinKeySize,
    MaxKeySize,
    MinValueSize,
    MaxValueSize,
    MaxBucketChainLength,
    RecordsLoadedFromSnapshot,
    RecordsSavedToSnapshot,
    CacheHitCount,
    CacheMissCount,
    EvictedRecordsCount,
}

impl CounterKind for TableCounter {
    const ALL: &'static [Self] = &[
        Self::RecordsCount,
        Self::BucketsCount,
        Self::TotalKeySize,
        Self::TotalValueSize,
        Self::TotalIndexSize,
        Self::ChainingEntriesCount,
        Self::MinKeySize,
        Self::MaxKeySize,
        Self::MinValueSize,
        Self::MaxValueSize,
        Self::MaxBucketChainLength,
        Self::RecordsLoadedFromSnapshot,
        Self::RecordsSavedToSnapshot,
        Self::CacheHitCount,
        Self::CacheMissCount,
        Self::EvictedRecordsCount,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Self::RecordsCount => "RecordsCount",
            Self::BucketsCount => "BucketsCount",
            Self::TotalKeySize => "TotalKeySize",
            Self::TotalValueSize => "TotalValueSize",
            Self::TotalIndexSize => "TotalIndexSize",
            Self::ChainingEntriesCount => "ChainingEntriesCount",
            Self::MinKeySize => "MinKeySize",
            Self::MaxKeySize => "MaxKeySize",
            Self::MinValueSize => "MinValueSize",
            Self::MaxValueSize => "MaxValueSize",
            Self::MaxBucketChainLength => "MaxBucketChainLength",
            Self::RecordsLoadedFromSnapshot => "RecordsLoadedFromSnapshot",
            Self::RecordsSavedToSnapshot => "RecordsSavedToSnapshot",
            Self::CacheHitCount => "CacheHitCount",
            Self::CacheMissCount => "CacheMissCount",
            Self::EvictedRecordsCount => "EvictedRecordsCount",
        }
    }
}

/// Store-wide counters maintained by the epoch manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreCounter {
    OldestEpochInQueue,
    LatestEpochInQueue,
    PendingActionsCount,
    LastPerformedActionsCount,
}

impl CounterKind for StoreCounter {
    const ALL: &'static [Self] = &[
        Self::OldestEpochInQueue,
        Self::LatestEpochInQueue,
        Self::PendingActionsCount,
        Self::LastPerformedActionsCount,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Self::OldestEpochInQueue => "OldestEpochInQueue",
            Self::LatestEpochInQueue => "LatestEpochInQueue",
            Self::PendingActionsCount => "PendingActionsCount",
            Self::LastPerformedActionsCount => "LastPerformedActionsCount",
        }
    }
}

/// A dense array of atomic counters indexed by a [`CounterKind`] enum.
///
/// Plain updates are relaxed; ordering between counters is never needed,
/// only atomicity. The monotonic min/max updates use a CAS loop so a
/// stale bound is never written over a tighter one.
pub struct PerfCounters<C: CounterKind> {
    counters: CachePadded<Box<[AtomicI64]>>,
    _kind: PhantomData<C>,
}

impl<C: CounterKind> PerfCounters<C> {
    fn zeroed() -> Self {
        let counters = std::iter::repeat_with(|| AtomicI64::new(0))
            .take(C::ALL.len())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            counters: CachePadded::new(counters),
            _kind: PhantomData,
        }
    }

    pub fn get(&self, counter: C) -> i64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn set(&self, counter: C, value: i64) {
        self.counters[counter.index()].store(value, Ordering::Relaxed);
    }

    pub fn increment(&self, counter: C) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self, counter: C) {
        self.counters[counter.index()].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: C, value: i64) {
        if value != 0 {
            self.counters[counter.index()].fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn sub(&self, counter: C, value: i64) {
        if value != 0 {
            self.counters[counter.index()].fetch_sub(value, Ordering::Relaxed);
        }
    }

    /// Raises the counter to `value` if `value` is larger.
    pub fn max(&self, counter: C, value: i64) {
        let cell = &self.counters[counter.index()];
        let mut observed = cell.load(Ordering::Acquire);
        loop {
            if observed >= value {
                return;
            }
            match cell.compare_exchange(observed, value, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return,
                Err(newer) => observed = newer,
            }
        }
    }

    /// Lowers the counter to `value` if `value` is smaller.
    pub fn min(&self, counter: C, value: i64) {
        let cell = &self.counters[counter.index()];
        let mut observed = cell.load(Ordering::Acquire);
        loop {
            if observed <= value {
                return;
            }
            match cell.compare_exchange(observed, value, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return,
                Err(newer) => observed = newer,
            }
        }
    }

    /// Returns every counter with its display name.
    pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
        C::ALL.iter().map(|c| (c.name(), self.get(*c))).collect()
    }
}

/// Counters for one table.
pub type TablePerfData = PerfCounters<TableCounter>;

/// Counters for one store.
pub type StorePerfData = PerfCounters<StoreCounter>;

impl Default for PerfCounters<TableCounter> {
    fn default() -> Self {
        let counters = Self::zeroed();
        // Min counters shrink monotonically, so they start at the top.
        counters.set(TableCounter::MinKeySize, i64::MAX);
        counters.set(TableCounter::MinValueSize, i64::MAX);
        // The head entry embedded in every bucket counts as one link.
        counters.set(TableCounter::MaxBucketChainLength, 1);
        counters
    }
}

impl Default for PerfCounters<StoreCounter> {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_counters_start_with_monotonic_bounds() {
        let perf = TablePerfData::default();
        assert_eq!(perf.get(TableCounter::RecordsCount), 0);
        assert_eq!(perf.get(TableCounter::MinKeySize), i64::MAX);
        assert_eq!(perf.get(TableCounter::MinValueSize), i64::MAX);
        assert_eq!(perf.get(TableCounter::MaxBucketChainLength), 1);
    }

    #[test]
    fn min_max_are_monotonic() {
        let perf = TablePerfData::default();

        perf.max(TableCounter::MaxValueSize, 10);
        perf.max(TableCounter::MaxValueSize, 7);
        assert_eq!(perf.get(TableCounter::MaxValueSize), 10);

        perf.min(TableCounter::MinValueSize, 5);
        perf.min(TableCounter::MinValueSize, 9);
        assert_eq!(perf.get(TableCounter::MinValueSize), 5);
    }

    #[test]
    fn add_and_sub_accumulate() {
        let perf = StorePerfData::default();
        perf.add(StoreCounter::PendingActionsCount, 4);
        perf.sub(StoreCounter::PendingActionsCount, 1);
        perf.increment(StoreCounter::PendingActionsCount);
        perf.decrement(StoreCounter::PendingActionsCount);
        assert_eq!(perf.get(StoreCounter::PendingActionsCount), 3);
    }

    #[test]
    fn snapshot_lists_every_counter_once() {
        let perf = TablePerfData::default();
        let snapshot = perf.snapshot();
        assert_eq!(snapshot.len(), TableCounter::ALL.len());
        assert!(snapshot.iter().any(|(name, _)| *name == "RecordsCount"));
    }
}
