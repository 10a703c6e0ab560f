//! The store: a registry of named tables, the epoch manager that guards
//! them, and the scoped contexts through which callers operate.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::common::time::Clock;
use crate::config::{EpochManagerConfig, TableConfig};
use crate::epoch::manager::EpochManager;
use crate::epoch::ActionRegistry;
use crate::error::{Error, Result};
use crate::perf::{StorePerfData, TablePerfData};
use crate::table::cache::{CacheIter, CacheTable, META_SIZE};
use crate::table::iter::Iter;
use crate::table::raw::{RawTable, Setting};
use crate::table::read_write::ReadWriteTable;
use crate::table::snapshot;

enum Table {
    Plain(ReadWriteTable),
    Cache(CacheTable),
}

impl Table {
    fn perf(&self) -> &TablePerfData {
        match self {
            Table::Plain(table) => table.raw().perf(),
            Table::Cache(cache) => cache.raw().perf(),
        }
    }
}

#[derive(Default)]
struct TableManager {
    tables: Vec<Table>,
    index_by_name: HashMap<String, usize>,
}

/// An embedded key/value store holding any number of named tables.
///
/// Tables are registered up front with [`add_table`](Self::add_table);
/// all reads and writes then go through a [`Context`]. Registration
/// takes `&mut self`, so the borrow checker guarantees no context is
/// live while the table set changes.
///
/// Dropping the store tears the tables down first and then the epoch
/// manager, which stops the advancer thread and drains every deferred
/// action.
pub struct Store {
    // Field order is load-bearing: tables must drop before the epoch
    // manager that frees their retired records.
    tables: TableManager,
    perf: Arc<StorePerfData>,
    epoch: Arc<EpochManager>,
}

impl Store {
    pub fn new(config: EpochManagerConfig) -> Self {
        let perf = Arc::new(StorePerfData::default());
        let epoch = Arc::new(EpochManager::new(&config, Arc::clone(&perf)));
        Self {
            tables: TableManager::default(),
            perf,
            epoch,
        }
    }

    /// Registers a table and returns its handle, usable with
    /// [`Context::table_at`] as a cheaper alternative to name lookups.
    pub fn add_table(&mut self, config: TableConfig) -> Result<usize> {
        let folded_name = config.name.to_ascii_lowercase();
        if self.tables.index_by_name.contains_key(&folded_name) {
            return Err(Error::DuplicateTable(config.name));
        }

        let registry = Arc::clone(&self.epoch) as Arc<dyn ActionRegistry>;
        let table = match (config.cache, config.restore) {
            (Some(_), Some(_)) => {
                return Err(Error::Unsupported(
                    "restoring a cache table from a snapshot".into(),
                ))
            }
            (None, Some(mut reader)) => {
                let raw = snapshot::restore(&mut *reader)?;
                Table::Plain(ReadWriteTable::new(raw, registry))
            }
            (cache, None) => {
                assert!(config.num_buckets > 0, "a table needs at least one bucket");
                let setting = Setting {
                    num_buckets: config.num_buckets,
                    num_buckets_per_mutex: config.num_buckets_per_mutex.max(1),
                    fixed_key_size: config.fixed_key_size,
                    fixed_value_size: config.fixed_value_size,
                };
                match cache {
                    Some(cache_config) => {
                        let raw = RawTable::new(setting, META_SIZE as u16);
                        let inner = ReadWriteTable::new(raw, registry);
                        Table::Cache(CacheTable::new(inner, &cache_config, Clock::default()))
                    }
                    None => Table::Plain(ReadWriteTable::new(RawTable::new(setting, 0), registry)),
                }
            }
        };

        let index = self.tables.tables.len();
        self.tables.tables.push(table);
        self.tables.index_by_name.insert(folded_name, index);
        Ok(index)
    }

    /// Opens a context. The context pins the current epoch, which keeps
    /// every record it can observe alive until the context drops.
    pub fn context(&self) -> Context<'_> {
        Context {
            store: self,
            epoch: self.epoch.pin(),
        }
    }

    /// Store-wide counters maintained by the epoch manager.
    pub fn perf_data(&self) -> &StorePerfData {
        &self.perf
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(EpochManagerConfig::default())
    }
}

/// A scoped session over a [`Store`].
///
/// Every value and iterator obtained through a context borrows from it,
/// so they cannot outlive the epoch pin that makes them safe to read.
pub struct Context<'a> {
    store: &'a Store,
    epoch: u64,
}

impl<'a> Context<'a> {
    /// Looks a table up by its case-insensitive name.
    pub fn table(&self, name: &str) -> Option<TableRef<'_>> {
        let index = *self
            .store
            .tables
            .index_by_name
            .get(&name.to_ascii_lowercase())?;
        self.table_at(index)
    }

    /// Looks a table up by the handle [`Store::add_table`] returned.
    pub fn table_at(&self, index: usize) -> Option<TableRef<'_>> {
        self.store
            .tables
            .tables
            .get(index)
            .map(|table| TableRef { table })
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.epoch.unpin(self.epoch) {
            // Refcount underflow means the queue state is corrupted.
            // Nothing sane can be done from a destructor.
            log::error!("context released an epoch it did not hold: {err}");
        }
    }
}

/// A handle to one table, valid for the lifetime of its [`Context`].
#[derive(Clone, Copy)]
pub struct TableRef<'a> {
    table: &'a Table,
}

impl<'a> TableRef<'a> {
    /// Returns the value stored under `key`.
    ///
    /// Lock free. On a cache table an expired record is a miss, and a
    /// hit marks the record as recently used.
    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        match self.table {
            Table::Plain(table) => table.get(key),
            Table::Cache(cache) => cache.get(key),
        }
    }

    /// Inserts `key` or overwrites its value. On a cache table this may
    /// first evict expired or cold records to fit the byte budget.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.table {
            Table::Plain(table) => table.add(key, value),
            Table::Cache(cache) => cache.add(key, value),
        }
    }

    /// Removes `key`, returning whether a record was present.
    pub fn remove(&self, key: &[u8]) -> bool {
        match self.table {
            Table::Plain(table) => table.remove(key),
            Table::Cache(cache) => cache.remove(key),
        }
    }

    /// Iterates the table in bucket order. Iteration concurrent with
    /// writers is allowed but makes no ordering promise. On a cache
    /// table, records expired at iterator creation are skipped.
    pub fn iter(&self) -> TableIter<'a> {
        TableIter {
            inner: match self.table {
                Table::Plain(table) => IterKind::Plain(table.iter()),
                Table::Cache(cache) => IterKind::Cache(cache.iter()),
            },
        }
    }

    /// Writes a snapshot of the table to `writer`. Cache tables cannot
    /// be dumped.
    pub fn dump<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self.table {
            Table::Plain(table) => snapshot::dump(table, writer),
            Table::Cache(_) => Err(Error::Unsupported(
                "dumping a cache table to a snapshot".into(),
            )),
        }
    }

    /// This table's counters.
    pub fn perf_data(&self) -> &'a TablePerfData {
        self.table.perf()
    }
}

/// Iterator over a table's records, yielding `(key, value)` slices that
/// borrow from the pinning context.
pub struct TableIter<'a> {
    inner: IterKind<'a>,
}

enum IterKind<'a> {
    Plain(Iter<'a>),
    Cache(CacheIter<'a>),
}

impl<'a> Iterator for TableIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IterKind::Plain(iter) => iter.next(),
            IterKind::Cache(iter) => iter.next(),
        }
    }
}
