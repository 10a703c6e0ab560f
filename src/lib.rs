#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Larder is an embedded, in-process key/value store built around three
//! ideas:
//!
//! - **Lock-free reads.** Every table is a chained hash map whose bucket
//!   entries carry one tag byte per record slot, so a lookup skips most
//!   slots without touching the records themselves. Readers never take a
//!   lock; writers only contend with other writers of the same bucket
//!   stripe.
//! - **Epoch-based reclamation.** Removed and overwritten records are not
//!   freed in place. They are handed to an epoch manager which defers the
//!   deallocation until every reader that could still observe them has
//!   finished. A background thread advances the epoch and runs the
//!   deferred work.
//! - **An optional cache layer.** A table may be configured with a byte
//!   budget and a TTL, in which case each record carries a small metadata
//!   prefix (creation time plus a CLOCK access bit) and inserts evict
//!   expired or cold records to stay inside the budget.
//!
//! All operations flow through a [`Context`], a scoped handle that pins
//! the current epoch for as long as it lives. Values returned by lookups
//! and iterators borrow from the context, so the borrow checker enforces
//! that no reference outlives the pin that keeps it alive.
//!
//! # Example
//!
//! ```
//! use larder::{EpochManagerConfig, Store, TableConfig};
//!
//! let mut store = Store::new(EpochManagerConfig::default());
//! store.add_table(TableConfig::new("books", 1024)).unwrap();
//!
//! let ctx = store.context();
//! let books = ctx.table("books").unwrap();
//!
//! books.add(b"dune", b"herbert").unwrap();
//! assert_eq!(books.get(b"dune"), Some(&b"herbert"[..]));
//! assert!(books.remove(b"dune"));
//! assert_eq!(books.get(b"dune"), None);
//! ```

mod common;
mod config;
mod epoch;
mod error;
mod perf;
mod record;
mod service;
mod table;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{CacheConfig, EpochManagerConfig, TableConfig};
pub use error::{Error, Result};
pub use perf::{CounterKind, PerfCounters, StoreCounter, StorePerfData, TableCounter, TablePerfData};
pub use service::{Context, Store, TableIter, TableRef};
