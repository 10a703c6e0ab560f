//! Versioned dump and restore of a plain table.
//!
//! Stream layout (all integers little-endian):
//!
//! ```text
//! u8  version (= 1)
//! u32 num_buckets
//! u32 num_buckets_per_mutex
//! u16 fixed_key_size
//! u32 fixed_value_size
//! repeat:
//!   u8 has_next          1 = a record follows, 0 = end of stream
//!   u16 key length, key bytes
//!   u32 value length, value bytes
//! ```
//!
//! Cache tables are not dumped; their metadata prefix is a property of
//! the running table, not of the data.

use std::io::{Read, Write};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::epoch::{Action, ActionRegistry};
use crate::error::{Error, Result};
use crate::perf::TableCounter;
use crate::table::raw::{RawTable, Setting};
use crate::table::read_write::ReadWriteTable;

const FORMAT_VERSION: u8 = 1;

/// Writes every record of `table` to `writer`.
///
/// Runs on the live table; records published or removed during the walk
/// may or may not be included, like any concurrent iteration.
pub(crate) fn dump<W: Write + ?Sized>(table: &ReadWriteTable, writer: &mut W) -> Result<()> {
    let raw = table.raw();
    let perf = raw.perf();
    perf.set(TableCounter::RecordsSavedToSnapshot, 0);

    writer.write_all(&[FORMAT_VERSION])?;

    let setting = raw.setting();
    writer.write_all(&setting.num_buckets.to_le_bytes())?;
    writer.write_all(&setting.num_buckets_per_mutex.to_le_bytes())?;
    writer.write_all(&setting.fixed_key_size.to_le_bytes())?;
    writer.write_all(&setting.fixed_value_size.to_le_bytes())?;

    for (key, value) in table.iter() {
        writer.write_all(&[1])?;
        writer.write_all(&(key.len() as u16).to_le_bytes())?;
        writer.write_all(key)?;
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value)?;
        perf.increment(TableCounter::RecordsSavedToSnapshot);
    }
    writer.write_all(&[0])?;

    // Publish the final counter values to whoever reads them next.
    fence(Ordering::Release);
    Ok(())
}

/// Rebuilds a table from a stream produced by [`dump`].
///
/// The caller wraps the returned [`RawTable`] with its own registry; the
/// inserts here run against a registry that frees inline, which is sound
/// because nothing can read the table while it is being rebuilt.
pub(crate) fn restore<R: Read + ?Sized>(reader: &mut R) -> Result<RawTable> {
    let version = read_u8(reader)?;
    if version != FORMAT_VERSION {
        return Err(Error::Unsupported(format!(
            "snapshot version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let setting = Setting {
        num_buckets: read_u32(reader)?,
        num_buckets_per_mutex: read_u32(reader)?,
        fixed_key_size: read_u16(reader)?,
        fixed_value_size: read_u32(reader)?,
    };
    if setting.num_buckets == 0 {
        return Err(Error::Unsupported("snapshot with zero buckets".into()));
    }

    let table = ReadWriteTable::new(RawTable::new(setting, 0), Arc::new(RestoreRegistry));

    let mut key = Vec::new();
    let mut value = Vec::new();
    while read_u8(reader)? != 0 {
        let key_len = read_u16(reader)? as usize;
        key.resize(key_len, 0);
        reader.read_exact(&mut key)?;

        let value_len = read_u32(reader)? as usize;
        value.resize(value_len, 0);
        reader.read_exact(&mut value)?;

        table.add(&key, &value)?;
        table
            .raw()
            .perf()
            .increment(TableCounter::RecordsLoadedFromSnapshot);
    }

    fence(Ordering::Release);
    Ok(table.into_raw())
}

/// Registry for restore-time inserts. The dumped keys of a hash table
/// are unique, so no insert should ever retire a record; if a hand-built
/// stream repeats a key anyway, the replaced buffer is freed on the spot
/// (no reader exists yet) instead of poisoning the restore.
struct RestoreRegistry;

impl ActionRegistry for RestoreRegistry {
    fn register_action(&self, action: Action) {
        log::warn!("snapshot stream repeated a key; dropping the replaced record");
        action();
    }
}

fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read + ?Sized>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
