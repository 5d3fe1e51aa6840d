//! ==============================================================================
//! store.rs - durable local reading queue
//! ==============================================================================
//!
//! purpose:
//!     ordered key -> bytes storage that survives restarts. the failover
//!     handler is its only user: records that could not be posted wait here
//!     until the ledger is reachable again.
//!
//! keys:
//!     composite, `|`-delimited: `reading|<asset id>|<timestamp>`. the
//!     timestamp is zero-padded so lexical order equals numeric order within
//!     one asset.
//!
//! relationships:
//!     - used by: failover.rs
//!     - uses: redb (single table `readings`)
//!
//! ==============================================================================

use crate::domain::MetricReadingRecord;
use crate::error::StoreError;
use redb::{Database, TableDefinition};
use std::path::Path;

const READINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("readings");

/// prefix shared by every persisted reading key
pub const READING_PREFIX: &str = "reading|";

/// blocking, ordered key/value store
pub trait ReadingStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// every entry whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// write all entries in one transaction
    fn write_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError>;
}

pub fn reading_key(asset_id: &str, timestamp: u64) -> String {
    format!("{}{}|{:020}", READING_PREFIX, asset_id, timestamp)
}

pub fn record_key(record: &MetricReadingRecord) -> String {
    reading_key(&record.asset_id, record.timestamp)
}

pub fn encode_record(record: &MetricReadingRecord) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode_record(bytes: &[u8]) -> Result<MetricReadingRecord, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// redb-backed reading queue
pub struct RedbQueue {
    db: Database,
}

impl RedbQueue {
    /// Open or create the queue at `path`; parent directories are created
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(redb::Error::Io(e)))?;
            }
        }
        let db = Database::create(path.as_ref())?;

        // Initialize table
        let write_txn = db.begin_write()?;
        {
            let _readings = write_txn.open_table(READINGS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::info!(path = %path.as_ref().display(), "durable reading queue opened");
        Ok(Self { db })
    }
}

impl ReadingStore for RedbQueue {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(READINGS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(READINGS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(READINGS_TABLE)?;

        let mut entries = Vec::new();
        for item in table.range(prefix..)? {
            let (key, value) = item?;
            if !key.value().starts_with(prefix) {
                break;
            }
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(READINGS_TABLE)?;
            for (key, value) in entries {
                table.insert(key.as_str(), value.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
