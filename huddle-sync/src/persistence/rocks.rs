//! RocksDB-backed key-value store.
//!
//! All room data lives in one column family, `rooms`. Keys are prefixed by
//! record kind and room (see the module docs of [`crate::persistence`]), so a
//! prefix scan returns one room's log in sequence order.

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{BatchOp, KeyValueStore, PersistenceError};

const CF_ROOMS: &str = "rooms";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("huddle_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB implementation of [`KeyValueStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (creating if needed) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::Lz4);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_ROOMS, cf_opts)],
        )?;
        log::info!("Opened room store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{CF_ROOMS}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.db.get_cf(self.cf()?, key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        self.db.put_cf_opt(self.cf()?, key, value, &self.write_options())?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), PersistenceError> {
        self.db.delete_cf_opt(self.cf()?, key, &self.write_options())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError> {
        let iter = self
            .db
            .iterator_cf(self.cf()?, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put_cf(cf, key, value),
                BatchOp::Delete { key } => batch.delete_cf(cf, key),
            }
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.path().exists());
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, store) = open_temp();
        store.put(b"doc-r1", b"snapshot").unwrap();
        assert_eq!(store.get(b"doc-r1").unwrap(), Some(b"snapshot".to_vec()));

        store.delete(b"doc-r1").unwrap();
        assert_eq!(store.get(b"doc-r1").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let (_dir, store) = open_temp();
        for seq in [3u64, 1, 2] {
            let mut key = b"upd-a".to_vec();
            key.extend_from_slice(&seq.to_be_bytes());
            store.put(&key, &[seq as u8]).unwrap();
        }
        store.put(b"upd-b", b"other").unwrap();

        let entries = store.scan_prefix(b"upd-a").unwrap();
        let values: Vec<u8> = entries.iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_write_batch_atomic_apply() {
        let (_dir, store) = open_temp();
        store.put(b"gone", b"x").unwrap();
        store
            .write_batch(vec![
                BatchOp::Put {
                    key: b"kept".to_vec(),
                    value: b"y".to_vec(),
                },
                BatchOp::Delete {
                    key: b"gone".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(store.get(b"gone").unwrap(), None);
        assert_eq!(store.get(b"kept").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put(b"k", b"v").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
