//! RocksDB-backed blob store.
//!
//! Column families:
//! - `items`: Serialized families, LZ4 compressed, keyed by id
//! - `metadata`: Per-item sizes and timestamps (bincode)
//!
//! Both are written in one batch so an item never exists without its
//! metadata.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Storage, StoreError};

const CF_ITEMS: &str = "items";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ITEMS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("upwell_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

/// Bookkeeping stored next to each item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Number of times the item was written
    pub writes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl ItemMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            size: 0,
            compressed_size: 0,
            writes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("opened store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed.
            CF_ITEMS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn metadata(&self, id: &str) -> Result<Option<ItemMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(ItemMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_item(&self, id: &str) -> Result<bool, StoreError> {
        if self.metadata(id)?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ITEMS)?, id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, id.as_bytes());
        self.write(batch)?;
        Ok(true)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl Storage for RocksStore {
    fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    fn set_item(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(bytes);

        let mut meta = self.metadata(id)?.unwrap_or_else(ItemMetadata::new);
        meta.size = bytes.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.writes += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ITEMS)?, id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, id.as_bytes(), meta.encode()?);
        self.write(batch)?;
        log::debug!("stored {id}: {} bytes ({} compressed)", meta.size, meta.compressed_size);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec()).map_err(|e| {
                StoreError::DeserializationError(format!("item key is not UTF-8: {e}"))
            })?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.ids().unwrap().is_empty());
    }

    #[test]
    fn test_item_roundtrip() {
        let (_dir, store) = open_temp();
        let data = b"a family container with enough repeated text text text to compress".to_vec();
        store.set_item("doc-1", &data).unwrap();
        assert_eq!(store.get_item("doc-1").unwrap(), Some(data.clone()));
        assert_eq!(store.get_item("doc-2").unwrap(), None);

        let meta = store.metadata("doc-1").unwrap().unwrap();
        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(meta.writes, 1);
    }

    #[test]
    fn test_overwrite_counts_writes() {
        let (_dir, store) = open_temp();
        store.set_item("doc", b"one").unwrap();
        let created = store.metadata("doc").unwrap().unwrap().created_at;
        store.set_item("doc", b"two").unwrap();
        let meta = store.metadata("doc").unwrap().unwrap();
        assert_eq!(meta.writes, 2);
        assert_eq!(meta.created_at, created);
        assert_eq!(store.get_item("doc").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_ids_sorted() {
        let (_dir, store) = open_temp();
        for id in ["upwell-b", "upwell-a", "other"] {
            store.set_item(id, b"x").unwrap();
        }
        assert_eq!(store.ids().unwrap(), vec!["other", "upwell-a", "upwell-b"]);
    }

    #[test]
    fn test_remove_item() {
        let (_dir, store) = open_temp();
        store.set_item("doc", b"x").unwrap();
        assert!(store.remove_item("doc").unwrap());
        assert!(!store.remove_item("doc").unwrap());
        assert_eq!(store.get_item("doc").unwrap(), None);
        assert!(store.ids().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.set_item("doc", b"persisted").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get_item("doc").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::CompressionError("bad frame".into());
        assert_eq!(err.to_string(), "Compression error: bad frame");
    }
}
