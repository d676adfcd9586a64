//! Database operation patterns and utilities

use crate::{
    error::{TollError, TollResult},
    serialization::TollSerialize,
};
use async_trait::async_trait;
use rocksdb::{Options, DB};
use std::sync::Arc;

/// Typed store operations over prefix-keyed tables
#[async_trait]
pub trait StoreOps {
    /// Store data with standardized key formatting
    async fn store_data<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
        key: &str,
        data: &T,
    ) -> TollResult<()>;

    /// Load data with standardized key formatting
    async fn load_data<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
        key: &str,
    ) -> TollResult<Option<T>>;

    /// Delete data with standardized key formatting
    async fn delete_data(&self, prefix: &str, key: &str) -> TollResult<()>;

    /// Check if key exists
    async fn exists(&self, prefix: &str, key: &str) -> TollResult<bool>;

    /// Get all keys with prefix
    async fn keys_with_prefix(&self, prefix: &str) -> TollResult<Vec<String>>;

    /// Load every `(key, value)` pair under a prefix, in key order
    async fn scan_prefix<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
    ) -> TollResult<Vec<(String, T)>>;
}

/// Tollgate database wrapper with standardized operations.
///
/// Logical tables are key prefixes (`reader:`, `nonce:`, `vdf_link:`, ...);
/// sequence-keyed tables use [`TollDatabase::seq_key`] so RocksDB iteration
/// order matches sequence order.
#[derive(Clone)]
pub struct TollDatabase {
    db: Arc<DB>,
}

impl TollDatabase {
    /// Open (or create) a database at the given path
    pub fn new(path: &str) -> TollResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(1000);
        opts.set_use_fsync(false);
        opts.set_bytes_per_sync(8388608);
        opts.set_max_write_buffer_number(8);
        opts.set_write_buffer_size(67108864);
        opts.set_compaction_style(rocksdb::DBCompactionStyle::Level);

        let db = DB::open(&opts, path)
            .map_err(|e| TollError::database(format!("Failed to open database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Format key with prefix
    pub fn format_key(prefix: &str, key: &str) -> String {
        format!("{}:{}", prefix, key)
    }

    /// Fixed-width hex key for sequence-ordered tables
    pub fn seq_key(seq: u64) -> String {
        format!("{:016x}", seq)
    }

    /// Get raw value from database
    pub fn get_raw(&self, key: &[u8]) -> TollResult<Option<Vec<u8>>> {
        self.db.get(key).map_err(TollError::from)
    }

    /// Put raw value to database
    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> TollResult<()> {
        self.db.put(key, value).map_err(TollError::from)
    }

    /// Delete raw key from database
    pub fn delete_raw(&self, key: &[u8]) -> TollResult<()> {
        self.db.delete(key).map_err(TollError::from)
    }

    /// Atomically write a batch of `(prefix, key, value)` puts
    pub fn write_batch(&self, puts: Vec<(String, String, Vec<u8>)>) -> TollResult<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for (prefix, key, value) in puts {
            batch.put(Self::format_key(&prefix, &key).as_bytes(), &value);
        }
        self.db.write(batch).map_err(TollError::from)
    }

    fn iter_prefix(&self, prefix: &str) -> TollResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        let prefix_with_separator = format!("{}:", prefix);
        let prefix_bytes = prefix_with_separator.as_bytes();

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            prefix_bytes,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item.map_err(TollError::from)?;
            let key_str = String::from_utf8_lossy(&key);

            if !key_str.starts_with(&prefix_with_separator) {
                break;
            }

            if let Some(actual_key) = key_str.strip_prefix(&prefix_with_separator) {
                entries.push((actual_key.to_string(), value.to_vec()));
            }
        }

        Ok(entries)
    }
}

#[async_trait]
impl StoreOps for TollDatabase {
    async fn store_data<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
        key: &str,
        data: &T,
    ) -> TollResult<()> {
        let formatted_key = Self::format_key(prefix, key);
        let encoded = data
            .encode()
            .map_err(|e| TollError::serialization(format!("Failed to encode data: {}", e)))?;

        self.put_raw(formatted_key.as_bytes(), &encoded)
    }

    async fn load_data<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
        key: &str,
    ) -> TollResult<Option<T>> {
        let formatted_key = Self::format_key(prefix, key);

        match self.get_raw(formatted_key.as_bytes())? {
            Some(bytes) => {
                let data = T::decode(&bytes).map_err(|e| {
                    TollError::serialization(format!("Failed to decode data: {}", e))
                })?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn delete_data(&self, prefix: &str, key: &str) -> TollResult<()> {
        let formatted_key = Self::format_key(prefix, key);
        self.delete_raw(formatted_key.as_bytes())
    }

    async fn exists(&self, prefix: &str, key: &str) -> TollResult<bool> {
        let formatted_key = Self::format_key(prefix, key);
        Ok(self.get_raw(formatted_key.as_bytes())?.is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> TollResult<Vec<String>> {
        Ok(self
            .iter_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn scan_prefix<T: TollSerialize + Send + Sync>(
        &self,
        prefix: &str,
    ) -> TollResult<Vec<(String, T)>> {
        self.iter_prefix(prefix)?
            .into_iter()
            .map(|(key, bytes)| {
                let value = T::decode(&bytes).map_err(|e| {
                    TollError::serialization(format!("Failed to decode {}:{}: {}", prefix, key, e))
                })?;
                Ok((key, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::EncodingType;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        id: u64,
        name: String,
    }

    impl TollSerialize for TestData {
        fn preferred_encoding() -> EncodingType {
            EncodingType::Bincode
        }
    }

    #[tokio::test]
    async fn test_database_operations() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test_db");
        let db = TollDatabase::new(db_path.to_str().unwrap()).unwrap();

        let test_data = TestData {
            id: 123,
            name: "test".to_string(),
        };

        db.store_data("test", "key1", &test_data).await.unwrap();

        let loaded: Option<TestData> = db.load_data("test", "key1").await.unwrap();
        assert_eq!(loaded, Some(test_data.clone()));

        assert!(db.exists("test", "key1").await.unwrap());
        assert!(!db.exists("test", "key2").await.unwrap());

        db.delete_data("test", "key1").await.unwrap();
        let loaded_after_delete: Option<TestData> = db.load_data("test", "key1").await.unwrap();
        assert_eq!(loaded_after_delete, None);
    }

    #[tokio::test]
    async fn test_scan_prefix_is_isolated() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("scan_db");
        let db = TollDatabase::new(db_path.to_str().unwrap()).unwrap();

        let data = TestData {
            id: 1,
            name: "x".to_string(),
        };

        db.store_data("alpha", "k1", &data).await.unwrap();
        db.store_data("alpha", "k2", &data).await.unwrap();
        db.store_data("alphabet", "k1", &data).await.unwrap();

        let entries: Vec<(String, TestData)> = db.scan_prefix("alpha").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "k1");
        assert_eq!(entries[1].0, "k2");
    }

    #[tokio::test]
    async fn test_seq_key_ordering() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("seq_db");
        let db = TollDatabase::new(db_path.to_str().unwrap()).unwrap();

        // Insert out of order; scan must return sequence order
        for seq in [5u64, 1, 300, 42] {
            let data = TestData {
                id: seq,
                name: String::new(),
            };
            db.store_data("links", &TollDatabase::seq_key(seq), &data)
                .await
                .unwrap();
        }

        let entries: Vec<(String, TestData)> = db.scan_prefix("links").await.unwrap();
        let ids: Vec<u64> = entries.iter().map(|(_, d)| d.id).collect();
        assert_eq!(ids, vec![1, 5, 42, 300]);
    }

    #[tokio::test]
    async fn test_write_batch() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("batch_db");
        let db = TollDatabase::new(db_path.to_str().unwrap()).unwrap();

        let puts = (1..=3)
            .map(|i| {
                let data = TestData {
                    id: i,
                    name: format!("item{}", i),
                };
                (
                    "test".to_string(),
                    format!("key{}", i),
                    data.encode().unwrap(),
                )
            })
            .collect();

        db.write_batch(puts).unwrap();

        for i in 1..=3u64 {
            let loaded: Option<TestData> = db.load_data("test", &format!("key{}", i)).await.unwrap();
            assert_eq!(loaded.unwrap().id, i);
        }
    }
}
