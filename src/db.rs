//! Storage Engine: opens and maintains the embedded relational store.
//!
//! Wraps a `sqlx` SQLite pool configured for a single-writer/many-reader
//! workload (WAL journaling, foreign keys, a generous memory-map) and
//! provides the float32-vector blob codec used by the embedding and
//! vector-index modules.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

use crate::config::Config;

/// Minimum memory-map size the store pragma requests, per the storage contract.
const MIN_MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {source}")]
    OpenError {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to prepare statement: {msg} (sql: {sql})")]
    PrepareError { sql: String, msg: String },
    #[error("statement execution failed: {0}")]
    StepError(#[from] sqlx::Error),
    #[error("no migration available for version {0}")]
    MigrationMissing(i64),
}

/// Open (creating if missing) the SQLite store and apply the pragmas the
/// storage contract requires: WAL journaling, foreign-key enforcement,
/// normal synchronous durability, in-memory temp storage, and a memory-map
/// of at least 256 MiB.
pub async fn connect(config: &Config) -> Result<SqlitePool, StorageError> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::OpenError {
            path: db_path.display().to_string(),
            source: sqlx::Error::Io(e),
        })?;
    }

    let journal_mode = if config.db.enable_wal {
        SqliteJournalMode::Wal
    } else {
        SqliteJournalMode::Delete
    };

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(|e| StorageError::OpenError {
            path: db_path.display().to_string(),
            source: e,
        })?
        .create_if_missing(true)
        .journal_mode(journal_mode)
        .foreign_keys(true)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .pragma("temp_store", "MEMORY")
        .pragma("mmap_size", MIN_MMAP_SIZE_BYTES.to_string());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.connection_pool_size)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::OpenError {
            path: db_path.display().to_string(),
            source: e,
        })?;

    Ok(pool)
}

/// Encode a float vector as a little-endian f32 BLOB for storage.
pub fn serialize_f32(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 BLOB back into a float vector.
///
/// # Panics
///
/// Panics if `blob.len()` is not a multiple of 4 — this indicates storage
/// corruption or a programmer error upstream, not a recoverable condition.
pub fn deserialize_f32(blob: &[u8]) -> Vec<f32> {
    assert_eq!(
        blob.len() % 4,
        0,
        "vector blob length {} is not a multiple of 4",
        blob.len()
    );
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 0.0, 3.125];
        let blob = serialize_f32(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(deserialize_f32(&blob), v);
    }

    #[test]
    #[should_panic]
    fn deserialize_rejects_misaligned_blob() {
        deserialize_f32(&[1, 2, 3]);
    }
}
