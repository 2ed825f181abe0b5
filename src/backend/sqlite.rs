//! SQLite backing store
//!
//! One row per stored version. The version check and the insert share a
//! transaction, so two writers racing on the same key cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

use super::{BackendError, BackingStore, VersionedBlob};

/// Versioned blob store on SQLite
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.init_schema()?;

        info!("Playbook database opened: {}", path.display());
        Ok(backend)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let backend = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> Result<(), BackendError> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS playbook_versions (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                blob BLOB NOT NULL,
                checksum TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key, version)
            );

            CREATE INDEX IF NOT EXISTS idx_playbook_versions_latest
                ON playbook_versions(namespace, key, version DESC);
            "#,
        )?;
        Ok(())
    }

    fn checksum(blob: &[u8]) -> String {
        hex::encode(Sha256::digest(blob))
    }

    fn row_to_blob(
        namespace: &str,
        key: &str,
        row: (i64, Vec<u8>, String, i64),
    ) -> Result<VersionedBlob, BackendError> {
        let (version, blob, checksum, stored_at) = row;
        let version = version as u64;

        if Self::checksum(&blob) != checksum {
            return Err(BackendError::Corrupt {
                namespace: namespace.to_string(),
                key: key.to_string(),
                version,
            });
        }

        Ok(VersionedBlob {
            version,
            blob,
            stored_at: DateTime::<Utc>::from_timestamp_millis(stored_at).unwrap_or_else(Utc::now),
        })
    }

    #[cfg(test)]
    fn corrupt(&self, namespace: &str, key: &str, version: u64) {
        self.conn
            .lock()
            .execute(
                "UPDATE playbook_versions SET checksum = 'bad' WHERE namespace = ?1 AND key = ?2 AND version = ?3",
                params![namespace, key, version as i64],
            )
            .unwrap();
    }
}

#[async_trait]
impl BackingStore for SqliteBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<VersionedBlob>, BackendError> {
        let row = self
            .conn
            .lock()
            .query_row(
                r#"
                SELECT version, blob, checksum, stored_at
                FROM playbook_versions
                WHERE namespace = ?1 AND key = ?2
                ORDER BY version DESC
                LIMIT 1
                "#,
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|r| Self::row_to_blob(namespace, key, r)).transpose()
    }

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
        blob: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let latest: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM playbook_versions WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )?;
        let expected = latest as u64 + 1;
        if version != expected {
            // Dropping the transaction rolls it back
            return Err(BackendError::Conflict {
                expected,
                found: version,
            });
        }

        tx.execute(
            r#"
            INSERT INTO playbook_versions (namespace, key, version, blob, checksum, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                namespace,
                key,
                version as i64,
                blob,
                Self::checksum(&blob),
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_version(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<VersionedBlob>, BackendError> {
        let row = self
            .conn
            .lock()
            .query_row(
                r#"
                SELECT version, blob, checksum, stored_at
                FROM playbook_versions
                WHERE namespace = ?1 AND key = ?2 AND version = ?3
                "#,
                params![namespace, key, version as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|r| Self::row_to_blob(namespace, key, r)).transpose()
    }

    async fn list_versions(&self, namespace: &str, key: &str) -> Result<Vec<u64>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version FROM playbook_versions WHERE namespace = ?1 AND key = ?2 ORDER BY version ASC",
        )?;

        let versions = stmt
            .query_map(params![namespace, key], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(versions.into_iter().map(|v| v as u64).collect())
    }
}
