//! SQLite persistence layer for jail, template and config records
//!
//! Records live in three named collections, keyed by opaque strings and
//! stored as JSON. Every read or write happens inside a transaction opened by
//! [`MetadataStore::with_read_tx`] or [`MetadataStore::with_write_tx`].
//! Uniqueness over decoded fields (hostname, IP, ...) is the caller's job.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::chroot::HostRoot;

/// The fixed set of record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Jails,
    Templates,
    Config,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jails => "jails",
            Collection::Templates => "templates",
            Collection::Config => "config",
        }
    }
}

/// Store error type
#[derive(Debug)]
pub enum StoreError {
    DatabaseError(rusqlite::Error),
    ReadOnly,
    SerializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {}", e),
            StoreError::ReadOnly => write!(f, "Write attempted in a read transaction"),
            StoreError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::DatabaseError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::DatabaseError(e)
    }
}

/// Handle passed to transaction closures
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
    writable: bool,
}

impl StoreTx<'_> {
    /// Every decodable record of `collection` in write order.
    ///
    /// Records that fail to decode are logged and skipped.
    pub fn scan<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<(String, T)>, StoreError> {
        let mut stmt = self
            .tx
            .prepare("SELECT key, value FROM records WHERE collection = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![collection.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, value) = row?;
            match serde_json::from_str(&value) {
                Ok(record) => records.push((key, record)),
                Err(e) => warn!("Skipping undecodable {} record '{}': {}", collection.as_str(), key, e),
            }
        }

        debug!("Scanned {} {} records", records.len(), collection.as_str());
        Ok(records)
    }

    /// Decode a single record
    pub fn get<T: DeserializeOwned>(&self, collection: Collection, key: &str) -> Result<Option<T>, StoreError> {
        let value: Option<String> = self
            .tx
            .query_row(
                "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|v| serde_json::from_str(&v).map_err(|e| StoreError::SerializationError(e.to_string())))
            .transpose()
    }

    /// Insert or replace a record; a replaced record moves to the end of the
    /// write order
    pub fn put<T: Serialize>(&self, collection: Collection, key: &str, value: &T) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        let json = serde_json::to_string(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;

        self.tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection.as_str(), key],
        )?;
        self.tx.execute(
            "INSERT INTO records (collection, key, value) VALUES (?1, ?2, ?3)",
            params![collection.as_str(), key, json],
        )?;

        debug!("Put {} record '{}'", collection.as_str(), key);
        Ok(())
    }

    /// Delete a record, returning whether it existed
    pub fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        let rows_affected = self.tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection.as_str(), key],
        )?;

        if rows_affected == 0 {
            warn!("Attempted to delete non-existent {} record '{}'", collection.as_str(), key);
        } else {
            debug!("Deleted {} record '{}'", collection.as_str(), key);
        }
        Ok(rows_affected > 0)
    }
}

/// SQLite-backed metadata store
#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) the store at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn init_db(&self) -> Result<(), StoreError> {
        let _root = HostRoot::hold();
        let conn = self.open()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL CHECK(collection IN ('jails', 'templates', 'config')),
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                written_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                UNIQUE(collection, key)
            )",
            [],
        )?;

        debug!("Database initialized at {:?}", self.db_path);
        Ok(())
    }

    /// Callers hold a [`HostRoot`] until they are done with the connection;
    /// SQLite opens journal files by path.
    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Run `f` in a read transaction. Writes through the handle fail with
    /// [`StoreError::ReadOnly`].
    pub fn with_read_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&StoreTx<'_>) -> Result<T, E>,
    {
        let _root = HostRoot::hold();
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;
        let handle = StoreTx { tx, writable: false };
        // Dropping the transaction rolls it back
        f(&handle)
    }

    /// Run `f` in a write transaction, committed only if `f` succeeds.
    ///
    /// Write transactions take the database lock up front, so two of them
    /// never interleave.
    pub fn with_write_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&StoreTx<'_>) -> Result<T, E>,
    {
        let _root = HostRoot::hold();
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let handle = StoreTx { tx, writable: true };
        let value = f(&handle)?;
        handle.tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
