//! Tracked Set Store - SQLite-backed ledger of every repository ever seen
//!
//! The store is partitioned into buckets, one per watched account. Each
//! bucket maps a repository's `full_name` to its upstream `created_at`
//! string. Buckets are append-only: once a key is present it is never
//! updated or removed, even if the repository disappears upstream.
//!
//! The database is stored in XDG_DATA_HOME/repowatch/repos.db

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A stored entry as read back from a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntry {
    pub full_name: String,
    pub created_at: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Durable store of tracked repository sets
pub struct RepoStore {
    conn: Connection,
}

/// Read/write view of one bucket inside a transaction
///
/// Only handed out by [`RepoStore::update`]; everything done through it
/// commits or rolls back together.
pub struct Bucket<'a> {
    conn: &'a Connection,
    name: &'a str,
}

impl Bucket<'_> {
    /// Look up a key, returning its stored value if present
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
                params![self.name, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to look up {} in bucket {}", key, self.name))
    }

    /// Insert a new key. Existing keys are never overwritten, so inserting a
    /// key twice is an error.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO entries (bucket, key, value, first_seen_at) VALUES (?1, ?2, ?3, ?4)",
                params![self.name, key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to insert {} into bucket {}", key, self.name))?;
        Ok(())
    }
}

impl RepoStore {
    /// Open or create the store at a specific path
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let store = Self { conn };
        store.initialize()?;

        info!("Repository store opened at {}", path.display());
        Ok(store)
    }

    /// Open an existing store without writing to it.
    ///
    /// Returns `None` when there is no database at `path`; nothing is
    /// created on disk. Writes through the returned store fail.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No database at {}", path.display());
            return Ok(None);
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open database at {} read-only", path.display()))?;

        Ok(Some(Self { conn }))
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    /// Get the default database path
    pub fn default_db_path() -> PathBuf {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        data_dir.join("repowatch").join("repos.db")
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS buckets (
                    name TEXT PRIMARY KEY NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS entries (
                    bucket TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    first_seen_at TEXT NOT NULL,
                    PRIMARY KEY (bucket, key)
                );
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Create a bucket unless it already exists. Safe to call on every start.
    pub fn create_bucket_if_not_exists(&self, name: &str) -> Result<()> {
        let created = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to create bucket {}", name))?;

        if created > 0 {
            info!("Created bucket for account {}", name);
        } else {
            debug!("Reusing existing bucket for account {}", name);
        }
        Ok(())
    }

    pub fn bucket_exists(&self, name: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM buckets WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to query buckets")?;
        Ok(found.is_some())
    }

    /// Run `f` against a bucket inside a single transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err`, so nothing `f` wrote survives a failure.
    pub fn update<T, F>(&mut self, bucket: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Bucket<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction()
            .context("Failed to begin transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM buckets WHERE name = ?1",
                params![bucket],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to query buckets")?
            .is_some();
        if !exists {
            bail!("Bucket {} does not exist", bucket);
        }

        let result = {
            let view = Bucket {
                conn: &*tx,
                name: bucket,
            };
            f(&view)
        };

        match result {
            Ok(value) => {
                tx.commit().context("Failed to commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().context("Failed to roll back transaction")?;
                Err(e)
            }
        }
    }

    /// Read a single value outside of any write transaction
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        Bucket {
            conn: &self.conn,
            name: bucket,
        }
        .get(key)
    }

    /// Number of entries tracked in a bucket
    pub fn len(&self, bucket: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entries WHERE bucket = ?1",
                params![bucket],
                |row| row.get(0),
            )
            .context("Failed to count entries")?;
        Ok(count as u64)
    }

    pub fn is_empty(&self, bucket: &str) -> Result<bool> {
        Ok(self.len(bucket)? == 0)
    }

    /// All entries of a bucket, oldest first
    pub fn entries(&self, bucket: &str) -> Result<Vec<TrackedEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT key, value, first_seen_at
            FROM entries
            WHERE bucket = ?1
            ORDER BY first_seen_at ASC, key ASC
            "#,
        )?;

        let entries = stmt
            .query_map(params![bucket], |row| {
                Ok(TrackedEntry {
                    full_name: row.get(0)?,
                    created_at: row.get(1)?,
                    first_seen_at: row
                        .get::<_, String>(2)
                        .ok()
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(Utc::now),
                })
            })
            .context("Failed to query entries")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect entries")?;

        Ok(entries)
    }
}
