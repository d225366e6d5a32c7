use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tempfile::TempDir;
use tracing::{debug, error};

use super::{Category, DeferredRef};
use crate::config::ImporterConfig;
use crate::error::Result;

/// Durable staging area for deferred references.
///
/// Every category owns a live table that receives new records and a mirror
/// table holding the snapshot currently being resolved. Snapshotting copies
/// the live rows into the mirror and truncates the live table in one
/// transaction, so records re-queued while a snapshot is scanned are never
/// lost.
pub struct DeferredStore {
    _dir: TempDir,
    path: PathBuf,
    conn: Mutex<Connection>,
    busy_timeout: Duration,
    scan_chunk: usize,
}

impl DeferredStore {
    /// Creates an empty store in the configured staging directory.
    pub fn create(config: &ImporterConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cityload-xlink-");
        let dir = match &config.xlink.store_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().join("xlinks.db");
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let conn = open(&path, busy_timeout)?;
        let mut ddl = String::new();
        for category in Category::SWEEP_ORDER {
            for table in [live_table(category), mirror_table(category)] {
                ddl.push_str(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        seq INTEGER PRIMARY KEY,
                        owner_id INTEGER NOT NULL,
                        target TEXT NOT NULL,
                        payload TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS {table}_owner ON {table} (owner_id);"
                ));
            }
        }
        conn.execute_batch(&ddl)?;
        debug!(path = %path.display(), "xlink.store.created");
        Ok(Self {
            _dir: dir,
            path,
            conn: Mutex::new(conn),
            busy_timeout,
            scan_chunk: config.xlink.scan_chunk,
        })
    }

    /// Location of the staging database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a dedicated connection for a worker thread.
    pub fn connect(&self) -> Result<Connection> {
        open(&self.path, self.busy_timeout)
    }

    /// Opens a reader for snapshot membership queries.
    pub fn reader(&self) -> Result<StoreReader> {
        Ok(StoreReader {
            conn: self.connect()?,
        })
    }

    /// Appends `records` through the store's own connection.
    pub fn append(&self, records: &[DeferredRef]) -> Result<usize> {
        let mut conn = self.conn.lock();
        append_records(&mut conn, records)
    }

    /// Number of live records of `category`.
    pub fn pending(&self, category: Category) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", live_table(category)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Moves every live record of `category` into its mirror table, replacing
    /// the previous snapshot, and returns the snapshot size.
    pub fn mirror_and_truncate(&self, category: Category) -> Result<u64> {
        let live = live_table(category);
        let mirror = mirror_table(category);
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(&format!("DELETE FROM {mirror}"), [])?;
        let moved = tx.execute(
            &format!(
                "INSERT INTO {mirror} (seq, owner_id, target, payload)
                 SELECT seq, owner_id, target, payload FROM {live}"
            ),
            [],
        )?;
        tx.execute(&format!("DELETE FROM {live}"), [])?;
        tx.commit()?;
        debug!(%category, moved, "xlink.store.mirror");
        Ok(moved as u64)
    }

    /// Iterates the current snapshot of `category` in insertion order.
    pub fn scan_snapshot(&self, category: Category) -> SnapshotCursor<'_> {
        SnapshotCursor {
            store: self,
            category,
            last_seq: i64::MIN,
            done: false,
        }
    }

    /// Drops every live record of `category`; returns how many were dropped.
    pub fn abandon(&self, category: Category) -> Result<u64> {
        let conn = self.conn.lock();
        let dropped = conn.execute(&format!("DELETE FROM {}", live_table(category)), [])?;
        Ok(dropped as u64)
    }

    /// Empties every table. Called between input files.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for category in Category::SWEEP_ORDER {
            tx.execute(&format!("DELETE FROM {}", live_table(category)), [])?;
            tx.execute(&format!("DELETE FROM {}", mirror_table(category)), [])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn read_chunk(&self, category: Category, after: i64) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT seq, payload FROM {} WHERE seq > ?1 ORDER BY seq LIMIT ?2",
            mirror_table(category)
        ))?;
        let rows = stmt
            .query_map(params![after, self.scan_chunk as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Chunked reader over one category's snapshot.
pub struct SnapshotCursor<'a> {
    store: &'a DeferredStore,
    category: Category,
    last_seq: i64,
    done: bool,
}

impl SnapshotCursor<'_> {
    /// Returns the next chunk of records, or an empty vector at the end.
    ///
    /// Undecodable payloads are logged and skipped.
    pub fn next_chunk(&mut self) -> Result<Vec<DeferredRef>> {
        if self.done {
            return Ok(Vec::new());
        }
        let rows = self.store.read_chunk(self.category, self.last_seq)?;
        if rows.is_empty() {
            self.done = true;
            return Ok(Vec::new());
        }
        let mut records = Vec::with_capacity(rows.len());
        for (seq, payload) in rows {
            self.last_seq = seq;
            match serde_json::from_str::<DeferredRef>(&payload) {
                Ok(record) => records.push(record),
                Err(err) => {
                    error!(category = %self.category, seq, error = %err, "xlink.store.decode_failed")
                }
            }
        }
        Ok(records)
    }
}

/// Per-thread connection answering membership questions about the
/// snapshot currently being resolved.
pub struct StoreReader {
    conn: Connection,
}

impl StoreReader {
    /// Whether the snapshot of `category` holds a record owned by any of `owners`.
    pub fn snapshot_has_owner(&self, category: Category, owners: &[i64]) -> Result<bool> {
        const CHUNK: usize = 256;
        for chunk in owners.chunks(CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT 1 FROM {} WHERE owner_id IN ({placeholders}) LIMIT 1",
                mirror_table(category)
            );
            let found = self
                .conn
                .query_row(&sql, params_from_iter(chunk.iter()), |_| Ok(()))
                .optional()?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Writes `records` into their live tables in one transaction.
pub(crate) fn append_records(conn: &mut Connection, records: &[DeferredRef]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for record in records {
        let payload = serde_json::to_string(record)?;
        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO {} (owner_id, target, payload) VALUES (?1, ?2, ?3)",
            live_table(record.category())
        ))?;
        stmt.execute(params![record.owner_id(), record.target(), payload])?;
    }
    tx.commit()?;
    Ok(records.len())
}

fn open(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn live_table(category: Category) -> String {
    format!("xlink_{}", category.name())
}

fn mirror_table(category: Category) -> String {
    format!("xlink_{}_mirror", category.name())
}
