use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheEntry, CacheTag};
use crate::error::Result;

/// Durable overflow table of one cache partition.
pub(super) struct SpillTable {
    conn: Connection,
}

impl SpillTable {
    pub(super) fn open(dir: &Path, partition: usize) -> Result<Self> {
        let path = dir.join(format!("partition-{partition}.db"));
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "OFF")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS spill (
                key TEXT PRIMARY KEY,
                id INTEGER NOT NULL,
                tag INTEGER NOT NULL
            )",
        )?;
        Ok(Self { conn })
    }

    pub(super) fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO spill (key, id, tag) VALUES (?1, ?2, ?3)")?;
        stmt.execute(params![key, entry.id, entry.tag.code()])?;
        Ok(())
    }

    pub(super) fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, tag FROM spill WHERE key = ?1")?;
        let row = stmt
            .query_row(params![key], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        Ok(row.and_then(|(id, code)| CacheTag::from_code(code).map(|tag| CacheEntry { id, tag })))
    }

    pub(super) fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .prepare_cached("DELETE FROM spill WHERE key = ?1")?
            .execute(params![key])?;
        Ok(removed > 0)
    }

    pub(super) fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM spill", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub(super) fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM spill", [])?;
        Ok(())
    }
}
