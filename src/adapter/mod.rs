//! SQLite adapter: schema, connections, identity sequences, index handling.

mod batch;
mod mapping;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ImporterConfig;
use crate::error::Result;

pub use batch::{validate_identifier, BatchOutcome, FailedUnit, StatementBatch};
pub use mapping::{ReferenceMapping, ReferenceTarget, LINK_TABLE};

#[cfg(test)]
pub(crate) fn schema_sql() -> &'static str {
    schema::TABLES
}

/// Largest number of statements SQLite handles comfortably per batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Tables whose primary keys are generated by the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTable {
    /// `feature`
    Feature,
    /// `surface_geometry`
    SurfaceGeometry,
    /// `appearance`
    Appearance,
    /// `surface_data`
    SurfaceData,
    /// `tex_image`
    TexImage,
}

impl IdTable {
    const ALL: [IdTable; 5] = [
        IdTable::Feature,
        IdTable::SurfaceGeometry,
        IdTable::Appearance,
        IdTable::SurfaceData,
        IdTable::TexImage,
    ];

    /// Table name.
    pub fn table(self) -> &'static str {
        match self {
            IdTable::Feature => "feature",
            IdTable::SurfaceGeometry => "surface_geometry",
            IdTable::Appearance => "appearance",
            IdTable::SurfaceData => "surface_data",
            IdTable::TexImage => "tex_image",
        }
    }
}

/// Id generators shared by every worker of a run.
///
/// Seeded from `MAX(id)` when the adapter opens, so generated keys are known
/// before the row is written and no worker needs a round trip to learn them.
#[derive(Debug, Default)]
pub struct Sequences {
    next: [AtomicI64; 5],
}

impl Sequences {
    fn seed(&self, conn: &Connection) -> Result<()> {
        for (slot, table) in IdTable::ALL.iter().enumerate() {
            let max: Option<i64> = conn.query_row(
                &format!("SELECT MAX(id) FROM {}", table.table()),
                [],
                |row| row.get(0),
            )?;
            self.next[slot].store(max.unwrap_or(0) + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Allocates the next id of `table`.
    pub fn next(&self, table: IdTable) -> i64 {
        self.next[table as usize].fetch_add(1, Ordering::Relaxed)
    }
}

/// Presence of one managed index.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexStatus {
    /// Index name.
    pub name: &'static str,
    /// Indexed table.
    pub table: &'static str,
    /// Whether the index currently exists.
    pub active: bool,
}

/// Connection factory and schema owner for the target database.
pub struct SqliteAdapter {
    path: PathBuf,
    busy_timeout: Duration,
    sequences: Sequences,
    mapping: ReferenceMapping,
}

impl SqliteAdapter {
    /// Opens the target database, creating the schema when missing.
    pub fn open(config: &ImporterConfig) -> Result<Self> {
        let adapter = Self {
            path: config.database.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            sequences: Sequences::default(),
            mapping: ReferenceMapping::default(),
        };
        let conn = adapter.connect()?;
        adapter.ensure_schema(&conn)?;
        adapter.sequences.seed(&conn)?;
        Ok(adapter)
    }

    /// Replaces the reference mapping.
    pub fn with_mapping(mut self, mapping: ReferenceMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Target database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a connection owned by the calling worker.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        conn.set_prepared_statement_cache_capacity(64);
        Ok(conn)
    }

    /// Creates missing tables, and the indexes when the database is new.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        let fresh = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'feature'",
                [],
                |_| Ok(()),
            )
            .optional()?
            .is_none();
        conn.execute_batch(schema::TABLES)?;
        // Existing databases keep whatever index state they were left in.
        if fresh {
            for index in schema::INDEXES {
                conn.execute(&index.create_sql(), [])?;
            }
        }
        debug!(path = %self.path.display(), fresh, "adapter.schema.ready");
        Ok(())
    }

    /// Largest batch a writer should accumulate.
    pub fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    /// Shared id generators.
    pub fn sequences(&self) -> &Sequences {
        &self.sequences
    }

    /// Role to destination registry.
    pub fn mapping(&self) -> &ReferenceMapping {
        &self.mapping
    }

    /// Reports which managed indexes exist.
    pub fn index_status(&self) -> Result<Vec<IndexStatus>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1")?;
        let mut status = Vec::with_capacity(schema::INDEXES.len());
        for index in schema::INDEXES {
            let active = stmt
                .query_row(params![index.name], |_| Ok(()))
                .optional()?
                .is_some();
            status.push(IndexStatus {
                name: index.name,
                table: index.table,
                active,
            });
        }
        Ok(status)
    }

    /// Creates every managed index; returns how many were missing.
    pub fn activate_indexes(&self) -> Result<usize> {
        self.toggle_indexes(true)
    }

    /// Drops every managed index; returns how many existed.
    pub fn deactivate_indexes(&self) -> Result<usize> {
        self.toggle_indexes(false)
    }

    fn toggle_indexes(&self, activate: bool) -> Result<usize> {
        let changed = self
            .index_status()?
            .iter()
            .filter(|status| status.active != activate)
            .count();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for index in schema::INDEXES {
            let sql = if activate {
                index.create_sql()
            } else {
                index.drop_sql()
            };
            tx.execute(&sql, [])?;
        }
        tx.commit()?;
        info!(activate, changed, "adapter.indexes");
        Ok(changed)
    }

    /// Deletes the features rooted at `root_ids` with every dependent row.
    /// Returns how many feature rows were removed.
    pub fn delete_feature_trees(&self, conn: &mut Connection, root_ids: &[i64]) -> Result<u64> {
        if root_ids.is_empty() {
            return Ok(0);
        }
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS doomed_feature (id INTEGER PRIMARY KEY);
             CREATE TEMP TABLE IF NOT EXISTS doomed_surface_data (id INTEGER PRIMARY KEY);
             DELETE FROM doomed_feature;
             DELETE FROM doomed_surface_data;",
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO doomed_feature (id)
                 SELECT id FROM feature WHERE id = ?1 OR root_id = ?1",
            )?;
            for root in root_ids {
                stmt.execute(params![root])?;
            }
        }
        tx.execute_batch(
            "INSERT OR IGNORE INTO doomed_surface_data (id)
                SELECT a2s.surface_data_id FROM appear_to_surface_data a2s
                JOIN appearance a ON a.id = a2s.appearance_id
                WHERE a.feature_id IN (SELECT id FROM doomed_feature);
             DELETE FROM doomed_surface_data WHERE id IN (
                SELECT a2s.surface_data_id FROM appear_to_surface_data a2s
                JOIN appearance a ON a.id = a2s.appearance_id
                WHERE a.feature_id IS NULL
                   OR a.feature_id NOT IN (SELECT id FROM doomed_feature));
             DELETE FROM feature_attribute WHERE feature_id IN (SELECT id FROM doomed_feature);
             DELETE FROM feature_reference
                WHERE feature_id IN (SELECT id FROM doomed_feature)
                   OR target_id IN (SELECT id FROM doomed_feature);
             DELETE FROM group_member
                WHERE group_id IN (SELECT id FROM doomed_feature)
                   OR member_id IN (SELECT id FROM doomed_feature);
             DELETE FROM textureparam
                WHERE surface_data_id IN (SELECT id FROM doomed_surface_data)
                   OR surface_geometry_id IN (
                      SELECT id FROM surface_geometry
                      WHERE feature_id IN (SELECT id FROM doomed_feature));
             DELETE FROM surface_geometry WHERE feature_id IN (SELECT id FROM doomed_feature);
             DELETE FROM appear_to_surface_data WHERE appearance_id IN (
                SELECT id FROM appearance WHERE feature_id IN (SELECT id FROM doomed_feature));
             DELETE FROM tex_image WHERE id IN (
                SELECT tex_image_id FROM surface_data
                WHERE id IN (SELECT id FROM doomed_surface_data)
                  AND tex_image_id NOT IN (
                      SELECT tex_image_id FROM surface_data
                      WHERE tex_image_id IS NOT NULL
                        AND id NOT IN (SELECT id FROM doomed_surface_data)));
             DELETE FROM surface_data WHERE id IN (SELECT id FROM doomed_surface_data);
             DELETE FROM appearance WHERE feature_id IN (SELECT id FROM doomed_feature);",
        )?;
        let removed = tx.execute(
            "DELETE FROM feature WHERE id IN (SELECT id FROM doomed_feature)",
            [],
        )?;
        tx.commit()?;
        debug!(roots = root_ids.len(), removed, "adapter.delete_feature_trees");
        Ok(removed as u64)
    }
}
