//! Duplicate pre-check.
//!
//! Streams the inputs once through a single read-only worker that looks up
//! every top-level gml:id in the target database. Hits land in a disk-backed
//! [`DuplicateLog`], which afterwards drives either a bulk delete of the old
//! rows or a [`SkipList`] filtering the real import.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::adapter::SqliteAdapter;
use crate::config::DuplicateMode;
use crate::context::RunContext;
use crate::error::{ImportError, Result};
use crate::model::Feature;
use crate::primitives::{ShutdownMode, WorkHandler, WorkerPool};
use crate::reader::FeatureReader;

/// Ids removed per delete transaction.
const DELETE_CHUNK: usize = 500;

/// Top-level feature that already exists in the target database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateRecord {
    /// Symbolic identifier.
    pub gml_id: String,
    /// Row id of the existing feature.
    pub existing_id: i64,
}

/// What the orchestrator did about duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    /// Action configured for the run.
    pub mode: DuplicateMode,
    /// Duplicates found by the check.
    pub found: u64,
    /// Feature rows removed by a delete.
    pub deleted: u64,
}

struct LogFile {
    _dir: TempDir,
    conn: Mutex<Connection>,
}

/// Disk-backed log of duplicates. Cloning shares the same file.
#[derive(Clone)]
pub struct DuplicateLog {
    file: Arc<LogFile>,
}

impl DuplicateLog {
    /// Creates an empty log in a fresh temporary directory under `parent`.
    pub fn create(parent: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cityload-duplicates-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        let conn = Connection::open(dir.path().join("duplicates.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE duplicate (
                 gml_id TEXT PRIMARY KEY,
                 existing_id INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            file: Arc::new(LogFile {
                _dir: dir,
                conn: Mutex::new(conn),
            }),
        })
    }

    /// Records a duplicate. Repeated identifiers are stored once.
    pub fn append(&self, record: &DuplicateRecord) -> Result<()> {
        let conn = self.file.conn.lock();
        conn.prepare_cached("INSERT OR IGNORE INTO duplicate (gml_id, existing_id) VALUES (?1, ?2)")?
            .execute(params![record.gml_id, record.existing_id])?;
        Ok(())
    }

    /// Number of logged duplicates.
    pub fn len(&self) -> Result<u64> {
        let conn = self.file.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM duplicate", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Whether any duplicate was logged.
    pub fn has_duplicates(&self) -> Result<bool> {
        Ok(self.len()? > 0)
    }

    /// Calls `visit` for every record in identifier order.
    pub fn visit(&self, mut visit: impl FnMut(DuplicateRecord) -> Result<()>) -> Result<()> {
        let conn = self.file.conn.lock();
        let mut stmt = conn.prepare("SELECT gml_id, existing_id FROM duplicate ORDER BY gml_id")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            visit(DuplicateRecord {
                gml_id: row.get(0)?,
                existing_id: row.get(1)?,
            })?;
        }
        Ok(())
    }

    /// Every record; only for logs known to be small.
    pub fn records(&self) -> Result<Vec<DuplicateRecord>> {
        let mut records = Vec::new();
        self.visit(|record| {
            records.push(record);
            Ok(())
        })?;
        Ok(records)
    }

    /// Skip list backed by this log.
    pub fn to_skip_list(&self) -> SkipList {
        SkipList { log: self.clone() }
    }

    /// Deletes the existing features and everything they own. Returns the
    /// number of feature rows removed.
    pub fn delete(&self, adapter: &SqliteAdapter) -> Result<u64> {
        let mut ids = Vec::new();
        self.visit(|record| {
            ids.push(record.existing_id);
            Ok(())
        })?;
        let mut conn = adapter.connect()?;
        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            removed += adapter.delete_feature_trees(&mut conn, chunk)?;
        }
        info!(duplicates = ids.len(), removed, "duplicates.deleted");
        Ok(removed)
    }

    fn contains(&self, gml_id: &str) -> Result<bool> {
        let conn = self.file.conn.lock();
        let found = conn
            .prepare_cached("SELECT 1 FROM duplicate WHERE gml_id = ?1")?
            .query_row([gml_id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

/// Filter of top-level identifiers the import leaves alone.
#[derive(Clone)]
pub struct SkipList {
    log: DuplicateLog,
}

impl SkipList {
    /// Whether `gml_id` must be skipped.
    pub fn contains(&self, gml_id: &str) -> Result<bool> {
        self.log.contains(gml_id)
    }
}

struct DuplicateWorker {
    ctx: Arc<RunContext>,
    conn: Connection,
    log: DuplicateLog,
}

impl DuplicateWorker {
    fn check(&self, gml_id: &str) -> Result<()> {
        let existing: Option<i64> = self
            .conn
            .prepare_cached("SELECT id FROM feature WHERE gmlid = ?1 AND toplevel = 1 LIMIT 1")?
            .query_row([gml_id], |row| row.get(0))
            .optional()?;
        if let Some(existing_id) = existing {
            debug!(gml_id, existing_id, "duplicates.found");
            self.log.append(&DuplicateRecord {
                gml_id: gml_id.to_string(),
                existing_id,
            })?;
        }
        Ok(())
    }
}

impl WorkHandler<Feature> for DuplicateWorker {
    fn handle(&mut self, feature: Feature) {
        if !self.ctx.should_run() || !feature.top_level {
            return;
        }
        let Some(gml_id) = feature.gml_id.as_deref() else {
            return;
        };
        if let Err(err) = self.check(gml_id) {
            warn!(gml_id, error = %err, "duplicates.check_failed");
        }
    }

    fn finish(&mut self, interrupted: bool) {
        debug!(interrupted, "duplicates.worker.finish");
    }
}

/// Runs the duplicate pre-check.
pub struct DuplicateChecker {
    ctx: Arc<RunContext>,
    adapter: Arc<SqliteAdapter>,
}

impl DuplicateChecker {
    /// Creates a checker against the adapter's database.
    pub fn new(ctx: Arc<RunContext>, adapter: Arc<SqliteAdapter>) -> Self {
        Self { ctx, adapter }
    }

    /// Streams `files` and logs every top-level feature that already exists.
    ///
    /// An interrupt ends the check early; what was logged so far stays valid.
    pub fn check(&self, reader: &mut dyn FeatureReader, files: &[PathBuf]) -> Result<DuplicateLog> {
        let log = DuplicateLog::create(self.ctx.config().xlink.store_dir.as_deref())?;
        let factory_ctx = Arc::clone(&self.ctx);
        let adapter = Arc::clone(&self.adapter);
        let worker_log = log.clone();
        let pool = WorkerPool::new(
            "duplicate-check",
            Arc::clone(&self.ctx),
            1,
            1,
            self.ctx.config().queue_capacity(),
            Box::new(move |_| {
                Ok(Box::new(DuplicateWorker {
                    ctx: Arc::clone(&factory_ctx),
                    conn: adapter.connect()?,
                    log: worker_log.clone(),
                }) as Box<dyn WorkHandler<Feature>>)
            }),
        );
        pool.prestart()?;

        for path in files {
            if !self.ctx.should_run() {
                break;
            }
            let summary = reader.read(path, &mut |feature| pool.submit(feature));
            match summary {
                Ok(summary) if summary.stopped => break,
                Ok(_) => {}
                Err(err) => {
                    pool.shutdown(ShutdownMode::Immediate);
                    return Err(ImportError::stop(format!(
                        "duplicate check failed to read {}: {err}",
                        path.display()
                    )));
                }
            }
        }
        pool.shutdown(ShutdownMode::Graceful);
        info!(
            duplicates = log.len()?,
            interrupted = !self.ctx.should_run(),
            "duplicates.checked"
        );
        Ok(log)
    }
}

/// Whether the configured mode runs a check at all.
pub(crate) fn check_enabled(mode: DuplicateMode) -> bool {
    mode != DuplicateMode::Ignore
}
