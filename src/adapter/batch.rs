use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{ImportError, Result};

struct Statement {
    sql: String,
    params: Vec<Value>,
}

struct Unit<M> {
    label: String,
    statements: Vec<Statement>,
    meta: M,
}

/// A unit whose statements were rolled back.
pub struct FailedUnit<M> {
    /// Label given to [`StatementBatch::begin_unit`].
    pub label: String,
    /// Metadata given to [`StatementBatch::end_unit`].
    pub meta: M,
    /// Cause of the rollback.
    pub error: ImportError,
}

/// Result of executing a [`StatementBatch`].
pub struct BatchOutcome<M> {
    /// Metadata of every unit whose statements were committed.
    pub committed: Vec<M>,
    /// Every unit that was rolled back.
    pub failed: Vec<FailedUnit<M>>,
}

/// Statements buffered per unit of work and executed in one transaction.
///
/// A unit is the smallest piece that may fail on its own: one top-level
/// feature during conversion, one deferred reference during resolution.
/// Statements are prepared through the connection's statement cache, so
/// every distinct (table, columns) shape is prepared once per connection.
pub struct StatementBatch<M> {
    units: Vec<Unit<M>>,
    open: Option<(String, Vec<Statement>)>,
}

impl<M> Default for StatementBatch<M> {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            open: None,
        }
    }
}

impl<M> StatementBatch<M> {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of closed units.
    pub fn units(&self) -> usize {
        self.units.len()
    }

    /// Whether no unit is buffered.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Starts a unit labelled `label`, discarding an unfinished one.
    pub fn begin_unit(&mut self, label: impl Into<String>) {
        self.open = Some((label.into(), Vec::new()));
    }

    /// Closes the open unit with its metadata.
    pub fn end_unit(&mut self, meta: M) {
        if let Some((label, statements)) = self.open.take() {
            self.units.push(Unit {
                label,
                statements,
                meta,
            });
        }
    }

    /// Drops the open unit and its statements.
    pub fn discard_unit(&mut self) {
        self.open = None;
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.units.clear();
        self.open = None;
    }

    /// Buffers a raw statement in the open unit.
    pub fn push(&mut self, sql: impl Into<String>, params: Vec<Value>) -> Result<()> {
        match self.open.as_mut() {
            Some((_, statements)) => {
                statements.push(Statement {
                    sql: sql.into(),
                    params,
                });
                Ok(())
            }
            None => Err(ImportError::Invalid(
                "statement pushed outside of a unit".into(),
            )),
        }
    }

    /// Buffers an insert of `values` into `columns` of `table`.
    pub fn insert(&mut self, table: &str, columns: &[&str], values: Vec<Value>) -> Result<()> {
        if columns.len() != values.len() {
            return Err(ImportError::Invalid(format!(
                "{} values for {} columns of {table}",
                values.len(),
                columns.len()
            )));
        }
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.push(sql, values)
    }

    /// Executes every closed unit in one immediate transaction.
    ///
    /// When the transaction fails, it is rolled back and each unit is replayed
    /// inside its own savepoint so a single bad unit does not take the
    /// others down with it.
    pub fn execute(&mut self, conn: &mut Connection) -> Result<BatchOutcome<M>> {
        self.open = None;
        let units = std::mem::take(&mut self.units);
        if units.is_empty() {
            return Ok(BatchOutcome {
                committed: Vec::new(),
                failed: Vec::new(),
            });
        }

        let first_attempt = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            match units.iter().try_for_each(|unit| run_unit(&tx, unit)) {
                Ok(()) => tx.commit().map_err(ImportError::from),
                Err(err) => Err(err),
            }
        };
        match first_attempt {
            Ok(()) => {
                debug!(units = units.len(), "adapter.batch.commit");
                Ok(BatchOutcome {
                    committed: units.into_iter().map(|unit| unit.meta).collect(),
                    failed: Vec::new(),
                })
            }
            Err(err) => {
                warn!(units = units.len(), error = %err, "adapter.batch.replay");
                replay(conn, units)
            }
        }
    }
}

impl<M> StatementBatch<M> {
    /// Executes every closed unit inside the transaction already open on
    /// `conn`, without committing it.
    ///
    /// Units run under one savepoint; on failure the savepoint is rolled
    /// back and each unit is replayed under its own, so the caller's
    /// transaction only ever holds whole units.
    pub fn execute_staged(&mut self, conn: &Connection) -> Result<BatchOutcome<M>> {
        self.open = None;
        let units = std::mem::take(&mut self.units);
        if conn.is_autocommit() {
            return Err(ImportError::Invalid(
                "staged batch executed outside of a transaction".into(),
            ));
        }
        if units.is_empty() {
            return Ok(BatchOutcome {
                committed: Vec::new(),
                failed: Vec::new(),
            });
        }
        let whole = within_savepoint(conn, "staged_batch", || {
            units.iter().try_for_each(|unit| run_statements(conn, &unit.statements))
        });
        if whole.is_ok() {
            return Ok(BatchOutcome {
                committed: units.into_iter().map(|unit| unit.meta).collect(),
                failed: Vec::new(),
            });
        }

        let mut committed = Vec::new();
        let mut failed = Vec::new();
        for unit in units {
            match within_savepoint(conn, "staged_unit", || run_statements(conn, &unit.statements)) {
                Ok(()) => committed.push(unit.meta),
                Err(error) => failed.push(FailedUnit {
                    label: unit.label,
                    meta: unit.meta,
                    error,
                }),
            }
        }
        debug!(
            staged = committed.len(),
            failed = failed.len(),
            "adapter.batch.staged_replay"
        );
        Ok(BatchOutcome { committed, failed })
    }
}

fn within_savepoint(conn: &Connection, name: &str, body: impl FnOnce() -> Result<()>) -> Result<()> {
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match body() {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE {name}"))?;
            Ok(())
        }
        Err(err) => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
            Err(err)
        }
    }
}

fn run_statements(conn: &Connection, statements: &[Statement]) -> Result<()> {
    for statement in statements {
        let mut stmt = conn.prepare_cached(&statement.sql)?;
        stmt.execute(params_from_iter(statement.params.iter()))?;
    }
    Ok(())
}

fn run_unit<M>(tx: &Transaction<'_>, unit: &Unit<M>) -> Result<()> {
    for statement in &unit.statements {
        let mut stmt = tx.prepare_cached(&statement.sql)?;
        stmt.execute(params_from_iter(statement.params.iter()))?;
    }
    Ok(())
}

fn replay<M>(conn: &mut Connection, units: Vec<Unit<M>>) -> Result<BatchOutcome<M>> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut committed = Vec::new();
    let mut failed = Vec::new();
    for unit in units {
        let sp = tx.savepoint()?;
        let result = unit.statements.iter().try_for_each(|statement| {
            let mut stmt = sp.prepare_cached(&statement.sql)?;
            stmt.execute(params_from_iter(statement.params.iter()))?;
            Ok::<_, ImportError>(())
        });
        match result {
            Ok(()) => {
                sp.commit()?;
                committed.push(unit.meta);
            }
            Err(error) => {
                drop(sp);
                failed.push(FailedUnit {
                    label: unit.label,
                    meta: unit.meta,
                    error,
                });
            }
        }
    }
    tx.commit()?;
    debug!(
        committed = committed.len(),
        failed = failed.len(),
        "adapter.batch.replay_commit"
    );
    Ok(BatchOutcome { committed, failed })
}

/// Accepts plain SQL identifiers only (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(ImportError::Invalid(format!("invalid SQL identifier '{name}'")))
    }
}
