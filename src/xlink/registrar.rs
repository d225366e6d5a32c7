use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, error};

use super::store::append_records;
use super::{DeferredRef, DeferredStore};
use crate::context::{ImportCounters, RunContext};
use crate::error::{ImportError, Result};
use crate::primitives::WorkHandler;

/// Records buffered before the registrar writes without waiting for idle.
const FLUSH_THRESHOLD: usize = 1_000;

/// Single-writer stage that moves deferred references produced by
/// conversion and resolver workers into the [`DeferredStore`].
///
/// Producers only hand over records belonging to committed work, so a
/// rolled back batch never leaves records behind. The registrar always
/// flushes what it took, including on interrupt; what is still queued then
/// is parked in the store by the importer.
pub struct Registrar {
    ctx: Arc<RunContext>,
    conn: Connection,
    pending: Vec<DeferredRef>,
}

impl Registrar {
    /// Opens a dedicated store connection.
    pub fn new(ctx: Arc<RunContext>, store: &DeferredStore) -> Result<Self> {
        Ok(Self {
            ctx,
            conn: store.connect()?,
            pending: Vec::new(),
        })
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.pending);
        match append_records(&mut self.conn, &records) {
            Ok(written) => {
                ImportCounters::add(&self.ctx.counters().xlinks_registered, written as u64);
                debug!(written, "xlink.registrar.flush");
            }
            Err(err) => {
                error!(lost = records.len(), error = %err, "xlink.registrar.flush_failed");
                self.ctx.fail(ImportError::stop(format!(
                    "failed to register deferred references: {err}"
                )));
            }
        }
    }
}

impl WorkHandler<Vec<DeferredRef>> for Registrar {
    fn handle(&mut self, records: Vec<DeferredRef>) {
        self.pending.extend(records);
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush();
        }
    }

    fn idle(&mut self) {
        self.flush();
    }

    fn finish(&mut self, _interrupted: bool) {
        self.flush();
    }
}
