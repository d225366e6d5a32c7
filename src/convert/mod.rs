//! Conversion stage: turns features into rows.
//!
//! Each [`ConversionWorker`] owns one database connection and one
//! [`StatementBatch`]. A feature becomes one unit of the batch; the batch is
//! committed after `commit_after` top-level features and once more when the
//! worker finishes. Deferred references of a unit reach the registrar only
//! after that unit committed.

mod appearance;
mod feature;
mod geometry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Connection;
use tracing::{debug, error, warn};

use crate::adapter::{SqliteAdapter, StatementBatch};
use crate::cache::{CacheEntry, CacheTag, IdentityCache};
use crate::context::{ImportCounters, RunContext};
use crate::error::ImportError;
use crate::error::Result;
use crate::model::Feature;
use crate::primitives::{Submitter, WorkHandler};
use crate::xlink::DeferredRef;

pub(crate) use appearance::texture_coordinates;
pub(crate) use geometry::{solid_shell_json, PolygonRings};

/// Rows and references produced by one converted feature.
#[derive(Default)]
pub(crate) struct ConvertedUnit {
    refs: Vec<DeferredRef>,
    features: u64,
    top_level: u64,
    geometries: u64,
    classes: Vec<String>,
    /// Cache keys this unit mapped first.
    cache_keys: Vec<String>,
}

/// Borrowed state used while one feature is converted.
pub(crate) struct Converter<'a> {
    adapter: &'a SqliteAdapter,
    cache: &'a IdentityCache,
    batch: &'a mut StatementBatch<ConvertedUnit>,
    unit: &'a mut ConvertedUnit,
    base_dir: &'a Path,
}

impl Converter<'_> {
    fn defer(&mut self, record: DeferredRef) {
        self.unit.refs.push(record);
    }

    /// [`IdentityCache::get_or_create`] that remembers the keys this unit
    /// created, so they can be released if the unit never commits.
    fn claim<F>(&mut self, key: &str, tag: CacheTag, create: F) -> Result<(CacheEntry, bool)>
    where
        F: FnOnce() -> Result<i64>,
    {
        let (entry, created) = self.cache.get_or_create(key, tag, create)?;
        if created {
            self.unit.cache_keys.push(key.to_string());
        }
        Ok((entry, created))
    }
}

/// Pool worker converting features of one input file.
pub struct ConversionWorker {
    index: usize,
    ctx: Arc<RunContext>,
    adapter: Arc<SqliteAdapter>,
    cache: Arc<IdentityCache>,
    conn: Connection,
    registrar: Submitter<Vec<DeferredRef>>,
    batch: StatementBatch<ConvertedUnit>,
    pending_top_level: usize,
    classes: BTreeMap<String, u64>,
    base_dir: PathBuf,
}

impl ConversionWorker {
    /// Opens the worker's connection.
    pub fn new(
        index: usize,
        ctx: Arc<RunContext>,
        adapter: Arc<SqliteAdapter>,
        cache: Arc<IdentityCache>,
        registrar: Submitter<Vec<DeferredRef>>,
        base_dir: PathBuf,
    ) -> Result<Self> {
        let conn = adapter.connect()?;
        Ok(Self {
            index,
            ctx,
            adapter,
            cache,
            conn,
            registrar,
            batch: StatementBatch::new(),
            pending_top_level: 0,
            classes: BTreeMap::new(),
            base_dir,
        })
    }

    fn convert(&mut self, feature: &Feature) -> Result<()> {
        let mut unit = ConvertedUnit::default();
        self.batch.begin_unit(feature.label());
        let mut converter = Converter {
            adapter: &self.adapter,
            cache: &self.cache,
            batch: &mut self.batch,
            unit: &mut unit,
            base_dir: &self.base_dir,
        };
        match converter.feature(feature, None) {
            Ok(_) => {
                self.batch.end_unit(unit);
                Ok(())
            }
            Err(err) => {
                self.batch.discard_unit();
                self.release(&unit.cache_keys);
                Err(err)
            }
        }
    }

    /// Unmaps identifiers of a unit that never reached the database, so later
    /// references to them are deferred and reported instead of pointing at
    /// missing rows.
    fn release(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.cache.remove(key) {
                warn!(worker = self.index, key, error = %err, "convert.cache.release_failed");
            }
        }
        if !keys.is_empty() {
            debug!(worker = self.index, keys = keys.len(), "convert.cache.released");
        }
    }

    /// Hands the deferred references of committed units to the registrar.
    /// After an interrupt they are still offered, so the store can report
    /// them when it is drained.
    fn register(&self, refs: Vec<DeferredRef>) {
        let refused = match self.registrar.hand_over(refs) {
            Ok(()) => return,
            Err(refs) => refs,
        };
        let records = refused.len();
        match self.registrar.offer(refused) {
            Ok(()) => debug!(worker = self.index, records, "convert.xlinks.offered"),
            Err(_) => {
                warn!(worker = self.index, records, "convert.xlinks.lost");
                ImportCounters::add(&self.ctx.counters().xlinks_lost, records as u64);
            }
        }
    }

    fn commit(&mut self) {
        self.pending_top_level = 0;
        if self.batch.is_empty() {
            return;
        }
        let units = self.batch.units();
        let counters = self.ctx.counters();
        match self.batch.execute(&mut self.conn) {
            Ok(outcome) => {
                ImportCounters::add(&counters.batches_committed, 1);
                let mut refs = Vec::new();
                for unit in outcome.committed {
                    ImportCounters::add(&counters.features, unit.features);
                    ImportCounters::add(&counters.top_level_features, unit.top_level);
                    ImportCounters::add(&counters.geometries, unit.geometries);
                    for class in unit.classes {
                        *self.classes.entry(class).or_insert(0) += 1;
                    }
                    refs.extend(unit.refs);
                }
                for failed in &outcome.failed {
                    warn!(gml_id = %failed.label, error = %failed.error, "convert.feature.failed");
                    self.release(&failed.meta.cache_keys);
                }
                ImportCounters::add(&counters.row_errors, outcome.failed.len() as u64);
                debug!(worker = self.index, units, xlinks = refs.len(), "convert.batch.commit");
                if !refs.is_empty() {
                    self.register(refs);
                }
            }
            Err(err) => {
                error!(worker = self.index, units, error = %err, "convert.batch.failed");
                ImportCounters::add(&counters.row_errors, units as u64);
            }
        }
    }
}

impl WorkHandler<Feature> for ConversionWorker {
    fn handle(&mut self, feature: Feature) {
        if !self.ctx.should_run() {
            return;
        }
        match self.convert(&feature) {
            Ok(()) => {
                if feature.top_level {
                    self.pending_top_level += 1;
                }
            }
            Err(err) if err.is_fatal() => self.ctx.fail(err),
            Err(err) => {
                warn!(gml_id = feature.label(), error = %err, "convert.feature.failed");
                ImportCounters::add(&self.ctx.counters().row_errors, 1);
            }
        }
        if self.pending_top_level >= self.ctx.config().commit_after {
            self.commit();
        }
    }

    fn finish(&mut self, interrupted: bool) {
        self.commit();
        self.ctx.counters().merge_classes(&mut self.classes);
        debug!(worker = self.index, interrupted, "convert.worker.finish");
    }
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn flag(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

fn invalid(message: impl Into<String>) -> ImportError {
    ImportError::Invalid(message.into())
}
