//! Per-category resolvers and the pool worker that drives them.
//!
//! A resolver looks the target of a deferred reference up in the identity
//! cache and buffers the statements that rewrite it. Every record is one
//! unit of the worker's [`StatementBatch`], which is staged into the open
//! category transaction once it reaches the configured batch size or when
//! the queue runs dry. The transaction commits when the sweep leaves the
//! category.

mod appearance;
mod basic;
mod geometry;
mod group;
mod solid;

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, error, warn};

use crate::adapter::{BatchOutcome, SqliteAdapter, Sequences, StatementBatch};
use crate::cache::IdentityCache;
use crate::context::{ImportCounters, RunContext};
use crate::error::{ImportError, Result};
use crate::primitives::{Submitter, WorkHandler};
use crate::xlink::{append_records, Category, DeferredRef, DeferredStore, StoreReader};

pub use appearance::{
    MaterialResolver, TexCoordListResolver, TextureAssociationResolver, TextureImageResolver,
    TextureParamResolver,
};
pub use basic::BasicResolver;
pub use geometry::SurfaceGeometryResolver;
pub use group::GroupMemberResolver;
pub use solid::SolidGeometryResolver;

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Statements were buffered; the record is consumed.
    Resolved,
    /// The target depends on a record of the current snapshot; try again in
    /// the next pass.
    Retry,
    /// The target is unknown within this import.
    Dangling,
}

/// Borrowed state a resolver works with.
pub struct ResolveCx<'a> {
    /// Worker's connection to the target database, for reads.
    pub conn: &'a Connection,
    /// Identity cache of the run.
    pub cache: &'a IdentityCache,
    /// Reader over the snapshot currently being resolved.
    pub store: &'a StoreReader,
    /// Id generators of the target database.
    pub sequences: &'a Sequences,
    /// Batch receiving the statements of the current record.
    pub batch: &'a mut StatementBatch<ResolvedUnit>,
    /// Records discovered while resolving; registered after commit.
    pub reinject: &'a mut Vec<DeferredRef>,
}

/// Resolver of one category.
pub trait Resolver: Send {
    /// Category handled by this resolver.
    fn category(&self) -> Category;

    /// Buffers the statements rewriting `record`.
    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution>;
}

/// Builds the resolver of `category`.
pub fn resolver_for(category: Category) -> Box<dyn Resolver> {
    match category {
        Category::Basic => Box::new(BasicResolver),
        Category::GroupMember => Box::new(GroupMemberResolver),
        Category::TextureImage => Box::new(TextureImageResolver),
        Category::TextureCoordList => Box::new(TexCoordListResolver),
        Category::TextureParam => Box::new(TextureParamResolver),
        Category::TextureAssociation => Box::new(TextureAssociationResolver),
        Category::DeprecatedMaterial => Box::new(MaterialResolver),
        Category::SurfaceGeometry => Box::new(SurfaceGeometryResolver),
        Category::SolidGeometry => Box::new(SolidGeometryResolver),
    }
}

/// Metadata of one resolved record.
pub struct ResolvedUnit {
    category: Category,
    reinject: Vec<DeferredRef>,
}

fn mismatch(expected: Category, record: &DeferredRef) -> ImportError {
    ImportError::Invalid(format!(
        "{expected} resolver received a {} record",
        record.category()
    ))
}

/// Work handed to the resolver worker by the sweep.
#[derive(Debug)]
pub enum ResolverTask {
    /// Snapshot chunk to resolve inside the open category transaction.
    Resolve(Vec<DeferredRef>),
    /// Every pass of the category finished; its writes become durable.
    Commit(Category),
}

/// Pool worker resolving snapshot chunks of whatever category the sweep is in.
///
/// All writes of a category go through one transaction on the worker's
/// connection, so later passes read what earlier passes wrote and an
/// interrupt leaves the category untouched. SQLite admits a single writer,
/// which is why the sweep runs one such worker.
pub struct ResolverWorker {
    index: usize,
    ctx: Arc<RunContext>,
    adapter: Arc<SqliteAdapter>,
    cache: Arc<IdentityCache>,
    conn: Connection,
    store_conn: Connection,
    reader: StoreReader,
    registrar: Submitter<Vec<DeferredRef>>,
    batch: StatementBatch<ResolvedUnit>,
    retry: Vec<DeferredRef>,
    staged: u64,
    discovered: Vec<DeferredRef>,
    resolvers: HashMap<Category, Box<dyn Resolver>>,
    batch_size: usize,
}

impl ResolverWorker {
    /// Opens the worker's target and store connections.
    pub fn new(
        index: usize,
        ctx: Arc<RunContext>,
        adapter: Arc<SqliteAdapter>,
        cache: Arc<IdentityCache>,
        store: &DeferredStore,
        registrar: Submitter<Vec<DeferredRef>>,
    ) -> Result<Self> {
        let batch_size = ctx
            .config()
            .resolver_batch_size
            .min(adapter.max_batch_size())
            .max(1);
        Ok(Self {
            index,
            conn: adapter.connect()?,
            store_conn: store.connect()?,
            reader: store.reader()?,
            ctx,
            adapter,
            cache,
            registrar,
            batch: StatementBatch::new(),
            retry: Vec::new(),
            staged: 0,
            discovered: Vec::new(),
            resolvers: HashMap::new(),
            batch_size,
        })
    }

    fn resolve(&mut self, record: DeferredRef) {
        let category = record.category();
        let counters = self.ctx.counters();
        self.batch
            .begin_unit(format!("{category}:{}", record.target()));
        let mut reinject = Vec::new();
        let resolver = self
            .resolvers
            .entry(category)
            .or_insert_with(|| resolver_for(category));
        debug_assert_eq!(resolver.category(), category);
        let outcome = {
            let mut cx = ResolveCx {
                conn: &self.conn,
                cache: &self.cache,
                store: &self.reader,
                sequences: self.adapter.sequences(),
                batch: &mut self.batch,
                reinject: &mut reinject,
            };
            resolver.resolve(&record, &mut cx)
        };
        match outcome {
            Ok(Resolution::Resolved) => self.batch.end_unit(ResolvedUnit { category, reinject }),
            Ok(Resolution::Retry) => {
                self.batch.discard_unit();
                self.retry.push(record);
            }
            Ok(Resolution::Dangling) => {
                self.batch.discard_unit();
                warn!(%category, target = record.target(), "xlink.dangling");
                ImportCounters::add(&counters.xlinks_dangling, 1);
            }
            Err(err) if err.is_fatal() => {
                self.batch.discard_unit();
                self.ctx.fail(err);
            }
            Err(err) => {
                self.batch.discard_unit();
                warn!(%category, target = record.target(), error = %err, "xlink.resolve.failed");
                ImportCounters::add(&counters.row_errors, 1);
            }
        }
    }

    /// Executes the buffered units inside the category transaction, opening
    /// it on first use, and requeues records deferred to the next pass.
    fn flush(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let counters = ctx.counters();
        if !self.batch.is_empty() {
            let units = self.batch.units();
            match self.stage() {
                Ok(outcome) => {
                    self.staged += outcome.committed.len() as u64;
                    for failed in &outcome.failed {
                        warn!(record = %failed.label, error = %failed.error, "xlink.resolve.failed");
                    }
                    ImportCounters::add(&counters.row_errors, outcome.failed.len() as u64);
                    for unit in outcome.committed {
                        if !unit.reinject.is_empty() {
                            debug!(category = %unit.category, records = unit.reinject.len(), "xlink.reinject");
                        }
                        self.discovered.extend(unit.reinject);
                    }
                    debug!(worker = self.index, units, "xlink.resolver.stage");
                }
                Err(err) => {
                    error!(worker = self.index, units, error = %err, "xlink.resolver.batch_failed");
                    ImportCounters::add(&counters.row_errors, units as u64);
                }
            }
        }
        if !self.retry.is_empty() {
            let retry = std::mem::take(&mut self.retry);
            if let Err(err) = append_records(&mut self.store_conn, &retry) {
                self.ctx.fail(ImportError::stop(format!(
                    "failed to requeue {} deferred references: {err}",
                    retry.len()
                )));
            }
        }
    }

    fn stage(&mut self) -> Result<BatchOutcome<ResolvedUnit>> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        self.batch.execute_staged(&self.conn)
    }

    /// Commits the category transaction and hands the records it revealed
    /// to the registrar.
    fn commit(&mut self, category: Category) {
        self.flush();
        if self.conn.is_autocommit() {
            return;
        }
        let resolved = std::mem::take(&mut self.staged);
        let discovered = std::mem::take(&mut self.discovered);
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            self.rollback();
            self.ctx.fail(ImportError::stop(format!(
                "failed to commit {resolved} resolved {category} references: {err}"
            )));
            return;
        }
        ImportCounters::add(&self.ctx.counters().xlinks_resolved, resolved);
        debug!(worker = self.index, %category, resolved, "xlink.resolver.commit");
        if !discovered.is_empty() {
            let records = discovered.len();
            if let Err(err) = self.registrar.submit(discovered) {
                warn!(worker = self.index, records, error = %err, "xlink.reinject.lost");
            }
        }
    }

    /// Drops everything staged for the current category.
    fn rollback(&mut self) -> u64 {
        let dropped = std::mem::take(&mut self.staged) + self.batch.units() as u64;
        self.batch.clear();
        self.retry.clear();
        self.discovered.clear();
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                error!(worker = self.index, error = %err, "xlink.resolver.rollback_failed");
            }
        }
        dropped
    }
}

impl WorkHandler<ResolverTask> for ResolverWorker {
    fn handle(&mut self, task: ResolverTask) {
        let records = match task {
            ResolverTask::Resolve(records) => records,
            ResolverTask::Commit(category) => {
                if self.ctx.should_run() {
                    self.commit(category);
                }
                return;
            }
        };
        for record in records {
            if !self.ctx.should_run() {
                return;
            }
            self.resolve(record);
            if self.batch.units() >= self.batch_size {
                self.flush();
            }
        }
    }

    fn idle(&mut self) {
        self.flush();
    }

    fn finish(&mut self, interrupted: bool) {
        let uncommitted = !self.conn.is_autocommit();
        let dropped = self.rollback();
        if interrupted {
            debug!(worker = self.index, dropped, "xlink.resolver.rollback");
        } else if uncommitted {
            warn!(worker = self.index, dropped, "xlink.resolver.uncommitted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheTag};
    use crate::config::ImporterConfig;
    use crate::primitives::WorkerPool;
    use crate::xlink::BasicLink;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Arc<RunContext>,
        adapter: Arc<SqliteAdapter>,
        cache: Arc<IdentityCache>,
        store: DeferredStore,
        registrar: WorkerPool<Vec<DeferredRef>>,
    }

    impl Fixture {
        fn new(buildings: i64) -> Result<Self> {
            let dir = tempdir()?;
            let mut config = ImporterConfig::for_database(dir.path().join("city.db"));
            config.cache.spill_dir = Some(dir.path().join("spill"));
            config.xlink.store_dir = Some(dir.path().join("xlinks"));
            config.resolver_batch_size = 1;
            let ctx = Arc::new(RunContext::new(config.clone()));
            let adapter = Arc::new(SqliteAdapter::open(&config)?);
            let cache = Arc::new(IdentityCache::new(&config.cache)?);
            let conn = adapter.connect()?;
            for i in 1..=buildings {
                let address = 1000 + i;
                conn.execute(
                    "INSERT INTO feature (id, gmlid, objectclass, toplevel) VALUES (?1, ?2, 'Building', 1)",
                    rusqlite::params![i, format!("bldg_{i}")],
                )?;
                conn.execute(
                    "INSERT INTO feature (id, gmlid, objectclass, toplevel) VALUES (?1, ?2, 'Address', 1)",
                    rusqlite::params![address, format!("addr_{i}")],
                )?;
                cache.insert_if_absent(
                    &format!("addr_{i}"),
                    CacheEntry {
                        id: address,
                        tag: CacheTag::Feature,
                    },
                )?;
            }
            let registrar = WorkerPool::new(
                "registrar",
                Arc::clone(&ctx),
                1,
                1,
                4,
                Box::new(|_| Err(ImportError::Invalid("not started".into()))),
            );
            Ok(Self {
                store: DeferredStore::create(&config)?,
                _dir: dir,
                ctx,
                adapter,
                cache,
                registrar,
            })
        }

        fn worker(&self) -> Result<ResolverWorker> {
            ResolverWorker::new(
                0,
                Arc::clone(&self.ctx),
                Arc::clone(&self.adapter),
                Arc::clone(&self.cache),
                &self.store,
                self.registrar.submitter(),
            )
        }

        fn links(buildings: i64) -> Vec<DeferredRef> {
            (1..=buildings)
                .map(|i| {
                    DeferredRef::Basic(BasicLink {
                        table: "feature".into(),
                        id: i,
                        from_column: None,
                        to_column: "address_id".into(),
                        role: None,
                        reverse: false,
                        target: format!("addr_{i}"),
                    })
                })
                .collect()
        }

        fn linked(&self) -> Result<i64> {
            let conn = self.adapter.connect()?;
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM feature WHERE address_id IS NOT NULL",
                [],
                |row| row.get(0),
            )?)
        }
    }

    #[test]
    fn category_is_invisible_until_committed() -> Result<()> {
        let fixture = Fixture::new(25)?;
        let mut worker = fixture.worker()?;
        worker.handle(ResolverTask::Resolve(Fixture::links(25)));
        worker.idle();
        assert_eq!(fixture.linked()?, 0);

        worker.handle(ResolverTask::Commit(Category::Basic));
        assert_eq!(fixture.linked()?, 25);
        assert_eq!(fixture.ctx.counters().snapshot().xlinks_resolved, 25);
        worker.finish(false);
        Ok(())
    }

    #[test]
    fn interrupted_category_leaves_no_partial_writes() -> Result<()> {
        let fixture = Fixture::new(40)?;
        let mut worker = fixture.worker()?;
        let mut links = Fixture::links(40);
        let rest = links.split_off(30);
        worker.handle(ResolverTask::Resolve(links));
        worker.idle();

        fixture.ctx.interrupt();
        worker.handle(ResolverTask::Resolve(rest));
        worker.finish(true);

        assert_eq!(fixture.linked()?, 0);
        assert_eq!(fixture.ctx.counters().snapshot().xlinks_resolved, 0);
        // The write lock is released again.
        let mut next = fixture.worker()?;
        next.conn.execute_batch("BEGIN IMMEDIATE; COMMIT")?;
        next.finish(false);
        Ok(())
    }
}
