//! Pipeline orchestrator.
//!
//! Per input file the importer streams features through the conversion
//! pool, waits for the deferred references of committed work to reach the
//! store, runs the resolution sweep and resets the per-file state. Indexes
//! can be dropped for the duration of the run and are rebuilt at the end,
//! whatever the outcome.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapter::{ReferenceMapping, SqliteAdapter};
use crate::cache::IdentityCache;
use crate::config::{DuplicateMode, ImporterConfig};
use crate::context::{CounterSnapshot, ImportCounters, InterruptHandle, ProgressEvent, RunContext, RunState};
use crate::convert::ConversionWorker;
use crate::duplicate::{check_enabled, DuplicateChecker, DuplicateLog, DuplicateReport, SkipList};
use crate::error::{ImportError, Result};
use crate::model::Feature;
use crate::primitives::{ShutdownMode, WorkHandler, WorkerPool};
use crate::reader::{FeatureReader, JsonLinesReader};
use crate::resolver::{ResolverTask, ResolverWorker};
use crate::splitter::ResolutionSplitter;
use crate::xlink::{Category, DeferredRef, DeferredStore, Registrar};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every file was processed without interrupt or fatal error.
    Done,
    /// An interrupt was observed; committed work stands.
    Aborted,
    /// A fatal error stopped the run.
    Failed,
}

/// Result of [`Importer::run`].
#[derive(Debug)]
pub struct Outcome {
    /// Terminal state.
    pub state: RunOutcome,
    /// Final counters.
    pub counters: CounterSnapshot,
    /// First fatal error; later ones were logged and suppressed.
    pub error: Option<ImportError>,
    /// Duplicate handling, when a check ran.
    pub duplicates: Option<DuplicateReport>,
}

impl Outcome {
    /// Whether the run reached [`RunOutcome::Done`].
    pub fn success(&self) -> bool {
        self.state == RunOutcome::Done
    }
}

/// Imports feature documents into the configured database.
pub struct Importer {
    ctx: Arc<RunContext>,
    reader: Box<dyn FeatureReader>,
    mapping: ReferenceMapping,
}

impl Importer {
    /// Validates `config` and prepares a run.
    pub fn new(config: ImporterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: Arc::new(RunContext::new(config)),
            reader: Box::new(JsonLinesReader),
            mapping: ReferenceMapping::default(),
        })
    }

    /// Replaces the document reader.
    pub fn with_reader(mut self, reader: impl FeatureReader + 'static) -> Self {
        self.reader = Box::new(reader);
        self
    }

    /// Replaces the role-to-column mapping of feature references.
    pub fn with_mapping(mut self, mapping: ReferenceMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Handle to interrupt the run from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.ctx))
    }

    /// Subscribes to progress events of the run. The channel closes when the
    /// run ends.
    pub fn progress(&self) -> Receiver<ProgressEvent> {
        let (sender, receiver) = mpsc::channel();
        self.ctx.set_progress(Some(sender));
        receiver
    }

    /// Runs only the duplicate check over `inputs`.
    pub fn check_duplicates(&mut self, inputs: &[PathBuf]) -> Result<DuplicateLog> {
        let files = collect_inputs(inputs)?;
        let adapter = Arc::new(SqliteAdapter::open(self.ctx.config())?);
        DuplicateChecker::new(Arc::clone(&self.ctx), adapter).check(self.reader.as_mut(), &files)
    }

    /// Imports `inputs`; directories contribute their regular files in name order.
    pub fn run(mut self, inputs: &[PathBuf]) -> Outcome {
        let mut duplicates = None;
        if let Err(err) = self.run_inner(inputs, &mut duplicates) {
            self.ctx.fail(err);
        }
        self.ctx.set_progress(None);

        let state = match self.ctx.state() {
            RunState::Running => RunOutcome::Done,
            RunState::Interrupted => RunOutcome::Aborted,
            RunState::Failed => RunOutcome::Failed,
        };
        let counters = self.ctx.counters().snapshot();
        info!(
            ?state,
            features = counters.features,
            xlinks_resolved = counters.xlinks_resolved,
            xlinks_dangling = counters.xlinks_dangling,
            "import.finished"
        );
        Outcome {
            state,
            counters,
            error: self.ctx.take_fatal(),
            duplicates,
        }
    }

    fn run_inner(&mut self, inputs: &[PathBuf], duplicates: &mut Option<DuplicateReport>) -> Result<()> {
        let files = collect_inputs(inputs)?;
        let counters = self.ctx.counters();
        ImportCounters::add(&counters.files_total, files.len() as u64);

        let adapter = Arc::new(
            SqliteAdapter::open(self.ctx.config())
                .map_err(|err| ImportError::stop(format!("cannot open target database: {err}")))?
                .with_mapping(self.mapping.clone()),
        );

        let mut skip_list = None;
        let mode = self.ctx.config().duplicates.mode;
        if check_enabled(mode) {
            let log = DuplicateChecker::new(Arc::clone(&self.ctx), Arc::clone(&adapter))
                .check(self.reader.as_mut(), &files)?;
            if !self.ctx.should_run() {
                return Ok(());
            }
            let found = log.len()?;
            let mut deleted = 0;
            if found > 0 {
                match mode {
                    DuplicateMode::Skip => skip_list = Some(log.to_skip_list()),
                    DuplicateMode::Delete => deleted = log.delete(&adapter)?,
                    DuplicateMode::Ignore => {}
                }
            }
            *duplicates = Some(DuplicateReport { mode, found, deleted });
        }

        let deactivated = self.ctx.config().indexes.deactivate_during_import;
        if deactivated {
            adapter.deactivate_indexes()?;
        }
        let result = self.import_files(&files, &adapter, skip_list.as_ref());
        if deactivated {
            if let Err(err) = adapter.activate_indexes() {
                error!(error = %err, "import.indexes.reactivate_failed");
                result?;
                return Err(ImportError::stop(format!("failed to rebuild indexes: {err}")));
            }
        }
        result
    }

    fn import_files(&mut self, files: &[PathBuf], adapter: &Arc<SqliteAdapter>, skip_list: Option<&SkipList>) -> Result<()> {
        let config = self.ctx.config();
        let cache = Arc::new(
            IdentityCache::new(&config.cache)
                .map_err(|err| ImportError::stop(format!("cannot create identity cache: {err}")))?,
        );
        let store = Arc::new(
            DeferredStore::create(config)
                .map_err(|err| ImportError::stop(format!("cannot create xlink store: {err}")))?,
        );
        let mut submitted = 0u64;

        for (index, path) in files.iter().enumerate() {
            if !self.ctx.should_run() || limit_reached(config.limits.max_features, submitted) {
                break;
            }
            self.ctx.emit(ProgressEvent::FileStarted {
                path: path.clone(),
                index,
                total: files.len(),
            });
            info!(path = %path.display(), index, total = files.len(), "import.file.start");

            let file = FileImport {
                ctx: &self.ctx,
                adapter,
                cache: &cache,
                store: &store,
                skip_list,
            };
            let result = file.run(self.reader.as_mut(), path, &mut submitted);

            let reset = if self.ctx.should_run() {
                store.reset()
            } else {
                drain(&store)
            };
            cache.clear()?;
            reset?;
            result?;

            ImportCounters::add(&self.ctx.counters().files_done, 1);
            self.ctx.emit(ProgressEvent::FileFinished { path: path.clone() });
            info!(path = %path.display(), "import.file.finish");
        }
        Ok(())
    }
}

/// Resources shared by the stages of one file.
struct FileImport<'a> {
    ctx: &'a Arc<RunContext>,
    adapter: &'a Arc<SqliteAdapter>,
    cache: &'a Arc<IdentityCache>,
    store: &'a Arc<DeferredStore>,
    skip_list: Option<&'a SkipList>,
}

impl FileImport<'_> {
    fn run(&self, reader: &mut dyn FeatureReader, path: &Path, submitted: &mut u64) -> Result<()> {
        let config = self.ctx.config();
        let registrar = self.registrar_pool();
        registrar.prestart()?;

        let convert = self.conversion_pool(&registrar, path);
        convert.prestart()?;

        let counters = self.ctx.counters();
        let limit = config.limits.max_features;
        let read = reader.read(path, &mut |feature: Feature| {
            if feature.top_level {
                if limit_reached(limit, *submitted) {
                    return Err(ImportError::Interrupted);
                }
                if let (Some(skip), Some(gml_id)) = (self.skip_list, feature.gml_id.as_deref()) {
                    if skip.contains(gml_id)? {
                        debug!(gml_id, "import.feature.skipped");
                        ImportCounters::add(&counters.skipped_duplicates, 1);
                        return Ok(());
                    }
                }
                *submitted += 1;
            }
            convert.submit(feature)
        });
        match &read {
            Ok(summary) => ImportCounters::add(&counters.validation_errors, summary.validation_errors),
            Err(err) => error!(path = %path.display(), error = %err, "import.file.read_failed"),
        }

        convert.shutdown(ShutdownMode::Graceful);
        if !registrar.join() {
            registrar.shutdown(ShutdownMode::Graceful);
            self.park(&registrar);
            return Ok(());
        }

        let resolved = self.resolve(&registrar);
        registrar.shutdown(ShutdownMode::Graceful);
        self.park(&registrar);
        read.map_err(|err| ImportError::stop(format!("failed to read {}: {err}", path.display())))?;
        resolved
    }

    /// Moves references the registrar never took into the store, so that
    /// draining the store after an interrupt accounts for them.
    fn park(&self, registrar: &WorkerPool<Vec<DeferredRef>>) {
        let records: Vec<DeferredRef> = registrar.take_pending().into_iter().flatten().collect();
        if records.is_empty() {
            return;
        }
        let counters = self.ctx.counters();
        match self.store.append(&records) {
            Ok(written) => {
                ImportCounters::add(&counters.xlinks_registered, written as u64);
                debug!(written, "xlink.registrar.parked");
            }
            Err(err) => {
                warn!(records = records.len(), error = %err, "xlink.registrar.lost");
                ImportCounters::add(&counters.xlinks_lost, records.len() as u64);
            }
        }
    }

    fn resolve(&self, registrar: &WorkerPool<Vec<DeferredRef>>) -> Result<()> {
        if !self.ctx.should_run() {
            return Ok(());
        }
        let resolvers = self.resolver_pool(registrar);
        resolvers.prestart()?;
        let swept = ResolutionSplitter::new(Arc::clone(self.ctx), self.store, &resolvers, registrar).run();
        resolvers.shutdown(ShutdownMode::Graceful);
        swept
    }

    fn registrar_pool(&self) -> WorkerPool<Vec<DeferredRef>> {
        let ctx = Arc::clone(self.ctx);
        let store = Arc::clone(self.store);
        WorkerPool::new(
            "xlink-registrar",
            Arc::clone(self.ctx),
            1,
            1,
            self.ctx.config().queue_capacity(),
            Box::new(move |_| {
                Ok(Box::new(Registrar::new(Arc::clone(&ctx), &store)?) as Box<dyn WorkHandler<Vec<DeferredRef>>>)
            }),
        )
    }

    fn conversion_pool(&self, registrar: &WorkerPool<Vec<DeferredRef>>, path: &Path) -> WorkerPool<Feature> {
        let config = self.ctx.config();
        let ctx = Arc::clone(self.ctx);
        let adapter = Arc::clone(self.adapter);
        let cache = Arc::clone(self.cache);
        let submitter = registrar.submitter();
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        WorkerPool::new(
            "convert",
            Arc::clone(self.ctx),
            config.workers.min,
            config.workers.max,
            config.queue_capacity(),
            Box::new(move |index| {
                Ok(Box::new(ConversionWorker::new(
                    index,
                    Arc::clone(&ctx),
                    Arc::clone(&adapter),
                    Arc::clone(&cache),
                    submitter.clone(),
                    base_dir.clone(),
                )?) as Box<dyn WorkHandler<Feature>>)
            }),
        )
    }

    /// One resolver: the category transaction is the database's only writer.
    fn resolver_pool(&self, registrar: &WorkerPool<Vec<DeferredRef>>) -> WorkerPool<ResolverTask> {
        let config = self.ctx.config();
        let ctx = Arc::clone(self.ctx);
        let adapter = Arc::clone(self.adapter);
        let cache = Arc::clone(self.cache);
        let store = Arc::clone(self.store);
        let submitter = registrar.submitter();
        WorkerPool::new(
            "xlink-resolver",
            Arc::clone(self.ctx),
            1,
            1,
            config.queue_capacity(),
            Box::new(move |index| {
                Ok(Box::new(ResolverWorker::new(
                    index,
                    Arc::clone(&ctx),
                    Arc::clone(&adapter),
                    Arc::clone(&cache),
                    &store,
                    submitter.clone(),
                )?) as Box<dyn WorkHandler<ResolverTask>>)
            }),
        )
    }
}

fn limit_reached(limit: Option<u64>, submitted: u64) -> bool {
    limit.is_some_and(|max| submitted >= max)
}

/// Logs what an interrupted file left unresolved, then empties the store.
fn drain(store: &DeferredStore) -> Result<()> {
    for category in Category::SWEEP_ORDER {
        let pending = store.pending(category)?;
        if pending > 0 {
            warn!(%category, pending, "xlink.store.drained");
        }
    }
    store.reset()
}

/// Expands `inputs` into the list of files to import.
///
/// A missing input is fatal: the run cannot know what it was meant to import.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let metadata = std::fs::metadata(input)
            .map_err(|err| ImportError::stop(format!("cannot read input {}: {err}", input.display())))?;
        if !metadata.is_dir() {
            files.push(input.clone());
            continue;
        }
        let mut entries = Vec::new();
        let listing = std::fs::read_dir(input)
            .map_err(|err| ImportError::stop(format!("cannot list {}: {err}", input.display())))?;
        for entry in listing {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();
        files.extend(entries);
    }
    Ok(files)
}
