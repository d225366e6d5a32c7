//! Run-scoped state handed to every pipeline component.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ImporterConfig;
use crate::error::ImportError;
use crate::xlink::Category;

const STATE_RUNNING: u8 = 0;
const STATE_INTERRUPTED: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Lifecycle of a run as seen by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Work continues.
    Running,
    /// A user interrupt was observed; committed work stands.
    Interrupted,
    /// A fatal error was recorded.
    Failed,
}

/// Progress notifications sent to an optional caller-owned channel.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A file starts streaming through the conversion stage.
    FileStarted {
        /// Input file.
        path: PathBuf,
        /// Zero-based position in the file list.
        index: usize,
        /// Number of files in the run.
        total: usize,
    },
    /// The resolution sweep entered a category.
    Resolving(Category),
    /// A file finished, successfully or not.
    FileFinished {
        /// Input file.
        path: PathBuf,
    },
}

/// Shared state of one import run: configuration, the cooperative stop flag,
/// aggregate counters and the first fatal error.
pub struct RunContext {
    config: ImporterConfig,
    state: AtomicU8,
    fatal: Mutex<Option<ImportError>>,
    counters: ImportCounters,
    progress: Mutex<Option<Sender<ProgressEvent>>>,
}

impl RunContext {
    /// Creates a running context.
    pub fn new(config: ImporterConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_RUNNING),
            fatal: Mutex::new(None),
            counters: ImportCounters::default(),
            progress: Mutex::new(None),
        }
    }

    /// Configuration of this run.
    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    /// Aggregate counters.
    pub fn counters(&self) -> &ImportCounters {
        &self.counters
    }

    /// Whether stages should keep working.
    pub fn should_run(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => RunState::Running,
            STATE_INTERRUPTED => RunState::Interrupted,
            _ => RunState::Failed,
        }
    }

    /// Flips the cooperative stop flag. Stages observe it at their next safe point.
    pub fn interrupt(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_INTERRUPTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!("import.interrupt");
        }
    }

    /// Records `err` as the fatal cause of the run. Only the first error is
    /// kept; later ones are logged and dropped.
    pub fn fail(&self, err: ImportError) {
        let mut slot = self.fatal.lock();
        if slot.is_some() {
            warn!(error = %err, "import.fatal.suppressed");
            return;
        }
        *slot = Some(err);
        self.state.store(STATE_FAILED, Ordering::Release);
    }

    /// Removes and returns the recorded fatal error.
    pub fn take_fatal(&self) -> Option<ImportError> {
        self.fatal.lock().take()
    }

    /// Installs the caller's progress channel for the duration of a run.
    pub fn set_progress(&self, sender: Option<Sender<ProgressEvent>>) {
        *self.progress.lock() = sender;
    }

    /// Sends `event` if a receiver is attached; a dropped receiver detaches it.
    pub fn emit(&self, event: ProgressEvent) {
        let mut guard = self.progress.lock();
        if let Some(sender) = guard.as_ref() {
            if sender.send(event).is_err() {
                *guard = None;
            }
        }
    }
}

/// Cloneable handle that lets another thread interrupt a run.
#[derive(Clone)]
pub struct InterruptHandle(pub(crate) Arc<RunContext>);

impl InterruptHandle {
    /// Requests a cooperative stop.
    pub fn interrupt(&self) {
        self.0.interrupt();
    }
}

/// Counters updated concurrently by the pipeline stages.
#[derive(Default)]
pub struct ImportCounters {
    pub(crate) files_total: AtomicU64,
    pub(crate) files_done: AtomicU64,
    pub(crate) top_level_features: AtomicU64,
    pub(crate) features: AtomicU64,
    pub(crate) geometries: AtomicU64,
    pub(crate) batches_committed: AtomicU64,
    pub(crate) row_errors: AtomicU64,
    pub(crate) validation_errors: AtomicU64,
    pub(crate) skipped_duplicates: AtomicU64,
    pub(crate) xlinks_registered: AtomicU64,
    pub(crate) xlinks_resolved: AtomicU64,
    pub(crate) xlinks_dangling: AtomicU64,
    pub(crate) xlinks_cyclic: AtomicU64,
    pub(crate) xlinks_lost: AtomicU64,
    by_class: Mutex<BTreeMap<String, u64>>,
}

impl ImportCounters {
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        if value > 0 {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Merges a worker-local tally of features per object class.
    pub(crate) fn merge_classes(&self, local: &mut BTreeMap<String, u64>) {
        if local.is_empty() {
            return;
        }
        let mut guard = self.by_class.lock();
        for (class, count) in std::mem::take(local) {
            *guard.entry(class).or_insert(0) += count;
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let files_total = load(&self.files_total);
        let files_done = load(&self.files_done);
        CounterSnapshot {
            files_total,
            files_remaining: files_total.saturating_sub(files_done),
            top_level_features: load(&self.top_level_features),
            features: load(&self.features),
            geometries: load(&self.geometries),
            batches_committed: load(&self.batches_committed),
            row_errors: load(&self.row_errors),
            validation_errors: load(&self.validation_errors),
            skipped_duplicates: load(&self.skipped_duplicates),
            xlinks_registered: load(&self.xlinks_registered),
            xlinks_resolved: load(&self.xlinks_resolved),
            xlinks_dangling: load(&self.xlinks_dangling),
            xlinks_cyclic: load(&self.xlinks_cyclic),
            xlinks_lost: load(&self.xlinks_lost),
            objects_by_class: self.by_class.lock().clone(),
        }
    }
}

/// Serializable copy of [`ImportCounters`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Input files in the run.
    pub files_total: u64,
    /// Files not yet finished.
    pub files_remaining: u64,
    /// Committed top-level features.
    pub top_level_features: u64,
    /// Committed features including nested ones.
    pub features: u64,
    /// Committed geometry rows.
    pub geometries: u64,
    /// Conversion batches committed.
    pub batches_committed: u64,
    /// Features or references skipped after a write error.
    pub row_errors: u64,
    /// Input records rejected by the reader.
    pub validation_errors: u64,
    /// Top-level features filtered by the skip list.
    pub skipped_duplicates: u64,
    /// Deferred references written to the store.
    pub xlinks_registered: u64,
    /// Deferred references resolved during the sweep.
    pub xlinks_resolved: u64,
    /// References whose target never appeared.
    pub xlinks_dangling: u64,
    /// References abandoned because of a cycle.
    pub xlinks_cyclic: u64,
    /// Committed references that never reached the store after an interrupt.
    pub xlinks_lost: u64,
    /// Committed features per object class.
    pub objects_by_class: BTreeMap<String, u64>,
}
