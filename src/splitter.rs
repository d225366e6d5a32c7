//! Category-ordered resolution sweep.
//!
//! For every category the splitter snapshots the live records, feeds the
//! snapshot to the resolver pool in chunks and waits for the resolvers and
//! the registrar to drain. Recursive categories repeat until no record is
//! left; a pass that makes no progress means the remaining records form a
//! cycle, which is reported once and abandoned. Only once a category is
//! done does the splitter tell the resolver to commit it.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::context::{ImportCounters, ProgressEvent, RunContext};
use crate::error::{ImportError, Result};
use crate::primitives::WorkerPool;
use crate::resolver::ResolverTask;
use crate::xlink::{Category, DeferredRef, DeferredStore};

/// Drives the resolver pool through every category in sweep order.
pub struct ResolutionSplitter<'a> {
    ctx: Arc<RunContext>,
    store: &'a DeferredStore,
    resolvers: &'a WorkerPool<ResolverTask>,
    registrar: &'a WorkerPool<Vec<DeferredRef>>,
}

impl<'a> ResolutionSplitter<'a> {
    /// Creates a splitter over started pools.
    pub fn new(
        ctx: Arc<RunContext>,
        store: &'a DeferredStore,
        resolvers: &'a WorkerPool<ResolverTask>,
        registrar: &'a WorkerPool<Vec<DeferredRef>>,
    ) -> Self {
        Self {
            ctx,
            store,
            resolvers,
            registrar,
        }
    }

    /// Resolves every category. Stops early, without error, once the run
    /// stops; store failures are returned.
    pub fn run(&self) -> Result<()> {
        for category in Category::SWEEP_ORDER {
            if !self.ctx.should_run() {
                return Ok(());
            }
            self.ctx.emit(ProgressEvent::Resolving(category));
            self.sweep(category)?;
        }
        Ok(())
    }

    fn sweep(&self, category: Category) -> Result<()> {
        if self.passes(category)? {
            self.commit(category)?;
        }
        Ok(())
    }

    /// Runs passes until the category is empty or cut off as a cycle.
    /// Returns false when the run stopped first.
    fn passes(&self, category: Category) -> Result<bool> {
        let mut previous: Option<u64> = None;
        let mut pass = 0u32;
        loop {
            let snapshot = self.store.mirror_and_truncate(category)?;
            if snapshot == 0 {
                return Ok(true);
            }
            pass += 1;
            info!(%category, pass, records = snapshot, "xlink.resolve.pass");

            let mut cursor = self.store.scan_snapshot(category);
            loop {
                let chunk = cursor.next_chunk()?;
                if chunk.is_empty() {
                    break;
                }
                match self.resolvers.submit(ResolverTask::Resolve(chunk)) {
                    Ok(()) => {}
                    Err(ImportError::Interrupted) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
            if !self.resolvers.join() || !self.registrar.join() {
                return Ok(false);
            }
            if !category.is_recursive() {
                return Ok(true);
            }

            let remaining = self.store.pending(category)?;
            if remaining == 0 {
                return Ok(true);
            }
            if previous.is_some_and(|last| remaining >= last) {
                error!(
                    %category,
                    remaining,
                    "illegal graph cycle: {remaining} {category} references depend on each other"
                );
                ImportCounters::add(&self.ctx.counters().xlinks_cyclic, remaining);
                let dropped = self.store.abandon(category)?;
                debug!(%category, dropped, "xlink.cycle.abandoned");
                return Ok(true);
            }
            previous = Some(remaining);
        }
    }

    fn commit(&self, category: Category) -> Result<()> {
        match self.resolvers.submit(ResolverTask::Commit(category)) {
            Ok(()) => {}
            Err(ImportError::Interrupted) => return Ok(()),
            Err(err) => return Err(err),
        }
        if self.resolvers.join() {
            self.registrar.join();
        }
        Ok(())
    }
}
