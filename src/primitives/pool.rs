use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context::RunContext;
use crate::error::{ImportError, Result};
use crate::primitives::queue::{Take, WorkQueue};

/// Per-thread consumer of a [`WorkerPool`].
pub trait WorkHandler<T>: Send {
    /// Processes one unit of work.
    fn handle(&mut self, item: T);

    /// Called when the queue ran dry while this worker holds unflushed work.
    fn idle(&mut self) {}

    /// Called once before the worker thread exits. `interrupted` is true when
    /// the run stopped before the queue was drained.
    fn finish(&mut self, interrupted: bool);
}

/// Builds the handler for worker number `index`.
pub type HandlerFactory<T> = Box<dyn FnMut(usize) -> Result<Box<dyn WorkHandler<T>>> + Send>;

/// How a pool stops its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain queued work, then stop.
    Graceful,
    /// Drop queued work and stop as soon as in-flight items finish.
    Immediate,
}

/// Fixed-purpose thread pool consuming a bounded [`WorkQueue`].
///
/// Grows lazily from `min` to `max` threads while producers find the queue
/// non-empty.
pub struct WorkerPool<T: Send + 'static> {
    name: &'static str,
    queue: Arc<WorkQueue<T>>,
    ctx: Arc<RunContext>,
    factory: Mutex<HandlerFactory<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    min: usize,
    max: usize,
}

/// Cloneable producer side of a pool, usable from other workers.
pub struct Submitter<T> {
    queue: Arc<WorkQueue<T>>,
    ctx: Arc<RunContext>,
}

impl<T> Clone for Submitter<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<T> Submitter<T> {
    /// Enqueues `item`, blocking while the queue is full.
    pub fn submit(&self, item: T) -> Result<()> {
        self.hand_over(item).map_err(|_| ImportError::Interrupted)
    }

    /// Like [`Submitter::submit`], but gives a refused item back.
    pub fn hand_over(&self, item: T) -> std::result::Result<(), T> {
        let ctx = &self.ctx;
        self.queue.push(item, &|| !ctx.should_run())
    }

    /// Hands `item` over even after the run stopped, without blocking.
    /// Returns it back when the queue is closed or full.
    pub fn offer(&self, item: T) -> std::result::Result<(), T> {
        self.queue.offer(item)
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool without starting any thread.
    pub fn new(
        name: &'static str,
        ctx: Arc<RunContext>,
        min: usize,
        max: usize,
        capacity: usize,
        factory: HandlerFactory<T>,
    ) -> Self {
        let min = min.max(1);
        Self {
            name,
            queue: Arc::new(WorkQueue::new(capacity)),
            ctx,
            factory: Mutex::new(factory),
            handles: Mutex::new(Vec::new()),
            min,
            max: max.max(min),
        }
    }

    /// Starts the core threads before any work arrives.
    ///
    /// Fails when not a single worker could be started.
    pub fn prestart(&self) -> Result<usize> {
        for _ in 0..self.min {
            if let Err(err) = self.spawn_worker() {
                warn!(pool = self.name, error = %err, "pool.worker.start_failed");
            }
        }
        let started = self.size();
        if started == 0 {
            return Err(ImportError::stop(format!(
                "failed to start any {} worker",
                self.name
            )));
        }
        debug!(pool = self.name, started, "pool.prestart");
        Ok(started)
    }

    /// Number of live worker threads.
    pub fn size(&self) -> usize {
        self.handles.lock().len()
    }

    /// Shared queue backing this pool.
    pub fn queue(&self) -> &Arc<WorkQueue<T>> {
        &self.queue
    }

    /// Producer handle for other stages.
    pub fn submitter(&self) -> Submitter<T> {
        Submitter {
            queue: Arc::clone(&self.queue),
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Enqueues `item`, growing the pool when work is piling up.
    pub fn submit(&self, item: T) -> Result<()> {
        if !self.queue.is_empty() && self.size() < self.max {
            if let Err(err) = self.spawn_worker() {
                warn!(pool = self.name, error = %err, "pool.worker.grow_failed");
            }
        }
        let ctx = &self.ctx;
        self.queue
            .push(item, &|| !ctx.should_run())
            .map_err(|_| ImportError::Interrupted)
    }

    /// Waits until every queued item was processed and every worker flushed.
    ///
    /// Returns false when the run stopped while waiting.
    pub fn join(&self) -> bool {
        let ctx = &self.ctx;
        self.queue.join(&|| !ctx.should_run())
    }

    /// Removes the items no worker took, e.g. after an interrupted shutdown.
    pub fn take_pending(&self) -> Vec<T> {
        self.queue.drain()
    }

    /// Stops every worker and waits for the threads to exit.
    pub fn shutdown(&self, mode: ShutdownMode) {
        match mode {
            ShutdownMode::Graceful => self.queue.close(),
            ShutdownMode::Immediate => {
                let dropped = self.queue.abandon();
                if dropped > 0 {
                    warn!(pool = self.name, dropped, "pool.shutdown.abandoned");
                }
            }
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = self.name, "pool.worker.panicked");
            }
        }
        debug!(pool = self.name, ?mode, "pool.shutdown");
    }

    fn spawn_worker(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if handles.len() >= self.max {
            return Ok(());
        }
        let index = handles.len();
        let handler = {
            let mut factory = self.factory.lock();
            (*factory)(index)?
        };
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || worker_loop(queue, ctx, handler))?;
        handles.push(handle);
        Ok(())
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if self.size() > 0 {
            self.shutdown(ShutdownMode::Immediate);
        }
    }
}

fn worker_loop<T>(queue: Arc<WorkQueue<T>>, ctx: Arc<RunContext>, mut handler: Box<dyn WorkHandler<T>>) {
    let mut leased = false;
    let cancelled = || !ctx.should_run();
    loop {
        match queue.take(&mut leased, &cancelled) {
            Take::Item(item) => handler.handle(item),
            Take::Idle => {
                handler.idle();
                queue.release(&mut leased);
            }
            Take::Closed => {
                handler.finish(!ctx.should_run());
                queue.release(&mut leased);
                break;
            }
        }
    }
}
