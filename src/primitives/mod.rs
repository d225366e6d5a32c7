//! Concurrency building blocks shared by every pipeline stage.

pub mod pool;
pub mod queue;

pub use pool::{HandlerFactory, ShutdownMode, Submitter, WorkHandler, WorkerPool};
pub use queue::{Take, WorkQueue};
