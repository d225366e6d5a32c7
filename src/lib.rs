//! Concurrent importer for city-model feature graphs.
//!
//! Features stream through a pool of conversion workers that write rows into
//! SQLite. A reference whose target has not been written yet is recorded as
//! a deferred xlink and resolved after the file was converted, category by
//! category, with recursive categories retried until they stop shrinking.
//!
//! ```no_run
//! use cityload::{Importer, ImporterConfig};
//!
//! let config = ImporterConfig::for_database("city.db");
//! let outcome = Importer::new(config)?.run(&["buildings.jsonl".into()]);
//! assert!(outcome.success());
//! # Ok::<(), cityload::ImportError>(())
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod cache;
pub mod config;
pub mod context;
pub mod convert;
pub mod duplicate;
pub mod error;
pub mod importer;
pub mod model;
pub mod primitives;
pub mod reader;
pub mod resolver;
pub mod splitter;
pub mod xlink;

pub use config::{DuplicateMode, ImporterConfig};
pub use context::{CounterSnapshot, InterruptHandle, ProgressEvent};
pub use error::{ImportError, Result};
pub use importer::{Importer, Outcome, RunOutcome};
pub use model::Feature;
pub use reader::{FeatureReader, JsonLinesReader, ReadSummary};
