use std::io;

use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;

/// Result alias used throughout the importer.
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors raised while importing city-model documents.
#[derive(Debug, Error)]
pub enum ImportError {
    /// I/O failure while reading inputs or writing staging files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Error reported by the SQLite driver.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failure encoding or decoding a JSON payload.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Condition that makes further progress of the whole run meaningless.
    #[error("import stopped: {0}")]
    StopImport(String),
    /// A single feature or deferred reference could not be written.
    #[error("failed to write '{gml_id}': {source}")]
    Row {
        /// Identifier of the offending feature or reference target.
        gml_id: String,
        /// Underlying failure.
        #[source]
        source: Box<ImportError>,
    },
    /// The run was interrupted through the cooperative stop flag.
    #[error("import interrupted")]
    Interrupted,
    /// Invalid argument or input shape.
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl ImportError {
    /// Builds a fatal error that aborts the whole run.
    pub fn stop(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(%message, "import.fatal");
        ImportError::StopImport(message)
    }

    /// Wraps `source` as a row-level failure attributed to `gml_id`.
    pub fn row(gml_id: impl Into<String>, source: ImportError) -> Self {
        ImportError::Row {
            gml_id: gml_id.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error must escalate to the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::StopImport(_) | ImportError::Config(_))
    }
}
