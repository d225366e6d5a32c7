//! Document readers feeding the conversion stage.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ImportError, Result};
use crate::model::Feature;

/// What a reader saw in one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Features handed to the sink.
    pub features: u64,
    /// Records rejected as malformed.
    pub validation_errors: u64,
    /// Whether the sink refused further features before the end of the file.
    pub stopped: bool,
}

/// Source of features.
///
/// `sink` applies backpressure by blocking and returns
/// [`ImportError::Interrupted`] once the run no longer accepts features;
/// readers stop at that point and report it in [`ReadSummary::stopped`].
/// Any other sink error aborts the read.
pub trait FeatureReader: Send {
    /// Streams the features of `path` into `sink`.
    fn read(&mut self, path: &Path, sink: &mut dyn FnMut(Feature) -> Result<()>) -> Result<ReadSummary>;
}

/// Reads one JSON-encoded [`Feature`] per line. Blank lines are ignored;
/// lines that do not decode, invalid UTF-8 included, count as validation
/// errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesReader;

impl FeatureReader for JsonLinesReader {
    fn read(&mut self, path: &Path, sink: &mut dyn FnMut(Feature) -> Result<()>) -> Result<ReadSummary> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut summary = ReadSummary::default();
        let mut buf = Vec::new();
        let mut line = 0usize;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line += 1;
            let record = buf.trim_ascii();
            if record.is_empty() {
                continue;
            }
            // Invalid UTF-8 is a rejected record, not a read failure.
            let feature = match serde_json::from_slice::<Feature>(record) {
                Ok(feature) => feature,
                Err(err) => {
                    warn!(path = %path.display(), line, error = %err, "reader.invalid_record");
                    summary.validation_errors += 1;
                    continue;
                }
            };
            match sink(feature) {
                Ok(()) => summary.features += 1,
                Err(ImportError::Interrupted) => {
                    summary.stopped = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(
            path = %path.display(),
            features = summary.features,
            invalid = summary.validation_errors,
            stopped = summary.stopped,
            "reader.done"
        );
        Ok(summary)
    }
}
