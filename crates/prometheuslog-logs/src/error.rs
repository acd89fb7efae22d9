use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures around creating and looking up application monitors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("log file does not exist: {}", .0.display())]
    LogPathMissing(PathBuf),

    #[error("log path is not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("application index {index} out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("max ingestion rate must be greater than zero")]
    InvalidRate,

    #[error("metric name registered twice: {0}")]
    DuplicateMetric(&'static str),
}

/// Failures while extracting values from a single log line
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no json= payload in structured metrics line")]
    MissingPayload,

    #[error("malformed JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload has no metrics object")]
    MissingMetrics,

    #[error("{metric}: no value for this application")]
    MissingApplicationValue { metric: &'static str },

    #[error("{metric}: {value:?} is not an integer")]
    InvalidInteger { metric: &'static str, value: String },

    #[error("{metric}: {value:?} is not a number")]
    InvalidNumber { metric: &'static str, value: String },
}

impl ExtractError {
    /// True when only one metric was skipped and the rest of the payload was used
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Self::MissingApplicationValue { .. }
                | Self::InvalidInteger { .. }
                | Self::InvalidNumber { .. }
        )
    }
}
