use crate::models::CanonicalField;
use std::path::PathBuf;
use thiserror::Error;

/// Batch-level failures. Any of these aborts normalization with no output.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("required column '{field}' not found in export header [{header}]")]
    MissingColumn { field: CanonicalField, header: String },

    #[error("column '{field}' is matched by more than one header label: {labels:?}")]
    AmbiguousColumn {
        field: CanonicalField,
        labels: Vec<String>,
    },

    #[error("export has no column header after skipping {skipped} leading line(s)")]
    MissingHeader { skipped: usize },

    #[error("no valid asset rows in export ({rejected} rejected, {sentinels} sentinel)")]
    NoData { rejected: usize, sentinels: usize },

    #[error("delimiter {0:?} is not a single ASCII character")]
    InvalidDelimiter(char),

    #[error("invalid pattern in normalizer config: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("could not read raw export {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed delimited text: {0}")]
    Csv(#[from] csv::Error),
}
