use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Input file not found: {path:?}")]
    InputNotFound { path: PathBuf },

    #[error("Invalid index file {path:?}: {reason}")]
    IndexFormat { path: PathBuf, reason: String },

    #[error("Malformed record in {path:?} at byte offset {offset}: {reason}")]
    MalformedRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Invalid catalog header in {path:?}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("Header of {path:?} does not match {reference:?}: {reason}")]
    SchemaMismatch {
        path: PathBuf,
        reference: PathBuf,
        reason: String,
    },

    #[error("{path:?} is a {found}, expected a {expected}")]
    WrongCatalogKind {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Output {path:?} is already finalized")]
    AlreadyFinalized { path: PathBuf },

    #[error("Output {path:?} was not finalized ({reason}); the previous run did not complete")]
    CrashRecoveryRequired { path: PathBuf, reason: String },

    #[error("Container error on '{dataset}': {reason}")]
    Container { dataset: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Conversion cancelled by stop signal")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConvertError {
    pub(crate) fn container(dataset: impl Into<String>, reason: impl ToString) -> Self {
        ConvertError::Container {
            dataset: dataset.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn index(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ConvertError::IndexFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors a skip policy may absorb without aborting the run.
    pub fn is_record_error(&self) -> bool {
        matches!(self, ConvertError::MalformedRecord { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Non-fatal conditions surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionWarning {
    /// The worker received no forests (or files) and wrote nothing.
    PartitionEmpty { worker: usize },
}

impl std::fmt::Display for ConversionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionWarning::PartitionEmpty { worker } => {
                write!(f, "Worker {} received an empty partition", worker)
            }
        }
    }
}
