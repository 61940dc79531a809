//! Run configuration.
//!
//! A conversion is described by one immutable [`ConversionConfig`] (merger
//! trees) or [`HaloCatalogConfig`] (`hlist` halo catalogs), built once by the
//! caller and passed by reference to every stage.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Physical arrangement of halo properties in the output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputLayout {
    /// One dataset per halo property, all sharing a row index (structure of arrays).
    #[default]
    PerPropertyDatasets,
    /// One dataset of compound rows holding every property (array of structures).
    SingleCompoundDataset,
}

impl OutputLayout {
    /// Resolve the mutually exclusive layout flags of the command line.
    ///
    /// Neither flag selects [`OutputLayout::PerPropertyDatasets`].
    pub fn from_flags(per_property: bool, compound: bool) -> Result<Self> {
        match (per_property, compound) {
            (true, true) => Err(ConvertError::InvalidConfig(
                "per-property and single-dataset layouts are mutually exclusive".to_string(),
            )),
            (false, true) => Ok(OutputLayout::SingleCompoundDataset),
            _ => Ok(OutputLayout::PerPropertyDatasets),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputLayout::PerPropertyDatasets => "PerPropertyDatasets",
            OutputLayout::SingleCompoundDataset => "SingleCompoundDataset",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "PerPropertyDatasets" => Some(OutputLayout::PerPropertyDatasets),
            "SingleCompoundDataset" => Some(OutputLayout::SingleCompoundDataset),
            _ => None,
        }
    }
}

/// What a worker does with a line that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Fail the run on the first malformed record.
    #[default]
    Abort,
    /// Count the record, log it, and continue with the next line.
    SkipRecord,
}

/// Storage library the engine writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Directory container with one memory-mappable file per dataset.
    Native,
    /// HDF5 file (requires the `hdf5` cargo feature).
    Hdf5,
}

impl Default for Backend {
    /// HDF5 whenever the crate is built with it.
    fn default() -> Self {
        if cfg!(feature = "hdf5") {
            Backend::Hdf5
        } else {
            Backend::Native
        }
    }
}

/// Chunking and compression hints passed through to the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Rows per storage chunk.
    pub chunk_rows: usize,
    /// Deflate level, if compression is wanted.
    pub compression: Option<u8>,
    pub shuffle: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_rows: 16_384,
            compression: Some(4),
            shuffle: true,
        }
    }
}

/// Which columns of the ASCII catalog are carried into the output.
///
/// `fields` is applied first (keep only these), then `drop_fields`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    pub fields: Option<Vec<String>>,
    pub drop_fields: Vec<String>,
}

/// Where the merger-tree index comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeInputs {
    /// Mode A: a `forests.list` / `locations.dat` pair (either order).
    IndexFiles { first: PathBuf, second: PathBuf },
    /// Mode B: per-worker tree files with `.forest` / `.loc` companions.
    TreeFiles(Vec<PathBuf>),
}

/// Configuration of a merger-tree conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub inputs: TreeInputs,
    pub output_dir: PathBuf,
    pub layout: OutputLayout,
    /// Number of parallel workers; 1 is single-worker mode.
    pub workers: usize,
    /// Progress bar on worker 0. Cosmetic only.
    pub show_progress: bool,
    pub failure_policy: FailurePolicy,
    pub selection: FieldSelection,
    pub backend: Backend,
    pub write_options: WriteOptions,
}

impl ConversionConfig {
    pub fn new(inputs: TreeInputs, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output_dir: output_dir.into(),
            layout: OutputLayout::default(),
            workers: 1,
            show_progress: false,
            failure_policy: FailurePolicy::default(),
            selection: FieldSelection::default(),
            backend: Backend::default(),
            write_options: WriteOptions::default(),
        }
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self.workers, &self.output_dir)?;
        if let TreeInputs::TreeFiles(files) = &self.inputs {
            if files.is_empty() {
                return Err(ConvertError::InvalidConfig(
                    "at least one tree file is required".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration of an `hlist` halo-catalog conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaloCatalogConfig {
    pub files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub layout: OutputLayout,
    pub workers: usize,
    pub show_progress: bool,
    pub failure_policy: FailurePolicy,
    pub selection: FieldSelection,
    pub backend: Backend,
    pub write_options: WriteOptions,
    /// Lines parsed before each append to the container.
    pub chunk_rows: usize,
}

impl HaloCatalogConfig {
    pub fn new(files: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            files,
            output_dir: output_dir.into(),
            layout: OutputLayout::default(),
            workers: 1,
            show_progress: false,
            failure_policy: FailurePolicy::default(),
            selection: FieldSelection::default(),
            backend: Backend::default(),
            write_options: WriteOptions::default(),
            chunk_rows: 100_000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(self.workers, &self.output_dir)?;
        if self.files.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "at least one halo catalog is required".to_string(),
            ));
        }
        if self.chunk_rows == 0 {
            return Err(ConvertError::InvalidConfig(
                "chunk_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_common(workers: usize, output_dir: &Path) -> Result<()> {
    if workers == 0 {
        return Err(ConvertError::InvalidConfig(
            "worker count must be at least 1".to_string(),
        ));
    }
    if !output_dir.is_dir() {
        return Err(ConvertError::InvalidConfig(format!(
            "output directory {:?} does not exist or is not a directory",
            output_dir
        )));
    }
    Ok(())
}
