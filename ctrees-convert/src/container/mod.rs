//! Storage backends for converted catalogs.
//!
//! The conversion engine talks to storage only through the [`Container`]
//! trait: append-only 1-D datasets addressed by slash-separated paths
//! (`"Forests/mvir"`), packed compound-row datasets, and scalar attributes on
//! the root (`"/"`), on groups, or on datasets. Groups are implicit in
//! dataset paths.
//!
//! | Backend | Type | On disk |
//! |---------|------|---------|
//! | [`Backend::Native`] | [`NativeContainer`] | directory, one file per dataset + JSON manifest |
//! | [`Backend::Hdf5`] | `Hdf5Container` | HDF5 file (feature `hdf5`) |
//!
//! Every container written by the engine carries a root `ConversionState`
//! attribute. It reads `converting` from creation until the run's final
//! metadata merge sets it to `finalized`; readers refuse anything else with
//! [`ConvertError::CrashRecoveryRequired`].

#[cfg(feature = "hdf5")]
mod h5;
mod native;
mod types;

#[cfg(feature = "hdf5")]
pub use h5::Hdf5Container;
pub use native::NativeContainer;
pub use types::{AttrValue, ColumnData, ColumnSpec, DType, RowBlock};

use crate::config::{Backend, WriteOptions};
use crate::error::{ConvertError, Result};
use std::ops::Range;
use std::path::Path;

pub const ROOT: &str = "/";
pub const STATE_ATTR: &str = "ConversionState";
pub const STATE_CONVERTING: &str = "converting";
pub const STATE_FINALIZED: &str = "finalized";

pub trait Container {
    fn path(&self) -> &Path;

    /// Create an empty, extendable 1-D dataset.
    fn create_column(&mut self, dataset: &str, dtype: DType) -> Result<()>;

    /// Create an empty, extendable dataset of packed compound rows.
    fn create_table(&mut self, dataset: &str, columns: &[ColumnSpec]) -> Result<()>;

    /// Append values, returning the row index of the first one.
    fn append_column(&mut self, dataset: &str, data: &ColumnData) -> Result<u64>;

    /// Append compound rows, returning the row index of the first one.
    fn append_rows(&mut self, dataset: &str, rows: &RowBlock) -> Result<u64>;

    fn contains(&self, dataset: &str) -> bool;

    /// Number of rows currently stored in `dataset`.
    fn row_count(&self, dataset: &str) -> Result<u64>;

    fn read_column(&self, dataset: &str, range: Range<u64>) -> Result<ColumnData>;

    fn read_rows(&self, dataset: &str, range: Range<u64>) -> Result<RowBlock>;

    /// Field layout of a compound dataset.
    fn table_columns(&self, dataset: &str) -> Result<Vec<ColumnSpec>>;

    fn set_attr(&mut self, target: &str, name: &str, value: AttrValue) -> Result<()>;

    fn attr(&self, target: &str, name: &str) -> Result<Option<AttrValue>>;

    fn flush(&mut self) -> Result<()>;

    fn read_all(&self, dataset: &str) -> Result<ColumnData> {
        let n = self.row_count(dataset)?;
        self.read_column(dataset, 0..n)
    }
}

impl Backend {
    /// File-name extension for outputs of this backend.
    pub fn extension(&self) -> &'static str {
        match self {
            Backend::Native => "ctc",
            Backend::Hdf5 => "h5",
        }
    }

    /// Pick the backend that wrote `path`, from its extension.
    pub fn detect(path: &Path) -> Backend {
        match path.extension().and_then(|e| e.to_str()) {
            Some("h5") | Some("hdf5") => Backend::Hdf5,
            _ => Backend::Native,
        }
    }

    /// Create (truncating) a container at `path`.
    pub fn create(&self, path: &Path, options: &WriteOptions) -> Result<Box<dyn Container>> {
        match self {
            Backend::Native => Ok(Box::new(NativeContainer::create(path)?)),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5 => Ok(Box::new(Hdf5Container::create(path, options)?)),
            #[cfg(not(feature = "hdf5"))]
            Backend::Hdf5 => {
                let _ = options;
                Err(hdf5_disabled())
            }
        }
    }

    /// Open an existing container for reading and attribute updates.
    pub fn open(&self, path: &Path) -> Result<Box<dyn Container>> {
        if !path.exists() {
            return Err(ConvertError::InputNotFound {
                path: path.to_path_buf(),
            });
        }
        match self {
            Backend::Native => Ok(Box::new(NativeContainer::open(path)?)),
            #[cfg(feature = "hdf5")]
            Backend::Hdf5 => Ok(Box::new(Hdf5Container::open(path)?)),
            #[cfg(not(feature = "hdf5"))]
            Backend::Hdf5 => Err(hdf5_disabled()),
        }
    }
}

#[cfg(not(feature = "hdf5"))]
fn hdf5_disabled() -> ConvertError {
    ConvertError::InvalidConfig("HDF5 backend requires the `hdf5` feature".to_string())
}

pub fn is_finalized(container: &dyn Container) -> Result<bool> {
    Ok(container
        .attr(ROOT, STATE_ATTR)?
        .as_ref()
        .and_then(AttrValue::as_text)
        == Some(STATE_FINALIZED))
}

/// Refuse a container whose conversion never completed.
pub fn ensure_finalized(container: &dyn Container) -> Result<()> {
    let state = container.attr(ROOT, STATE_ATTR)?;
    match state.as_ref().and_then(AttrValue::as_text) {
        Some(STATE_FINALIZED) => Ok(()),
        Some(other) => Err(ConvertError::CrashRecoveryRequired {
            path: container.path().to_path_buf(),
            reason: format!("{} is '{}'", STATE_ATTR, other),
        }),
        None => Err(ConvertError::CrashRecoveryRequired {
            path: container.path().to_path_buf(),
            reason: format!("missing {} attribute", STATE_ATTR),
        }),
    }
}

/// Check that parallel per-property datasets have equal row counts.
///
/// Returns the shared row count. Unequal lengths mean a forest append was
/// interrupted between fields.
pub fn check_aligned(container: &dyn Container, datasets: &[String]) -> Result<u64> {
    let mut expected: Option<(u64, &str)> = None;
    for name in datasets {
        let n = container.row_count(name)?;
        match expected {
            None => expected = Some((n, name)),
            Some((rows, first)) if rows != n => {
                return Err(ConvertError::CrashRecoveryRequired {
                    path: container.path().to_path_buf(),
                    reason: format!(
                        "dataset '{}' has {} rows but '{}' has {}",
                        name, n, first, rows
                    ),
                });
            }
            Some(_) => {}
        }
    }
    Ok(expected.map(|(n, _)| n).unwrap_or(0))
}

pub(crate) fn read_i64_column(container: &dyn Container, dataset: &str) -> Result<Vec<i64>> {
    container
        .read_all(dataset)?
        .as_i64()
        .ok_or_else(|| ConvertError::container(dataset, "expected an integer dataset"))
}

pub(crate) fn int_attr(container: &dyn Container, target: &str, name: &str) -> Result<i64> {
    container
        .attr(target, name)?
        .as_ref()
        .and_then(AttrValue::as_int)
        .ok_or_else(|| ConvertError::container(target, format!("missing integer attribute '{}'", name)))
}

/// Integer root attribute, or 0 when absent.
pub(crate) fn attr_or_zero(container: &dyn Container, name: &str) -> Result<i64> {
    Ok(container
        .attr(ROOT, name)?
        .as_ref()
        .and_then(AttrValue::as_int)
        .unwrap_or(0))
}

pub(crate) fn text_attr(container: &dyn Container, target: &str, name: &str) -> Result<String> {
    container
        .attr(target, name)?
        .and_then(|v| v.as_text().map(str::to_string))
        .ok_or_else(|| ConvertError::container(target, format!("missing text attribute '{}'", name)))
}
