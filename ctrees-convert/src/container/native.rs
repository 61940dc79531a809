//! Directory container backend.
//!
//! A `.ctc` container is a directory holding:
//!
//! 1. **`container.json`**: format tag, dataset table (type and data file per
//!    dataset path) and every attribute.
//! 2. **`dNNNN.bin`**: one file per dataset, raw little-endian values or
//!    packed compound rows, appended in place.
//!
//! Row counts are derived from data file lengths, so an interrupted append
//! shows up as a trailing partial row or as unequal per-property lengths.
//! The manifest is replaced atomically (`container.json.tmp` then rename).
//! Reads memory-map the data file and copy out the requested rows.

use super::types::{AttrValue, ColumnData, ColumnSpec, DType, RowBlock};
use super::{Container, ROOT};
use crate::error::{ConvertError, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

const MANIFEST: &str = "container.json";
const FORMAT: &str = "ctrees-native";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DatasetKind {
    Column { dtype: DType },
    Table { columns: Vec<ColumnSpec> },
}

impl DatasetKind {
    fn row_size(&self) -> usize {
        match self {
            DatasetKind::Column { dtype } => dtype.size(),
            DatasetKind::Table { columns } => RowBlock::row_size_of(columns),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetEntry {
    file: String,
    layout: DatasetKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format: String,
    version: u32,
    datasets: BTreeMap<String, DatasetEntry>,
    attrs: BTreeMap<String, BTreeMap<String, AttrValue>>,
}

impl Manifest {
    fn empty() -> Self {
        Self {
            format: FORMAT.to_string(),
            version: VERSION,
            datasets: BTreeMap::new(),
            attrs: BTreeMap::new(),
        }
    }
}

pub struct NativeContainer {
    path: PathBuf,
    manifest: Manifest,
    writers: HashMap<String, File>,
}

impl NativeContainer {
    /// Create an empty container, replacing an existing one at `path`.
    ///
    /// # Errors
    /// Refuses to replace anything at `path` that is not itself a container.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            if !path.join(MANIFEST).is_file() {
                return Err(ConvertError::container(
                    ROOT,
                    format!("refusing to overwrite {:?}: not a container", path),
                ));
            }
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        let container = Self {
            path,
            manifest: Manifest::empty(),
            writers: HashMap::new(),
        };
        container.save_manifest()?;
        Ok(container)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let manifest_path = path.join(MANIFEST);
        if !manifest_path.is_file() {
            return Err(ConvertError::InputNotFound {
                path: manifest_path,
            });
        }
        let text = fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&text)
            .map_err(|e| ConvertError::container(ROOT, format!("unreadable manifest: {}", e)))?;
        if manifest.format != FORMAT || manifest.version != VERSION {
            return Err(ConvertError::container(
                ROOT,
                format!(
                    "unsupported container format {} v{}",
                    manifest.format, manifest.version
                ),
            ));
        }
        Ok(Self {
            path,
            manifest,
            writers: HashMap::new(),
        })
    }

    fn save_manifest(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.manifest)
            .map_err(|e| ConvertError::container(ROOT, e))?;
        let final_path = self.path.join(MANIFEST);
        let temp_path = final_path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn entry(&self, dataset: &str) -> Result<&DatasetEntry> {
        self.manifest
            .datasets
            .get(normalize(dataset))
            .ok_or_else(|| ConvertError::container(dataset, "no such dataset"))
    }

    fn register(&mut self, dataset: &str, layout: DatasetKind) -> Result<()> {
        let key = normalize(dataset);
        if key.is_empty() {
            return Err(ConvertError::container(dataset, "empty dataset path"));
        }
        if self.manifest.datasets.contains_key(key) {
            return Err(ConvertError::container(dataset, "dataset already exists"));
        }
        let file = format!("d{:04}.bin", self.manifest.datasets.len());
        File::create(self.path.join(&file))?;
        self.manifest
            .datasets
            .insert(key.to_string(), DatasetEntry { file, layout });
        self.save_manifest()
    }

    fn append_bytes(&mut self, dataset: &str, bytes: &[u8]) -> Result<u64> {
        let start = self.row_count(dataset)?;
        let key = normalize(dataset).to_string();
        if !self.writers.contains_key(&key) {
            let file_path = self.path.join(&self.entry(dataset)?.file);
            let file = OpenOptions::new().append(true).open(file_path)?;
            self.writers.insert(key.clone(), file);
        }
        if let Some(writer) = self.writers.get_mut(&key) {
            writer.write_all(bytes)?;
        }
        Ok(start)
    }

    fn map_rows(&self, dataset: &str, range: Range<u64>) -> Result<Vec<u8>> {
        let entry = self.entry(dataset)?;
        let rows = self.row_count(dataset)?;
        if range.start > range.end || range.end > rows {
            return Err(ConvertError::container(
                dataset,
                format!("rows {:?} out of bounds for {} rows", range, rows),
            ));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let row_size = entry.layout.row_size() as u64;
        let file = File::open(self.path.join(&entry.file))?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let start = (range.start * row_size) as usize;
        let end = (range.end * row_size) as usize;
        Ok(mmap[start..end].to_vec())
    }
}

fn normalize(name: &str) -> &str {
    name.trim_matches('/')
}

fn attr_key(target: &str) -> String {
    match normalize(target) {
        "" => ROOT.to_string(),
        other => other.to_string(),
    }
}

impl Container for NativeContainer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_column(&mut self, dataset: &str, dtype: DType) -> Result<()> {
        self.register(dataset, DatasetKind::Column { dtype })
    }

    fn create_table(&mut self, dataset: &str, columns: &[ColumnSpec]) -> Result<()> {
        if columns.is_empty() {
            return Err(ConvertError::container(dataset, "compound type has no fields"));
        }
        self.register(
            dataset,
            DatasetKind::Table {
                columns: columns.to_vec(),
            },
        )
    }

    fn append_column(&mut self, dataset: &str, data: &ColumnData) -> Result<u64> {
        match &self.entry(dataset)?.layout {
            DatasetKind::Column { dtype } if *dtype == data.dtype() => {}
            DatasetKind::Column { dtype } => {
                return Err(ConvertError::container(
                    dataset,
                    format!("cannot append {} to {} dataset", data.dtype().as_str(), dtype.as_str()),
                ));
            }
            DatasetKind::Table { .. } => {
                return Err(ConvertError::container(dataset, "not a 1-D column dataset"));
            }
        }
        self.append_bytes(dataset, &data.to_le_bytes())
    }

    fn append_rows(&mut self, dataset: &str, rows: &RowBlock) -> Result<u64> {
        match &self.entry(dataset)?.layout {
            DatasetKind::Table { columns } if columns.as_slice() == rows.columns() => {}
            DatasetKind::Table { .. } => {
                return Err(ConvertError::container(dataset, "row layout does not match dataset"));
            }
            DatasetKind::Column { .. } => {
                return Err(ConvertError::container(dataset, "not a compound dataset"));
            }
        }
        self.append_bytes(dataset, rows.as_bytes())
    }

    fn contains(&self, dataset: &str) -> bool {
        self.manifest.datasets.contains_key(normalize(dataset))
    }

    fn row_count(&self, dataset: &str) -> Result<u64> {
        let entry = self.entry(dataset)?;
        let len = fs::metadata(self.path.join(&entry.file))?.len();
        let row_size = entry.layout.row_size() as u64;
        if len % row_size != 0 {
            return Err(ConvertError::CrashRecoveryRequired {
                path: self.path.clone(),
                reason: format!("dataset '{}' ends with a partial row", dataset),
            });
        }
        Ok(len / row_size)
    }

    fn read_column(&self, dataset: &str, range: Range<u64>) -> Result<ColumnData> {
        let dtype = match &self.entry(dataset)?.layout {
            DatasetKind::Column { dtype } => *dtype,
            DatasetKind::Table { .. } => {
                return Err(ConvertError::container(dataset, "not a 1-D column dataset"));
            }
        };
        let bytes = self.map_rows(dataset, range)?;
        Ok(ColumnData::from_le_bytes(dtype, &bytes))
    }

    fn read_rows(&self, dataset: &str, range: Range<u64>) -> Result<RowBlock> {
        let columns = self.table_columns(dataset)?;
        let bytes = self.map_rows(dataset, range)?;
        RowBlock::from_bytes(&columns, bytes)
    }

    fn table_columns(&self, dataset: &str) -> Result<Vec<ColumnSpec>> {
        match &self.entry(dataset)?.layout {
            DatasetKind::Table { columns } => Ok(columns.clone()),
            DatasetKind::Column { .. } => {
                Err(ConvertError::container(dataset, "not a compound dataset"))
            }
        }
    }

    fn set_attr(&mut self, target: &str, name: &str, value: AttrValue) -> Result<()> {
        self.manifest
            .attrs
            .entry(attr_key(target))
            .or_default()
            .insert(name.to_string(), value);
        self.save_manifest()
    }

    fn attr(&self, target: &str, name: &str) -> Result<Option<AttrValue>> {
        Ok(self
            .manifest
            .attrs
            .get(&attr_key(target))
            .and_then(|attrs| attrs.get(name))
            .cloned())
    }

    fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values() {
            writer.sync_data()?;
        }
        self.save_manifest()
    }
}
