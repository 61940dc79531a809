//! Metadata merge run once every worker has finished.
//!
//! The merge reads each worker file's `ForestInfo`, re-bases halo offsets
//! onto the concatenation of all worker files (in rank order), and writes the
//! combined table to `forests_index.<ext>`. Worker files are then marked
//! finalized, and the index file last, so a finalized index implies a
//! complete output set.

use super::{creator, FOREST_GROUP, FOREST_INFO, FOREST_INFO_COLUMNS, TREE_INFO, TREE_INFO_COLUMNS};
use crate::config::{Backend, ConversionConfig, OutputLayout, WriteOptions};
use crate::container::{
    self, AttrValue, ColumnData, Container, DType, ROOT, STATE_ATTR, STATE_CONVERTING, STATE_FINALIZED,
};
use crate::error::{ConvertError, Result};
use crate::layout::LayoutWriter;
use std::path::{Path, PathBuf};
use tracing::info;

pub const INDEX_STEM: &str = "forests_index";

pub const INDEX_COLUMNS: [&str; 8] = [
    "ForestID",
    "FileScope",
    "OutputFileIndex",
    "FileHalosOffset",
    "GlobalHalosOffset",
    "ForestNhalos",
    "ForestNtrees",
    "Input_ForestNbytes",
];

/// Totals recorded in the combined index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedIndex {
    pub path: PathBuf,
    pub nforests: u64,
    pub ntrees: u64,
    pub nhalos: u64,
    pub skipped_records: u64,
    pub output_files: Vec<PathBuf>,
}

pub struct Finalizer {
    output_dir: PathBuf,
    backend: Backend,
    layout: OutputLayout,
    write_options: WriteOptions,
}

struct CombinedRow {
    values: [i64; 8],
}

impl Finalizer {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            backend: config.backend,
            layout: config.layout,
            write_options: config.write_options,
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", INDEX_STEM, self.backend.extension()))
    }

    /// Fail with `AlreadyFinalized` if this output directory holds a
    /// finalized index.
    pub fn check_not_finalized(&self) -> Result<()> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(());
        }
        let index = self.backend.open(&path)?;
        if container::is_finalized(index.as_ref())? {
            return Err(ConvertError::AlreadyFinalized { path });
        }
        Ok(())
    }

    /// Merge the worker files (rank order) into the combined index.
    ///
    /// Only the index state decides whether the output is complete: worker
    /// files already marked by an interrupted finalize are merged again.
    pub fn finalize(&self, outputs: &[PathBuf]) -> Result<FinalizedIndex> {
        self.check_not_finalized()?;

        let mut workers: Vec<Box<dyn Container>> = Vec::with_capacity(outputs.len());
        for path in outputs {
            workers.push(self.backend.open(path)?);
        }

        let mut rows = Vec::new();
        let mut base = 0i64;
        let mut ntrees = 0u64;
        let mut skipped = 0u64;
        for (file_index, c) in workers.iter().enumerate() {
            let file_rows = validate_worker(c.as_ref())?;
            let info = read_forest_info(c.as_ref())?;
            let nforests = info[0].len();
            for i in 0..nforests {
                let file_offset = info[2][i];
                rows.push(CombinedRow {
                    values: [
                        info[0][i],
                        info[1][i],
                        file_index as i64,
                        file_offset,
                        base + file_offset,
                        info[3][i],
                        info[4][i],
                        info[5][i],
                    ],
                });
                ntrees += info[4][i] as u64;
            }
            skipped += container::attr_or_zero(c.as_ref(), "SkippedRecords")? as u64;
            base += file_rows as i64;
        }
        rows.sort_by_key(|r| (r.values[1], r.values[0]));

        let index_path = self.index_path();
        let mut index = self.backend.create(&index_path, &self.write_options)?;
        index.set_attr(ROOT, STATE_ATTR, STATE_CONVERTING.into())?;
        for (col, name) in INDEX_COLUMNS.iter().enumerate() {
            let dataset = format!("{}/{}", FOREST_INFO, name);
            index.create_column(&dataset, DType::I64)?;
            let values: Vec<i64> = rows.iter().map(|r| r.values[col]).collect();
            index.append_column(&dataset, &ColumnData::I64(values))?;
        }

        let names: Vec<String> = outputs
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();
        let attrs: [(&str, AttrValue); 8] = [
            ("TotNforests", (rows.len() as i64).into()),
            ("TotNtrees", (ntrees as i64).into()),
            ("TotNhalos", base.into()),
            ("Nfiles", (outputs.len() as i64).into()),
            ("OutputFiles", names.join("\n").into()),
            ("OutputLayout", self.layout.as_str().into()),
            ("SkippedRecords", (skipped as i64).into()),
            ("creator", creator().into()),
        ];
        for (name, value) in attrs {
            index.set_attr(ROOT, name, value)?;
        }
        index.flush()?;

        for c in workers.iter_mut() {
            c.set_attr(ROOT, STATE_ATTR, STATE_FINALIZED.into())?;
            c.flush()?;
        }
        index.set_attr(ROOT, STATE_ATTR, STATE_FINALIZED.into())?;
        index.flush()?;

        info!(
            "Finalized {:?}: {} forests, {} trees, {} halos in {} files",
            index_path,
            rows.len(),
            ntrees,
            base,
            outputs.len()
        );
        Ok(FinalizedIndex {
            path: index_path,
            nforests: rows.len() as u64,
            ntrees,
            nhalos: base as u64,
            skipped_records: skipped,
            output_files: outputs.to_vec(),
        })
    }
}

/// Check a worker file is internally consistent; returns its halo count.
fn validate_worker(c: &dyn Container) -> Result<u64> {
    let recovery = |reason: String| ConvertError::CrashRecoveryRequired {
        path: c.path().to_path_buf(),
        reason,
    };
    let forest_info: Vec<String> = FOREST_INFO_COLUMNS
        .iter()
        .map(|n| format!("{}/{}", FOREST_INFO, n))
        .collect();
    let tree_info: Vec<String> = TREE_INFO_COLUMNS
        .iter()
        .map(|n| format!("{}/{}", TREE_INFO, n))
        .collect();
    container::check_aligned(c, &forest_info)?;
    container::check_aligned(c, &tree_info)?;

    let halos = LayoutWriter::open(c, FOREST_GROUP)?.rows(c)?;
    let counted: i64 = container::read_i64_column(c, &format!("{}/ForestNhalos", FOREST_INFO))?
        .iter()
        .sum();
    if counted as u64 != halos {
        return Err(recovery(format!(
            "{} halos stored but ForestInfo accounts for {}",
            halos, counted
        )));
    }
    Ok(halos)
}

fn read_forest_info(c: &dyn Container) -> Result<Vec<Vec<i64>>> {
    FOREST_INFO_COLUMNS
        .iter()
        .map(|n| container::read_i64_column(c, &format!("{}/{}", FOREST_INFO, n)))
        .collect()
}

/// Output file names listed in a finalized index, resolved against its directory.
pub(crate) fn listed_outputs(index: &dyn Container, index_path: &Path) -> Result<Vec<PathBuf>> {
    let dir = index_path.parent().unwrap_or_else(|| Path::new(""));
    let listed = container::text_attr(index, ROOT, "OutputFiles")?;
    Ok(listed
        .lines()
        .filter(|l| !l.is_empty())
        .map(|name| dir.join(name))
        .collect())
}
