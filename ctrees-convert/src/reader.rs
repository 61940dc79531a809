//! Read-back of converted output.
//!
//! [`ConvertedCatalog`] opens a finalized merger-tree output set through its
//! `forests_index` file and serves any forest's halos, whichever layout they
//! were written in. [`HaloCatalogFile`] does the same for one converted halo
//! catalog. Both refuse containers that were never finalized.

use crate::config::{Backend, OutputLayout};
use crate::container::{self, ColumnData, ColumnSpec, Container};
use crate::coordinator::{
    listed_outputs, FOREST_GROUP, FOREST_INFO, HALO_GROUP, INDEX_COLUMNS, INDEX_STEM, TREE_INFO,
    TREE_INFO_COLUMNS,
};
use crate::error::{ConvertError, Result};
use crate::layout::LayoutWriter;
use std::path::{Path, PathBuf};

/// One row of the combined forest index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestRecord {
    pub forest_id: i64,
    pub scope: i64,
    pub file_index: usize,
    pub file_offset: u64,
    pub global_offset: u64,
    pub nhalos: u64,
    pub ntrees: u64,
    pub input_nbytes: u64,
}

/// One row of a worker file's `TreeInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRecord {
    pub tree_root_id: i64,
    pub forest_id: i64,
    pub halo_offset: u64,
    pub nhalos: u64,
    pub input_file_id: i64,
    pub input_offset: u64,
    pub input_nbytes: u64,
}

pub struct ConvertedCatalog {
    index_path: PathBuf,
    index: Box<dyn Container>,
    files: Vec<Box<dyn Container>>,
    layouts: Vec<LayoutWriter>,
    forests: Vec<ForestRecord>,
}

impl ConvertedCatalog {
    pub fn open_dir(output_dir: &Path, backend: Backend) -> Result<Self> {
        Self::open(output_dir.join(format!("{}.{}", INDEX_STEM, backend.extension())))
    }

    /// Open a finalized output set from its index file.
    ///
    /// # Errors
    /// `CrashRecoveryRequired` if the index or any worker file is not
    /// finalized, or if a worker file's datasets disagree in length.
    pub fn open(index_path: impl AsRef<Path>) -> Result<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        let backend = Backend::detect(&index_path);
        let index = backend.open(&index_path)?;
        container::ensure_finalized(index.as_ref())?;

        let mut files = Vec::new();
        let mut layouts = Vec::new();
        for path in listed_outputs(index.as_ref(), &index_path)? {
            let c = backend.open(&path)?;
            container::ensure_finalized(c.as_ref())?;
            let layout = LayoutWriter::open(c.as_ref(), FOREST_GROUP)?;
            layout.rows(c.as_ref())?;
            layouts.push(layout);
            files.push(c);
        }

        let cols = INDEX_COLUMNS
            .iter()
            .map(|name| container::read_i64_column(index.as_ref(), &format!("{}/{}", FOREST_INFO, name)))
            .collect::<Result<Vec<_>>>()?;
        let forests = (0..cols[0].len())
            .map(|i| ForestRecord {
                forest_id: cols[0][i],
                scope: cols[1][i],
                file_index: cols[2][i] as usize,
                file_offset: cols[3][i] as u64,
                global_offset: cols[4][i] as u64,
                nhalos: cols[5][i] as u64,
                ntrees: cols[6][i] as u64,
                input_nbytes: cols[7][i] as u64,
            })
            .collect();

        Ok(Self {
            index_path,
            index,
            files,
            layouts,
            forests,
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Forests ordered by `(scope, forest_id)`.
    pub fn forests(&self) -> &[ForestRecord] {
        &self.forests
    }

    pub fn find(&self, scope: i64, forest_id: i64) -> Option<&ForestRecord> {
        self.forests
            .binary_search_by_key(&(scope, forest_id), |f| (f.scope, f.forest_id))
            .ok()
            .map(|i| &self.forests[i])
    }

    pub fn total_halos(&self) -> Result<u64> {
        Ok(container::int_attr(self.index.as_ref(), container::ROOT, "TotNhalos")? as u64)
    }

    pub fn total_trees(&self) -> Result<u64> {
        Ok(container::int_attr(self.index.as_ref(), container::ROOT, "TotNtrees")? as u64)
    }

    pub fn skipped_records(&self) -> Result<u64> {
        Ok(container::attr_or_zero(self.index.as_ref(), "SkippedRecords")? as u64)
    }

    pub fn output_files(&self) -> Vec<PathBuf> {
        self.files.iter().map(|c| c.path().to_path_buf()).collect()
    }

    pub fn layout(&self) -> Option<OutputLayout> {
        self.layouts.first().map(LayoutWriter::layout)
    }

    /// Stored columns, identical across worker files.
    pub fn columns(&self) -> &[ColumnSpec] {
        self.layouts.first().map(LayoutWriter::columns).unwrap_or(&[])
    }

    fn file(&self, forest: &ForestRecord) -> Result<(&dyn Container, &LayoutWriter)> {
        match (self.files.get(forest.file_index), self.layouts.get(forest.file_index)) {
            (Some(c), Some(l)) => Ok((c.as_ref(), l)),
            _ => Err(ConvertError::container(
                "ForestInfo/OutputFileIndex",
                format!("forest {} points at missing file {}", forest.forest_id, forest.file_index),
            )),
        }
    }

    /// A forest's halos, one [`ColumnData`] per stored column.
    pub fn read_forest(&self, forest: &ForestRecord) -> Result<Vec<ColumnData>> {
        let (c, layout) = self.file(forest)?;
        layout.read(c, forest.file_offset..forest.file_offset + forest.nhalos)
    }

    /// The forest's trees, in the order their halos were written.
    pub fn read_trees(&self, forest: &ForestRecord) -> Result<Vec<TreeRecord>> {
        let (c, _) = self.file(forest)?;
        let cols = TREE_INFO_COLUMNS
            .iter()
            .map(|name| container::read_i64_column(c, &format!("{}/{}", TREE_INFO, name)))
            .collect::<Result<Vec<_>>>()?;
        let end = forest.file_offset + forest.nhalos;
        Ok((0..cols[0].len())
            .map(|i| TreeRecord {
                tree_root_id: cols[0][i],
                forest_id: cols[1][i],
                halo_offset: cols[2][i] as u64,
                nhalos: cols[3][i] as u64,
                input_file_id: cols[4][i],
                input_offset: cols[5][i] as u64,
                input_nbytes: cols[6][i] as u64,
            })
            .filter(|t| {
                t.forest_id == forest.forest_id
                    && t.halo_offset >= forest.file_offset
                    && t.halo_offset + t.nhalos <= end
            })
            .collect())
    }
}

/// A converted `hlist` halo catalog.
pub struct HaloCatalogFile {
    container: Box<dyn Container>,
    layout: LayoutWriter,
}

impl HaloCatalogFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let container = Backend::detect(path).open(path)?;
        container::ensure_finalized(container.as_ref())?;
        let layout = LayoutWriter::open(container.as_ref(), HALO_GROUP)?;
        layout.rows(container.as_ref())?;
        Ok(Self { container, layout })
    }

    pub fn total_halos(&self) -> Result<u64> {
        Ok(container::int_attr(self.container.as_ref(), container::ROOT, "TotNhalos")? as u64)
    }

    pub fn scale_factor(&self) -> Result<Option<f64>> {
        Ok(self
            .container
            .attr(container::ROOT, "scale_factor")?
            .and_then(|v| v.as_float()))
    }

    pub fn redshift(&self) -> Result<Option<f64>> {
        Ok(self
            .container
            .attr(container::ROOT, "redshift")?
            .and_then(|v| v.as_float()))
    }

    pub fn input_filename(&self) -> Result<String> {
        container::text_attr(self.container.as_ref(), container::ROOT, "input_filename")
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout.layout()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        self.layout.columns()
    }

    pub fn read_all(&self) -> Result<Vec<ColumnData>> {
        let n = self.layout.rows(self.container.as_ref())?;
        self.layout.read(self.container.as_ref(), 0..n)
    }
}
