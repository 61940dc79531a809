//! Halo property layouts.
//!
//! | Layout | Datasets under the group |
//! |--------|--------------------------|
//! | [`OutputLayout::PerPropertyDatasets`] | one 1-D dataset per stored column, shared row index |
//! | [`OutputLayout::SingleCompoundDataset`] | `halos`, packed compound rows of every stored column |
//!
//! [`LayoutWriter`] owns the choice for one group of one container. The
//! group carries `OutputLayout` and `columns` attributes so readers can
//! reopen it without outside knowledge.

mod batch;

pub use batch::ForestBatch;

use crate::config::OutputLayout;
use crate::container::{self, ColumnData, ColumnSpec, Container};
use crate::error::{ConvertError, Result};
use std::ops::Range;

pub const COMPOUND_DATASET: &str = "halos";
const LAYOUT_ATTR: &str = "OutputLayout";
const COLUMNS_ATTR: &str = "columns";

#[derive(Debug, Clone)]
pub struct LayoutWriter {
    layout: OutputLayout,
    group: String,
    columns: Vec<ColumnSpec>,
}

impl LayoutWriter {
    /// Create the empty datasets for `columns` under `group`.
    pub fn create(
        container: &mut dyn Container,
        group: &str,
        layout: OutputLayout,
        columns: &[ColumnSpec],
    ) -> Result<Self> {
        let writer = Self {
            layout,
            group: group.trim_matches('/').to_string(),
            columns: columns.to_vec(),
        };
        match layout {
            OutputLayout::PerPropertyDatasets => {
                for spec in columns {
                    container.create_column(&writer.path_of(&spec.name), spec.dtype)?;
                }
            }
            OutputLayout::SingleCompoundDataset => {
                container.create_table(&writer.path_of(COMPOUND_DATASET), columns)?;
            }
        }
        container.set_attr(&writer.group, LAYOUT_ATTR, layout.as_str().into())?;
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        container.set_attr(&writer.group, COLUMNS_ATTR, names.join(" ").into())?;
        Ok(writer)
    }

    /// Reopen a group written by [`LayoutWriter::create`].
    pub fn open(container: &dyn Container, group: &str) -> Result<Self> {
        let group = group.trim_matches('/').to_string();
        let layout_name = container::text_attr(container, &group, LAYOUT_ATTR)?;
        let layout = OutputLayout::parse(&layout_name).ok_or_else(|| {
            ConvertError::container(&group, format!("unknown layout '{}'", layout_name))
        })?;
        let columns = match layout {
            OutputLayout::SingleCompoundDataset => {
                container.table_columns(&format!("{}/{}", group, COMPOUND_DATASET))?
            }
            OutputLayout::PerPropertyDatasets => {
                let names = container::text_attr(container, &group, COLUMNS_ATTR)?;
                names
                    .split_whitespace()
                    .map(|name| {
                        let path = format!("{}/{}", group, name);
                        let dtype = container.read_column(&path, 0..0)?.dtype();
                        Ok(ColumnSpec::new(name, dtype))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(Self {
            layout,
            group,
            columns,
        })
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn path_of(&self, name: &str) -> String {
        format!("{}/{}", self.group, name)
    }

    /// Every dataset this layout writes to.
    pub fn dataset_paths(&self) -> Vec<String> {
        match self.layout {
            OutputLayout::PerPropertyDatasets => {
                self.columns.iter().map(|c| self.path_of(&c.name)).collect()
            }
            OutputLayout::SingleCompoundDataset => vec![self.path_of(COMPOUND_DATASET)],
        }
    }

    /// Append a staged forest and return the row index of its first halo.
    pub fn write(&self, container: &mut dyn Container, batch: &ForestBatch) -> Result<u64> {
        if batch.columns() != self.columns.as_slice() {
            return Err(ConvertError::container(&self.group, "batch columns do not match layout"));
        }
        match self.layout {
            OutputLayout::PerPropertyDatasets => {
                let mut start = None;
                for (spec, data) in self.columns.iter().zip(batch.data()) {
                    let path = self.path_of(&spec.name);
                    let row = container.append_column(&path, data)?;
                    match start {
                        None => start = Some(row),
                        Some(expected) if expected != row => {
                            return Err(ConvertError::CrashRecoveryRequired {
                                path: container.path().to_path_buf(),
                                reason: format!(
                                    "dataset '{}' started at row {} instead of {}",
                                    path, row, expected
                                ),
                            });
                        }
                        Some(_) => {}
                    }
                }
                Ok(start.unwrap_or(0))
            }
            OutputLayout::SingleCompoundDataset => {
                container.append_rows(&self.path_of(COMPOUND_DATASET), &batch.to_rows()?)
            }
        }
    }

    /// Total halos written, checking per-property datasets agree.
    pub fn rows(&self, container: &dyn Container) -> Result<u64> {
        match self.layout {
            OutputLayout::PerPropertyDatasets => container::check_aligned(container, &self.dataset_paths()),
            OutputLayout::SingleCompoundDataset => container.row_count(&self.path_of(COMPOUND_DATASET)),
        }
    }

    /// Read rows back as one [`ColumnData`] per stored column.
    pub fn read(&self, container: &dyn Container, range: Range<u64>) -> Result<Vec<ColumnData>> {
        match self.layout {
            OutputLayout::PerPropertyDatasets => self
                .columns
                .iter()
                .map(|c| container.read_column(&self.path_of(&c.name), range.clone()))
                .collect(),
            OutputLayout::SingleCompoundDataset => Ok(container
                .read_rows(&self.path_of(COMPOUND_DATASET), range)?
                .to_columns()),
        }
    }
}
