use super::{output_file_name, FOREST_GROUP, FOREST_INFO, FOREST_INFO_COLUMNS, TREE_INFO, TREE_INFO_COLUMNS};
use crate::config::{ConversionConfig, FailurePolicy};
use crate::container::{AttrValue, ColumnData, Container, DType, ROOT, STATE_ATTR, STATE_CONVERTING};
use crate::error::{ConvertError, Result};
use crate::index::{ForestEntry, ForestIndex};
use crate::layout::{ForestBatch, LayoutWriter};
use crate::parse::{CatalogHeader, HaloSchema, TreeReader};
use crate::partition::Partition;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Read-only state shared by every worker of a run.
pub(crate) struct WorkerContext<'a> {
    pub config: &'a ConversionConfig,
    pub index: &'a ForestIndex,
    pub header: &'a CatalogHeader,
    pub schema: &'a HaloSchema,
    pub stop: &'a AtomicBool,
    pub abort: &'a AtomicBool,
}

impl WorkerContext<'_> {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.abort.load(Ordering::Relaxed)
    }
}

/// What one worker wrote, returned to the coordinator for the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub rank: usize,
    /// `None` for an empty partition.
    pub output: Option<PathBuf>,
    pub forests: u64,
    pub trees: u64,
    pub halos: u64,
    pub skipped_records: u64,
}

pub(crate) fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} forests ({percent}%, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Per-forest output metadata, appended once the forest's halos are on disk.
struct ForestInfoRows {
    forest: [Vec<i64>; 6],
    tree: [Vec<i64>; 7],
}

impl ForestInfoRows {
    fn new() -> Self {
        Self {
            forest: Default::default(),
            tree: Default::default(),
        }
    }

    fn append(&self, container: &mut dyn Container) -> Result<()> {
        for (name, values) in FOREST_INFO_COLUMNS.iter().zip(&self.forest) {
            container.append_column(&format!("{}/{}", FOREST_INFO, name), &ColumnData::I64(values.clone()))?;
        }
        for (name, values) in TREE_INFO_COLUMNS.iter().zip(&self.tree) {
            container.append_column(&format!("{}/{}", TREE_INFO, name), &ColumnData::I64(values.clone()))?;
        }
        Ok(())
    }
}

pub(crate) fn run_worker(ctx: &WorkerContext<'_>, partition: &Partition) -> Result<WorkerReport> {
    let rank = partition.worker;
    let mut report = WorkerReport {
        rank,
        output: None,
        forests: 0,
        trees: 0,
        halos: 0,
        skipped_records: 0,
    };
    if partition.is_empty() {
        debug!("Worker {}: nothing to convert", rank);
        return Ok(report);
    }

    let config = ctx.config;
    let path = config.output_dir.join(output_file_name(rank, config.backend));
    info!(
        "Worker {}: {} forests ({} input bytes) -> {:?}",
        rank,
        partition.forests.len(),
        partition.input_bytes,
        path
    );

    let mut container = config.backend.create(&path, &config.write_options)?;
    init_output(container.as_mut(), ctx, rank)?;
    let writer = LayoutWriter::create(
        container.as_mut(),
        FOREST_GROUP,
        config.layout,
        &ctx.schema.stored_columns(),
    )?;
    for name in FOREST_INFO_COLUMNS {
        container.create_column(&format!("{}/{}", FOREST_INFO, name), DType::I64)?;
    }
    for name in TREE_INFO_COLUMNS {
        container.create_column(&format!("{}/{}", TREE_INFO, name), DType::I64)?;
    }

    let progress = (rank == 0 && config.show_progress).then(|| create_progress_bar(partition.forests.len() as u64));
    let mut reader = TreeReader::new();
    let mut batch = ForestBatch::new(ctx.schema);

    for &position in &partition.forests {
        if ctx.should_stop() {
            if let Some(pb) = &progress {
                pb.abandon();
            }
            return Err(ConvertError::Cancelled);
        }
        let Some(forest) = ctx.index.get(position) else {
            return Err(ConvertError::InvalidConfig(format!("forest position {} out of range", position)));
        };
        let result = convert_forest(ctx, &mut reader, &mut batch, forest, &writer, container.as_mut());
        let (nhalos, skipped) = match result {
            Ok(counts) => counts,
            Err(e) => {
                if let Some(pb) = &progress {
                    pb.abandon();
                }
                return Err(e);
            }
        };
        report.forests += 1;
        report.trees += forest.ntrees() as u64;
        report.halos += nhalos;
        report.skipped_records += skipped;
        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }

    container.set_attr(ROOT, "Nforests", (report.forests as i64).into())?;
    container.set_attr(ROOT, "Ntrees", (report.trees as i64).into())?;
    container.set_attr(ROOT, "Nhalos", (report.halos as i64).into())?;
    container.set_attr(ROOT, "SkippedRecords", (report.skipped_records as i64).into())?;
    container.flush()?;
    if let Some(pb) = progress {
        pb.finish_with_message("Done");
    }

    info!(
        "Worker {} done: {} forests, {} trees, {} halos, {} skipped records",
        rank, report.forests, report.trees, report.halos, report.skipped_records
    );
    report.output = Some(path);
    Ok(report)
}

fn init_output(container: &mut dyn Container, ctx: &WorkerContext<'_>, rank: usize) -> Result<()> {
    let attrs: [(&str, AttrValue); 8] = [
        (STATE_ATTR, STATE_CONVERTING.into()),
        ("OutputLayout", ctx.config.layout.as_str().into()),
        ("Ncolumns", (ctx.schema.stored_indices().len() as i64).into()),
        ("ctrees_columns", ctx.schema.names_line().into()),
        ("ctrees_metadata", ctx.header.metadata_text().into()),
        ("WorkerRank", (rank as i64).into()),
        ("Nworkers", (ctx.config.workers as i64).into()),
        ("creator", super::creator().into()),
    ];
    for (name, value) in attrs {
        container.set_attr(ROOT, name, value)?;
    }
    Ok(())
}

/// Parse every tree of `forest`, stage, and append it in one piece.
///
/// Returns the halos written and the records skipped.
fn convert_forest(
    ctx: &WorkerContext<'_>,
    reader: &mut TreeReader,
    batch: &mut ForestBatch,
    forest: &ForestEntry,
    writer: &LayoutWriter,
    container: &mut dyn Container,
) -> Result<(u64, u64)> {
    batch.clear();
    let mut skipped = 0u64;
    let mut tree_spans = Vec::with_capacity(forest.trees.len());

    for tree in &forest.trees {
        let start = batch.len();
        for record in reader.records(ctx.schema, &tree.location)? {
            match record {
                Ok(record) => batch.push(&record)?,
                Err(e) if e.is_record_error() && ctx.config.failure_policy == FailurePolicy::SkipRecord => {
                    warn!("Skipping record: {}", e);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tree_spans.push((start as i64, (batch.len() - start) as i64));
    }

    let offset = writer.write(container, batch)? as i64;
    let nhalos = batch.len() as i64;

    let mut rows = ForestInfoRows::new();
    let forest_values = [
        forest.key.forest_id,
        forest.key.scope as i64,
        offset,
        nhalos,
        forest.ntrees() as i64,
        forest.input_nbytes as i64,
    ];
    for (col, value) in rows.forest.iter_mut().zip(forest_values) {
        col.push(value);
    }
    for (tree, (start, count)) in forest.trees.iter().zip(tree_spans) {
        let tree_values = [
            tree.tree_root_id,
            forest.key.forest_id,
            offset + start,
            count,
            tree.file_id,
            tree.location.offset as i64,
            tree.location.length as i64,
        ];
        for (col, value) in rows.tree.iter_mut().zip(tree_values) {
            col.push(value);
        }
    }
    rows.append(container)?;

    debug!(
        "Forest {} (scope {}): {} trees, {} halos at row {}",
        forest.key.forest_id,
        forest.key.scope,
        forest.ntrees(),
        nhalos,
        offset
    );
    Ok((nhalos as u64, skipped))
}
