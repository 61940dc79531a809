//! Run orchestration.
//!
//! A merger-tree conversion moves through
//! `Indexing → Partitioning → Converting → Finalizing → Done`, or to
//! `Failed` from any of them. Workers run on a dedicated rayon pool, one per
//! partition, each writing only its own `forest_<rank>.<ext>`. Collecting
//! their reports is the barrier; the merge then runs once on the calling
//! thread.

mod finalize;
mod halocat;
mod worker;

pub use finalize::{FinalizedIndex, Finalizer, INDEX_COLUMNS, INDEX_STEM};
pub use halocat::{convert_halo_catalogs, halo_output_path, HaloCatalogReport, HaloCatalogSummary, HALO_GROUP};
pub use worker::WorkerReport;

pub(crate) use finalize::listed_outputs;

use crate::config::{Backend, ConversionConfig};
use crate::error::{ConversionWarning, ConvertError, Result};
use crate::index::ForestIndex;
use crate::parse::{CatalogHeader, CatalogKind};
use crate::partition::partition_forests;
use rayon::prelude::*;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use worker::{run_worker, WorkerContext};

pub const FOREST_GROUP: &str = "Forests";
pub const FOREST_INFO: &str = "ForestInfo";
pub const TREE_INFO: &str = "TreeInfo";

pub const FOREST_INFO_COLUMNS: [&str; 6] = [
    "ForestID",
    "FileScope",
    "ForestHalosOffset",
    "ForestNhalos",
    "ForestNtrees",
    "Input_ForestNbytes",
];

pub const TREE_INFO_COLUMNS: [&str; 7] = [
    "TreeRootID",
    "ForestID",
    "TreeHalosOffset",
    "TreeNhalos",
    "InputFileID",
    "InputTreeOffset",
    "InputTreeNbytes",
];

pub fn output_file_name(rank: usize, backend: Backend) -> String {
    format!("forest_{}.{}", rank, backend.extension())
}

pub(crate) fn creator() -> String {
    format!("ctrees-convert {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Indexing,
    Partitioning,
    Converting,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Indexing => "indexing",
            RunState::Partitioning => "partitioning",
            RunState::Converting => "converting",
            RunState::Finalizing => "finalizing",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub forests: u64,
    pub trees: u64,
    pub halos: u64,
    pub skipped_records: u64,
    pub warnings: Vec<ConversionWarning>,
    pub index_file: PathBuf,
    pub output_files: Vec<PathBuf>,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Summary ===")?;
        writeln!(f, "Forests converted: {}", self.forests)?;
        writeln!(f, "Trees: {}", self.trees)?;
        writeln!(f, "Halos written: {}", self.halos)?;
        writeln!(f, "Skipped records: {}", self.skipped_records)?;
        writeln!(f, "Output files: {}", self.output_files.len())?;
        writeln!(f, "Index: {:?}", self.index_file)?;
        for w in &self.warnings {
            writeln!(f, "Warning: {}", w)?;
        }
        write!(f, "Elapsed: {:.2}s", self.elapsed.as_secs_f64())
    }
}

/// Drives one merger-tree conversion from index to finalized output.
pub struct ConversionCoordinator {
    config: ConversionConfig,
    state: RunState,
    stop: Arc<AtomicBool>,
}

impl ConversionCoordinator {
    pub fn new(config: ConversionConfig) -> Self {
        Self {
            config,
            state: RunState::Indexing,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Cooperative stop flag, checked by workers between forests.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.execute();
        match &result {
            Ok(_) => self.state = RunState::Done,
            Err(e) => {
                error!("Conversion failed while {}: {}", self.state, e);
                self.state = RunState::Failed;
            }
        }
        result
    }

    fn execute(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.config.validate()?;
        let finalizer = Finalizer::new(&self.config);
        finalizer.check_not_finalized()?;

        self.state = RunState::Indexing;
        let index = ForestIndex::build(&self.config.inputs)?;
        let header = validate_headers(&index)?;
        let schema = header.schema.select(&self.config.selection)?;

        self.state = RunState::Partitioning;
        let partitions = partition_forests(&index, self.config.workers);
        let warnings: Vec<ConversionWarning> = partitions
            .iter()
            .filter(|p| p.is_empty())
            .map(|p| ConversionWarning::PartitionEmpty { worker: p.worker })
            .collect();

        self.state = RunState::Converting;
        let abort = AtomicBool::new(false);
        let ctx = WorkerContext {
            config: &self.config,
            index: &index,
            header: &header,
            schema: &schema,
            stop: &self.stop,
            abort: &abort,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| ConvertError::InvalidConfig(format!("failed to build worker pool: {}", e)))?;
        let results: Vec<Result<WorkerReport>> = pool.install(|| {
            partitions
                .par_iter()
                .map(|p| {
                    let result = run_worker(&ctx, p);
                    if result.is_err() {
                        abort.store(true, Ordering::Relaxed);
                    }
                    result
                })
                .collect()
        });
        let reports = collect_reports(results, self.stop.load(Ordering::Relaxed))?;

        self.state = RunState::Finalizing;
        let outputs: Vec<PathBuf> = reports.iter().filter_map(|r| r.output.clone()).collect();
        let finalized = finalizer.finalize(&outputs)?;

        for w in &warnings {
            warn!("{}", w);
        }
        let summary = RunSummary {
            forests: finalized.nforests,
            trees: finalized.ntrees,
            halos: finalized.nhalos,
            skipped_records: finalized.skipped_records,
            warnings,
            index_file: finalized.path,
            output_files: finalized.output_files,
            elapsed: started.elapsed(),
        };
        info!(
            "Converted {} forests ({} halos) in {:.2}s",
            summary.forests,
            summary.halos,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}

/// Every tree file of the run must be a merger-tree file sharing the first
/// file's columns and metadata.
fn validate_headers(index: &ForestIndex) -> Result<CatalogHeader> {
    let files = index.tree_files();
    let Some((first, rest)) = files.split_first() else {
        return Err(ConvertError::index(PathBuf::new(), "index references no tree files"));
    };
    let reference = CatalogHeader::read(first)?;
    reference.ensure_kind(CatalogKind::MergerTrees)?;
    for path in rest {
        let header = CatalogHeader::read(path)?;
        header.ensure_kind(CatalogKind::MergerTrees)?;
        reference.ensure_same_setup(&header)?;
    }
    Ok(reference)
}

/// Reports in rank order, or the first real failure.
///
/// Workers that stopped only because another one failed report
/// `Cancelled`; the underlying error is preferred.
fn collect_reports(results: Vec<Result<WorkerReport>>, stopped: bool) -> Result<Vec<WorkerReport>> {
    let mut reports = Vec::with_capacity(results.len());
    let mut cancelled = false;
    let mut failure = None;
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(ConvertError::Cancelled) => cancelled = true,
            Err(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if cancelled || stopped {
        return Err(ConvertError::Cancelled);
    }
    reports.sort_by_key(|r| r.rank);
    Ok(reports)
}
