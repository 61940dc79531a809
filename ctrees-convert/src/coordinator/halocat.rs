//! `hlist` halo-catalog conversion.
//!
//! Each input file becomes one container holding a `HaloCatalogue` group in
//! the run's layout. Files are dealt round-robin to the workers; a file is
//! streamed in chunks of `chunk_rows` lines and marked finalized once its
//! last chunk and attributes are written.

use super::creator;
use super::worker::create_progress_bar;
use crate::config::{FailurePolicy, HaloCatalogConfig};
use crate::container::{self, AttrValue, Container, ROOT, STATE_ATTR, STATE_CONVERTING, STATE_FINALIZED};
use crate::error::{ConvertError, Result};
use crate::layout::{ForestBatch, LayoutWriter};
use crate::parse::{open_text, CatalogHeader, CatalogKind, HaloSchema, RecordParser};
use crate::partition::assign_files;
use rayon::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const HALO_GROUP: &str = "HaloCatalogue";

#[derive(Debug, Clone, PartialEq)]
pub struct HaloCatalogReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub halos: u64,
    pub skipped_records: u64,
    pub scale_factor: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HaloCatalogSummary {
    pub files: Vec<HaloCatalogReport>,
    pub elapsed: Duration,
}

impl HaloCatalogSummary {
    pub fn total_halos(&self) -> u64 {
        self.files.iter().map(|f| f.halos).sum()
    }
}

impl fmt::Display for HaloCatalogSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Summary ===")?;
        writeln!(f, "Files converted: {}", self.files.len())?;
        writeln!(f, "Halos written: {}", self.total_halos())?;
        let skipped: u64 = self.files.iter().map(|r| r.skipped_records).sum();
        writeln!(f, "Skipped records: {}", skipped)?;
        write!(f, "Elapsed: {:.2}s", self.elapsed.as_secs_f64())
    }
}

/// Output path for one halo catalog: the input name (without `.gz`) plus
/// the backend extension.
pub fn halo_output_path(config: &HaloCatalogConfig, input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    config
        .output_dir
        .join(format!("{}.{}", name, config.backend.extension()))
}

/// Convert every configured halo catalog.
pub fn convert_halo_catalogs(config: &HaloCatalogConfig, stop: &AtomicBool) -> Result<HaloCatalogSummary> {
    let started = Instant::now();
    config.validate()?;

    let headers = config
        .files
        .iter()
        .map(|f| CatalogHeader::read(f))
        .collect::<Result<Vec<_>>>()?;
    for h in &headers {
        h.ensure_kind(CatalogKind::HaloCatalog)?;
    }
    if let Some((first, rest)) = headers.split_first() {
        for h in rest {
            first.ensure_same_setup(h)?;
        }
    }
    for input in &config.files {
        let out = halo_output_path(config, input);
        if out.exists() {
            let existing = config.backend.open(&out)?;
            if container::is_finalized(existing.as_ref())? {
                return Err(ConvertError::AlreadyFinalized { path: out });
            }
        }
    }

    let assignment = assign_files(config.files.len(), config.workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| ConvertError::InvalidConfig(format!("failed to build worker pool: {}", e)))?;
    let progress = config
        .show_progress
        .then(|| create_progress_bar(assignment.first().map(Vec::len).unwrap_or(0) as u64));

    let results: Vec<Result<Vec<HaloCatalogReport>>> = pool.install(|| {
        assignment
            .par_iter()
            .enumerate()
            .map(|(rank, files)| {
                if files.is_empty() {
                    warn!("Worker {} received an empty partition", rank);
                }
                let mut reports = Vec::with_capacity(files.len());
                for &i in files {
                    if stop.load(Ordering::Relaxed) {
                        return Err(ConvertError::Cancelled);
                    }
                    let header = &headers[i];
                    reports.push(convert_one(config, header, &config.files[i], stop)?);
                    if rank == 0 {
                        if let Some(pb) = &progress {
                            pb.inc(1);
                        }
                    }
                }
                Ok(reports)
            })
            .collect()
    });
    if let Some(pb) = progress {
        pb.finish_with_message("Done");
    }

    let mut files = Vec::with_capacity(config.files.len());
    for result in results {
        files.extend(result?);
    }
    files.sort_by(|a, b| a.input.cmp(&b.input));
    let summary = HaloCatalogSummary {
        files,
        elapsed: started.elapsed(),
    };
    info!(
        "Converted {} halo catalogs ({} halos) in {:.2}s",
        summary.files.len(),
        summary.total_halos(),
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

fn convert_one(
    config: &HaloCatalogConfig,
    header: &CatalogHeader,
    input: &Path,
    stop: &AtomicBool,
) -> Result<HaloCatalogReport> {
    let schema: HaloSchema = header.schema.select(&config.selection)?;
    let output = halo_output_path(config, input);
    info!("Converting {:?} -> {:?}", input, output);

    let mut c = config.backend.create(&output, &config.write_options)?;
    c.set_attr(ROOT, STATE_ATTR, STATE_CONVERTING.into())?;
    let writer = LayoutWriter::create(c.as_mut(), HALO_GROUP, config.layout, &schema.stored_columns())?;

    let mut batch = ForestBatch::new(&schema);
    let mut halos = 0u64;
    let mut skipped = 0u64;
    let parser = RecordParser::new(open_text(input)?, &schema, input, 0);
    for record in parser {
        match record {
            Ok(record) => batch.push(&record)?,
            Err(e) if e.is_record_error() && config.failure_policy == FailurePolicy::SkipRecord => {
                warn!("Skipping record: {}", e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
        if batch.len() >= config.chunk_rows {
            if stop.load(Ordering::Relaxed) {
                return Err(ConvertError::Cancelled);
            }
            halos += flush_chunk(&writer, c.as_mut(), &mut batch)?;
        }
    }
    halos += flush_chunk(&writer, c.as_mut(), &mut batch)?;

    let mut attrs: Vec<(&str, AttrValue)> = vec![
        ("TotNhalos", (halos as i64).into()),
        ("input_filename", input.to_string_lossy().into_owned().into()),
        ("OutputLayout", config.layout.as_str().into()),
        ("ctrees_columns", header.schema.names_line().into()),
        ("ctrees_metadata", header.metadata_text().into()),
        ("SkippedRecords", (skipped as i64).into()),
        ("creator", creator().into()),
    ];
    if let Some(a) = header.scale_factor {
        attrs.push(("scale_factor", a.into()));
        attrs.push(("redshift", (1.0 / a - 1.0).into()));
    }
    for (name, value) in attrs {
        c.set_attr(ROOT, name, value)?;
    }
    c.flush()?;
    c.set_attr(ROOT, STATE_ATTR, STATE_FINALIZED.into())?;
    c.flush()?;

    Ok(HaloCatalogReport {
        input: input.to_path_buf(),
        output,
        halos,
        skipped_records: skipped,
        scale_factor: header.scale_factor,
    })
}

fn flush_chunk(writer: &LayoutWriter, c: &mut dyn Container, batch: &mut ForestBatch) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    writer.write(c, batch)?;
    let n = batch.len() as u64;
    batch.clear();
    Ok(n)
}
