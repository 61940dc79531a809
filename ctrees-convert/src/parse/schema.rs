//! Column schema of Consistent-Trees ASCII catalogs.
//!
//! Every tree and `hlist` file starts with a header line naming its columns:
//!
//! ```text
//! #scale(0) id(1) desc_scale(2) desc_id(3) num_prog(4) pid(5) ... mvir(10)
//! ```
//!
//! followed by `#` metadata lines (cosmology, box size, units and for halo
//! catalogs the `#a = <scale>` line). The column list fixes the record
//! grammar for the whole file.

use crate::config::FieldSelection;
use crate::container::{ColumnSpec, DType};
use crate::error::{ConvertError, Result};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const SMALL_INT_COLUMNS: &[&str] = &["num_prog", "phantom", "mmp?", "Snap_num", "Snap_idx"];

/// Storage type for a catalog column, decided by its name.
pub fn storage_kind(name: &str) -> DType {
    if SMALL_INT_COLUMNS.contains(&name) {
        DType::I32
    } else if name.ends_with("id") || name.ends_with("ID") {
        DType::I64
    } else {
        DType::F64
    }
}

/// Full column list of a catalog plus the subset carried into the output.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloSchema {
    columns: Vec<ColumnSpec>,
    stored: Vec<usize>,
}

impl HaloSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        let stored = (0..columns.len()).collect();
        Self { columns, stored }
    }

    /// Parse the `#name(0) name(1) ...` header line.
    pub fn from_header_line(path: &Path, line: &str) -> Result<Self> {
        let invalid = |reason: String| ConvertError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };
        let body = line
            .trim()
            .strip_prefix('#')
            .ok_or_else(|| invalid("first line is not a '#' column header".to_string()))?;

        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for (position, token) in body.split_whitespace().enumerate() {
            // `(500c)` style suffixes are part of the name; only `(N)` numbers a column.
            let numbered = token
                .strip_suffix(')')
                .and_then(|t| t.rsplit_once('('))
                .and_then(|(name, number)| number.parse::<usize>().ok().map(|n| (name, n)));
            let name = match numbered {
                Some((name, n)) => {
                    if n != position {
                        return Err(invalid(format!(
                            "column '{}' is numbered {} but sits at position {}",
                            name, n, position
                        )));
                    }
                    name
                }
                None => token,
            };
            if name.is_empty() {
                return Err(invalid(format!("empty column name in '{}'", token)));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate column '{}'", name)));
            }
            columns.push(ColumnSpec::new(name, storage_kind(name)));
        }
        if columns.is_empty() {
            return Err(invalid("header names no columns".to_string()));
        }
        Ok(Self::new(columns))
    }

    /// Number of fields every data line must have.
    pub fn ncolumns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Indices (into the full header) of the stored columns, in file order.
    pub fn stored_indices(&self) -> &[usize] {
        &self.stored
    }

    pub fn stored_columns(&self) -> Vec<ColumnSpec> {
        self.stored.iter().map(|&i| self.columns[i].clone()).collect()
    }

    /// Position of `name` among the stored columns.
    pub fn stored_position(&self, name: &str) -> Option<usize> {
        self.stored.iter().position(|&i| self.columns[i].name == name)
    }

    /// Column names joined by spaces, as written to container attributes.
    pub fn names_line(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Apply `fields` (keep) then `drop_fields` (remove).
    ///
    /// # Errors
    /// Unknown column names, or a selection that keeps nothing.
    pub fn select(&self, selection: &FieldSelection) -> Result<Self> {
        let lookup = |name: &String| {
            self.columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| ConvertError::InvalidConfig(format!("unknown column '{}'", name)))
        };

        let mut keep: Vec<usize> = match &selection.fields {
            Some(fields) => {
                let mut wanted = fields.iter().map(lookup).collect::<Result<Vec<_>>>()?;
                wanted.sort_unstable();
                wanted.dedup();
                wanted
            }
            None => self.stored.clone(),
        };
        for name in &selection.drop_fields {
            let index = lookup(name)?;
            keep.retain(|&i| i != index);
        }
        if keep.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "field selection leaves no columns to write".to_string(),
            ));
        }
        Ok(Self {
            columns: self.columns.clone(),
            stored: keep,
        })
    }
}

/// What an ASCII catalog file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    /// Consistent-Trees `tree_*.dat`: header, tree count, then `#tree <id>` blocks.
    MergerTrees,
    /// `hlist` / Rockstar `out_*.list`: header, then one halo per line.
    HaloCatalog,
}

impl CatalogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::MergerTrees => "merger-tree file",
            CatalogKind::HaloCatalog => "halo catalog",
        }
    }
}

/// Header block of one ASCII catalog file.
#[derive(Debug, Clone)]
pub struct CatalogHeader {
    pub path: PathBuf,
    pub schema: HaloSchema,
    /// `#` lines after the column header, verbatim.
    pub metadata: Vec<String>,
    /// From an `#a = <scale>` line, present in halo catalogs.
    pub scale_factor: Option<f64>,
    /// The first metadata line naming a version, e.g. `Consistent Trees version 1.01`.
    pub version: Option<String>,
    pub kind: CatalogKind,
}

impl CatalogHeader {
    pub fn read(path: &Path) -> Result<Self> {
        let reader = open_text(path)?;
        Self::from_reader(path, reader)
    }

    pub fn from_reader<R: BufRead>(path: &Path, mut reader: R) -> Result<Self> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ConvertError::InvalidHeader {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }
        let schema = HaloSchema::from_header_line(path, &line)?;

        let mut metadata = Vec::new();
        let mut scale_factor = None;
        let mut version = None;
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if !trimmed.starts_with('#') {
                break;
            }
            if let Some(a) = parse_scale_factor(trimmed) {
                scale_factor = Some(a);
            }
            if version.is_none() && trimmed.to_ascii_lowercase().contains("version") {
                version = Some(trimmed.trim_start_matches('#').trim().to_string());
            }
            metadata.push(trimmed.to_string());
        }

        // `line` now holds the first data line, empty at end of file.
        let kind = detect_kind(&schema, &line);
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            metadata,
            scale_factor,
            version,
            kind,
        })
    }

    /// Fail with `WrongCatalogKind` unless this file holds `expected` data.
    pub fn ensure_kind(&self, expected: CatalogKind) -> Result<()> {
        if self.kind != expected {
            return Err(ConvertError::WrongCatalogKind {
                path: self.path.clone(),
                expected: expected.as_str(),
                found: self.kind.as_str(),
            });
        }
        Ok(())
    }

    /// Fail with `SchemaMismatch` unless `other` comes from the same setup:
    /// same columns, same version line, same metadata block apart from the
    /// per-snapshot `#a =` line.
    pub fn ensure_same_setup(&self, other: &CatalogHeader) -> Result<()> {
        let mismatch = |reason: String| ConvertError::SchemaMismatch {
            path: other.path.clone(),
            reference: self.path.clone(),
            reason,
        };
        if self.schema.columns() != other.schema.columns() {
            return Err(mismatch("column lists differ".to_string()));
        }
        if self.version != other.version {
            return Err(mismatch(format!(
                "version {:?} differs from {:?}",
                other.version, self.version
            )));
        }
        if self.setup_lines().ne(other.setup_lines()) {
            return Err(mismatch("metadata blocks differ".to_string()));
        }
        Ok(())
    }

    fn setup_lines(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .iter()
            .map(String::as_str)
            .filter(|l| parse_scale_factor(l).is_none())
    }

    pub fn metadata_text(&self) -> String {
        self.metadata.join("\n")
    }
}

/// A tree file follows its header with a bare tree count; a halo catalog
/// goes straight to halo rows.
fn detect_kind(schema: &HaloSchema, first_data_line: &str) -> CatalogKind {
    let mut fields = first_data_line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(count), None) if schema.ncolumns() > 1 && count.parse::<u64>().is_ok() => {
            CatalogKind::MergerTrees
        }
        _ => CatalogKind::HaloCatalog,
    }
}

fn parse_scale_factor(line: &str) -> Option<f64> {
    let rest = line.strip_prefix('#')?.trim_start();
    let value = rest.strip_prefix("a")?.trim_start().strip_prefix('=')?;
    value.split_whitespace().next()?.parse().ok()
}

/// Open a text catalog, decompressing `.gz` files on the fly.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    if !path.is_file() {
        return Err(ConvertError::InputNotFound {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path)?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}
