use super::table::TextTable;
use crate::config::TreeInputs;
use crate::error::{ConvertError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Byte range of one tree inside a tree data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLocation {
    pub file: PathBuf,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub tree_root_id: i64,
    pub file_id: i64,
    pub location: TreeLocation,
}

/// Forest identity. `scope` is the index of the tree file a mode B forest
/// came from; forest ids are only unique within one scope. Mode A uses 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForestKey {
    pub scope: u32,
    pub forest_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestEntry {
    pub key: ForestKey,
    /// Ordered by `(file_id, offset)`.
    pub trees: Vec<TreeEntry>,
    /// Total input bytes of all trees.
    pub input_nbytes: u64,
}

impl ForestEntry {
    pub fn ntrees(&self) -> usize {
        self.trees.len()
    }
}

/// Forest → tree locations for a whole run, ordered by [`ForestKey`].
#[derive(Debug, Clone, Default)]
pub struct ForestIndex {
    forests: Vec<ForestEntry>,
}

impl ForestIndex {
    pub fn build(inputs: &TreeInputs) -> Result<Self> {
        let index = match inputs {
            TreeInputs::IndexFiles { first, second } => Self::from_index_files(first, second)?,
            TreeInputs::TreeFiles(files) => Self::from_tree_files(files)?,
        };
        info!(
            "Indexed {} forests, {} trees, {} input bytes",
            index.len(),
            index.ntrees(),
            index.total_bytes()
        );
        Ok(index)
    }

    /// Mode A: a membership file and a location file, given in either order.
    pub fn from_index_files(first: &Path, second: &Path) -> Result<Self> {
        let a = TextTable::read(first)?;
        let b = TextTable::read(second)?;
        let (membership, locations) = match (a.has_column("ForestID"), b.has_column("ForestID")) {
            (true, false) => (a, b),
            (false, true) => (b, a),
            _ => {
                return Err(ConvertError::index(
                    first,
                    format!(
                        "exactly one of {:?} and {:?} must be a forest membership file (ForestID column)",
                        first, second
                    ),
                ))
            }
        };
        check_same_directory(membership.path(), locations.path())?;
        debug!(
            "Membership file {:?}, location file {:?}",
            membership.path(),
            locations.path()
        );
        let forests = join_tables(&membership, &locations, 0, None)?;
        Self::from_forests(forests)
    }

    /// Mode B: each `<dir>/<base>.<ext>` tree file with its `<base>.forest`
    /// and `<base>.loc` companions, indexed independently.
    pub fn from_tree_files(files: &[PathBuf]) -> Result<Self> {
        let mut forests = Vec::new();
        for (scope, tree_file) in files.iter().enumerate() {
            let (forest_path, loc_path) = companion_paths(tree_file);
            if !tree_file.is_file() {
                return Err(ConvertError::InputNotFound {
                    path: tree_file.clone(),
                });
            }
            let membership = TextTable::read(&forest_path)?;
            let locations = TextTable::read(&loc_path)?;
            let scope = u32::try_from(scope)
                .map_err(|_| ConvertError::InvalidConfig("too many tree files".to_string()))?;
            forests.extend(join_tables(&membership, &locations, scope, Some(tree_file))?);
        }
        Self::from_forests(forests)
    }

    pub fn from_forests(mut forests: Vec<ForestEntry>) -> Result<Self> {
        forests.sort_by_key(|f| f.key);
        if forests.is_empty() {
            return Err(ConvertError::IndexFormat {
                path: PathBuf::new(),
                reason: "index contains no forests".to_string(),
            });
        }
        Ok(Self { forests })
    }

    pub fn forests(&self) -> &[ForestEntry] {
        &self.forests
    }

    pub fn get(&self, position: usize) -> Option<&ForestEntry> {
        self.forests.get(position)
    }

    pub fn len(&self) -> usize {
        self.forests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forests.is_empty()
    }

    pub fn ntrees(&self) -> usize {
        self.forests.iter().map(ForestEntry::ntrees).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.forests.iter().map(|f| f.input_nbytes).sum()
    }

    /// Distinct tree data files, sorted.
    pub fn tree_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .forests
            .iter()
            .flat_map(|f| f.trees.iter().map(|t| t.location.file.clone()))
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// `<dir>/<base>.forest` and `<dir>/<base>.loc` for a tree file.
pub fn companion_paths(tree_file: &Path) -> (PathBuf, PathBuf) {
    let base = tree_file.file_stem().unwrap_or_default().to_os_string();
    let dir = tree_file.parent().unwrap_or_else(|| Path::new(""));
    let mut forest = base.clone();
    forest.push(".forest");
    let mut loc = base;
    loc.push(".loc");
    (dir.join(forest), dir.join(loc))
}

fn check_same_directory(a: &Path, b: &Path) -> Result<()> {
    let dir_of = |p: &Path| -> Result<PathBuf> {
        let parent = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
        Ok(fs::canonicalize(parent)?)
    };
    if dir_of(a)? != dir_of(b)? {
        return Err(ConvertError::index(
            b,
            format!("must be in the same directory as {:?}", a),
        ));
    }
    Ok(())
}

struct Located {
    file_id: i64,
    offset: u64,
    file: PathBuf,
}

/// Join membership and location tables on `TreeRootID` and group by forest.
///
/// `data_file` replaces every location `Filename` (mode B).
fn join_tables(
    membership: &TextTable,
    locations: &TextTable,
    scope: u32,
    data_file: Option<&Path>,
) -> Result<Vec<ForestEntry>> {
    let member_ids = membership.i64_column("TreeRootID")?;
    let forest_ids = membership.i64_column("ForestID")?;
    let loc_ids = locations.i64_column("TreeRootID")?;
    let file_ids = locations.i64_column("FileID")?;
    let offsets = locations.i64_column("Offset")?;
    let filenames = locations.str_column("Filename")?;

    let loc_dir = locations.path().parent().unwrap_or_else(|| Path::new(""));
    let mut located: HashMap<i64, Located> = HashMap::with_capacity(loc_ids.len());
    for (i, &tree_id) in loc_ids.iter().enumerate() {
        let offset = u64::try_from(offsets[i]).map_err(|_| {
            ConvertError::index(locations.path(), format!("negative offset for tree {}", tree_id))
        })?;
        let file = match data_file {
            Some(path) => path.to_path_buf(),
            None if filenames[i].contains('/') => PathBuf::from(filenames[i]),
            None => loc_dir.join(filenames[i]),
        };
        let entry = Located {
            file_id: file_ids[i],
            offset,
            file,
        };
        if located.insert(tree_id, entry).is_some() {
            return Err(ConvertError::index(
                locations.path(),
                format!("duplicate TreeRootID {}", tree_id),
            ));
        }
    }

    let lengths = tree_lengths(&located)?;

    let mut seen = HashMap::with_capacity(member_ids.len());
    let mut grouped: BTreeMap<i64, Vec<TreeEntry>> = BTreeMap::new();
    for (&tree_id, &forest_id) in member_ids.iter().zip(&forest_ids) {
        if seen.insert(tree_id, forest_id).is_some() {
            return Err(ConvertError::index(
                membership.path(),
                format!("duplicate TreeRootID {}", tree_id),
            ));
        }
        let loc = located.get(&tree_id).ok_or_else(|| {
            ConvertError::index(
                membership.path(),
                format!("tree {} has no entry in {:?}", tree_id, locations.path()),
            )
        })?;
        grouped.entry(forest_id).or_default().push(TreeEntry {
            tree_root_id: tree_id,
            file_id: loc.file_id,
            location: TreeLocation {
                file: loc.file.clone(),
                offset: loc.offset,
                length: lengths[&tree_id],
            },
        });
    }
    if let Some(orphan) = loc_ids.iter().find(|id| !seen.contains_key(*id)) {
        return Err(ConvertError::index(
            locations.path(),
            format!("tree {} belongs to no forest in {:?}", orphan, membership.path()),
        ));
    }

    Ok(grouped
        .into_iter()
        .map(|(forest_id, mut trees)| {
            trees.sort_by_key(|t| (t.file_id, t.location.offset));
            let input_nbytes = trees.iter().map(|t| t.location.length).sum();
            ForestEntry {
                key: ForestKey { scope, forest_id },
                trees,
                input_nbytes,
            }
        })
        .collect())
}

/// Derive each tree's byte length from the next tree's offset in the same file.
///
/// A tree ends where the `#tree <next id>` separator of the following tree
/// begins; the last tree of a file runs to end-of-file.
fn tree_lengths(located: &HashMap<i64, Located>) -> Result<HashMap<i64, u64>> {
    let mut by_file: HashMap<&Path, Vec<(u64, i64)>> = HashMap::new();
    for (&id, loc) in located {
        by_file.entry(loc.file.as_path()).or_default().push((loc.offset, id));
    }

    let mut lengths = HashMap::with_capacity(located.len());
    for (file, mut trees) in by_file {
        if !file.is_file() {
            return Err(ConvertError::InputNotFound {
                path: file.to_path_buf(),
            });
        }
        let file_size = fs::metadata(file)?.len();
        trees.sort_unstable();
        for (i, &(offset, id)) in trees.iter().enumerate() {
            let end = match trees.get(i + 1) {
                Some(&(next_offset, next_id)) => {
                    let separator = format!("#tree {}\n", next_id).len() as u64;
                    next_offset.checked_sub(separator).unwrap_or(0)
                }
                None => file_size,
            };
            if end <= offset {
                return Err(ConvertError::index(
                    file,
                    format!("tree {} at offset {} has non-positive length", id, offset),
                ));
            }
            lengths.insert(id, end - offset);
        }
    }
    Ok(lengths)
}
