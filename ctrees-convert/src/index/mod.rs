//! Forest and tree index construction.
//!
//! Consistent-Trees writes two whitespace tables next to its tree files:
//!
//! | File | Columns |
//! |------|---------|
//! | `forests.list` (`.forest`) | `#TreeRootID ForestID` |
//! | `locations.dat` (`.loc`) | `#TreeRootID FileID Offset Filename` |
//!
//! Joining them on `TreeRootID` gives every forest's trees as byte ranges in
//! the tree files. The result is built once per run and shared read-only.

mod forest;
mod table;

pub use forest::{companion_paths, ForestEntry, ForestIndex, ForestKey, TreeEntry, TreeLocation};
