//! Consistent-Trees catalog converter.
//!
//! Converts ASCII halo merger trees (and `hlist` halo catalogs) written by
//! Consistent-Trees into chunked binary containers that can be read back
//! forest by forest. Work is split across parallel workers, each writing its
//! own `forest_<rank>` container; a final merge writes `forests_index`, the
//! combined forest table with global halo offsets.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`index`] | [`ForestIndex`](index::ForestIndex) from `forests.list` / `locations.dat` or per-file `.forest` / `.loc` companions |
//! | [`parse`] | Column header ([`CatalogHeader`](parse::CatalogHeader)), [`HaloRecord`](parse::HaloRecord), streaming [`RecordParser`](parse::RecordParser) |
//! | [`layout`] | [`LayoutWriter`](layout::LayoutWriter): per-property datasets or one compound dataset |
//! | [`partition`] | Greedy size-balanced forest assignment, round-robin file assignment |
//! | [`coordinator`] | [`ConversionCoordinator`](coordinator::ConversionCoordinator), worker loop, metadata merge, halo catalogs |
//! | [`container`] | [`Container`](container::Container) trait with native and HDF5 backends |
//! | [`reader`] | [`ConvertedCatalog`](reader::ConvertedCatalog), [`HaloCatalogFile`](reader::HaloCatalogFile) |
//!
//! # Quick Start
//!
//! ```ignore
//! use ctrees_convert::config::{ConversionConfig, TreeInputs};
//! use ctrees_convert::coordinator::ConversionCoordinator;
//! use ctrees_convert::reader::ConvertedCatalog;
//!
//! let inputs = TreeInputs::IndexFiles {
//!     first: "trees/forests.list".into(),
//!     second: "trees/locations.dat".into(),
//! };
//! let config = ConversionConfig::new(inputs, "out").with_workers(8);
//! let summary = ConversionCoordinator::new(config).run()?;
//! println!("{}", summary);
//!
//! let catalog = ConvertedCatalog::open(&summary.index_file)?;
//! let halos = catalog.read_forest(&catalog.forests()[0])?;
//! ```
//!
//! # Features
//!
//! - **`cli`**: enables the `ctrees2h5` binary.
//! - **`hdf5`**: enables the HDF5 container backend and makes it the default
//!   (needs libhdf5).

pub mod config;
pub mod container;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod layout;
pub mod parse;
pub mod partition;
pub mod reader;

pub use error::{ConversionWarning, ConvertError, Result};
