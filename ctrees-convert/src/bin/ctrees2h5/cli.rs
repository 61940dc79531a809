//! CLI argument definitions for ctrees2h5

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ctrees2h5")]
#[command(about = "Convert Consistent-Trees merger trees and halo catalogs")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert merger trees from forests.list + locations.dat, or from tree files
    Trees(TreesArgs),

    /// Convert hlist halo catalogs, one output file per input
    Halocat(HalocatArgs),
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Native,
    Hdf5,
}

/// Options shared by both conversions.
#[derive(Args)]
pub struct CommonArgs {
    /// Output directory (must exist)
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of parallel workers
    #[arg(short = 'j', long, default_value = "1")]
    pub workers: usize,

    /// One dataset per halo property (default)
    #[arg(long)]
    pub soa: bool,

    /// One compound dataset holding every halo property
    #[arg(long)]
    pub aos: bool,

    /// Count and skip malformed lines instead of aborting
    #[arg(long)]
    pub skip_bad_records: bool,

    /// Keep only these columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub fields: Option<Vec<String>>,

    /// Drop these columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub drop_fields: Vec<String>,

    /// Storage backend [default: hdf5 when built with HDF5, native otherwise]
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Rows per storage chunk
    #[arg(long, default_value = "16384")]
    pub chunk_rows: usize,

    /// Deflate level 0-9 (0 disables compression)
    #[arg(long, default_value = "4")]
    pub compression: u8,

    /// Show a progress bar for worker 0
    #[arg(long)]
    pub progress: bool,
}

#[derive(Parser)]
pub struct TreesArgs {
    /// forests.list and locations.dat (either order), or tree_*.dat files with --tree-files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Inputs are tree files with .forest/.loc companions
    #[arg(long)]
    pub tree_files: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Parser)]
pub struct HalocatArgs {
    /// hlist files, plain or gzipped
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Lines parsed between appends
    #[arg(long, default_value = "100000")]
    pub read_rows: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}
