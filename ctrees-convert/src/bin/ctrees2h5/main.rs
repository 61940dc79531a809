//! ctrees2h5: Consistent-Trees conversion CLI
//!
//! Converts ASCII merger trees into per-worker forest containers plus a
//! combined `forests_index`, or `hlist` halo catalogs into one container
//! each.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{BackendArg, Cli, Commands, CommonArgs, HalocatArgs, TreesArgs};
use ctrees_convert::config::{
    Backend, ConversionConfig, FailurePolicy, FieldSelection, HaloCatalogConfig, OutputLayout,
    TreeInputs, WriteOptions,
};
use ctrees_convert::coordinator::{convert_halo_catalogs, ConversionCoordinator};
use std::sync::atomic::AtomicBool;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Trees(args) => run_trees(args),
        Commands::Halocat(args) => run_halocat(args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Settings both subcommands share, resolved from the flags.
struct Common {
    layout: OutputLayout,
    failure_policy: FailurePolicy,
    selection: FieldSelection,
    backend: Backend,
    write_options: WriteOptions,
}

fn resolve_common(args: &CommonArgs) -> anyhow::Result<Common> {
    let layout = OutputLayout::from_flags(args.soa, args.aos)?;
    if args.compression > 9 {
        anyhow::bail!("Compression level must be 0-9, got {}", args.compression);
    }
    Ok(Common {
        layout,
        failure_policy: if args.skip_bad_records {
            FailurePolicy::SkipRecord
        } else {
            FailurePolicy::Abort
        },
        selection: FieldSelection {
            fields: args.fields.clone(),
            drop_fields: args.drop_fields.clone(),
        },
        backend: match args.backend {
            Some(BackendArg::Native) => Backend::Native,
            Some(BackendArg::Hdf5) => Backend::Hdf5,
            None => Backend::default(),
        },
        write_options: WriteOptions {
            chunk_rows: args.chunk_rows,
            compression: (args.compression > 0).then_some(args.compression),
            shuffle: args.compression > 0,
        },
    })
}

fn run_trees(args: &TreesArgs) -> anyhow::Result<()> {
    let common = resolve_common(&args.common)?;
    let inputs = if args.tree_files {
        TreeInputs::TreeFiles(args.inputs.clone())
    } else {
        match args.inputs.as_slice() {
            [first, second] => TreeInputs::IndexFiles {
                first: first.clone(),
                second: second.clone(),
            },
            _ => anyhow::bail!(
                "Expected forests.list and locations.dat, got {} inputs (use --tree-files for tree files)",
                args.inputs.len()
            ),
        }
    };

    let mut config = ConversionConfig::new(inputs, &args.common.output)
        .with_layout(common.layout)
        .with_workers(args.common.workers)
        .with_failure_policy(common.failure_policy);
    config.show_progress = args.common.progress;
    config.selection = common.selection;
    config.backend = common.backend;
    config.write_options = common.write_options;

    let summary = ConversionCoordinator::new(config)
        .run()
        .context("Merger tree conversion failed")?;
    println!("\n{}", summary);
    Ok(())
}

fn run_halocat(args: &HalocatArgs) -> anyhow::Result<()> {
    let common = resolve_common(&args.common)?;
    let mut config = HaloCatalogConfig::new(args.inputs.clone(), &args.common.output);
    config.layout = common.layout;
    config.workers = args.common.workers;
    config.show_progress = args.common.progress;
    config.failure_policy = common.failure_policy;
    config.selection = common.selection;
    config.backend = common.backend;
    config.write_options = common.write_options;
    config.chunk_rows = args.read_rows;

    let stop = AtomicBool::new(false);
    let summary = convert_halo_catalogs(&config, &stop).context("Halo catalog conversion failed")?;
    println!("\n{}", summary);
    Ok(())
}
