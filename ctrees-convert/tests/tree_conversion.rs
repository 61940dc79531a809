use ctrees_convert::config::{
    Backend, ConversionConfig, FailurePolicy, FieldSelection, OutputLayout, TreeInputs,
};
use ctrees_convert::container::{self, ColumnData, Container, NativeContainer};
use ctrees_convert::coordinator::{ConversionCoordinator, Finalizer, RunState};
use ctrees_convert::reader::ConvertedCatalog;
use ctrees_convert::{ConversionWarning, ConvertError};
use std::fs;
use std::path::{Path, PathBuf};

const HEADER: &str = "#scale(0) id(1) desc_id(2) num_prog(3) pid(4) mvir(5)\n\
                      #Omega_M = 0.3089; Omega_L = 0.6911; h0 = 0.6774\n\
                      #Full box size = 62.5 Mpc/h\n";

/// One tree: root id and its halo lines.
struct Tree {
    id: i64,
    lines: Vec<String>,
}

impl Tree {
    /// `n` well-formed halos with ids `id*100 + i`.
    fn halos(id: i64, n: usize) -> Self {
        let lines = (0..n)
            .map(|i| format!("1.0 {} -1 {} -1 1.5e{}", id * 100 + i as i64, i % 2, 10 + i))
            .collect();
        Self { id, lines }
    }

    fn with_line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }
}

/// Write a tree file and return the byte offset of each tree's first halo.
fn write_tree_file(path: &Path, header: &str, trees: &[Tree]) -> Vec<u64> {
    let mut text = header.to_string();
    text.push_str(&format!("{}\n", trees.len()));
    let mut offsets = Vec::new();
    for tree in trees {
        text.push_str(&format!("#tree {}\n", tree.id));
        offsets.push(text.len() as u64);
        for line in &tree.lines {
            text.push_str(line);
            text.push('\n');
        }
    }
    fs::write(path, text).expect("Failed to write tree file");
    offsets
}

/// Mode A input set: one tree file plus `forests.list` and `locations.dat`.
fn write_mode_a(dir: &Path, forests: &[(i64, Tree)]) -> TreeInputs {
    let trees: Vec<Tree> = forests
        .iter()
        .map(|(_, t)| Tree {
            id: t.id,
            lines: t.lines.clone(),
        })
        .collect();
    let offsets = write_tree_file(&dir.join("tree_0_0_0.dat"), HEADER, &trees);

    let mut membership = String::from("#TreeRootID ForestID\n");
    let mut locations = String::from("#TreeRootID FileID Offset Filename\n");
    for ((forest_id, tree), offset) in forests.iter().zip(&offsets) {
        membership.push_str(&format!("{} {}\n", tree.id, forest_id));
        locations.push_str(&format!("{} 0 {} tree_0_0_0.dat\n", tree.id, offset));
    }
    fs::write(dir.join("forests.list"), membership).expect("Failed to write forests.list");
    fs::write(dir.join("locations.dat"), locations).expect("Failed to write locations.dat");

    // Location file first: either order is accepted.
    TreeInputs::IndexFiles {
        first: dir.join("locations.dat"),
        second: dir.join("forests.list"),
    }
}

/// Trees 1 and 2 in forest 100, tree 3 in forest 200.
fn two_forests(dir: &Path) -> TreeInputs {
    write_mode_a(
        dir,
        &[
            (100, Tree::halos(1, 2)),
            (100, Tree::halos(2, 1)),
            (200, Tree::halos(3, 3)),
        ],
    )
}

/// These tests inspect `.ctc` files directly, whatever the default backend.
fn native_config(inputs: TreeInputs, output_dir: impl Into<PathBuf>) -> ConversionConfig {
    ConversionConfig::new(inputs, output_dir).with_backend(Backend::Native)
}

fn workspace() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let out = dir.path().join("out");
    fs::create_dir(&out).expect("Failed to create output dir");
    (dir, out)
}

fn ids(columns: &[ColumnData]) -> Vec<i64> {
    match &columns[1] {
        ColumnData::I64(v) => v.clone(),
        other => panic!("id column has type {:?}", other.dtype()),
    }
}

#[test]
fn test_single_worker_groups_trees_into_forests() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let mut coordinator = ConversionCoordinator::new(native_config(inputs, &out));

    let summary = coordinator.run().expect("Conversion failed");
    assert_eq!(coordinator.state(), RunState::Done);
    assert_eq!(summary.forests, 2);
    assert_eq!(summary.trees, 3);
    assert_eq!(summary.halos, 6);
    assert_eq!(summary.skipped_records, 0);
    assert!(summary.warnings.is_empty());
    assert_eq!(summary.output_files, vec![out.join("forest_0.ctc")]);

    let catalog = ConvertedCatalog::open(&summary.index_file).expect("Failed to open output");
    assert_eq!(catalog.layout(), Some(OutputLayout::PerPropertyDatasets));
    assert_eq!(catalog.total_halos().unwrap(), 6);
    assert_eq!(catalog.total_trees().unwrap(), 3);

    let forests = catalog.forests();
    assert_eq!(forests.len(), 2);
    assert_eq!((forests[0].forest_id, forests[0].ntrees, forests[0].nhalos), (100, 2, 3));
    assert_eq!((forests[1].forest_id, forests[1].ntrees, forests[1].nhalos), (200, 1, 3));

    let a = catalog.read_forest(&forests[0]).unwrap();
    assert_eq!(ids(&a), vec![100, 101, 200]);
    let b = catalog.read_forest(&forests[1]).unwrap();
    assert_eq!(ids(&b), vec![300, 301, 302]);

    let trees = catalog.read_trees(&forests[0]).unwrap();
    let roots: Vec<_> = trees.iter().map(|t| (t.tree_root_id, t.nhalos)).collect();
    assert_eq!(roots, vec![(1, 2), (2, 1)]);
}

#[test]
fn test_per_property_datasets_share_row_count() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let summary = ConversionCoordinator::new(native_config(inputs, &out))
        .run()
        .expect("Conversion failed");

    let c = NativeContainer::open(&summary.output_files[0]).expect("Failed to open worker file");
    let datasets: Vec<String> = ["scale", "id", "desc_id", "num_prog", "pid", "mvir"]
        .iter()
        .map(|n| format!("Forests/{}", n))
        .collect();
    assert_eq!(container::check_aligned(&c, &datasets).unwrap(), 6);
    assert_eq!(
        container::check_aligned(&c, &["ForestInfo/ForestID".to_string()]).unwrap(),
        2
    );
    assert_eq!(
        container::check_aligned(&c, &["TreeInfo/TreeRootID".to_string()]).unwrap(),
        3
    );
}

#[test]
fn test_layouts_read_back_identically() {
    let mut read = Vec::new();
    for layout in [OutputLayout::PerPropertyDatasets, OutputLayout::SingleCompoundDataset] {
        let (dir, out) = workspace();
        let inputs = two_forests(dir.path());
        let config = native_config(inputs, &out).with_layout(layout);
        let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");

        let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
        assert_eq!(catalog.layout(), Some(layout));
        let names: Vec<_> = catalog.columns().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, ["scale", "id", "desc_id", "num_prog", "pid", "mvir"]);
        let forests: Vec<_> = catalog
            .forests()
            .iter()
            .map(|f| catalog.read_forest(f).unwrap())
            .collect();
        read.push(forests);
    }
    assert_eq!(read[0], read[1]);
    assert_eq!(read[0][1][3], ColumnData::I32(vec![0, 1, 0]));
}

#[test]
fn test_rerun_on_finalized_output_fails() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let config = native_config(inputs, &out);
    let summary = ConversionCoordinator::new(config.clone())
        .run()
        .expect("Conversion failed");
    let before = fs::read(out.join("forests_index.ctc/container.json")).unwrap();

    let mut again = ConversionCoordinator::new(config.clone());
    assert!(matches!(again.run(), Err(ConvertError::AlreadyFinalized { .. })));
    assert_eq!(again.state(), RunState::Failed);

    let finalizer = Finalizer::new(&config);
    assert!(matches!(
        finalizer.finalize(&summary.output_files),
        Err(ConvertError::AlreadyFinalized { .. })
    ));

    let after = fs::read(out.join("forests_index.ctc/container.json")).unwrap();
    assert_eq!(before, after);
    let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
    assert_eq!(catalog.total_halos().unwrap(), 6);
}

#[test]
fn test_interrupted_finalize_can_be_redone() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let config = native_config(inputs, &out).with_workers(2);
    let summary = ConversionCoordinator::new(config.clone())
        .run()
        .expect("Conversion failed");

    // Workers marked, index not yet: the state a failed final write leaves behind.
    let mut index = NativeContainer::open(&summary.index_file).unwrap();
    index
        .set_attr(container::ROOT, container::STATE_ATTR, container::STATE_CONVERTING.into())
        .unwrap();
    index.flush().unwrap();
    for path in &summary.output_files {
        assert!(container::is_finalized(&NativeContainer::open(path).unwrap()).unwrap());
    }
    assert!(matches!(
        ConvertedCatalog::open(&summary.index_file),
        Err(ConvertError::CrashRecoveryRequired { .. })
    ));

    let redone = Finalizer::new(&config)
        .finalize(&summary.output_files)
        .expect("Finalize should be repeatable");
    assert_eq!(redone.nhalos, 6);
    let catalog = ConvertedCatalog::open(&redone.path).unwrap();
    assert_eq!(catalog.total_halos().unwrap(), 6);
    assert_eq!(catalog.forests().len(), 2);
}

#[test]
fn test_workers_split_forests_by_size() {
    let (dir, out) = workspace();
    let inputs = write_mode_a(
        dir.path(),
        &[
            (10, Tree::halos(1, 2)),
            (20, Tree::halos(2, 2)),
            (30, Tree::halos(3, 2)),
            (40, Tree::halos(4, 2)),
        ],
    );
    let config = native_config(inputs, &out).with_workers(2);
    let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");
    assert_eq!(summary.output_files.len(), 2);
    assert_eq!(summary.halos, 8);

    let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
    let per_file = |i: usize| catalog.forests().iter().filter(|f| f.file_index == i).count();
    assert_eq!(per_file(0), 2);
    assert_eq!(per_file(1), 2);

    let first_file_rows: u64 = catalog
        .forests()
        .iter()
        .filter(|f| f.file_index == 0)
        .map(|f| f.nhalos)
        .sum();
    for forest in catalog.forests() {
        let base = if forest.file_index == 0 { 0 } else { first_file_rows };
        assert_eq!(forest.global_offset, base + forest.file_offset);
        let halos = catalog.read_forest(forest).unwrap();
        let root = forest.forest_id / 10;
        assert_eq!(ids(&halos), vec![root * 100, root * 100 + 1]);
    }
}

#[test]
fn test_more_workers_than_forests_warns() {
    let (dir, out) = workspace();
    let inputs = write_mode_a(dir.path(), &[(5, Tree::halos(1, 4))]);
    let config = native_config(inputs, &out).with_workers(3);
    let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");

    assert_eq!(summary.output_files.len(), 1);
    assert_eq!(
        summary.warnings,
        vec![
            ConversionWarning::PartitionEmpty { worker: 1 },
            ConversionWarning::PartitionEmpty { worker: 2 },
        ]
    );
    let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
    assert_eq!(catalog.output_files().len(), 1);
    assert_eq!(catalog.total_halos().unwrap(), 4);
}

#[test]
fn test_malformed_record_aborts_without_finalizing() {
    let (dir, out) = workspace();
    let inputs = write_mode_a(
        dir.path(),
        &[
            (100, Tree::halos(1, 2)),
            (200, Tree::halos(2, 1).with_line("1.0 5 -1 0 -1")),
        ],
    );
    let mut coordinator = ConversionCoordinator::new(native_config(inputs, &out));
    let err = coordinator.run().expect_err("Expected malformed record");
    assert!(matches!(err, ConvertError::MalformedRecord { .. }), "got {:?}", err);
    assert_eq!(coordinator.state(), RunState::Failed);

    assert!(!out.join("forests_index.ctc").exists());
    assert!(ConvertedCatalog::open_dir(&out, Backend::Native).is_err());
    let worker = NativeContainer::open(out.join("forest_0.ctc")).unwrap();
    assert!(!container::is_finalized(&worker).unwrap());
}

#[test]
fn test_skip_policy_counts_bad_records() {
    let (dir, out) = workspace();
    let inputs = write_mode_a(
        dir.path(),
        &[
            (100, Tree::halos(1, 2)),
            (200, Tree::halos(2, 1).with_line("1.0 5 -1 0 -1").with_line("1.0 x -1 0 -1 2e10")),
        ],
    );
    let config = native_config(inputs, &out).with_failure_policy(FailurePolicy::SkipRecord);
    let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");
    assert_eq!(summary.skipped_records, 2);
    assert_eq!(summary.halos, 3);

    let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
    assert_eq!(catalog.skipped_records().unwrap(), 2);
    let forest = catalog.find(0, 200).expect("forest 200 missing");
    assert_eq!(forest.nhalos, 1);
}

#[test]
fn test_field_selection_limits_columns() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let mut config = native_config(inputs, &out);
    config.selection = FieldSelection {
        fields: Some(vec!["id".into(), "mvir".into(), "pid".into()]),
        drop_fields: vec!["pid".into()],
    };
    let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");
    let catalog = ConvertedCatalog::open(&summary.index_file).unwrap();
    let names: Vec<_> = catalog.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "mvir"]);
    let halos = catalog.read_forest(&catalog.forests()[1]).unwrap();
    assert_eq!(halos[0], ColumnData::I64(vec![300, 301, 302]));
}

#[test]
fn test_tree_files_mode_scopes_forest_ids() {
    let (dir, out) = workspace();
    let mut files = Vec::new();
    for rank in 0..2i64 {
        let path = dir.path().join(format!("tree_{}.dat", rank));
        let trees = [Tree::halos(1, 1 + rank as usize), Tree::halos(2, 1)];
        let offsets = write_tree_file(&path, HEADER, &trees);
        fs::write(
            dir.path().join(format!("tree_{}.forest", rank)),
            "#TreeRootID ForestID\n1 1\n2 1\n",
        )
        .unwrap();
        fs::write(
            dir.path().join(format!("tree_{}.loc", rank)),
            format!(
                "#TreeRootID FileID Offset Filename\n1 {r} {} tree_{r}.dat\n2 {r} {} tree_{r}.dat\n",
                offsets[0],
                offsets[1],
                r = rank
            ),
        )
        .unwrap();
        files.push(path);
    }

    let config = native_config(TreeInputs::TreeFiles(files), &out).with_workers(2);
    let summary = ConversionCoordinator::new(config).run().expect("Conversion failed");
    assert_eq!(summary.forests, 2);
    assert_eq!(summary.halos, 5);

    let catalog = ConvertedCatalog::open_dir(&out, Backend::Native).unwrap();
    let keys: Vec<_> = catalog.forests().iter().map(|f| (f.scope, f.forest_id)).collect();
    assert_eq!(keys, vec![(0, 1), (1, 1)]);
    assert_eq!(catalog.find(1, 1).unwrap().nhalos, 3);
}

#[test]
fn test_mismatched_tree_headers_rejected() {
    let (dir, out) = workspace();
    let mut files = Vec::new();
    let headers = [HEADER, "#scale(0) id(1) desc_id(2) num_prog(3) pid(4) rvir(5)\n"];
    for (rank, header) in headers.iter().enumerate() {
        let path = dir.path().join(format!("tree_{}.dat", rank));
        let offsets = write_tree_file(&path, header, &[Tree::halos(1, 1)]);
        fs::write(dir.path().join(format!("tree_{}.forest", rank)), "#TreeRootID ForestID\n1 1\n").unwrap();
        fs::write(
            dir.path().join(format!("tree_{}.loc", rank)),
            format!("#TreeRootID FileID Offset Filename\n1 0 {} x.dat\n", offsets[0]),
        )
        .unwrap();
        files.push(path);
    }
    let config = native_config(TreeInputs::TreeFiles(files), &out);
    let err = ConversionCoordinator::new(config).run().expect_err("Expected schema mismatch");
    assert!(matches!(err, ConvertError::SchemaMismatch { .. }), "got {:?}", err);
    assert!(!out.join("forest_0.ctc").exists());
}

#[test]
fn test_tree_metadata_mismatch_rejected() {
    let (dir, out) = workspace();
    let mut files = Vec::new();
    let other_box = HEADER.replace("62.5 Mpc/h", "125.0 Mpc/h");
    for (rank, header) in [HEADER, other_box.as_str()].iter().enumerate() {
        let path = dir.path().join(format!("tree_{}.dat", rank));
        let offsets = write_tree_file(&path, header, &[Tree::halos(1, 1)]);
        fs::write(dir.path().join(format!("tree_{}.forest", rank)), "#TreeRootID ForestID\n1 1\n").unwrap();
        fs::write(
            dir.path().join(format!("tree_{}.loc", rank)),
            format!("#TreeRootID FileID Offset Filename\n1 0 {} x.dat\n", offsets[0]),
        )
        .unwrap();
        files.push(path);
    }
    let config = native_config(TreeInputs::TreeFiles(files), &out);
    let err = ConversionCoordinator::new(config).run().expect_err("Expected metadata mismatch");
    assert!(matches!(err, ConvertError::SchemaMismatch { .. }), "got {:?}", err);
}

#[test]
fn test_halo_catalog_given_as_tree_file_rejected() {
    let (dir, out) = workspace();
    let hlist = "#scale(0) id(1) desc_id(2) num_prog(3) pid(4) mvir(5)\n#a = 1.00000\n";
    let text = format!("{}1.0 100 -1 0 -1 1.5e10\n1.0 101 -1 1 -1 1.5e11\n", hlist);
    fs::write(dir.path().join("tree_0_0_0.dat"), text).unwrap();
    fs::write(dir.path().join("forests.list"), "#TreeRootID ForestID\n1 100\n").unwrap();
    fs::write(
        dir.path().join("locations.dat"),
        format!("#TreeRootID FileID Offset Filename\n1 0 {} tree_0_0_0.dat\n", hlist.len()),
    )
    .unwrap();
    let inputs = TreeInputs::IndexFiles {
        first: dir.path().join("forests.list"),
        second: dir.path().join("locations.dat"),
    };

    let config = native_config(inputs, &out).with_failure_policy(FailurePolicy::SkipRecord);
    let mut coordinator = ConversionCoordinator::new(config);
    let err = coordinator.run().expect_err("Expected wrong catalog kind");
    assert!(matches!(err, ConvertError::WrongCatalogKind { .. }), "got {:?}", err);
    assert_eq!(coordinator.state(), RunState::Failed);
    assert!(fs::read_dir(&out).unwrap().next().is_none());
}

#[test]
fn test_stop_signal_cancels_run() {
    let (dir, out) = workspace();
    let inputs = two_forests(dir.path());
    let mut coordinator = ConversionCoordinator::new(native_config(inputs, &out));
    coordinator
        .stop_signal()
        .store(true, std::sync::atomic::Ordering::Relaxed);

    assert!(matches!(coordinator.run(), Err(ConvertError::Cancelled)));
    assert_eq!(coordinator.state(), RunState::Failed);
    assert!(!out.join("forests_index.ctc").exists());
}

#[test]
fn test_missing_output_directory_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = two_forests(dir.path());
    let config = native_config(inputs, dir.path().join("nope"));
    assert!(matches!(
        ConversionCoordinator::new(config).run(),
        Err(ConvertError::InvalidConfig(_))
    ));
}
