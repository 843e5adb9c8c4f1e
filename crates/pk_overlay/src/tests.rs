//! End-to-end tests: patch stacks applied to a scratch game install.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use pk_container::SharedSource;
use pk_patch::PatchManifest;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::apply::{ApplyStage, GameConfig, OverlayApplier};
use crate::error::Error;
use crate::library::PatchLibrary;
use crate::pack::pack_patch_dir;
use crate::resolver::ActivePatch;
use crate::source::{DataSource, Ownership, VirtualSource};

/// Routes `tracing` output through the test harness; `RUST_LOG=pk_overlay=debug` shows it.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Game {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Game {
    /// A game with `data/core.zip` holding `a.txt` and `b.txt`, and a loose `readme.txt`.
    fn new() -> Self {
        init_tracing();
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let game = Self { _dir: dir, root };

        std::fs::create_dir_all(game.game_dir().join("data").as_std_path()).unwrap();
        game.write_archive(&[("a.txt", "original a"), ("b.txt", "original b")]);
        std::fs::write(game.game_dir().join("readme.txt").as_std_path(), "readme").unwrap();
        game
    }

    fn game_dir(&self) -> Utf8PathBuf {
        self.root.join("game")
    }

    fn archive_path(&self) -> Utf8PathBuf {
        self.game_dir().join("data/core.zip")
    }

    fn write_archive(&self, files: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(self.archive_path().as_std_path()).unwrap());
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn archive(&self) -> Vec<(String, String)> {
        let mut archive = ZipArchive::new(File::open(self.archive_path().as_std_path()).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut content = String::new();
                file.read_to_string(&mut content).unwrap();
                (file.name().to_string(), content)
            })
            .collect()
    }

    fn archive_bytes(&self) -> Vec<u8> {
        std::fs::read(self.archive_path().as_std_path()).unwrap()
    }

    fn loose(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.game_dir().join(path).as_std_path()).ok()
    }

    fn applier(&self, version: &str) -> OverlayApplier {
        OverlayApplier::new(GameConfig::new(self.game_dir(), version), self.root.join("state"))
    }

    fn backups(&self) -> Utf8PathBuf {
        self.root.join("state/backups")
    }
}

fn pairs(files: &[(&str, &str)]) -> Vec<(String, String)> {
    files.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
}

/// A patch whose resources are `(resource name, content)` pairs.
fn patch(json: &str, resources: &[(&str, &str)], priority: i32) -> ActivePatch {
    let mut source = VirtualSource::new(Ownership::Owned);
    for (name, content) in resources {
        source = source.with_resource_bytes(name, content.as_bytes().to_vec()).unwrap();
    }
    ActivePatch {
        manifest: PatchManifest::from_json(json).unwrap(),
        source: Arc::new(source),
        priority,
    }
}

fn replaces_a(priority: i32) -> ActivePatch {
    patch(
        r#"{ "id": "replace-a", "name": "Replace A", "revision": 1,
             "files": { "archives": [{ "id": "core", "path": "data/core.zip" }],
                        "added_files": { "core": ["A.txt", "new/c.txt"], "loose": ["mods/extra.txt"] } } }"#,
        &[
            ("core/a.txt", "patched a"),
            ("core/new/c.txt", "added c"),
            ("loose/mods/extra.txt", "extra"),
        ],
        priority,
    )
}

fn removes_a(priority: i32) -> ActivePatch {
    patch(
        r#"{ "id": "remove-a", "name": "Remove A", "revision": 1,
             "files": { "archives": [{ "id": "core", "path": "data/core.zip" }],
                        "removed_files": { "core": ["a.txt"], "loose": ["readme.txt"] } } }"#,
        &[],
        priority,
    )
}

#[test]
fn test_apply_and_revert() {
    let game = Game::new();
    let pristine = game.archive_bytes();
    let applier = game.applier("1.0");

    let result = applier.apply(&[replaces_a(0)]).unwrap();

    assert!(!result.skipped);
    assert_eq!(result.repacked.len(), 1);
    assert_eq!((result.repacked[0].replaced, result.repacked[0].added), (1, 1));
    assert_eq!(
        game.archive(),
        pairs(&[("a.txt", "patched a"), ("b.txt", "original b"), ("new/c.txt", "added c")])
    );
    assert_eq!(game.loose("mods/extra.txt").as_deref(), Some("extra"));

    let result = applier.revert().unwrap();

    assert_eq!(result.restored.len(), 2);
    assert_eq!(game.archive_bytes(), pristine);
    assert_eq!(game.loose("mods/extra.txt"), None);
    assert_eq!(game.loose("readme.txt").as_deref(), Some("readme"));
    assert!(!game.backups().join("data/core.zip").as_std_path().exists());
}

#[test]
fn test_priority_order_decides_end_to_end() {
    let game = Game::new();
    let applier = game.applier("1.0");

    // Removal has the higher priority: a.txt and readme.txt are gone
    applier.apply(&[replaces_a(1), removes_a(2)]).unwrap();
    assert_eq!(
        game.archive(),
        pairs(&[("b.txt", "original b"), ("new/c.txt", "added c")])
    );
    assert_eq!(game.loose("readme.txt"), None);

    // Swapped: the replacement wins and is built from the pristine archive, not the
    // previous result
    let result = applier.apply(&[removes_a(1), replaces_a(2)]).unwrap();
    assert_eq!(
        game.archive(),
        pairs(&[("a.txt", "patched a"), ("b.txt", "original b"), ("new/c.txt", "added c")])
    );
    assert_eq!(game.loose("readme.txt"), None);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].winner, "replace-a");
}

#[test]
fn test_reapply_unchanged_stack_is_skipped() {
    let game = Game::new();
    let applier = game.applier("1.0");

    applier.apply(&[replaces_a(0)]).unwrap();
    let applied = game.archive_bytes();

    let result = applier.apply(&[replaces_a(0)]).unwrap();
    assert!(result.skipped);
    assert_eq!(game.archive_bytes(), applied);

    // A different stack is not skipped
    let result = applier.apply(&[removes_a(0)]).unwrap();
    assert!(!result.skipped);
    assert_eq!(game.loose("mods/extra.txt"), None);
}

#[test]
fn test_dropping_a_patch_restores_its_files() {
    let game = Game::new();
    let pristine = game.archive_bytes();
    let applier = game.applier("1.0");

    applier.apply(&[removes_a(0)]).unwrap();
    assert_eq!(game.loose("readme.txt"), None);

    let result = applier.apply(&[]).unwrap();
    assert_eq!(game.loose("readme.txt").as_deref(), Some("readme"));
    assert_eq!(game.archive_bytes(), pristine);
    assert_eq!(result.restored.len(), 2);
}

#[test]
fn test_game_update_refreshes_backups() {
    let game = Game::new();
    let applier = game.applier("1.0");
    applier.apply(&[replaces_a(0)]).unwrap();

    // The game replaces the patched archive with a new release
    game.write_archive(&[("a.txt", "updated a"), ("b.txt", "updated b"), ("d.txt", "new d")]);
    let updated = game.archive_bytes();

    let result = applier.apply(&[replaces_a(0)]).unwrap();
    assert!(!result.skipped);
    assert_eq!(
        game.archive(),
        pairs(&[
            ("a.txt", "patched a"),
            ("b.txt", "updated b"),
            ("d.txt", "new d"),
            ("new/c.txt", "added c"),
        ])
    );

    applier.revert().unwrap();
    assert_eq!(game.archive_bytes(), updated);
}

#[test]
fn test_failed_repack_keeps_game_intact() {
    let game = Game::new();
    let pristine = game.archive_bytes();
    let applier = game.applier("1.0");

    // The stream is closed after resolution succeeds, so the write pass fails
    let stream = SharedSource::new(std::io::Cursor::new(b"broken".to_vec()));
    let source = VirtualSource::new(Ownership::Borrowed)
        .with_resource("core/a.txt", stream.clone())
        .unwrap();
    stream.close();
    let broken = ActivePatch {
        manifest: PatchManifest::from_json(
            r#"{ "id": "broken", "name": "Broken",
                 "files": { "archives": [{ "id": "core", "path": "data/core.zip" }],
                            "added_files": { "core": ["a.txt"] } } }"#,
        )
        .unwrap(),
        source: Arc::new(source),
        priority: 0,
    };

    let result = applier.apply(&[broken]);
    match result {
        Err(Error::ArchiveWrite { archive_id, patch_id, .. }) => {
            assert_eq!(archive_id, "core");
            assert_eq!(patch_id.as_deref(), Some("broken"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(game.archive_bytes(), pristine);

    // The interrupted run is recorded and can be reverted
    let state = applier.applied_state().unwrap().unwrap();
    assert!(!state.complete);
    applier.revert().unwrap();
    assert_eq!(game.archive_bytes(), pristine);
    assert!(!game.backups().join("data/core.zip").as_std_path().exists());
}

#[test]
fn test_missing_resource_aborts_before_touching_the_game() {
    let game = Game::new();
    let pristine = game.archive_bytes();
    let applier = game.applier("1.0");

    let incomplete = patch(
        r#"{ "id": "incomplete", "name": "Incomplete",
             "files": { "archives": [{ "id": "core", "path": "data/core.zip" }],
                        "added_files": { "core": ["a.txt"] } } }"#,
        &[],
        1,
    );

    let result = applier.apply(&[replaces_a(0), incomplete]);
    assert!(matches!(
        result,
        Err(Error::MissingResource { patch_id, resource }) if patch_id == "incomplete" && resource == "core/a.txt"
    ));
    assert_eq!(game.archive_bytes(), pristine);
    assert_eq!(game.loose("mods/extra.txt"), None);
    assert!(applier.applied_state().unwrap().is_none());
}

#[test]
fn test_incompatible_game_version() {
    let game = Game::new();
    let versioned = patch(
        r#"{ "id": "versioned", "name": "Versioned", "files": { "game_versions": ["2.0"] } }"#,
        &[],
        0,
    );

    let result = game.applier("1.0").apply(&[versioned.clone()]);
    assert!(matches!(result, Err(Error::IncompatiblePatch { .. })));

    assert!(game.applier("2.0").apply(&[versioned.clone()]).is_ok());
    // An unversioned game accepts every patch
    assert!(game.applier("").apply(&[versioned]).is_ok());
}

#[test]
fn test_conflicting_archive_targets() {
    let game = Game::new();
    let other = patch(
        r#"{ "id": "other", "name": "Other",
             "files": { "archives": [{ "id": "core", "path": "data/other.zip" }] } }"#,
        &[],
        1,
    );

    let result = game.applier("1.0").apply(&[replaces_a(0), other]);
    assert!(matches!(result, Err(Error::ArchiveConflict { archive_id, .. }) if archive_id == "core"));
}

#[test]
fn test_missing_archive() {
    let game = Game::new();
    let missing = patch(
        r#"{ "id": "missing", "name": "Missing",
             "files": { "archives": [{ "id": "ui", "path": "data/ui.zip" }],
                        "removed_files": { "ui": ["x.txt"] } } }"#,
        &[],
        0,
    );

    let result = game.applier("1.0").apply(&[missing]);
    assert!(matches!(result, Err(Error::ArchiveNotFound { archive_id, .. }) if archive_id == "ui"));
}

#[test]
fn test_loose_remove_then_readd_by_higher_priority() {
    let game = Game::new();
    std::fs::write(game.game_dir().join("a.txt").as_std_path(), "game a").unwrap();

    let p1 = patch(
        r#"{ "id": "p1", "name": "P1", "files": { "removed_files": { "loose": ["a.txt"] } } }"#,
        &[],
        1,
    );
    let p2 = patch(
        r#"{ "id": "p2", "name": "P2", "files": { "added_files": { "loose": ["a.txt"] } } }"#,
        &[("loose/a.txt", "from p2")],
        2,
    );

    let applier = game.applier("1.0");
    let result = applier.apply(&[p1, p2]).unwrap();

    assert_eq!(game.loose("a.txt").as_deref(), Some("from p2"));
    assert_eq!((result.loose.written, result.loose.removed), (1, 0));

    applier.revert().unwrap();
    assert_eq!(game.loose("a.txt").as_deref(), Some("game a"));
}

#[test]
fn test_progress_stages() {
    let game = Game::new();
    let stages = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&stages);

    game.applier("1.0")
        .with_progress(move |progress| recorded.lock().unwrap().push(progress.stage))
        .apply(&[replaces_a(0)])
        .unwrap();

    assert_eq!(
        *stages.lock().unwrap(),
        vec![
            ApplyStage::Indexing,
            ApplyStage::Resolving,
            ApplyStage::Restoring,
            ApplyStage::Repacking,
            ApplyStage::WritingLoose,
            ApplyStage::Complete,
        ]
    );
}

#[test]
fn test_library_stack_end_to_end() {
    let game = Game::new();
    let patch_dir = game.root.join("src/hd");
    std::fs::create_dir_all(patch_dir.join("assets").as_std_path()).unwrap();
    std::fs::create_dir_all(patch_dir.join("resources/core").as_std_path()).unwrap();
    std::fs::write(
        patch_dir.join("assets/patch.json").as_std_path(),
        r#"{ "id": "hd", "name": "HD", "revision": 1,
             "files": { "archives": [{ "id": "core", "path": "data/core.zip" }] } }"#,
    )
    .unwrap();
    std::fs::write(patch_dir.join("resources/core/b.txt").as_std_path(), "hd b").unwrap();

    let container = game.root.join("hd.pkc");
    pack_patch_dir(&patch_dir, &mut File::create(container.as_std_path()).unwrap()).unwrap();

    let mut library = PatchLibrary::open(game.root.join("library")).unwrap();
    library.install_container(&container).unwrap();
    library.set_enabled(&["hd".to_string()]).unwrap();

    let _lock = library.lock().unwrap();
    let patches = library.active_patches().unwrap();
    let applier = OverlayApplier::for_library(&library, GameConfig::new(game.game_dir(), "1.0"));
    applier.apply(&patches).unwrap();

    assert_eq!(game.archive(), pairs(&[("a.txt", "original a"), ("b.txt", "hd b")]));
    assert!(library
        .game_state_dir(&game.game_dir())
        .join("backups/data/core.zip")
        .as_std_path()
        .is_file());
}

#[test]
fn test_game_config_load() {
    let dir = tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();

    std::fs::write(root.join("game.toml").as_std_path(), "game_dir = \"install\"\nversion = \"1.2\"\n").unwrap();
    let config = GameConfig::load(&root.join("game.toml")).unwrap();
    assert_eq!(config.game_dir, root.join("install"));
    assert_eq!(config.version, "1.2");

    std::fs::write(
        root.join("game.json").as_std_path(),
        r#"{ "game_dir": "/abs/game", "archive_format": "zip" }"#,
    )
    .unwrap();
    let config = GameConfig::load(&root.join("game.json")).unwrap();
    assert_eq!(config.game_dir, Utf8PathBuf::from("/abs/game"));
    assert!(config.version.is_empty());
}

#[test]
fn test_borrowed_container_source_survives_drop() {
    use crate::source::ContainerSource;
    use pk_container::ResourceContainer;

    let game = Game::new();
    let patch_dir = game.root.join("src/p");
    std::fs::create_dir_all(patch_dir.join("assets").as_std_path()).unwrap();
    std::fs::create_dir_all(patch_dir.join("resources/loose").as_std_path()).unwrap();
    std::fs::write(
        patch_dir.join("assets/patch.json").as_std_path(),
        r#"{ "id": "p", "name": "P" }"#,
    )
    .unwrap();
    std::fs::write(patch_dir.join("resources/loose/x.txt").as_std_path(), "x").unwrap();
    let path = game.root.join("p.pkc");
    pack_patch_dir(&patch_dir, &mut File::create(path.as_std_path()).unwrap()).unwrap();

    let container = ResourceContainer::open(&path).unwrap();
    drop(ContainerSource::new(container.clone(), "p", Ownership::Borrowed));
    assert!(container.is_open());

    let owned = ContainerSource::new(container.clone(), "p", Ownership::Owned);
    assert!(owned.has_resource("loose/x.txt", false));
    drop(owned);
    assert!(!container.is_open());
}
