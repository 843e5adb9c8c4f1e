//! Applying a patch stack to a game install.
//!
//! The [`OverlayApplier`] runs the whole pipeline against one [`GameConfig`]:
//!
//! 1. Check every patch supports the game version and merge their archive targets.
//! 2. Skip the run if the last completed application used the same stack and every file it
//!    touched is still as it was left.
//! 3. Index the pristine game: archives are listed through the codec, reading the backup
//!    when one exists.
//! 4. [`resolve`] the stack.
//! 5. Restore files the previous application touched and this one doesn't.
//! 6. Back up and repack changed archives in parallel, then write and delete loose files.
//! 7. Persist the [`AppliedState`].
//!
//! Reverting is applying an empty stack.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use pk_patch::{normalize_path, Bucket, ModFilePath};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::{ArchiveCodec, ArchiveFormat, ArchiveReader, ZipCodec};
use crate::error::{Error, Result};
use crate::library::PatchLibrary;
use crate::repack::{apply_loose, repack_archive, LooseStats, RepackStats};
use crate::resolver::{resolve, ActivePatch, BaseIndex, Conflict};
use crate::state::{AppliedPatch, AppliedState, TouchedFile};
use crate::utils::{copy_atomic, fingerprint_files, remove_file_if_exists};

pub const APPLIED_STATE_FILE: &str = "applied.json";
pub const BACKUPS_DIR: &str = "backups";

/// The game install a stack is applied to.
///
/// Loaded from JSON or TOML:
///
/// ```toml
/// game_dir = "/games/example"
/// version = "1.2"
/// archive_format = "zip"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub game_dir: Utf8PathBuf,

    /// Checked against each patch's supported game versions. Empty skips the check.
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub archive_format: ArchiveFormat,
}

impl GameConfig {
    pub fn new(game_dir: impl Into<Utf8PathBuf>, version: impl Into<String>) -> Self {
        Self {
            game_dir: game_dir.into(),
            version: version.into(),
            archive_format: ArchiveFormat::default(),
        }
    }

    /// Load a config file. `.toml` files are parsed as TOML, anything else as JSON.
    /// A relative `game_dir` is resolved against the config file's directory.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_std_path())?;
        let mut config: Self = match path.extension() {
            Some(extension) if extension.eq_ignore_ascii_case("toml") => toml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };

        if config.game_dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.game_dir = parent.join(&config.game_dir);
            }
        }
        Ok(config)
    }
}

/// Progress information emitted while applying.
///
/// `current`/`total` are only meaningful during [`Repacking`](ApplyStage::Repacking).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyProgress {
    pub stage: ApplyStage,
    pub current_file: Option<String>,
    pub current: u32,
    pub total: u32,
}

/// Emitted in order, `Repacking` once per archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyStage {
    Indexing,
    Resolving,
    Restoring,
    Repacking,
    WritingLoose,
    Complete,
}

/// Summary of one apply.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Nothing changed since the last application.
    pub skipped: bool,
    pub repacked: Vec<RepackStats>,
    pub loose: LooseStats,
    /// Files put back to their pristine state.
    pub restored: Vec<Utf8PathBuf>,
    pub conflicts: Vec<Conflict>,
    pub elapsed: Duration,
}

type ProgressCallback = Arc<dyn Fn(ApplyProgress) + Send + Sync>;

/// Applies patch stacks to one game install.
pub struct OverlayApplier {
    game: GameConfig,
    state_dir: Utf8PathBuf,
    progress_callback: Option<ProgressCallback>,
}

impl OverlayApplier {
    /// `state_dir` holds the backups and applied state of this game install; see
    /// [`PatchLibrary::game_state_dir`].
    pub fn new(game: GameConfig, state_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            game,
            state_dir: state_dir.into(),
            progress_callback: None,
        }
    }

    /// An applier keeping its state in `library`.
    pub fn for_library(library: &PatchLibrary, game: GameConfig) -> Self {
        let state_dir = library.game_state_dir(&game.game_dir);
        Self::new(game, state_dir)
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ApplyProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn game(&self) -> &GameConfig {
        &self.game
    }

    pub fn state_path(&self) -> Utf8PathBuf {
        self.state_dir.join(APPLIED_STATE_FILE)
    }

    /// The state of the last application, if any.
    pub fn applied_state(&self) -> Result<Option<AppliedState>> {
        AppliedState::load(&self.state_path())
    }

    /// Apply `patches` and undo whatever the previous application did that they don't.
    pub fn apply(&self, patches: &[ActivePatch]) -> Result<ApplyResult> {
        match self.game.archive_format {
            ArchiveFormat::Zip => self.apply_with(&ZipCodec::default(), patches),
        }
    }

    /// Restore every file the overlay touched.
    pub fn revert(&self) -> Result<ApplyResult> {
        self.apply(&[])
    }

    /// [`apply`](Self::apply) with an explicit codec.
    pub fn apply_with<C: ArchiveCodec>(&self, codec: &C, patches: &[ActivePatch]) -> Result<ApplyResult> {
        let start_time = Instant::now();
        let game_dir = &self.game.game_dir;

        tracing::info!("Applying patch stack...");
        tracing::info!("Game dir: {}", game_dir);
        tracing::info!("State dir: {}", self.state_dir);
        tracing::info!("Patches: {}", patches.len());

        if !game_dir.as_std_path().is_dir() {
            return Err(Error::Other(format!("game directory '{}' does not exist", game_dir)));
        }

        self.emit_progress(ApplyStage::Indexing, None, 0, 0);

        let mut ordered: Vec<&ActivePatch> = patches.iter().collect();
        ordered.sort_by_key(|patch| patch.priority);
        for patch in &ordered {
            if !self.game.version.is_empty() && !patch.manifest.files.supports_game_version(&self.game.version) {
                return Err(Error::IncompatiblePatch {
                    patch_id: patch.id().to_string(),
                    version: self.game.version.clone(),
                });
            }
        }
        let applied: Vec<AppliedPatch> = ordered
            .iter()
            .map(|patch| AppliedPatch {
                id: patch.manifest.id.clone(),
                revision: patch.manifest.revision,
            })
            .collect();

        let targets = collect_archive_targets(&ordered)?;

        let previous = self.applied_state()?;
        if let Some(previous) = &previous {
            if previous.matches(&self.game.version, &applied) && previous.is_current(game_dir) {
                tracing::info!("Overlay: reusing applied state (stack and files unchanged)");
                self.emit_progress(ApplyStage::Complete, None, 0, 0);
                return Ok(ApplyResult {
                    skipped: true,
                    elapsed: start_time.elapsed(),
                    ..Default::default()
                });
            }
        }

        let previous_touched = self.drop_stale_backups(previous.as_ref())?;
        let created_by_us = |relative: &Utf8Path| {
            previous_touched
                .get(&path_key(relative))
                .is_some_and(|file| !file.backed_up)
        };

        let mut base = BaseIndex::new();
        for (id, relative) in &targets {
            let pristine = self.pristine_path(relative);
            if !pristine.as_std_path().is_file() {
                return Err(Error::ArchiveNotFound {
                    archive_id: id.clone(),
                    path: game_dir.join(relative),
                });
            }

            let reader = codec.open_for_read(&pristine)?;
            let entries = reader
                .entries()
                .iter()
                .filter_map(|entry| ModFilePath::in_archive(id, &entry.path).ok())
                .collect::<Vec<_>>();
            reader.close();

            tracing::debug!("Indexed archive id={} entries={}", id, entries.len());
            base.insert_archive(id, entries);
        }

        for patch in &ordered {
            for path in patch.manifest.files.removals()? {
                if !path.is_loose() {
                    continue;
                }
                let relative = Utf8PathBuf::from(path.relative_path());
                let present = self.backup_path(&relative).as_std_path().is_file()
                    || (game_dir.join(&relative).as_std_path().is_file() && !created_by_us(relative.as_path()));
                if present {
                    base.insert_loose(path);
                }
            }
        }

        self.emit_progress(ApplyStage::Resolving, None, 0, 0);
        let table = resolve(patches, &base)?;

        // Everything this application will modify, keyed by normalized path
        let mut touched: BTreeMap<String, Utf8PathBuf> = BTreeMap::new();
        let mut repacks = Vec::new();
        for (id, resolution) in table.archives() {
            if resolution.is_unchanged() {
                continue;
            }
            let relative = targets
                .get(id)
                .ok_or_else(|| Error::Other(format!("archive '{}' has no target path", id)))?;
            touched.insert(path_key(relative), relative.clone());
            repacks.push((id, relative, resolution));
        }

        let loose = table.loose().cloned().unwrap_or_default();
        for path in loose.overlay.iter().map(|entry| &entry.path).chain(&loose.removed) {
            let relative = Utf8PathBuf::from(path.relative_path());
            touched.insert(path_key(&relative), relative);
        }

        // Written before any modification so an interrupted run can still be restored
        let mut in_progress = AppliedState::new(game_dir.clone(), self.game.version.clone(), Vec::new());
        let mut union: BTreeMap<String, TouchedFile> = previous_touched.clone();
        for (key, relative) in &touched {
            union.entry(key.clone()).or_insert_with(|| TouchedFile {
                path: relative.clone(),
                backed_up: game_dir.join(relative).as_std_path().is_file() && !created_by_us(relative.as_path()),
                fingerprint: None,
            });
        }
        in_progress.touched = union
            .into_values()
            .map(|file| TouchedFile {
                fingerprint: None,
                ..file
            })
            .collect();
        in_progress.save(&self.state_path())?;

        self.emit_progress(ApplyStage::Restoring, None, 0, 0);
        let mut restored = Vec::new();
        for (key, file) in &previous_touched {
            if touched.contains_key(key) {
                continue;
            }
            self.restore(file)?;
            restored.push(file.path.clone());
        }

        for (_, relative, _) in &repacks {
            self.backup(relative, created_by_us(relative.as_path()))?;
        }

        let total = repacks.len() as u32;
        let done = AtomicU32::new(0);
        let repacked = repacks
            .par_iter()
            .map(|(id, relative, resolution)| {
                let original = self.pristine_path(relative);
                let stats = repack_archive(codec, id, &original, &game_dir.join(relative), resolution)?;

                let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.emit_progress(ApplyStage::Repacking, Some(relative.to_string()), current, total);
                Ok(stats)
            })
            .collect::<Result<Vec<_>>>()?;

        self.emit_progress(ApplyStage::WritingLoose, None, 0, 0);
        for path in loose.overlay.iter().map(|entry| &entry.path).chain(&loose.removed) {
            let relative = Utf8PathBuf::from(path.relative_path());
            self.backup(&relative, created_by_us(relative.as_path()))?;
        }
        let loose_stats = apply_loose(game_dir, &loose)?;

        let mut state = AppliedState::new(game_dir.clone(), self.game.version.clone(), applied);
        state.touched = touched
            .into_values()
            .map(|relative| TouchedFile {
                backed_up: self.backup_path(&relative).as_std_path().is_file(),
                fingerprint: Some(fingerprint_files(game_dir, [relative.as_path()])),
                path: relative,
            })
            .collect();
        state.complete = true;
        state.save(&self.state_path())?;

        for conflict in &table.conflicts {
            tracing::info!(
                "Conflict path={} contributors={:?} winner={}",
                conflict.path,
                conflict.contributors,
                conflict.winner
            );
        }

        self.emit_progress(ApplyStage::Complete, None, total, total);
        let elapsed = start_time.elapsed();
        tracing::info!(
            "Applied patch stack archives={} loose_written={} loose_removed={} restored={} in {:?}",
            repacked.len(),
            loose_stats.written,
            loose_stats.removed,
            restored.len(),
            elapsed
        );

        Ok(ApplyResult {
            skipped: false,
            repacked,
            loose: loose_stats,
            restored,
            conflicts: table.conflicts,
            elapsed,
        })
    }

    /// Previously touched files keyed by normalized path. Files changed since the last
    /// application (a game update, say) lose their backup: the game's new copy is pristine.
    fn drop_stale_backups(&self, previous: Option<&AppliedState>) -> Result<BTreeMap<String, TouchedFile>> {
        let mut touched = BTreeMap::new();
        let Some(previous) = previous else {
            return Ok(touched);
        };

        for file in &previous.touched {
            if file.is_stale(&self.game.game_dir) {
                tracing::warn!("'{}' changed since it was patched, treating it as pristine", file.path);
                remove_file_if_exists(&self.backup_path(&file.path))?;
                continue;
            }
            touched.insert(path_key(&file.path), file.clone());
        }
        Ok(touched)
    }

    fn backup_path(&self, relative: &Utf8Path) -> Utf8PathBuf {
        self.state_dir.join(BACKUPS_DIR).join(relative)
    }

    /// The unmodified copy of a game file: its backup if there is one.
    fn pristine_path(&self, relative: &Utf8Path) -> Utf8PathBuf {
        let backup = self.backup_path(relative);
        match backup.as_std_path().is_file() {
            true => backup,
            false => self.game.game_dir.join(relative),
        }
    }

    /// Save a pristine copy of a game file before its first modification.
    fn backup(&self, relative: &Utf8Path, created_by_us: bool) -> Result<()> {
        let backup = self.backup_path(relative);
        let game_file = self.game.game_dir.join(relative);
        if created_by_us || backup.as_std_path().is_file() || !game_file.as_std_path().is_file() {
            return Ok(());
        }

        let bytes = copy_atomic(&game_file, &backup)?;
        tracing::debug!("Backed up path={} bytes={}", relative, bytes);
        Ok(())
    }

    /// Put a touched file back the way it was before the first application.
    fn restore(&self, file: &TouchedFile) -> Result<()> {
        let game_file = self.game.game_dir.join(&file.path);
        let backup = self.backup_path(&file.path);

        // A backed up file without a backup was never modified
        if backup.as_std_path().is_file() {
            copy_atomic(&backup, &game_file)?;
            remove_file_if_exists(&backup)?;
            tracing::debug!("Restored path={}", file.path);
        } else if !file.backed_up {
            remove_file_if_exists(&game_file)?;
            tracing::debug!("Deleted created file path={}", file.path);
        }
        Ok(())
    }

    fn emit_progress(&self, stage: ApplyStage, current_file: Option<String>, current: u32, total: u32) {
        if let Some(callback) = &self.progress_callback {
            callback(ApplyProgress {
                stage,
                current_file,
                current,
                total,
            });
        }
    }
}

/// Merge the archive targets of all patches. One archive id must map to one path.
fn collect_archive_targets(patches: &[&ActivePatch]) -> Result<HashMap<String, Utf8PathBuf>> {
    let mut targets: HashMap<String, Utf8PathBuf> = HashMap::new();
    let mut seen_paths: HashMap<String, String> = HashMap::new();

    for patch in patches {
        for archive in &patch.manifest.files.archives {
            let id = Bucket::archive(&archive.id)?.key().to_string();
            let key = path_key(&archive.path);

            match targets.get(&id) {
                Some(existing) if path_key(existing) != key => {
                    return Err(Error::ArchiveConflict {
                        archive_id: id,
                        first: existing.clone(),
                        second: archive.path.clone(),
                    });
                }
                Some(_) => continue,
                None => {}
            }

            if let Some(other) = seen_paths.get(&key) {
                return Err(Error::Other(format!(
                    "archives '{}' and '{}' both target {}",
                    other, id, archive.path
                )));
            }

            seen_paths.insert(key, id.clone());
            targets.insert(id, archive.path.clone());
        }
    }

    Ok(targets)
}

/// Comparison key for a game-relative path.
fn path_key(path: &Utf8Path) -> String {
    normalize_path(path.as_str()).unwrap_or_else(|_| path.as_str().to_lowercase())
}

impl std::fmt::Debug for OverlayApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayApplier")
            .field("game", &self.game)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}
