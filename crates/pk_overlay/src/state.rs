//! Applied state persistence.
//!
//! After a successful apply an [`AppliedState`] is written to `applied.json` in the game's
//! state directory. The next apply loads it to find out which files it touched before (so
//! files no longer touched can be restored from backup) and whether anything changed at
//! all. An unchanged stack over unchanged files skips the whole run.
//!
//! Each touched file carries a fingerprint of how the overlay left it. A file whose
//! fingerprint no longer matches was replaced by something else, usually a game update, and
//! its backup is stale. Before modifying anything the applier writes an in-progress state
//! without fingerprints, so an interrupted run is never mistaken for a game update.
//!
//! Any mismatch is a full re-apply; there is no incremental diffing.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::{fingerprint_files, persist, temp_file_for};

/// Current schema version of `applied.json`.
pub const APPLIED_STATE_VERSION: u32 = 1;

/// One patch as it was when the stack was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub id: String,
    pub revision: u32,
}

/// A game file the overlay wrote or deleted, relative to the game directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchedFile {
    pub path: Utf8PathBuf,
    /// `true` if a pristine copy was saved before the first modification. A touched file
    /// without a backup did not exist in the game and is deleted on restore.
    pub backed_up: bool,
    /// Size and modification time as the overlay left the file. `None` while an apply is
    /// in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u64>,
}

impl TouchedFile {
    /// Whether the file changed since the overlay wrote it.
    pub fn is_stale(&self, game_dir: &Utf8Path) -> bool {
        self.fingerprint
            .is_some_and(|fingerprint| fingerprint != fingerprint_files(game_dir, [self.path.as_path()]))
    }
}

/// Snapshot of the last applied stack.
///
/// # JSON format
///
/// ```json
/// {
///   "version": 1,
///   "gameDir": "/games/example",
///   "gameVersion": "1.2",
///   "patches": [{ "id": "hd-textures", "revision": 3 }],
///   "touched": [{ "path": "data/core.zip", "backedUp": true, "fingerprint": 1234567890 }],
///   "complete": true,
///   "appliedAt": "2026-01-01T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedState {
    pub version: u32,
    pub game_dir: Utf8PathBuf,
    pub game_version: String,
    /// Applied patches, lowest priority first.
    pub patches: Vec<AppliedPatch>,
    pub touched: Vec<TouchedFile>,
    /// `false` while an apply is running or after it failed.
    pub complete: bool,
    pub applied_at: DateTime<Utc>,
}

impl AppliedState {
    pub fn new(game_dir: Utf8PathBuf, game_version: impl Into<String>, patches: Vec<AppliedPatch>) -> Self {
        Self {
            version: APPLIED_STATE_VERSION,
            game_dir,
            game_version: game_version.into(),
            patches,
            touched: Vec::new(),
            complete: false,
            applied_at: Utc::now(),
        }
    }

    /// Read `applied.json`. A missing file means nothing was applied yet.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        let contents = match std::fs::read(path.as_std_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    /// Write `applied.json` through a temp file in the same directory, so an interrupted
    /// save leaves the previous state in place.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let mut temp = temp_file_for(path)?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        persist(temp, path)
    }

    /// Whether this state is a completed application of the same stack to the same game
    /// version.
    ///
    /// Order matters since it decides conflicts.
    pub fn matches(&self, game_version: &str, patches: &[AppliedPatch]) -> bool {
        self.version == APPLIED_STATE_VERSION
            && self.complete
            && self.game_version == game_version
            && self.patches == patches
    }

    /// Whether every touched file is still exactly as the overlay left it.
    pub fn is_current(&self, game_dir: &Utf8Path) -> bool {
        self.touched
            .iter()
            .all(|file| file.fingerprint.is_some() && !file.is_stale(game_dir))
    }

    pub fn touched_paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.touched.iter().map(|file| file.path.as_path())
    }

    pub fn get(&self, path: &Utf8Path) -> Option<&TouchedFile> {
        self.touched.iter().find(|file| file.path == path)
    }
}
