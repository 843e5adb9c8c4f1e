//! Local patch library.
//!
//! ```text
//! library/
//!   library.json                # LibraryIndex
//!   .lock                       # held while a stack is applied
//!   patches/
//!     <uuid>.pkc                # installed containers (may hold several patches)
//!     <uuid>/                   # installed patch directories
//!   games/
//!     <hash of game dir>/
//!       applied.json            # AppliedState
//!       backups/                # pristine copies of touched game files
//! ```
//!
//! [`PatchLibrary`] is the explicit context the applier works against; nothing here is
//! global. Containers are opened once per file and lent to data sources as
//! [`Ownership::Borrowed`], the library closes them when it is dropped.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use pk_container::ResourceContainer;
use pk_patch::PatchManifest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::resolver::ActivePatch;
use crate::source::{check_resources, read_manifest, ContainerSource, DataSource, Ownership, PhysicalSource};
use crate::utils::{copy_atomic, utf8_path, write_atomic};

pub const LIBRARY_INDEX_FILE: &str = "library.json";
pub const PATCHES_DIR: &str = "patches";
pub const GAMES_DIR: &str = "games";
pub const CONTAINER_EXTENSION: &str = "pkc";
const LOCK_FILE: &str = ".lock";
const LIBRARY_INDEX_VERSION: u32 = 1;

/// How an installed patch is stored under `patches/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStorage {
    Container,
    Directory,
}

/// A patch entry in `library.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPatch {
    pub id: String,
    pub name: String,
    pub revision: u32,
    /// File or directory name under `patches/`.
    pub file: String,
    pub storage: PatchStorage,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryIndex {
    version: u32,
    patches: Vec<InstalledPatch>,
    /// Enabled patch ids, lowest priority first.
    enabled: Vec<String>,
}

impl Default for LibraryIndex {
    fn default() -> Self {
        Self {
            version: LIBRARY_INDEX_VERSION,
            patches: Vec::new(),
            enabled: Vec::new(),
        }
    }
}

/// Exclusive lock on a library directory, released on drop.
#[derive(Debug)]
pub struct LibraryLock {
    file: File,
}

impl Drop for LibraryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release library lock: {}", e);
        }
    }
}

/// Installed patches and their enabled order.
pub struct PatchLibrary {
    root: Utf8PathBuf,
    index: LibraryIndex,
    containers: HashMap<String, ResourceContainer>,
}

impl PatchLibrary {
    /// Open the library at `root`, creating it if needed.
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(PATCHES_DIR).as_std_path())?;

        let index_path = root.join(LIBRARY_INDEX_FILE);
        let index = if index_path.as_std_path().exists() {
            serde_json::from_str(&std::fs::read_to_string(index_path.as_std_path())?)?
        } else {
            LibraryIndex::default()
        };

        Ok(Self {
            root,
            index,
            containers: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn patches(&self) -> &[InstalledPatch] {
        &self.index.patches
    }

    pub fn get(&self, id: &str) -> Option<&InstalledPatch> {
        self.index.patches.iter().find(|patch| patch.id.eq_ignore_ascii_case(id))
    }

    /// Enabled patch ids, lowest priority first.
    pub fn enabled(&self) -> &[String] {
        &self.index.enabled
    }

    /// Take the library lock. Fails with [`Error::LibraryBusy`] if another process holds it.
    pub fn lock(&self) -> Result<LibraryLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE).as_std_path())?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(LibraryLock { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(Error::LibraryBusy(self.root.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// State directory for one game install.
    pub fn game_state_dir(&self, game_dir: &Utf8Path) -> Utf8PathBuf {
        let key = game_dir.as_str().replace('\\', "/").to_lowercase();
        self.root.join(GAMES_DIR).join(format!("{:016x}", xxh3_64(key.as_bytes())))
    }

    /// Install every patch stored in the container at `path`.
    ///
    /// A patch that is already installed is only replaced by a newer revision.
    pub fn install_container(&mut self, path: &Utf8Path) -> Result<Vec<InstalledPatch>> {
        let container = ResourceContainer::open(path)?;
        let mut manifests = Vec::new();
        for owner in container.owners() {
            let source = ContainerSource::new(container.clone(), owner.as_str(), Ownership::Borrowed);
            let manifest = read_manifest(&source)?;
            check_resources(&manifest, &source)?;
            if manifest.key() != owner.to_lowercase() {
                return Err(Error::Other(format!(
                    "manifest id '{}' does not match its owner '{}'",
                    manifest.id, owner
                )));
            }
            manifests.push(manifest);
        }
        container.close();

        if manifests.is_empty() {
            return Err(Error::Other(format!("{} contains no patches", path)));
        }
        for manifest in &manifests {
            self.check_installable(manifest)?;
        }

        let file = format!("{}.{}", Uuid::new_v4(), CONTAINER_EXTENSION);
        copy_atomic(path, &self.patches_dir().join(&file))?;

        let installed = manifests
            .iter()
            .map(|manifest| self.record(manifest, &file, PatchStorage::Container))
            .collect::<Result<Vec<_>>>()?;
        self.save()?;
        Ok(installed)
    }

    /// Install an unpacked patch directory by copying it into the library.
    pub fn install_directory(&mut self, dir: &Utf8Path) -> Result<InstalledPatch> {
        let source = PhysicalSource::open(dir)?;
        let manifest = read_manifest(&source)?;
        check_resources(&manifest, &source)?;
        self.check_installable(&manifest)?;

        let file = Uuid::new_v4().to_string();
        let target = self.patches_dir().join(&file);
        for entry in walkdir::WalkDir::new(dir.as_std_path()) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = utf8_path(entry.into_path()) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            copy_atomic(&path, &target.join(relative))?;
        }

        let installed = self.record(&manifest, &file, PatchStorage::Directory)?;
        self.save()?;
        Ok(installed)
    }

    /// Remove a patch. Its container is deleted once no other installed patch uses it.
    pub fn uninstall(&mut self, id: &str) -> Result<InstalledPatch> {
        let position = self
            .index
            .patches
            .iter()
            .position(|patch| patch.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| Error::PatchNotFound(id.to_string()))?;

        let removed = self.index.patches.remove(position);
        self.index.enabled.retain(|enabled| !enabled.eq_ignore_ascii_case(&removed.id));
        self.release_file(&removed.file, removed.storage)?;
        self.save()?;

        tracing::info!("Uninstalled patch id={} revision={}", removed.id, removed.revision);
        Ok(removed)
    }

    /// Replace the enabled list. Priority is the position in `ids`, last wins.
    pub fn set_enabled(&mut self, ids: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut enabled = Vec::with_capacity(ids.len());
        for id in ids {
            let patch = self.get(id).ok_or_else(|| Error::PatchNotFound(id.clone()))?;
            if !seen.insert(patch.id.to_lowercase()) {
                return Err(Error::Other(format!("patch '{}' is enabled more than once", id)));
            }
            enabled.push(patch.id.clone());
        }

        self.index.enabled = enabled;
        self.save()
    }

    /// Open a data source for an installed patch.
    pub fn data_source(&mut self, id: &str) -> Result<Arc<dyn DataSource>> {
        let patch = self.get(id).ok_or_else(|| Error::PatchNotFound(id.to_string()))?.clone();
        let path = self.patches_dir().join(&patch.file);

        Ok(match patch.storage {
            PatchStorage::Directory => Arc::new(PhysicalSource::open(path)?),
            PatchStorage::Container => {
                let container = match self.containers.get(&patch.file) {
                    Some(container) if container.is_open() => container.clone(),
                    _ => {
                        let container = ResourceContainer::open(&path)?;
                        self.containers.insert(patch.file.clone(), container.clone());
                        container
                    }
                };
                Arc::new(ContainerSource::new(container, patch.id.to_lowercase(), Ownership::Borrowed))
            }
        })
    }

    /// The enabled patches with their manifests and data sources, ready to resolve.
    pub fn active_patches(&mut self) -> Result<Vec<ActivePatch>> {
        let enabled = self.index.enabled.clone();
        let mut active = Vec::with_capacity(enabled.len());

        for (priority, id) in enabled.iter().enumerate() {
            let source = self.data_source(id)?;
            let manifest = read_manifest(source.as_ref())?;
            active.push(ActivePatch {
                manifest,
                source,
                priority: priority as i32,
            });
        }

        Ok(active)
    }

    fn patches_dir(&self) -> Utf8PathBuf {
        self.root.join(PATCHES_DIR)
    }

    fn check_installable(&self, manifest: &PatchManifest) -> Result<()> {
        match self.get(&manifest.id) {
            Some(existing) if manifest.revision <= existing.revision => Err(Error::AlreadyInstalled {
                id: existing.id.clone(),
                revision: existing.revision,
            }),
            _ => Ok(()),
        }
    }

    /// Add or replace the index entry for `manifest`.
    fn record(&mut self, manifest: &PatchManifest, file: &str, storage: PatchStorage) -> Result<InstalledPatch> {
        let installed = InstalledPatch {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            revision: manifest.revision,
            file: file.to_string(),
            storage,
            installed_at: Utc::now(),
        };

        match self
            .index
            .patches
            .iter()
            .position(|patch| patch.id.eq_ignore_ascii_case(&manifest.id))
        {
            Some(position) => {
                let previous = std::mem::replace(&mut self.index.patches[position], installed.clone());
                tracing::info!(
                    "Updated patch id={} revision={} -> {}",
                    previous.id,
                    previous.revision,
                    installed.revision
                );
                self.release_file(&previous.file, previous.storage)?;
            }
            None => {
                tracing::info!("Installed patch id={} revision={}", installed.id, installed.revision);
                self.index.patches.push(installed.clone());
            }
        }

        Ok(installed)
    }

    /// Delete a stored file unless another installed patch still uses it.
    fn release_file(&mut self, file: &str, storage: PatchStorage) -> Result<()> {
        if self.index.patches.iter().any(|patch| patch.file == file) {
            return Ok(());
        }

        if let Some(container) = self.containers.remove(file) {
            container.close();
        }

        let path = self.patches_dir().join(file);
        match storage {
            PatchStorage::Container => {
                crate::utils::remove_file_if_exists(&path)?;
            }
            PatchStorage::Directory if path.as_std_path().exists() => {
                std::fs::remove_dir_all(path.as_std_path())?;
            }
            PatchStorage::Directory => {}
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.index)?;
        write_atomic(&self.root.join(LIBRARY_INDEX_FILE), &mut contents.as_bytes())?;
        Ok(())
    }
}

impl Drop for PatchLibrary {
    fn drop(&mut self) {
        for container in self.containers.values() {
            container.close();
        }
    }
}
