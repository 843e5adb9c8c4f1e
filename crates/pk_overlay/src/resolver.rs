//! Patch stack resolution.
//!
//! [`resolve`] turns an ordered stack of [`ActivePatch`]es plus a [`BaseIndex`] of what
//! the game ships into a [`ResolutionTable`]:
//!
//! 1. Sort patches by priority, lowest first. Ties keep the caller's order.
//! 2. For every patch, apply its removals, then its additions, to a map keyed by
//!    [`ModFilePath`]. A later patch overwrites whatever an earlier one did to the same
//!    path, so the highest priority action wins regardless of its kind.
//! 3. Split the final map per bucket into overlay entries and removals, and list the base
//!    entries that survive untouched.
//!
//! Any manifest that references a resource its data source lacks aborts the whole stack.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use pk_patch::{Bucket, ModFilePath, PatchManifest};

use crate::error::{Error, Result};
use crate::source::{check_resources, DataSource};

/// A patch taking part in one resolution.
#[derive(Clone)]
pub struct ActivePatch {
    pub manifest: PatchManifest,
    pub source: Arc<dyn DataSource>,
    /// Higher wins.
    pub priority: i32,
}

impl ActivePatch {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

impl fmt::Debug for ActivePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePatch")
            .field("id", &self.manifest.id)
            .field("revision", &self.manifest.revision)
            .field("priority", &self.priority)
            .field("source", &self.source.location())
            .finish()
    }
}

/// What the unmodified game contains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseIndex {
    archives: BTreeMap<String, ArchiveIndex>,
    loose: HashSet<ModFilePath>,
}

/// Entries of one archive in file-table order, plus a set for membership checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ArchiveIndex {
    entries: Vec<ModFilePath>,
    lookup: HashSet<ModFilePath>,
}

impl BaseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an archive and its entries in file-table order.
    pub fn insert_archive(&mut self, archive_id: &str, entries: Vec<ModFilePath>) {
        let lookup = entries.iter().cloned().collect();
        self.archives
            .insert(archive_id.to_lowercase(), ArchiveIndex { entries, lookup });
    }

    /// Register loose files present in the game install.
    pub fn insert_loose(&mut self, path: ModFilePath) {
        self.loose.insert(path);
    }

    pub fn archive(&self, archive_id: &str) -> Option<&[ModFilePath]> {
        self.archives
            .get(&archive_id.to_lowercase())
            .map(|archive| archive.entries.as_slice())
    }

    fn contains(&self, path: &ModFilePath) -> bool {
        match path.bucket() {
            Bucket::Loose => self.loose.contains(path),
            Bucket::Archive(id) => self
                .archives
                .get(id)
                .is_some_and(|archive| archive.lookup.contains(path)),
        }
    }
}

/// A file that ends up in the output, with the resource providing its bytes.
#[derive(Clone)]
pub struct OverlayEntry {
    pub path: ModFilePath,
    pub patch_id: String,
    pub resource: String,
    pub source: Arc<dyn DataSource>,
}

impl PartialEq for OverlayEntry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.patch_id == other.patch_id
            && self.resource == other.resource
            && std::ptr::eq(
                Arc::as_ptr(&self.source) as *const (),
                Arc::as_ptr(&other.source) as *const (),
            )
    }
}

impl Eq for OverlayEntry {}

impl fmt::Debug for OverlayEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayEntry")
            .field("path", &self.path.to_string())
            .field("patch_id", &self.patch_id)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Resolution of one archive, or of the loose bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketResolution {
    /// Base entries kept as they are, in base order.
    pub surviving: Vec<ModFilePath>,
    /// Files added or replaced, ordered by path.
    pub overlay: Vec<OverlayEntry>,
    /// Base entries deleted, ordered by path.
    pub removed: Vec<ModFilePath>,
}

impl BucketResolution {
    pub fn is_unchanged(&self) -> bool {
        self.overlay.is_empty() && self.removed.is_empty()
    }
}

/// A path touched by more than one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: ModFilePath,
    /// Patch ids in application order.
    pub contributors: Vec<String>,
    /// Patch whose action is final.
    pub winner: String,
}

/// Result of resolving a patch stack.
///
/// Always contains the loose bucket; archive buckets only when something changes in them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTable {
    pub buckets: BTreeMap<Bucket, BucketResolution>,
    pub conflicts: Vec<Conflict>,
}

impl ResolutionTable {
    pub fn loose(&self) -> Option<&BucketResolution> {
        self.buckets.get(&Bucket::Loose)
    }

    pub fn archive(&self, archive_id: &str) -> Option<&BucketResolution> {
        self.buckets
            .get(&Bucket::Archive(archive_id.to_lowercase()))
    }

    /// Archive buckets with changes.
    pub fn archives(&self) -> impl Iterator<Item = (&str, &BucketResolution)> {
        self.buckets.iter().filter_map(|(bucket, resolution)| match bucket {
            Bucket::Archive(id) => Some((id.as_str(), resolution)),
            Bucket::Loose => None,
        })
    }
}

enum FileState {
    Removed { by: String },
    Added(OverlayEntry),
}

impl FileState {
    fn patch_id(&self) -> &str {
        match self {
            FileState::Removed { by } => by,
            FileState::Added(entry) => &entry.patch_id,
        }
    }
}

/// Resolve `patches` against `base`.
pub fn resolve(patches: &[ActivePatch], base: &BaseIndex) -> Result<ResolutionTable> {
    let mut ordered: Vec<&ActivePatch> = patches.iter().collect();
    ordered.sort_by_key(|patch| patch.priority);

    for pair in ordered.windows(2) {
        if pair[0].priority == pair[1].priority {
            tracing::warn!(
                "Patches '{}' and '{}' share priority {}; the later one wins conflicts",
                pair[0].id(),
                pair[1].id(),
                pair[0].priority
            );
        }
    }

    let mut states: HashMap<ModFilePath, FileState> = HashMap::new();
    let mut contributors: HashMap<ModFilePath, Vec<String>> = HashMap::new();

    for patch in &ordered {
        let manifest = &patch.manifest;
        check_resources(manifest, patch.source.as_ref())?;

        let removals = manifest.files.removals()?;
        let additions = manifest.files.additions()?;
        tracing::debug!(
            "Resolving patch id={} priority={} additions={} removals={}",
            patch.id(),
            patch.priority,
            additions.len(),
            removals.len()
        );

        let touched_paths = removals.iter().chain(additions.iter().map(|a| &a.path));
        for path in touched_paths {
            if let Bucket::Archive(id) = path.bucket() {
                if base.archive(id).is_none() {
                    return Err(Error::UnknownArchive {
                        patch_id: manifest.id.clone(),
                        archive_id: id.clone(),
                    });
                }
            }

            let ids = contributors.entry(path.clone()).or_default();
            if ids.last().map(String::as_str) != Some(manifest.id.as_str()) {
                ids.push(manifest.id.clone());
            }
        }

        for path in removals {
            states.insert(
                path,
                FileState::Removed {
                    by: manifest.id.clone(),
                },
            );
        }

        for addition in additions {
            states.insert(
                addition.path.clone(),
                FileState::Added(OverlayEntry {
                    path: addition.path,
                    patch_id: manifest.id.clone(),
                    resource: addition.resource,
                    source: patch.source.clone(),
                }),
            );
        }
    }

    let mut table = ResolutionTable::default();
    table.buckets.insert(Bucket::Loose, BucketResolution::default());

    let mut touched: HashMap<Bucket, HashSet<ModFilePath>> = HashMap::new();
    for (path, state) in &states {
        match state {
            FileState::Added(entry) => {
                table
                    .buckets
                    .entry(path.bucket().clone())
                    .or_default()
                    .overlay
                    .push(entry.clone());
            }
            FileState::Removed { .. } if base.contains(path) => {
                table
                    .buckets
                    .entry(path.bucket().clone())
                    .or_default()
                    .removed
                    .push(path.clone());
            }
            FileState::Removed { by } => {
                tracing::debug!("Patch '{}' removes '{}' which the game does not have", by, path);
                continue;
            }
        }
        touched
            .entry(path.bucket().clone())
            .or_default()
            .insert(path.clone());
    }

    for (bucket, resolution) in table.buckets.iter_mut() {
        resolution.overlay.sort_by(|a, b| a.path.cmp(&b.path));
        resolution.removed.sort();

        let touched = touched.get(bucket);
        let is_untouched = |path: &&ModFilePath| touched.map_or(true, |t| !t.contains(*path));
        resolution.surviving = match bucket {
            Bucket::Archive(id) => base
                .archive(id)
                .unwrap_or_default()
                .iter()
                .filter(is_untouched)
                .cloned()
                .collect(),
            Bucket::Loose => {
                let mut surviving: Vec<_> = base.loose.iter().filter(is_untouched).cloned().collect();
                surviving.sort();
                surviving
            }
        };
    }

    let mut conflicts: Vec<Conflict> = contributors
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .filter_map(|(path, contributors)| {
            let winner = states.get(&path)?.patch_id().to_string();
            Some(Conflict {
                path,
                contributors,
                winner,
            })
        })
        .collect();
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    table.conflicts = conflicts;

    tracing::info!(
        "Resolved patch stack patches={} buckets={} conflicts={}",
        ordered.len(),
        table.buckets.len(),
        table.conflicts.len()
    );

    Ok(table)
}
