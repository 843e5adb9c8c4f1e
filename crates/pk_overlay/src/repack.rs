//! Archive repack driver.
//!
//! [`repack_archive`] rewrites one archive with its [`BucketResolution`] applied:
//!
//! 1. Open the original through the codec and walk its file table in order. Removed
//!    entries are dropped, replaced entries keep their original id and position but read
//!    from the patch's data source, everything else streams straight from the original.
//! 2. Append overlay entries the original did not have.
//! 3. Let the codec write the new archive into a temp file next to the target.
//! 4. Close the original and move the temp file over the target.
//!
//! On failure the temp file is deleted and the target is left as it was.
//! [`apply_loose`] does the same for files directly in the game install.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8Path;
use pk_patch::ModFilePath;

use crate::codec::{ArchiveCodec, ArchiveReader};
use crate::error::{Error, Result};
use crate::generator::{ArchiveFileGenerator, GeneratorEntry};
use crate::resolver::{BucketResolution, OverlayEntry};
use crate::source::{open_preferred, ResourceStream};
use crate::utils::{persist, remove_file_if_exists, temp_file_for, write_atomic};

/// Counts from one archive repack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepackStats {
    pub archive_id: String,
    /// Original entries copied unchanged.
    pub kept: usize,
    /// Original entries whose bytes now come from a patch.
    pub replaced: usize,
    /// Entries the original did not have.
    pub added: usize,
    pub removed: usize,
}

/// Counts from applying the loose bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LooseStats {
    pub written: usize,
    pub removed: usize,
}

/// Repack `original` into `target` with `resolution` applied.
///
/// `original` and `target` may be the same file. Errors are reported as
/// [`Error::ArchiveWrite`] (original untouched) or [`Error::PartialWrite`] (the new
/// archive could not be moved into place).
pub fn repack_archive<C: ArchiveCodec>(
    codec: &C,
    archive_id: &str,
    original: &Utf8Path,
    target: &Utf8Path,
    resolution: &BucketResolution,
) -> Result<RepackStats> {
    tracing::info!(
        "Repacking archive id={} original={} target={} overlay={} removed={}",
        archive_id,
        original,
        target,
        resolution.overlay.len(),
        resolution.removed.len()
    );

    let wrap = |error: Error| match error {
        Error::PartialWrite { .. } => error,
        error => Error::ArchiveWrite {
            archive_id: archive_id.to_string(),
            patch_id: error.patch_id().map(str::to_string),
            source: Box::new(error),
        },
    };

    let (mut generator, stats) = build_generator(codec, archive_id, original, resolution).map_err(wrap)?;

    let temp = temp_file_for(target).map_err(wrap)?;
    generator.begin_write_pass();
    let written = codec
        .write_archive(temp.as_file(), &mut generator)
        .and_then(|()| match generator.count() {
            0 => Ok(()),
            left => Err(Error::Codec {
                codec: codec.name(),
                message: format!("{} entries were never written", left),
            }),
        });

    // Release the original before it gets replaced
    drop(generator);

    if let Err(error) = written {
        tracing::warn!("Repack of archive '{}' failed: {}", archive_id, error);
        return Err(wrap(error));
    }

    persist(temp, target)?;

    tracing::info!(
        "Repacked archive id={} kept={} replaced={} added={} removed={}",
        archive_id,
        stats.kept,
        stats.replaced,
        stats.added,
        stats.removed
    );
    Ok(stats)
}

fn build_generator<C: ArchiveCodec>(
    codec: &C,
    archive_id: &str,
    original: &Utf8Path,
    resolution: &BucketResolution,
) -> Result<(ArchiveFileGenerator<C::Entry>, RepackStats)> {
    let reader = Arc::new(codec.open_for_read(original)?);

    let mut generator = ArchiveFileGenerator::new();
    let closer = reader.clone();
    generator.on_dispose(move || closer.close());

    let overlay: HashMap<&ModFilePath, &OverlayEntry> =
        resolution.overlay.iter().map(|entry| (&entry.path, entry)).collect();
    let removed: HashSet<&ModFilePath> = resolution.removed.iter().collect();
    let mut placed: HashSet<&ModFilePath> = HashSet::new();

    let mut stats = RepackStats {
        archive_id: archive_id.to_string(),
        ..Default::default()
    };

    for entry in reader.entries() {
        let generator_entry = GeneratorEntry {
            id: entry.id.clone(),
            path: entry.path.clone(),
            size_hint: Some(entry.size),
        };

        // Entries whose names are not valid relative paths can only be kept as they are
        let path = ModFilePath::in_archive(archive_id, &entry.path).ok();
        if let Some(path) = &path {
            if removed.contains(path) {
                tracing::debug!("Dropping entry archive={} path={}", archive_id, path);
                stats.removed += 1;
                continue;
            }

            if let Some(overlay_entry) = overlay.get(path) {
                placed.insert(&overlay_entry.path);
                stats.replaced += 1;
                generator.add(
                    GeneratorEntry {
                        size_hint: None,
                        ..generator_entry
                    },
                    overlay_producer(overlay_entry),
                )?;
                continue;
            }
        }

        let id = entry.id.clone();
        let source = reader.clone();
        generator.add(generator_entry, move || source.open_entry(&id))?;
        stats.kept += 1;
    }

    for overlay_entry in &resolution.overlay {
        if placed.contains(&overlay_entry.path) {
            continue;
        }

        let path = overlay_entry.path.relative_path();
        generator.add(
            GeneratorEntry {
                id: codec.new_entry(&path),
                path,
                size_hint: None,
            },
            overlay_producer(overlay_entry),
        )?;
        stats.added += 1;
    }

    Ok((generator, stats))
}

fn overlay_producer(entry: &OverlayEntry) -> impl FnMut() -> Result<ResourceStream> + Send + 'static {
    let source = entry.source.clone();
    let resource = entry.resource.clone();
    let patch_id = entry.patch_id.clone();

    move || {
        open_preferred(source.as_ref(), &resource).map_err(|error| Error::EntrySource {
            patch_id: patch_id.clone(),
            resource: resource.clone(),
            source: Box::new(error),
        })
    }
}

/// Write and delete loose files under `game_dir`.
pub fn apply_loose(game_dir: &Utf8Path, resolution: &BucketResolution) -> Result<LooseStats> {
    let mut stats = LooseStats::default();

    for entry in &resolution.overlay {
        let target = game_dir.join(entry.path.relative_path());
        let mut stream = open_preferred(entry.source.as_ref(), &entry.resource).map_err(|error| {
            Error::EntrySource {
                patch_id: entry.patch_id.clone(),
                resource: entry.resource.clone(),
                source: Box::new(error),
            }
        })?;

        let written = write_atomic(&target, &mut stream)?;
        tracing::debug!("Wrote loose file path={} bytes={} patch={}", target, written, entry.patch_id);
        stats.written += 1;
    }

    for path in &resolution.removed {
        if remove_file_if_exists(&game_dir.join(path.relative_path()))? {
            stats.removed += 1;
        }
    }

    Ok(stats)
}
