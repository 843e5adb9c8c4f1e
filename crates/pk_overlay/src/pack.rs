//! Packing an unpacked patch directory into a resource container.
//!
//! ```text
//! patch_dir/
//!   assets/
//!     patch.json             # or patch.toml
//!     thumbnail.webp
//!   resources/
//!     <bucket>/<path>        # raw resources
//!   normalized/
//!     <bucket>/<path>        # optional normalized variants
//! ```
//!
//! The container gets one owner, the manifest id. The manifest is validated and stored
//! back as the `patch.json` asset.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Seek, Write};

use camino::{Utf8Path, Utf8PathBuf};
use pk_container::builder::{ContainerBuilder, ContainerBuilderError, ContainerEntryBuilder};
use pk_container::ContainerCompression;
use pk_patch::{AddedFile, PatchManifest, PATCH_MANIFEST_ASSET};

use crate::error::{Error, Result};
use crate::source::{index_dir, PhysicalSource};

/// Name of the TOML form of the manifest accepted when authoring.
pub const PATCH_MANIFEST_TOML_ASSET: &str = "patch.toml";

pub const NORMALIZED_DIR: &str = "normalized";

/// Entries at least this large are zstd compressed unless already compressed.
pub const COMPRESSION_THRESHOLD: u64 = 64 * 1024;

const COMPRESSED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "ogg", "mp3", "opus", "wem", "bnk", "zip", "gz", "zst", "7z",
];

enum PackSource {
    File(Utf8PathBuf),
    Bytes(Vec<u8>),
}

/// Pack the patch directory at `root` into `writer`. Returns the manifest that was stored.
pub fn pack_patch_dir<W: Write + Seek>(root: &Utf8Path, writer: &mut W) -> Result<PatchManifest> {
    let assets = index_dir(&root.join(PhysicalSource::ASSETS_DIR))?;
    let resources_dir = root.join(PhysicalSource::RESOURCES_DIR);
    let resources = index_dir(&resources_dir)?;
    let normalized = index_dir(&root.join(NORMALIZED_DIR))?;

    let mut manifest = load_manifest(root, &assets)?;
    if manifest.files.added_files.is_empty() {
        manifest.files.added_files = derive_added_files(&resources_dir, &resources);
    }
    manifest.validate()?;

    tracing::info!(
        "Packing patch id={} revision={} resources={} assets={}",
        manifest.id,
        manifest.revision,
        resources.len(),
        assets.len()
    );

    let owner = manifest.key();
    let mut builder = ContainerBuilder::new();
    let mut sources: HashMap<u64, PackSource> = HashMap::new();

    let referenced = manifest.files.resources()?;
    for resource in &referenced {
        let Some(path) = resources.get(resource) else {
            return Err(Error::MissingResource {
                patch_id: manifest.id.clone(),
                resource: resource.clone(),
            });
        };

        let entry = ContainerEntryBuilder::resource(&owner, resource).with_compression(choose_compression(path)?);
        sources.insert(entry.key(), PackSource::File(path.clone()));
        builder = builder.with_entry(entry)?;

        if let Some(path) = normalized.get(resource) {
            let entry = ContainerEntryBuilder::normalized_resource(&owner, resource)
                .with_compression(choose_compression(path)?);
            sources.insert(entry.key(), PackSource::File(path.clone()));
            builder = builder.with_entry(entry)?;
        }
    }

    for name in resources.keys().filter(|name| !referenced.contains(*name)) {
        tracing::warn!("Resource '{}' is not referenced by the manifest, skipping", name);
    }

    for (name, path) in &assets {
        if name == PATCH_MANIFEST_ASSET || name == PATCH_MANIFEST_TOML_ASSET {
            continue;
        }
        let entry = ContainerEntryBuilder::asset(&owner, name).with_compression(choose_compression(path)?);
        sources.insert(entry.key(), PackSource::File(path.clone()));
        builder = builder.with_entry(entry)?;
    }

    let manifest_entry = ContainerEntryBuilder::asset(&owner, PATCH_MANIFEST_ASSET);
    sources.insert(manifest_entry.key(), PackSource::Bytes(manifest.to_json()?.into_bytes()));
    builder = builder.with_entry(manifest_entry)?;

    builder.build_to_writer(writer, |entry, sink| {
        match sources.get(&entry.key()) {
            Some(PackSource::File(path)) => {
                let mut file = File::open(path.as_std_path())?;
                io::copy(&mut file, sink)?;
            }
            Some(PackSource::Bytes(bytes)) => sink.write_all(bytes)?,
            None => {
                return Err(ContainerBuilderError::Provider {
                    name: entry.name.clone(),
                    reason: "no source file".to_string(),
                })
            }
        }
        Ok(())
    })?;

    Ok(manifest)
}

fn load_manifest(root: &Utf8Path, assets: &HashMap<String, Utf8PathBuf>) -> Result<PatchManifest> {
    if let Some(path) = assets.get(PATCH_MANIFEST_ASSET) {
        return Ok(PatchManifest::from_json(&std::fs::read_to_string(path.as_std_path())?)?);
    }
    if let Some(path) = assets.get(PATCH_MANIFEST_TOML_ASSET) {
        return Ok(PatchManifest::from_toml(&std::fs::read_to_string(path.as_std_path())?)?);
    }

    Err(Error::EntryNotFound {
        kind: "asset",
        name: PATCH_MANIFEST_ASSET.to_string(),
        location: root.to_string(),
    })
}

/// One added file per resource, keeping the on-disk case of the path inside its bucket.
fn derive_added_files(
    resources_dir: &Utf8Path,
    resources: &HashMap<String, Utf8PathBuf>,
) -> BTreeMap<String, Vec<AddedFile>> {
    let mut added: BTreeMap<String, Vec<AddedFile>> = BTreeMap::new();

    for path in resources.values() {
        let Ok(relative) = path.strip_prefix(resources_dir) else {
            continue;
        };
        let mut components = relative.components();
        let Some(bucket) = components.next() else {
            continue;
        };
        let rest = components.as_path();
        if rest.as_str().is_empty() {
            tracing::warn!("Resource '{}' is not inside a bucket directory, skipping", relative);
            continue;
        }

        added
            .entry(bucket.as_str().to_lowercase())
            .or_default()
            .push(AddedFile::Path(rest.as_str().replace('\\', "/")));
    }

    for files in added.values_mut() {
        files.sort_by(|a, b| a.path().cmp(b.path()));
    }
    added
}

fn choose_compression(path: &Utf8Path) -> Result<ContainerCompression> {
    let size = std::fs::metadata(path.as_std_path())?.len();
    let precompressed = path
        .extension()
        .is_some_and(|extension| COMPRESSED_EXTENSIONS.contains(&extension.to_lowercase().as_str()));

    Ok(if size >= COMPRESSION_THRESHOLD && !precompressed {
        ContainerCompression::Zstd
    } else {
        ContainerCompression::None
    })
}
