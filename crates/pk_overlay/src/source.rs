//! Data source abstraction.
//!
//! A [`DataSource`] gives uniform read access to the resources and assets of one patch,
//! wherever they live:
//!
//! - [`PhysicalSource`]: an unpacked patch directory on disk.
//! - [`ContainerSource`]: one owner inside a [`ResourceContainer`].
//! - [`VirtualSource`]: caller-supplied seekable streams, e.g. resources synthesized in memory.
//!
//! Who releases the underlying handle is decided once, at construction, through
//! [`Ownership`]. An `Owned` source closes its container or streams when dropped, a
//! `Borrowed` one leaves them to whoever lent them.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use camino::{Utf8Path, Utf8PathBuf};
use pk_container::{EntryKind, ResourceContainer, SharedSource};
use pk_patch::{normalize_path, PatchManifest, PATCH_MANIFEST_ASSET};

use crate::error::{Error, Result};
use crate::utils::utf8_path;

/// A readable resource stream positioned at its first byte.
pub type ResourceStream = Box<dyn Read + Send>;

/// Whether dropping a data source releases the handle it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Close the underlying container or streams on drop.
    Owned,
    /// Leave the underlying container or streams open; another owner closes them.
    Borrowed,
}

/// Read access to one patch's resources and assets.
///
/// Every call returns a fresh stream starting at the first byte, so a resource can be read
/// any number of times (for a preview and again for the final repack, say).
///
/// Implementations must be [`Send`] + [`Sync`]: archives are repacked in parallel and
/// several generators may hold the same source.
pub trait DataSource: Send + Sync {
    /// Stream a resource. `normalized` selects the canonicalized variant where the source
    /// distinguishes variants; sources that don't ignore it.
    fn get_resource(&self, name: &str, normalized: bool) -> Result<ResourceStream>;

    /// Stream an auxiliary asset such as the manifest or a thumbnail.
    fn get_asset(&self, name: &str) -> Result<ResourceStream>;

    fn has_resource(&self, name: &str, normalized: bool) -> bool;

    fn has_asset(&self, name: &str) -> bool;

    /// Human-readable location used in logs and errors.
    fn location(&self) -> String;
}

/// Open the normalized variant of a resource if the source has one, the raw one otherwise.
pub fn open_preferred(source: &dyn DataSource, name: &str) -> Result<ResourceStream> {
    let normalized = source.has_resource(name, true);
    source.get_resource(name, normalized)
}

/// Read and validate the patch manifest stored in a source's `patch.json` asset.
pub fn read_manifest(source: &dyn DataSource) -> Result<PatchManifest> {
    let mut json = String::new();
    source.get_asset(PATCH_MANIFEST_ASSET)?.read_to_string(&mut json)?;

    let manifest = PatchManifest::from_json(&json)?;
    manifest.validate()?;
    Ok(manifest)
}

/// Check that every resource the manifest references is present in `source`.
///
/// Fails with [`Error::MissingResource`] on the first absent resource.
pub fn check_resources(manifest: &PatchManifest, source: &dyn DataSource) -> Result<()> {
    for resource in manifest.files.resources()? {
        if !source.has_resource(&resource, false) && !source.has_resource(&resource, true) {
            return Err(Error::MissingResource {
                patch_id: manifest.id.clone(),
                resource,
            });
        }
    }
    Ok(())
}

/// An unpacked patch directory.
///
/// ```text
/// patch_dir/
///   assets/
///     patch.json          # PatchManifest
///     thumbnail.webp
///   resources/
///     <bucket>/<path>     # e.g. resources/core/textures/hero.png
/// ```
///
/// Names are matched case-insensitively; the directory is indexed once when the source is
/// opened. Physical resources are already in their final encoding, so the `normalized`
/// flag is ignored.
#[derive(Debug, Clone)]
pub struct PhysicalSource {
    root: Utf8PathBuf,
    resources: HashMap<String, Utf8PathBuf>,
    assets: HashMap<String, Utf8PathBuf>,
}

impl PhysicalSource {
    pub const RESOURCES_DIR: &'static str = "resources";
    pub const ASSETS_DIR: &'static str = "assets";

    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.as_std_path().is_dir() {
            return Err(Error::Other(format!("patch directory not found: {}", root)));
        }

        let resources = index_dir(&root.join(Self::RESOURCES_DIR))?;
        let assets = index_dir(&root.join(Self::ASSETS_DIR))?;
        tracing::debug!(
            "Indexed patch directory root={} resources={} assets={}",
            root,
            resources.len(),
            assets.len()
        );

        Ok(Self {
            root,
            resources,
            assets,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Normalized names of all resources.
    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    fn open_file(&self, files: &HashMap<String, Utf8PathBuf>, kind: &'static str, name: &str) -> Result<ResourceStream> {
        let key = normalize_path(name)?;
        let path = files.get(&key).ok_or_else(|| Error::EntryNotFound {
            kind,
            name: name.to_string(),
            location: self.location(),
        })?;

        let file = std::fs::File::open(path.as_std_path())?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

impl DataSource for PhysicalSource {
    fn get_resource(&self, name: &str, _normalized: bool) -> Result<ResourceStream> {
        self.open_file(&self.resources, "resource", name)
    }

    fn get_asset(&self, name: &str) -> Result<ResourceStream> {
        self.open_file(&self.assets, "asset", name)
    }

    fn has_resource(&self, name: &str, _normalized: bool) -> bool {
        normalize_path(name).is_ok_and(|key| self.resources.contains_key(&key))
    }

    fn has_asset(&self, name: &str) -> bool {
        normalize_path(name).is_ok_and(|key| self.assets.contains_key(&key))
    }

    fn location(&self) -> String {
        self.root.to_string()
    }
}

/// Map every file under `dir` from its normalized relative path to its real path.
pub(crate) fn index_dir(dir: &Utf8Path) -> Result<HashMap<String, Utf8PathBuf>> {
    let mut files = HashMap::new();
    if !dir.as_std_path().is_dir() {
        return Ok(files);
    }

    for entry in walkdir::WalkDir::new(dir.as_std_path()).follow_links(false) {
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
        let key = normalize_path(relative.as_str())?;
        files.insert(key, path);
    }

    Ok(files)
}

/// One owner of a [`ResourceContainer`].
pub struct ContainerSource {
    container: ResourceContainer,
    patch_id: String,
    ownership: Ownership,
}

impl ContainerSource {
    pub fn new(container: ResourceContainer, patch_id: impl Into<String>, ownership: Ownership) -> Self {
        Self {
            container,
            patch_id: patch_id.into(),
            ownership,
        }
    }

    /// Open the container at `path` and take ownership of it.
    pub fn open(path: impl AsRef<Utf8Path>, patch_id: impl Into<String>) -> Result<Self> {
        let container = ResourceContainer::open(path)?;
        Ok(Self::new(container, patch_id, Ownership::Owned))
    }

    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

impl DataSource for ContainerSource {
    fn get_resource(&self, name: &str, normalized: bool) -> Result<ResourceStream> {
        let stream = self.container.get_resource(&self.patch_id, name, normalized)?;
        Ok(Box::new(stream))
    }

    fn get_asset(&self, name: &str) -> Result<ResourceStream> {
        let stream = self.container.get_asset(&self.patch_id, name)?;
        Ok(Box::new(stream))
    }

    fn has_resource(&self, name: &str, normalized: bool) -> bool {
        let kind = match normalized {
            true => EntryKind::NormalizedResource,
            false => EntryKind::Resource,
        };
        self.container.contains(&self.patch_id, name, kind)
    }

    fn has_asset(&self, name: &str) -> bool {
        self.container.contains(&self.patch_id, name, EntryKind::Asset)
    }

    fn location(&self) -> String {
        format!("container owner '{}'", self.patch_id)
    }
}

impl Drop for ContainerSource {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned {
            self.container.close();
        }
    }
}

/// Resources and assets backed by caller-supplied seekable streams.
///
/// Each read starts from position 0 of the wrapped stream, no matter how far a previous
/// reader got. The `normalized` flag is ignored.
pub struct VirtualSource {
    resources: HashMap<String, SharedSource>,
    assets: HashMap<String, SharedSource>,
    ownership: Ownership,
}

impl VirtualSource {
    pub fn new(ownership: Ownership) -> Self {
        Self {
            resources: HashMap::new(),
            assets: HashMap::new(),
            ownership,
        }
    }

    pub fn with_resource(mut self, name: &str, stream: SharedSource) -> Result<Self> {
        self.resources.insert(normalize_path(name)?, stream);
        Ok(self)
    }

    pub fn with_asset(mut self, name: &str, stream: SharedSource) -> Result<Self> {
        self.assets.insert(normalize_path(name)?, stream);
        Ok(self)
    }

    /// Convenience for in-memory resources.
    pub fn with_resource_bytes(self, name: &str, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        self.with_resource(name, SharedSource::new(Cursor::new(bytes.into())))
    }

    pub fn with_asset_bytes(self, name: &str, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        self.with_asset(name, SharedSource::new(Cursor::new(bytes.into())))
    }

    fn open_stream(&self, streams: &HashMap<String, SharedSource>, kind: &'static str, name: &str) -> Result<ResourceStream> {
        let stream = normalize_path(name)
            .ok()
            .and_then(|key| streams.get(&key))
            .ok_or_else(|| Error::EntryNotFound {
                kind,
                name: name.to_string(),
                location: self.location(),
            })?;

        Ok(Box::new(stream.full_range()?))
    }
}

impl DataSource for VirtualSource {
    fn get_resource(&self, name: &str, _normalized: bool) -> Result<ResourceStream> {
        self.open_stream(&self.resources, "resource", name)
    }

    fn get_asset(&self, name: &str) -> Result<ResourceStream> {
        self.open_stream(&self.assets, "asset", name)
    }

    fn has_resource(&self, name: &str, _normalized: bool) -> bool {
        normalize_path(name).is_ok_and(|key| self.resources.contains_key(&key))
    }

    fn has_asset(&self, name: &str) -> bool {
        normalize_path(name).is_ok_and(|key| self.assets.contains_key(&key))
    }

    fn location(&self) -> String {
        "virtual source".to_string()
    }
}

impl Drop for VirtualSource {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned {
            for stream in self.resources.values().chain(self.assets.values()) {
                stream.close();
            }
        }
    }
}
