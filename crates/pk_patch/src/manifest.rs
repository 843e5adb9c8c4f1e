use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::{normalize_path, validate_id, Bucket, ModFilePath, PatchError, Result};

/// Name of the asset holding a patch's manifest inside its container or `assets/` directory.
pub const PATCH_MANIFEST_ASSET: &str = "patch.json";

/// Describes a patch: identity, authorship and the files it touches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchManifest {
    /// Unique id of the patch. Compared lower-cased.
    ///
    /// Example: `hd-textures`
    pub id: String,

    /// Display name.
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Increases with every published update of the same id.
    #[serde(default)]
    pub revision: u32,

    /// Name of the asset used as thumbnail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,

    #[serde(default)]
    pub files: FilesManifest,
}

/// Which files a patch adds, replaces or removes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FilesManifest {
    /// Game versions the patch targets. Empty means any version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub game_versions: Vec<String>,

    /// Archives the patch touches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archives: Vec<ArchiveTarget>,

    /// Bucket (archive id or `loose`) -> files added or replaced.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added_files: BTreeMap<String, Vec<AddedFile>>,

    /// Bucket (archive id or `loose`) -> relative paths to delete.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed_files: BTreeMap<String, Vec<String>>,
}

/// An archive inside the game install.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub id: String,

    /// Relative to the game install root.
    pub path: Utf8PathBuf,
}

/// A file a patch adds or replaces.
///
/// Either a bare path, whose resource is named after the path, or a path mapped to an
/// explicit resource name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum AddedFile {
    Path(String),
    Mapped { path: String, resource: String },
}

/// An added file resolved against its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddition {
    pub path: ModFilePath,
    /// Name of the resource providing the bytes.
    pub resource: String,
}

impl AddedFile {
    pub fn path(&self) -> &str {
        match self {
            AddedFile::Path(path) | AddedFile::Mapped { path, .. } => path,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            AddedFile::Path(_) => None,
            AddedFile::Mapped { resource, .. } => Some(resource),
        }
    }
}

impl FilesManifest {
    pub fn supports_game_version(&self, version: &str) -> bool {
        self.game_versions.is_empty() || self.game_versions.iter().any(|v| v == version)
    }

    /// Look up an archive target by id, ignoring case.
    pub fn archive(&self, id: &str) -> Option<&ArchiveTarget> {
        self.archives.iter().find(|archive| archive.id.eq_ignore_ascii_case(id))
    }

    /// Every added file, resolved to its identity and resource name.
    ///
    /// Buckets come in key order; files keep their order within a bucket.
    pub fn additions(&self) -> Result<Vec<FileAddition>> {
        let mut additions = Vec::new();
        for (key, files) in &self.added_files {
            let bucket = self.bucket(key)?;
            for file in files {
                let path = ModFilePath::new(bucket.clone(), file.path())?;
                let resource = match file.resource() {
                    Some(resource) => normalize_path(resource)?,
                    None => path.resource_name(),
                };
                additions.push(FileAddition { path, resource });
            }
        }
        Ok(additions)
    }

    /// Every removed file. Buckets come in key order; paths keep their order within a bucket.
    pub fn removals(&self) -> Result<Vec<ModFilePath>> {
        let mut removals = Vec::new();
        for (key, paths) in &self.removed_files {
            let bucket = self.bucket(key)?;
            for path in paths {
                removals.push(ModFilePath::new(bucket.clone(), path)?);
            }
        }
        Ok(removals)
    }

    /// Names of all resources the manifest references, each once.
    ///
    /// Several added files may share one resource.
    pub fn resources(&self) -> Result<BTreeSet<String>> {
        Ok(self.additions()?.into_iter().map(|a| a.resource).collect())
    }

    /// Check archive ids and paths and every referenced file path.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for archive in &self.archives {
            let bucket = Bucket::archive(&archive.id)?;
            if !ids.insert(bucket.key().to_string()) {
                return Err(PatchError::InvalidManifest(format!(
                    "archive '{}' is declared more than once",
                    archive.id
                )));
            }

            if archive.path.is_absolute() || archive.path.as_str().starts_with(['/', '\\']) {
                return Err(PatchError::InvalidPath {
                    path: archive.path.to_string(),
                    reason: "archive paths must be relative to the game root",
                });
            }
            normalize_path(archive.path.as_str())?;
        }

        let additions = self.additions()?;
        let mut seen = HashSet::new();
        for addition in &additions {
            if !seen.insert(&addition.path) {
                return Err(PatchError::InvalidManifest(format!(
                    "'{}' is added more than once",
                    addition.path
                )));
            }
        }

        self.removals()?;
        Ok(())
    }

    fn bucket(&self, key: &str) -> Result<Bucket> {
        let bucket = Bucket::from_key(key)?;
        if let Bucket::Archive(id) = &bucket {
            if self.archive(id).is_none() {
                return Err(PatchError::InvalidManifest(format!(
                    "bucket '{}' does not name a declared archive",
                    key
                )));
            }
        }
        Ok(bucket)
    }
}

impl PatchManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        Ok(toml::from_str(toml)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Lower-cased id.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(PatchError::InvalidManifest(format!(
                "patch '{}' has no name",
                self.id
            )));
        }
        self.files.validate()
    }

    /// Whether this manifest is a newer revision of `other`.
    pub fn is_update_of(&self, other: &PatchManifest) -> bool {
        self.id.eq_ignore_ascii_case(&other.id) && self.revision > other.revision
    }
}
