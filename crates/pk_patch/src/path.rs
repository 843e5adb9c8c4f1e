use std::{
    cmp::Ordering,
    fmt::Display,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

use xxhash_rust::xxh64::xxh64;

use crate::{PatchError, Result};

/// Bucket key reserved for files that live directly in the game install.
pub const LOOSE_BUCKET: &str = "loose";

fn id_regex() -> &'static regex::Regex {
    static ID_REGEX: OnceLock<regex::Regex> = OnceLock::new();
    ID_REGEX.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9][a-z0-9._-]{0,127}$").expect("id regex is valid")
    })
}

/// Validate a patch or archive id. Ids are compared lower-cased.
pub fn validate_id(id: &str) -> Result<String> {
    let lowered = id.to_lowercase();
    if !id_regex().is_match(&lowered) {
        return Err(PatchError::InvalidId {
            id: id.to_string(),
            reason: "must start with a letter or digit and contain only letters, digits, '.', '_' or '-'",
        });
    }
    Ok(lowered)
}

/// Where a modified file lives: loose in the game install, or inside a named archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Loose,
    /// Lower-cased archive id.
    Archive(String),
}

impl Bucket {
    /// Parse a manifest bucket key. `"loose"` (any case) is the loose bucket.
    pub fn from_key(key: &str) -> Result<Self> {
        if key.eq_ignore_ascii_case(LOOSE_BUCKET) {
            return Ok(Bucket::Loose);
        }
        Ok(Bucket::Archive(validate_id(key)?))
    }

    pub fn archive(id: &str) -> Result<Self> {
        match Self::from_key(id)? {
            Bucket::Loose => Err(PatchError::InvalidId {
                id: id.to_string(),
                reason: "'loose' is reserved",
            }),
            bucket => Ok(bucket),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Bucket::Loose => LOOSE_BUCKET,
            Bucket::Archive(id) => id,
        }
    }

    pub fn is_loose(&self) -> bool {
        matches!(self, Bucket::Loose)
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Normalize a relative path: lower-case, `/` separators, no leading, trailing or doubled
/// separators, no `.` components.
///
/// Fails for empty paths, `..` components, NUL bytes and drive or stream designators.
pub fn normalize_path(path: &str) -> Result<String> {
    let invalid = |reason| PatchError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    let mut components = Vec::new();
    for component in path.split(['/', '\\']) {
        match component {
            "" | "." => continue,
            ".." => return Err(invalid("escapes its root")),
            _ if component.contains(':') => {
                return Err(invalid("drive or stream designators are not allowed"))
            }
            _ => components.push(component.to_lowercase()),
        }
    }

    if components.is_empty() {
        return Err(invalid("path is empty"));
    }

    Ok(components.join("/"))
}

/// Identity of one modified file.
///
/// Equality and hashing use the bucket and the normalized path only, so differently cased
/// or separated references to one file compare equal. The normalized form and its hash are
/// computed once at construction.
#[derive(Debug, Clone)]
pub struct ModFilePath {
    bucket: Bucket,
    original: String,
    normalized: String,
    hash: u64,
}

impl ModFilePath {
    pub fn new(bucket: Bucket, path: &str) -> Result<Self> {
        let normalized = normalize_path(path)?;

        let mut key = Vec::with_capacity(bucket.key().len() + normalized.len() + 1);
        key.extend_from_slice(bucket.key().as_bytes());
        key.push(0);
        key.extend_from_slice(normalized.as_bytes());

        Ok(Self {
            hash: xxh64(&key, 0),
            bucket,
            original: path.to_string(),
            normalized,
        })
    }

    /// A file relative to the game install root.
    pub fn loose(path: &str) -> Result<Self> {
        Self::new(Bucket::Loose, path)
    }

    /// A file relative to the root of archive `archive_id`.
    pub fn in_archive(archive_id: &str, path: &str) -> Result<Self> {
        Self::new(Bucket::archive(archive_id)?, path)
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn archive_id(&self) -> Option<&str> {
        match &self.bucket {
            Bucket::Loose => None,
            Bucket::Archive(id) => Some(id),
        }
    }

    pub fn is_loose(&self) -> bool {
        self.bucket.is_loose()
    }

    /// The path exactly as it was given.
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// The given path with `/` separators and without empty or `.` components, keeping its
    /// original case. Used when the file has to be created on disk or in an archive.
    pub fn relative_path(&self) -> String {
        self.original
            .split(['/', '\\'])
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Default container resource name for this file: `<bucket>/<normalized path>`.
    pub fn resource_name(&self) -> String {
        format!("{}/{}", self.bucket.key(), self.normalized)
    }
}

impl PartialEq for ModFilePath {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bucket == other.bucket && self.normalized == other.normalized
    }
}

impl Eq for ModFilePath {}

impl Hash for ModFilePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for ModFilePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModFilePath {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.bucket, &self.normalized).cmp(&(&other.bucket, &other.normalized))
    }
}

impl Display for ModFilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.bucket {
            Bucket::Loose => f.write_str(&self.normalized),
            Bucket::Archive(id) => write!(f, "{}:{}", id, self.normalized),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_case_and_separator_insensitive_equality() {
        let a = ModFilePath::in_archive("Archive1", "Data\\X.TXT").unwrap();
        let b = ModFilePath::in_archive("archive1", "/data//x.txt").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.original(), "Data\\X.TXT");
        assert_eq!(a.normalized(), "data/x.txt");

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_loose_and_archive_are_distinct() {
        let loose = ModFilePath::loose("data/x.txt").unwrap();
        let archived = ModFilePath::in_archive("archive1", "data/x.txt").unwrap();

        assert_ne!(loose, archived);
        assert_eq!(loose.to_string(), "data/x.txt");
        assert_eq!(archived.to_string(), "archive1:data/x.txt");
    }

    #[test]
    fn test_invalid_paths() {
        for path in ["", "/", "a/../b", "..", "c:/windows", "a\0b", "./."] {
            assert!(
                matches!(ModFilePath::loose(path), Err(PatchError::InvalidPath { .. })),
                "{path:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_dot_components_are_dropped() {
        let path = ModFilePath::loose("./A/./b.txt").unwrap();
        assert_eq!(path.normalized(), "a/b.txt");
        assert_eq!(path.relative_path(), "A/b.txt");
    }

    #[test]
    fn test_loose_is_reserved_for_archives() {
        assert!(ModFilePath::in_archive("LOOSE", "a.txt").is_err());
        assert_eq!(Bucket::from_key("Loose").unwrap(), Bucket::Loose);
        assert!(Bucket::from_key("bad id").is_err());
    }

    #[test]
    fn test_resource_name() {
        assert_eq!(
            ModFilePath::in_archive("Core", "Sub/File.bin").unwrap().resource_name(),
            "core/sub/file.bin"
        );
        assert_eq!(ModFilePath::loose("a.txt").unwrap().resource_name(), "loose/a.txt");
    }

    proptest! {
        #[test]
        fn test_separator_and_case_variants_collide(
            parts in proptest::collection::vec("[a-zA-Z0-9_]{1,8}", 1..5),
            backslash in any::<bool>(),
        ) {
            let separator = if backslash { "\\" } else { "/" };
            let upper = parts.iter().map(|p| p.to_uppercase()).collect::<Vec<_>>().join(separator);
            let lower = parts.iter().map(|p| p.to_lowercase()).collect::<Vec<_>>().join("/");

            let a = ModFilePath::loose(&format!("/{upper}")).unwrap();
            let b = ModFilePath::loose(&lower).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.normalized(), lower.as_str());
        }
    }
}
