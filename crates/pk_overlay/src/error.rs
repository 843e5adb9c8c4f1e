//! Error types for overlay operations.
//!
//! All fallible functions in this crate return [`Result<T>`], which uses [`Error`]
//! as the error type. Errors from the container and manifest crates, `std::io`,
//! `serde_json` and `zip` convert via `From` impls.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or applying a patch stack.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Opening or reading a resource container failed.
    #[error("container error: {0}")]
    Container(#[from] pk_container::ContainerError),

    #[error("container builder error: {0}")]
    ContainerBuilder(#[from] pk_container::builder::ContainerBuilderError),

    /// A manifest or path is malformed.
    #[error(transparent)]
    Patch(#[from] pk_patch::PatchError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A manifest references a resource its data source does not have.
    #[error("patch '{patch_id}' references missing resource '{resource}'")]
    MissingResource { patch_id: String, resource: String },

    /// A physical or virtual data source has no entry with this name.
    #[error("{kind} '{name}' not found in {location}")]
    EntryNotFound {
        kind: &'static str,
        name: String,
        location: String,
    },

    /// Producing the bytes of an overlay entry failed during the write pass.
    #[error("failed to read resource '{resource}' of patch '{patch_id}'")]
    EntrySource {
        patch_id: String,
        resource: String,
        #[source]
        source: Box<Error>,
    },

    /// The archive codec failed while repacking. The original archive is untouched.
    #[error("failed to write archive '{archive_id}'{}", patch_suffix(.patch_id))]
    ArchiveWrite {
        archive_id: String,
        patch_id: Option<String>,
        #[source]
        source: Box<Error>,
    },

    /// The repacked archive was written but could not replace the original.
    #[error("failed to move the repacked file into place at {path}")]
    PartialWrite {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An archive-format codec rejected its input.
    #[error("{codec} codec error: {message}")]
    Codec { codec: &'static str, message: String },

    #[error("archive '{archive_id}' not found at {path}")]
    ArchiveNotFound { archive_id: String, path: Utf8PathBuf },

    /// A patch touches an archive the base index does not know.
    #[error("patch '{patch_id}' targets unknown archive '{archive_id}'")]
    UnknownArchive { patch_id: String, archive_id: String },

    /// Two patches map one archive id to different paths.
    #[error("archive '{archive_id}' is mapped to both '{first}' and '{second}'")]
    ArchiveConflict {
        archive_id: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },

    #[error("generator has no remaining entry '{0}'")]
    GeneratorEntryUnavailable(String),

    #[error("generator entries were requested before the write pass started")]
    GeneratorNotWriting,

    #[error("patch '{patch_id}' does not support game version '{version}'")]
    IncompatiblePatch { patch_id: String, version: String },

    #[error("patch '{id}' revision {revision} is already installed")]
    AlreadyInstalled { id: String, revision: u32 },

    #[error("patch '{0}' is not installed")]
    PatchNotFound(String),

    /// Another process holds the library lock.
    #[error("patch library at {0} is in use by another process")]
    LibraryBusy(Utf8PathBuf),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Id of the patch this error can be attributed to, if any.
    pub fn patch_id(&self) -> Option<&str> {
        match self {
            Error::MissingResource { patch_id, .. }
            | Error::EntrySource { patch_id, .. }
            | Error::UnknownArchive { patch_id, .. }
            | Error::IncompatiblePatch { patch_id, .. } => Some(patch_id),
            Error::ArchiveWrite { patch_id, .. } => patch_id.as_deref(),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

fn patch_suffix(patch_id: &Option<String>) -> String {
    match patch_id {
        Some(id) => format!(" (patch '{}')", id),
        None => String::new(),
    }
}
