use std::io;

use thiserror::Error;

use crate::EntryKind;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors raised while opening or reading a resource container.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The header or index is malformed, or an entry points outside the payload region.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// The file was written by a newer format revision.
    #[error("unsupported container version {version} (supported up to {supported})")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("{kind} '{name}' not found for owner '{owner}'")]
    ResourceNotFound {
        owner: String,
        name: String,
        kind: EntryKind,
    },

    #[error("container has been closed")]
    Closed,
}

impl From<binrw::Error> for ContainerError {
    fn from(error: binrw::Error) -> Self {
        match error {
            binrw::Error::Io(io) => ContainerError::Io(io),
            other => ContainerError::Corrupt(other.to_string()),
        }
    }
}
