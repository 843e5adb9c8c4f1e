//! Patch manifests and the identity model for modified files.

mod error;
mod manifest;
mod path;

pub use error::{PatchError, Result};
pub use manifest::*;
pub use path::*;
