//! Patch overlay for game installs.
//!
//! This crate layers a stack of patches over a game's loose files and archives:
//!
//! - **Data sources** ([`source`]): uniform read access to a patch's resources, whether they
//!   live in a directory, a resource container or in memory.
//! - **Resolution** ([`resolver`]): compute, per archive and for loose files, which original
//!   entries survive, which are removed and which come from a patch. Higher priority wins.
//! - **Repacking** ([`repack`]): rewrite each changed archive through an [`ArchiveCodec`],
//!   producing entry bytes lazily through an [`ArchiveFileGenerator`] and replacing the
//!   original atomically.
//! - **Library and applier** ([`library`], [`apply`]): installed patches, backups of pristine
//!   game files and the applied state, so a stack can be re-applied or reverted.
//!
//! # Example
//!
//! ```no_run
//! use pk_overlay::{GameConfig, OverlayApplier, PatchLibrary};
//!
//! # fn main() -> pk_overlay::Result<()> {
//! let mut library = PatchLibrary::open("/home/me/.local/share/patchkit")?;
//! let game = GameConfig::load("/games/example/game.toml".into())?;
//!
//! let _lock = library.lock()?;
//! let patches = library.active_patches()?;
//! let result = OverlayApplier::for_library(&library, game)
//!     .with_progress(|progress| println!("{:?} {}/{}", progress.stage, progress.current, progress.total))
//!     .apply(&patches)?;
//!
//! println!("Repacked {} archives", result.repacked.len());
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod codec;
pub mod error;
pub mod generator;
pub mod library;
pub mod pack;
pub mod repack;
pub mod resolver;
pub mod source;
pub mod state;
pub mod utils;

#[cfg(test)]
mod tests;

pub use apply::{ApplyProgress, ApplyResult, ApplyStage, GameConfig, OverlayApplier};
pub use codec::{ArchiveCodec, ArchiveEntry, ArchiveFormat, ArchiveReader, ZipCodec, ZipReader};
pub use error::{Error, Result};
pub use generator::{ArchiveFileGenerator, GeneratorEntry};
pub use library::{InstalledPatch, LibraryLock, PatchLibrary, PatchStorage};
pub use pack::pack_patch_dir;
pub use repack::{apply_loose, repack_archive, LooseStats, RepackStats};
pub use resolver::{resolve, ActivePatch, BaseIndex, BucketResolution, Conflict, OverlayEntry, ResolutionTable};
pub use source::{ContainerSource, DataSource, Ownership, PhysicalSource, ResourceStream, VirtualSource};
pub use state::AppliedState;
