use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Patch directory not found: {path}")]
    #[diagnostic(
        code(pack::dir_not_found),
        help("Point --dir at a directory containing assets/patch.json and resources/")
    )]
    PatchDirNotFound { path: Utf8PathBuf },

    #[error("Game config not found: {path}")]
    #[diagnostic(
        code(game::config_not_found),
        help("Create a game.toml with game_dir and version, e.g. game_dir = \"C:/Games/Example\"")
    )]
    GameConfigNotFound { path: Utf8PathBuf },

    #[error("Could not determine a library directory")]
    #[diagnostic(
        code(library::no_location),
        help("Pass --library <dir> or set library_path in config.toml next to the executable")
    )]
    NoLibraryLocation,

    #[error("File not found: {path}")]
    #[diagnostic(
        code(file::not_found),
        help("Make sure the file exists and the path is correct")
    )]
    FileNotFound { path: Utf8PathBuf },

    #[error("Patch library is busy")]
    #[diagnostic(
        code(library::busy),
        help("Another patchkit process is applying patches; wait for it to finish")
    )]
    LibraryBusy {
        #[source]
        source: pk_overlay::Error,
    },

    #[error("Patch '{id}' is not installed")]
    #[diagnostic(
        code(library::patch_not_found),
        help("Run `patchkit list` to see installed patches, or install it with `patchkit install`")
    )]
    PatchNotInstalled { id: String },

    #[error("Directory creation failed")]
    #[diagnostic(
        code(fs::create_dir_failed),
        help("Check file permissions and available disk space")
    )]
    DirectoryCreationFailed {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(overlay::operation_failed))]
    Overlay {
        #[from]
        source: pk_overlay::Error,
    },
}

impl CliError {
    pub fn patch_dir_not_found(path: Utf8PathBuf) -> Self {
        Self::PatchDirNotFound { path }
    }

    pub fn game_config_not_found(path: Utf8PathBuf) -> Self {
        Self::GameConfigNotFound { path }
    }

    pub fn file_not_found(path: Utf8PathBuf) -> Self {
        Self::FileNotFound { path }
    }

    pub fn directory_creation_failed(path: Utf8PathBuf, source: std::io::Error) -> Self {
        Self::DirectoryCreationFailed { path, source }
    }
}

/// Maps overlay errors that have a dedicated diagnostic; everything else is passed through.
pub fn overlay_error(error: pk_overlay::Error) -> miette::Report {
    match error {
        pk_overlay::Error::LibraryBusy(_) => CliError::LibraryBusy { source: error }.into(),
        pk_overlay::Error::PatchNotFound(id) => CliError::PatchNotInstalled { id }.into(),
        other => CliError::from(other).into(),
    }
}
