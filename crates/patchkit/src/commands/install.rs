use colored::Colorize;
use miette::Result;
use pk_overlay::{InstalledPatch, PatchLibrary};

use crate::{errors::overlay_error, utils};

pub struct InstallPatchArgs {
    pub library: Option<String>,
    pub file_path: String,
}

pub fn install_patch(args: InstallPatchArgs) -> Result<()> {
    let path = utils::existing_path(&args.file_path)?;
    let library_dir = utils::config::resolve_library_dir(args.library.as_deref())?;
    let mut library = PatchLibrary::open(library_dir).map_err(overlay_error)?;
    let _lock = library.lock().map_err(overlay_error)?;

    println!(
        "{} {}",
        "📥 Installing:".bright_blue().bold(),
        path.as_str().bright_cyan().bold()
    );

    let installed = match path.is_dir() {
        true => vec![library.install_directory(&path).map_err(overlay_error)?],
        false => library.install_container(&path).map_err(overlay_error)?,
    };

    for patch in &installed {
        print_installed(patch);
    }
    println!(
        "{} {}",
        "📍 Library:".bright_green(),
        library.root().as_str().bright_white().bold()
    );

    Ok(())
}

fn print_installed(patch: &InstalledPatch) {
    println!(
        "{} {} {}",
        "✅ Installed".bright_green().bold(),
        patch.name.bright_cyan().bold(),
        format!("({} r{})", patch.id, patch.revision).dimmed()
    );
}
