use colored::Colorize;
use miette::Result;
use pk_overlay::PatchLibrary;

use crate::{errors::overlay_error, println_pad, utils};

pub fn list_patches(library: Option<String>) -> Result<()> {
    let library_dir = utils::config::resolve_library_dir(library.as_deref())?;
    let library = PatchLibrary::open(library_dir).map_err(overlay_error)?;

    println_pad!(
        "{} {}",
        "📚 Library:".bright_blue().bold(),
        library.root().as_str().bright_cyan().bold()
    );

    if library.patches().is_empty() {
        println_pad!("{}", "No patches installed".dimmed());
        return Ok(());
    }

    println_pad!("\n{}", "🧩 Installed:".bright_magenta().bold());
    for patch in library.patches() {
        let enabled = library
            .enabled()
            .iter()
            .any(|id| id.eq_ignore_ascii_case(&patch.id));
        println_pad!(
            "   {} {} {} {}",
            match enabled {
                true => "●".bright_green(),
                false => "○".dimmed(),
            },
            patch.name.bright_cyan().bold(),
            format!("({} r{})", patch.id, patch.revision).dimmed(),
            format!("installed {}", patch.installed_at.format("%Y-%m-%d %H:%M")).dimmed()
        );
    }

    println_pad!("\n{}", "🏗️  Enabled (lowest priority first):".bright_magenta().bold());
    if library.enabled().is_empty() {
        println_pad!("   {}", "none".dimmed());
    }
    for (priority, id) in library.enabled().iter().enumerate() {
        println_pad!(
            "   {} {}",
            format!("{:>2}.", priority).dimmed(),
            id.bright_white()
        );
    }

    Ok(())
}
