use std::io::Read;

use colored::Colorize;
use miette::{IntoDiagnostic, Result, WrapErr};
use pk_container::{EntryKind, ResourceContainer};
use pk_patch::{PatchManifest, PATCH_MANIFEST_ASSET};

use crate::{println_pad, utils};

pub struct InfoContainerArgs {
    pub file_path: String,
}

pub fn info_container(args: InfoContainerArgs) -> Result<()> {
    let path = utils::existing_path(&args.file_path)?;
    let container = ResourceContainer::open(&path).into_diagnostic()?;

    println_pad!(
        "{} {} {}",
        "📦 Container:".bright_blue().bold(),
        path.as_str().bright_cyan().bold(),
        format!("(v{}, {} entries)", container.version(), container.len()).dimmed()
    );

    for owner in container.owners() {
        let manifest = read_manifest(&container, owner)?;
        print_manifest(owner, manifest.as_ref());
    }

    println_pad!("\n{}", "🗂️  Entries:".bright_magenta().bold());
    for entry in container.entries() {
        let kind = match entry.kind {
            EntryKind::Resource => "resource",
            EntryKind::NormalizedResource => "normalized",
            EntryKind::Asset => "asset",
        };
        println_pad!(
            "   {} {}/{} {} {}",
            "•".bright_cyan(),
            entry.owner.dimmed(),
            entry.name.bright_white(),
            format!("[{}]", kind).bright_yellow(),
            format!(
                "{} ({:?}, {} stored)",
                utils::format_size(entry.size),
                entry.compression,
                utils::format_size(entry.stored_size)
            )
            .dimmed()
        );
    }

    container.close();
    Ok(())
}

fn read_manifest(container: &ResourceContainer, owner: &str) -> Result<Option<PatchManifest>> {
    if !container.contains(owner, PATCH_MANIFEST_ASSET, EntryKind::Asset) {
        return Ok(None);
    }

    let mut json = String::new();
    container
        .get_asset(owner, PATCH_MANIFEST_ASSET)
        .into_diagnostic()?
        .read_to_string(&mut json)
        .into_diagnostic()?;
    let manifest = PatchManifest::from_json(&json)
        .into_diagnostic()
        .wrap_err_with(|| format!("Invalid {} for owner '{}'", PATCH_MANIFEST_ASSET, owner))?;
    Ok(Some(manifest))
}

fn print_manifest(owner: &str, manifest: Option<&PatchManifest>) {
    let Some(manifest) = manifest else {
        println_pad!(
            "\n{} {} {}",
            "🧩 Owner:".bright_magenta().bold(),
            owner.bright_cyan().bold(),
            "(no patch manifest)".dimmed()
        );
        return;
    };

    println_pad!(
        "\n{} {} {}",
        "🧩 Patch:".bright_magenta().bold(),
        manifest.name.bright_cyan().bold(),
        format!("({})", manifest.id).dimmed()
    );
    println_pad!(
        "{} {}",
        "🏷️ Revision:".bright_green(),
        manifest.revision.to_string().bright_white().bold()
    );
    if let Some(author) = &manifest.author {
        println_pad!("{} {}", "👤 Author:".bright_green(), author.bright_white());
    }
    println_pad!(
        "{} {}",
        "📝 Description:".bright_yellow(),
        match manifest.description.is_empty() {
            true => "No description",
            false => manifest.description.as_str(),
        }
        .bright_white()
    );
    println_pad!(
        "{} {}",
        "🎮 Game versions:".bright_yellow(),
        match manifest.files.game_versions.is_empty() {
            true => "any".to_string(),
            false => manifest.files.game_versions.join(", "),
        }
        .bright_white()
    );

    for archive in &manifest.files.archives {
        println_pad!(
            "   {} {} {}",
            "•".bright_cyan(),
            archive.id.bright_cyan().bold(),
            format!("-> {}", archive.path).dimmed()
        );
    }
    for (bucket, files) in &manifest.files.added_files {
        println_pad!(
            "   {} {} {}",
            "+".bright_green(),
            bucket.bright_white(),
            format!("{} files", files.len()).dimmed()
        );
    }
    for (bucket, files) in &manifest.files.removed_files {
        println_pad!(
            "   {} {} {}",
            "-".bright_red(),
            bucket.bright_white(),
            format!("{} files", files.len()).dimmed()
        );
    }
}
