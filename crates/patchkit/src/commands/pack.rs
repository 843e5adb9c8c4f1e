use std::io::{BufWriter, Write};

use camino::Utf8Path;
use colored::Colorize;
use miette::{IntoDiagnostic, Result, WrapErr};
use pk_overlay::{library::CONTAINER_EXTENSION, pack_patch_dir};
use pk_patch::PatchManifest;
use tempfile::NamedTempFile;

use crate::{
    errors::{overlay_error, CliError},
    utils,
};

#[derive(Debug)]
pub struct PackPatchArgs {
    pub dir: String,
    pub file_name: Option<String>,
    pub output_dir: String,
}

pub fn pack_patch(args: PackPatchArgs) -> Result<()> {
    let dir = utils::absolute_path(&args.dir)?;
    if !dir.is_dir() {
        return Err(CliError::patch_dir_not_found(dir).into());
    }

    println!(
        "{} {}",
        "📦 Packing patch directory:".bright_blue().bold(),
        dir.as_str().bright_cyan().bold()
    );

    let output_dir = utils::absolute_path(&args.output_dir)?;
    if !output_dir.exists() {
        println!("Creating output directory: {}", output_dir);
        std::fs::create_dir_all(output_dir.as_std_path())
            .map_err(|e| CliError::directory_creation_failed(output_dir.clone(), e))?;
    }

    // The file name depends on the manifest, so pack next to the destination first.
    let mut temp = NamedTempFile::new_in(output_dir.as_std_path()).into_diagnostic()?;
    let manifest = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let manifest = pack_patch_dir(&dir, &mut writer).map_err(overlay_error)?;
        writer.flush().into_diagnostic()?;
        manifest
    };

    let file_name = create_container_file_name(&manifest, args.file_name);
    let output_path = output_dir.join(&file_name);
    temp.persist(output_path.as_std_path())
        .map_err(|e| e.error)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", output_path))?;

    print_summary(&manifest, &output_path);
    Ok(())
}

fn print_summary(manifest: &PatchManifest, output_path: &Utf8Path) {
    let archives = manifest.files.archives.len();
    let added: usize = manifest.files.added_files.values().map(Vec::len).sum();
    let removed: usize = manifest.files.removed_files.values().map(Vec::len).sum();

    println!(
        "{} {} {}",
        "🧩 Patch:".bright_magenta(),
        manifest.name.bright_cyan().bold(),
        format!("({} r{})", manifest.id, manifest.revision).dimmed()
    );
    println!(
        "   {} archives, {} added files, {} removed files",
        archives.to_string().bright_white(),
        added.to_string().bright_white(),
        removed.to_string().bright_white()
    );
    println!(
        "{}\n{} {}",
        "✅ Container created successfully!".bright_green().bold(),
        "📍 Path:".bright_green(),
        output_path.as_str().bright_white().bold()
    );
}

fn create_container_file_name(manifest: &PatchManifest, custom_name: Option<String>) -> String {
    let suffix = format!(".{}", CONTAINER_EXTENSION);
    match custom_name {
        Some(name) if name.ends_with(&suffix) => name,
        Some(name) => format!("{}{}", name, suffix),
        None => format!("{}_r{}{}", manifest.key(), manifest.revision, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PatchManifest {
        PatchManifest {
            id: "HD-Textures".to_string(),
            name: "HD Textures".to_string(),
            revision: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_container_file_name() {
        assert_eq!(create_container_file_name(&manifest(), None), "hd-textures_r3.pkc");
        assert_eq!(
            create_container_file_name(&manifest(), Some("custom".to_string())),
            "custom.pkc"
        );
        assert_eq!(
            create_container_file_name(&manifest(), Some("custom.pkc".to_string())),
            "custom.pkc"
        );
    }
}
