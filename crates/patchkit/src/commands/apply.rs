use colored::Colorize;
use miette::Result;
use pk_overlay::{ApplyProgress, ApplyResult, ApplyStage, GameConfig, OverlayApplier, PatchLibrary};

use crate::{
    errors::{overlay_error, CliError},
    println_pad, utils,
};

pub struct ApplyPatchesArgs {
    pub library: Option<String>,
    pub game: String,
    /// Replaces the enabled order before applying.
    pub patches: Option<Vec<String>>,
}

pub fn apply_patches(args: ApplyPatchesArgs) -> Result<()> {
    let game = load_game_config(&args.game)?;
    let library_dir = utils::config::resolve_library_dir(args.library.as_deref())?;
    let mut library = PatchLibrary::open(library_dir).map_err(overlay_error)?;
    let _lock = library.lock().map_err(overlay_error)?;

    if let Some(patches) = &args.patches {
        library.set_enabled(patches).map_err(overlay_error)?;
    }

    println!(
        "{} {} {}",
        "🎮 Applying to:".bright_blue().bold(),
        game.game_dir.as_str().bright_cyan().bold(),
        format!("({} enabled)", library.enabled().len()).dimmed()
    );

    let patches = library.active_patches().map_err(overlay_error)?;
    let result = OverlayApplier::for_library(&library, game)
        .with_progress(print_progress)
        .apply(&patches)
        .map_err(overlay_error)?;

    print_result(&result);
    Ok(())
}

pub fn revert_patches(args: ApplyPatchesArgs) -> Result<()> {
    let game = load_game_config(&args.game)?;
    let library_dir = utils::config::resolve_library_dir(args.library.as_deref())?;
    let library = PatchLibrary::open(library_dir).map_err(overlay_error)?;
    let _lock = library.lock().map_err(overlay_error)?;

    println!(
        "{} {}",
        "♻️  Reverting:".bright_blue().bold(),
        game.game_dir.as_str().bright_cyan().bold()
    );

    let result = OverlayApplier::for_library(&library, game)
        .with_progress(print_progress)
        .revert()
        .map_err(overlay_error)?;

    print_result(&result);
    Ok(())
}

fn load_game_config(path: &str) -> Result<GameConfig> {
    let path = utils::absolute_path(path)?;
    if !path.is_file() {
        return Err(CliError::game_config_not_found(path).into());
    }
    GameConfig::load(&path).map_err(overlay_error)
}

fn print_progress(progress: ApplyProgress) {
    match progress.stage {
        ApplyStage::Repacking => println!(
            "   {} {} {}",
            "🔧".bright_yellow(),
            progress.current_file.unwrap_or_default().bright_white(),
            format!("[{}/{}]", progress.current, progress.total).dimmed()
        ),
        ApplyStage::Complete => {}
        stage => println!("{} {:?}", "▶".bright_cyan(), stage),
    }
}

fn print_result(result: &ApplyResult) {
    if result.skipped {
        println!(
            "{}",
            "✅ Game files are already up to date".bright_green().bold()
        );
        return;
    }

    for stats in &result.repacked {
        println_pad!(
            "{} {} {}",
            "📦".bright_blue(),
            stats.archive_id.bright_cyan().bold(),
            format!(
                "kept {}, replaced {}, added {}, removed {}",
                stats.kept, stats.replaced, stats.added, stats.removed
            )
            .dimmed()
        );
    }
    println_pad!(
        "{} {}",
        "📄 Loose files:".bright_blue(),
        format!("{} written, {} removed", result.loose.written, result.loose.removed).dimmed()
    );
    if !result.restored.is_empty() {
        println_pad!(
            "{} {}",
            "♻️  Restored:".bright_blue(),
            result.restored.len().to_string().bright_white()
        );
    }

    if !result.conflicts.is_empty() {
        println_pad!("\n{}", "⚠️  Conflicts:".bright_yellow().bold());
        for conflict in &result.conflicts {
            println_pad!(
                "   {} {} {} {}",
                "•".bright_yellow(),
                conflict.path.to_string().bright_white(),
                format!("({})", conflict.contributors.join(", ")).dimmed(),
                format!("-> {}", conflict.winner).bright_green()
            );
        }
    }

    println!(
        "{} {}",
        "✅ Done in".bright_green().bold(),
        format!("{:.2?}", result.elapsed).bright_white()
    );
}
