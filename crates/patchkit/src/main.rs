use clap::builder::{styling::AnsiColor, Styles};
use clap::ColorChoice;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    apply_patches, info_container, install_patch, list_patches, pack_patch, revert_patches,
    ApplyPatchesArgs, InfoContainerArgs, InstallPatchArgs, PackPatchArgs,
};
use miette::Result;
use tracing_subscriber::EnvFilter;

mod commands;
mod errors;
mod utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The patch library directory (defaults to the configured or platform data directory)
    #[arg(short, long, global = true)]
    library: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pack a patch directory into a resource container
    Pack {
        /// The patch directory containing assets/ and resources/
        #[arg(short, long)]
        dir: String,

        /// The resulting file name of the container
        #[arg(short, long)]
        file_name: Option<String>,

        /// The directory to output the container to
        #[arg(short, long, default_value = "build")]
        output_dir: String,
    },
    /// Show the owners, manifests and entries of a resource container
    Info {
        /// The path to the container file
        #[arg(short, long)]
        file_path: String,
    },
    /// Install a container or a patch directory into the library
    Install {
        /// The path to the container file or patch directory
        #[arg(short, long)]
        file_path: String,
    },
    /// List installed patches and the enabled order
    List,
    /// Apply the enabled patches to a game install
    Apply {
        /// The game config file (game.toml or game.json)
        #[arg(short, long)]
        game: String,

        /// Patch ids to enable, lowest priority first
        #[arg(short, long, value_delimiter = ',')]
        patches: Option<Vec<String>>,
    },
    /// Restore the pristine game files
    Revert {
        /// The game config file (game.toml or game.json)
        #[arg(short, long)]
        game: String,
    },
}

fn parse_args() -> Args {
    // Configure colored/styled help output
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("patchkit=info,pk_overlay=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = parse_args();

    match args.command {
        Commands::Pack {
            dir,
            file_name,
            output_dir,
        } => pack_patch(PackPatchArgs {
            dir,
            file_name,
            output_dir,
        }),
        Commands::Info { file_path } => info_container(InfoContainerArgs { file_path }),
        Commands::Install { file_path } => install_patch(InstallPatchArgs {
            library: args.library,
            file_path,
        }),
        Commands::List => list_patches(args.library),
        Commands::Apply { game, patches } => apply_patches(ApplyPatchesArgs {
            library: args.library,
            game,
            patches,
        }),
        Commands::Revert { game } => revert_patches(ApplyPatchesArgs {
            library: args.library,
            game,
            patches: None,
        }),
    }
}
