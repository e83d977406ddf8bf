mod cmd;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::SettingsArgs;

/// rolebuild - build and push role-based container images
#[derive(Parser)]
#[command(name = "rolebuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output, including daemon build output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build, and optionally push, an image for every selected unit
  Build {
    #[command(flatten)]
    settings: SettingsArgs,
  },

  /// Print the generated recipe for a unit
  Recipe {
    /// Unit name as listed in the inventory
    unit: String,

    #[command(flatten)]
    settings: SettingsArgs,
  },

  /// List the units found in the inventory
  Units {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build { settings } => cmd::cmd_build(&settings, cli.verbose),
    Commands::Recipe { unit, settings } => cmd::cmd_recipe(&unit, &settings),
    Commands::Units { settings, json } => cmd::cmd_units(&settings, json),
  }
}
