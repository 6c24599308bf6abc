//! nimbus - build and deploy the simulation stack.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;
mod prompts;

use cmd::Context;

/// Build the simulation stack into a content-addressed store, assemble
/// versioned environments, and replicate them to the fleet.
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the configuration file
  #[arg(long, global = true, default_value = "config.yaml")]
  config: PathBuf,

  /// Installation prefix (default: paths.prefix from the config)
  #[arg(long, global = true)]
  prefix: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build all packages and assemble the declared environments
  Build {
    /// Force a new environment instance even if one already exists (rollback)
    #[arg(short, long)]
    force: bool,

    /// Directory of build scripts overriding the builtin ones
    #[arg(long)]
    extra_scripts: Option<PathBuf>,
  },

  /// Create the configured symlinks
  Links,

  /// Replicate the store and environments to every area
  Sync {
    /// Prefix used on the remote hosts (default: the local prefix)
    #[arg(long)]
    dest_prefix: Option<PathBuf>,

    /// Record the commands without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Process hosts one at a time instead of in parallel
    #[arg(long)]
    no_async: bool,
  },

  /// Inspect the deployed state on every area
  Check {
    /// Prefix used on the remote hosts (default: the local prefix)
    #[arg(long)]
    dest_prefix: Option<PathBuf>,
  },

  /// Pin a package's source ref to a branch's latest commit
  Update {
    /// Package to update
    package: String,

    /// Branch whose latest commit becomes the new ref
    branch: String,

    /// New version string to record alongside the new ref
    #[arg(long)]
    version: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("nimbus_lib=debug,nimbus_cli=debug")
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .without_time()
    .init();

  let ctx = Context::load(&cli.config, cli.prefix.as_deref())?;

  match cli.command {
    Commands::Build {
      force,
      extra_scripts,
    } => cmd::cmd_build(&ctx, force, extra_scripts),
    Commands::Links => cmd::cmd_links(&ctx),
    Commands::Sync {
      dest_prefix,
      dry_run,
      no_async,
    } => cmd::cmd_sync(&ctx, dest_prefix, dry_run, no_async),
    Commands::Check { dest_prefix } => cmd::cmd_check(&ctx, dest_prefix),
    Commands::Update {
      package,
      branch,
      version,
      yes,
    } => cmd::cmd_update(&ctx, &package, &branch, version.as_deref(), yes),
  }
}
