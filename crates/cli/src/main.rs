mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::BuildArgs;
use crate::output::OutputFormat;

/// ovl - layered package overrides and reproducible builds
#[derive(Parser)]
#[command(name = "ovl")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging (RUST_LOG takes precedence)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Compose a package set and print the build plan of each package
  Plan {
    /// Path to the package-set file
    file: PathBuf,

    /// Only plan these packages (and their dependencies)
    #[arg(short, long = "package")]
    packages: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Build packages into the content store
  Build {
    /// Path to the package-set file
    file: PathBuf,

    /// Only build these packages (and their dependencies)
    #[arg(short, long = "package")]
    packages: Vec<String>,

    /// Maximum number of concurrent builds
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Store root (default: $OVERLAY_STORE, then the user data directory)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Pass the caller's PATH to build tools instead of an empty search path
    #[arg(long)]
    host_path: bool,

    /// Abort the build after this long (e.g. "10m", "1h 30m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Print the composed package graph
  Graph {
    /// Path to the package-set file
    file: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
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
    Commands::Plan { file, packages, format } => cmd::cmd_plan(&file, &packages, format),
    Commands::Build {
      file,
      packages,
      jobs,
      store,
      host_path,
      timeout,
      format,
    } => cmd::cmd_build(BuildArgs {
      file,
      packages,
      jobs,
      store,
      host_path,
      timeout,
      format,
    }),
    Commands::Graph { file, format } => cmd::cmd_graph(&file, format),
  }
}
