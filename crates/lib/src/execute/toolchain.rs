//! Tool phase invocation.
//!
//! The [`CommandToolchain`] runs commands in an isolated environment:
//! - Clears all environment variables
//! - Sets PATH to /path-not-set unless a search path is configured
//! - Sets HOME to /homeless-shelter
//! - Points TMPDIR/TMP/TEMP/TEMPDIR at the workspace's tmp directory
//! - Exports `src`, `out`, `cache` and `deps` as workspace paths
//! - Merges the option environment from the plan underneath those, so an
//!   option can never replace an isolation variable

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::SOURCE_DATE_EPOCH;
use crate::plan::{PhaseKind, ToolSpec};

/// Everything a toolchain needs to run one tool phase.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
  pub package: String,
  pub phase: PhaseKind,
  pub spec: ToolSpec,
  /// Working source tree; the process runs here.
  pub source_dir: PathBuf,
  pub out_dir: PathBuf,
  pub cache_dir: PathBuf,
  pub tmp_dir: PathBuf,
  /// Parent of the unpacked dependency artifacts.
  pub deps_dir: PathBuf,
  /// Unpacked dependency artifacts by package name.
  pub dependencies: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
  pub success: bool,
  pub exit_code: Option<i32>,
  /// Files under the output directory after the call, relative and sorted.
  pub produced: Vec<PathBuf>,
  pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },
}

/// Runs tool phases.
#[async_trait]
pub trait Toolchain: Send + Sync {
  async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError>;
}

/// Spawns each phase's command as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandToolchain {
  search_path: Option<String>,
}

impl CommandToolchain {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use `path` as PATH for child processes.
  pub fn with_search_path(mut self, path: &str) -> Self {
    self.search_path = Some(path.to_string());
    self
  }
}

#[async_trait]
impl Toolchain for CommandToolchain {
  async fn invoke(&self, inv: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
    let program = &inv.spec.command.program;
    info!(package = %inv.package, phase = %inv.phase, program = %program, "running tool phase");

    let mut command = Command::new(program);
    command
      .args(&inv.spec.command.args)
      .current_dir(&inv.source_dir)
      .env_clear()
      .envs(&inv.spec.env)
      .env("PATH", self.search_path.as_deref().unwrap_or("/path-not-set"))
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", &inv.tmp_dir)
      .env("TMP", &inv.tmp_dir)
      .env("TEMP", &inv.tmp_dir)
      .env("TEMPDIR", &inv.tmp_dir)
      .env("src", &inv.source_dir)
      .env("out", &inv.out_dir)
      .env("cache", &inv.cache_dir)
      .env("deps", &inv.deps_dir)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("TZ", "UTC")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .kill_on_drop(true);

    debug!(working_dir = ?inv.source_dir, args = ?inv.spec.command.args, "spawning process");

    let output = command.output().await.map_err(|source| ToolError::Spawn {
      program: program.clone(),
      source,
    })?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      let stdout = String::from_utf8_lossy(&output.stdout);
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "command stdout");
      }
    }

    Ok(ToolOutcome {
      success: output.status.success(),
      exit_code: output.status.code(),
      produced: list_files(&inv.out_dir),
      stderr,
    })
  }
}

/// Regular files under `root`, relative to it, in sorted order.
pub(crate) fn list_files(root: &Path) -> Vec<PathBuf> {
  WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
    .collect()
}
