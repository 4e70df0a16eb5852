//! Implementation of the `ovl build` command.
//!
//! Composes and plans the package set, then builds the selected packages and
//! their dependencies into the content store. The store is locked for the
//! duration of the build. A package that cannot be planned is reported as
//! failed and the packages depending on it as skipped; everything else is
//! still built. Any failure makes the command exit non-zero.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use overlay_lib::execute::{CommandToolchain, ExecuteConfig, Executor, GraphBuildResult, build_graph};
use overlay_lib::fetch::DefaultTransport;
use overlay_lib::paths;
use overlay_lib::plan::BuildPlan;
use overlay_lib::store::FsStore;
use overlay_lib::store_lock::{LockMode, StoreLock};

use super::{compose, plan_selected};
use crate::output::{OutputFormat, Status, format_elapsed, format_size, print_field, print_json, print_status, short_id};

pub struct BuildArgs {
  pub file: PathBuf,
  pub packages: Vec<String>,
  pub jobs: Option<usize>,
  pub store: Option<PathBuf>,
  pub host_path: bool,
  pub timeout: Option<Duration>,
  pub format: OutputFormat,
}

#[derive(Serialize)]
struct BuiltEntry {
  id: String,
  digest: String,
  size: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  path: Option<PathBuf>,
}

/// Outcome of every selected package and every dependency pulled in.
#[derive(Default, Serialize)]
struct BuildReport {
  built: BTreeMap<String, BuiltEntry>,
  failed: BTreeMap<String, String>,
  skipped: BTreeMap<String, String>,
}

impl BuildReport {
  fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  fn total(&self) -> usize {
    self.built.len() + self.failed.len() + self.skipped.len()
  }

  fn record_build(&mut self, result: &GraphBuildResult) {
    for (name, artifact) in &result.built {
      let entry = BuiltEntry {
        id: artifact.id.to_string(),
        digest: artifact.digest.to_string(),
        size: artifact.size,
        path: artifact.path.clone(),
      };
      self.built.insert(name.clone(), entry);
    }
    self.failed.extend(result.failed.iter().map(|(n, e)| (n.clone(), e.to_string())));
    self.skipped.extend(result.skipped.iter().map(|(n, e)| (n.clone(), e.to_string())));
  }

  fn print(&self, elapsed: Duration) {
    for (name, entry) in &self.built {
      print_status(
        Status::Built,
        &format!("{} ({}, {})", name, short_id(&entry.id), format_size(entry.size)),
      );
    }
    for message in self.failed.values() {
      print_status(Status::Failed, message);
    }
    for message in self.skipped.values() {
      print_status(Status::Skipped, message);
    }
    println!();
    print_field("Built", &self.built.len().to_string());
    print_field("Failed", &self.failed.len().to_string());
    print_field("Skipped", &self.skipped.len().to_string());
    print_field("Duration", &format_elapsed(elapsed));
  }
}

pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let start = Instant::now();

  let (set, graph) = compose(&args.file)?;
  let mut report = BuildReport::default();
  let mut plans: Vec<Arc<BuildPlan>> = Vec::new();
  for (name, result) in plan_selected(&set, &graph, &args.packages)? {
    match result {
      Ok(plan) => plans.push(plan),
      Err(e) if e.is_own(&name) => {
        warn!(package = %name, error = %e, "planning failed");
        report.failed.insert(name, e.to_string());
      }
      Err(e) => {
        let message = format!("{} not built: a dependency could not be planned: {}", name, e);
        report.skipped.insert(name, message);
      }
    }
  }

  let store_root = args.store.clone().unwrap_or_else(paths::store_dir);
  let _lock = StoreLock::acquire(&store_root, LockMode::Exclusive, "ovl build").context("Failed to acquire store lock")?;

  // relative source origins resolve against the package set's directory
  let manifest_path = dunce::canonicalize(&args.file)
    .with_context(|| format!("Failed to resolve package set path: {}", args.file.display()))?;
  let base_dir = manifest_path.parent().map(PathBuf::from).unwrap_or_default();

  let mut toolchain = CommandToolchain::new();
  if args.host_path {
    toolchain = toolchain.with_search_path(&std::env::var("PATH").unwrap_or_default());
  }

  let mut config = ExecuteConfig::default();
  if let Some(jobs) = args.jobs {
    config.parallelism = jobs.max(1);
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    let store = FsStore::open(&store_root)
      .await
      .with_context(|| format!("Failed to open store: {}", store_root.display()))?;
    info!(store = %store_root.display(), plans = plans.len(), "starting build");

    let executor = Executor::new(
      Arc::new(store),
      Arc::new(DefaultTransport::with_base(&base_dir)),
      Arc::new(toolchain),
      config,
    );

    let build = build_graph(&executor, plans.iter());
    match args.timeout {
      Some(limit) => tokio::time::timeout(limit, build)
        .await
        .with_context(|| format!("Build timed out after {}", humantime::format_duration(limit))),
      None => Ok(build.await),
    }
  })?;

  report.record_build(&result);
  if args.format.is_json() {
    print_json(&report)?;
  } else {
    report.print(start.elapsed());
  }

  if !report.is_success() {
    bail!(
      "{} of {} package(s) did not build",
      report.failed.len() + report.skipped.len(),
      report.total()
    );
  }
  Ok(())
}
