mod build;
mod graph;
mod plan;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use overlay_lib::manifest::PackageSet;
use overlay_lib::package::PackageGraph;
use overlay_lib::plan::{BuildPlan, PlanError};

pub use build::{BuildArgs, cmd_build};
pub use graph::cmd_graph;
pub use plan::cmd_plan;

type PlanResults = BTreeMap<String, Result<Arc<BuildPlan>, PlanError>>;

/// Load and compose the package set at `file`.
fn compose(file: &Path) -> Result<(PackageSet, PackageGraph)> {
  let set = PackageSet::load(file).with_context(|| format!("Failed to load package set: {}", file.display()))?;
  let graph = set.compose().context("Failed to compose package set")?;
  Ok((set, graph))
}

/// Plan `packages`, or every package when none are named.
fn plan_selected(set: &PackageSet, graph: &PackageGraph, packages: &[String]) -> Result<PlanResults> {
  let planner = set.planner();
  if packages.is_empty() {
    return Ok(planner.plan_all(graph));
  }

  for name in packages {
    if !graph.contains(name) {
      bail!("unknown package '{}'", name);
    }
  }
  Ok(
    packages
      .iter()
      .map(|name| (name.clone(), planner.plan_package(name, graph)))
      .collect(),
  )
}
