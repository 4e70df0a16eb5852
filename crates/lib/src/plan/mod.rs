//! Build planning.
//!
//! A [`Planner`] turns a composed package definition into an immutable,
//! content-addressed [`BuildPlan`]. The plan identity is a SHA-256 over
//! everything that can influence the build output: source digests
//! (including sub-modules), patch digests in application order, canonical
//! options, the resolved tool commands and the identities of every
//! dependency plan. Changing any transitive input changes the identity.
//!
//! Phases always appear in the order fetch, patch, warm-up (when the recipe
//! has one), build, install.

mod options;
mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::package::{AmbientValue, OptionKind, PackageDefinition, PackageGraph, PatchDescriptor, ToolCommand};

pub use options::{OptionEffect, OptionSchema, OptionSpec, ResolvedOptions};
pub use types::{BuildPlan, Phase, PhaseAction, PhaseKind, PlanId, Slot, ToolSpec};

/// Why a definition cannot be planned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPlanReason {
  #[error("patches '{first}' and '{second}' share sequence position {sequence}")]
  DuplicatePatchSequence { sequence: u32, first: String, second: String },

  #[error("unknown option '{0}'")]
  UnknownOption(String),

  #[error("option '{key}' expects a {expected} value, got {found}")]
  OptionKind {
    key: String,
    expected: OptionKind,
    found: OptionKind,
  },

  #[error("option '{key}' has non-deterministic value {value:?}")]
  NonDeterministicOption { key: String, value: AmbientValue },

  #[error("option '{key}' would set reserved variable {var}")]
  ReservedVariable { key: String, var: String },

  #[error("{0} command is empty")]
  EmptyCommand(PhaseKind),

  #[error("source at '{path}' has malformed digest '{digest}'")]
  InvalidDigest { path: String, digest: String },

  #[error("sub-module path '{0}' must be relative and stay inside the source tree")]
  InvalidSubmodulePath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
  #[error("cannot plan '{package}': {reason}")]
  InvalidPlan { package: String, reason: InvalidPlanReason },

  #[error("dependency cycle while planning: {}", .cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },

  #[error("package '{package}' depends on unknown package '{reference}'")]
  UnknownReference { package: String, reference: String },

  #[error("failed to compute identity of '{package}': {message}")]
  Identity { package: String, message: String },
}

impl PlanError {
  /// Whether this error is `package`'s own rather than one it inherited from
  /// a dependency that could not be planned.
  pub fn is_own(&self, package: &str) -> bool {
    match self {
      PlanError::InvalidPlan { package: owner, .. }
      | PlanError::UnknownReference { package: owner, .. }
      | PlanError::Identity { package: owner, .. } => owner == package,
      PlanError::Cycle { cycle } => cycle.iter().any(|name| name == package),
    }
  }

  fn invalid(package: &str, reason: InvalidPlanReason) -> Self {
    PlanError::InvalidPlan {
      package: package.to_string(),
      reason,
    }
  }
}

/// Derives build plans from package definitions.
#[derive(Debug, Clone, Default)]
pub struct Planner {
  schema: OptionSchema,
}

struct PlanContext<'g> {
  graph: &'g PackageGraph,
  memo: HashMap<String, Arc<BuildPlan>>,
  visiting: Vec<String>,
}

impl Planner {
  pub fn new(schema: OptionSchema) -> Self {
    Self { schema }
  }

  /// A planner accepting any option key.
  pub fn permissive() -> Self {
    Self::new(OptionSchema::permissive())
  }

  pub fn schema(&self) -> &OptionSchema {
    &self.schema
  }

  /// Plan `def`, resolving its dependencies from `graph`.
  ///
  /// `def` need not be a member of `graph`. Dependency plans are memoized for
  /// the duration of the call, so a dependency shared by several packages is
  /// planned once.
  ///
  /// # Errors
  ///
  /// - [`PlanError::InvalidPlan`] if the definition or one of its
  ///   dependencies is malformed
  /// - [`PlanError::UnknownReference`] if a dependency is absent from `graph`
  /// - [`PlanError::Cycle`] if dependencies lead back to a package being planned
  pub fn plan(&self, def: &PackageDefinition, graph: &PackageGraph) -> Result<Arc<BuildPlan>, PlanError> {
    let mut ctx = PlanContext {
      graph,
      memo: HashMap::new(),
      visiting: Vec::new(),
    };
    self.plan_definition(def, &mut ctx)
  }

  /// Plan the package named `name` in `graph`.
  pub fn plan_package(&self, name: &str, graph: &PackageGraph) -> Result<Arc<BuildPlan>, PlanError> {
    let def = graph.get(name).ok_or_else(|| PlanError::UnknownReference {
      package: name.to_string(),
      reference: name.to_string(),
    })?;
    self.plan(def, graph)
  }

  /// Plan every package in `graph`.
  ///
  /// Failures are isolated: a package whose plan fails does not prevent
  /// unrelated packages from being planned. Dependents of a failed package
  /// receive that package's error.
  pub fn plan_all(&self, graph: &PackageGraph) -> BTreeMap<String, Result<Arc<BuildPlan>, PlanError>> {
    let mut ctx = PlanContext {
      graph,
      memo: HashMap::new(),
      visiting: Vec::new(),
    };

    let mut results = BTreeMap::new();
    for (name, def) in graph.iter() {
      ctx.visiting.clear();
      let result = match ctx.memo.get(name) {
        Some(plan) => Ok(plan.clone()),
        None => self.plan_definition(def, &mut ctx),
      };
      if let Ok(plan) = &result {
        ctx.memo.insert(name.to_string(), plan.clone());
      }
      results.insert(name.to_string(), result);
    }
    results
  }

  fn plan_definition(&self, def: &PackageDefinition, ctx: &mut PlanContext<'_>) -> Result<Arc<BuildPlan>, PlanError> {
    if let Some(start) = ctx.visiting.iter().position(|n| *n == def.name) {
      let mut cycle = ctx.visiting[start..].to_vec();
      cycle.push(def.name.clone());
      return Err(PlanError::Cycle { cycle });
    }

    self.check_sources(def)?;
    let patches = ordered_patches(def)?;
    let resolved = self
      .schema
      .resolve(&def.options)
      .map_err(|reason| PlanError::invalid(&def.name, reason))?;
    check_command(def, PhaseKind::Build, &def.recipe.build)?;
    check_command(def, PhaseKind::Install, &def.recipe.install)?;
    if let Some(warm_up) = &def.recipe.warm_up {
      check_command(def, PhaseKind::WarmUp, warm_up)?;
    }

    ctx.visiting.push(def.name.clone());
    let mut dependencies = BTreeMap::new();
    for dep in &def.dependencies {
      let plan = match ctx.memo.get(dep) {
        Some(plan) => plan.clone(),
        None => {
          let dep_def = ctx.graph.get(dep).ok_or_else(|| PlanError::UnknownReference {
            package: def.name.clone(),
            reference: dep.clone(),
          })?;
          let plan = self.plan_definition(dep_def, ctx)?;
          ctx.memo.insert(dep.clone(), plan.clone());
          plan
        }
      };
      dependencies.insert(dep.clone(), plan);
    }
    ctx.visiting.pop();

    let phases = build_phases(def, patches.clone(), &resolved, &dependencies);
    let id = types::compute_identity(
      &def.name,
      &def.version,
      &def.source,
      &patches,
      &def.options,
      &phases,
      &dependencies,
    )
    .map_err(|e| PlanError::Identity {
      package: def.name.clone(),
      message: e.to_string(),
    })?;

    trace!(package = %def.name, id = %id, phases = phases.len(), "planned package");

    let plan = BuildPlan {
      id,
      package: def.name.clone(),
      version: def.version.clone(),
      source: def.source.clone(),
      options: def.options.clone(),
      phases,
      dependencies,
    };
    debug!(package = %plan.package, id = %plan.id.short(), "build plan ready");
    Ok(Arc::new(plan))
  }

  fn check_sources(&self, def: &PackageDefinition) -> Result<(), PlanError> {
    for (path, digest) in def.source.all_digests() {
      if !digest.is_valid() {
        return Err(PlanError::invalid(
          &def.name,
          InvalidPlanReason::InvalidDigest {
            path,
            digest: digest.0,
          },
        ));
      }
      if !path.is_empty() && !is_contained_path(&path) {
        return Err(PlanError::invalid(&def.name, InvalidPlanReason::InvalidSubmodulePath(path)));
      }
    }
    Ok(())
  }
}

/// Whether `path` is relative and never climbs above its root.
pub(crate) fn is_contained_path(path: &str) -> bool {
  !path.starts_with('/')
    && !path.starts_with('\\')
    && !path.contains(':')
    && path
      .split(['/', '\\'])
      .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

fn ordered_patches(def: &PackageDefinition) -> Result<Vec<PatchDescriptor>, PlanError> {
  let mut patches = def.patches.clone();
  patches.sort_by_key(|p| p.sequence);
  for pair in patches.windows(2) {
    if pair[0].sequence == pair[1].sequence {
      return Err(PlanError::invalid(
        &def.name,
        InvalidPlanReason::DuplicatePatchSequence {
          sequence: pair[0].sequence,
          first: pair[0].name.clone(),
          second: pair[1].name.clone(),
        },
      ));
    }
  }
  Ok(patches)
}

fn check_command(def: &PackageDefinition, kind: PhaseKind, command: &ToolCommand) -> Result<(), PlanError> {
  if command.program.trim().is_empty() {
    return Err(PlanError::invalid(&def.name, InvalidPlanReason::EmptyCommand(kind)));
  }
  Ok(())
}

fn build_phases(
  def: &PackageDefinition,
  patches: Vec<PatchDescriptor>,
  resolved: &ResolvedOptions,
  dependencies: &BTreeMap<String, Arc<BuildPlan>>,
) -> Vec<Phase> {
  let dep_slots: Vec<Slot> = dependencies.keys().map(|d| Slot::Dependency(d.clone())).collect();
  let tool = |command: &ToolCommand, extra_args: &[String]| {
    let mut command = command.clone();
    command.args.extend(extra_args.iter().cloned());
    PhaseAction::Tool(ToolSpec {
      command,
      env: resolved.env.clone(),
    })
  };

  let mut phases = vec![
    Phase {
      kind: PhaseKind::Fetch,
      inputs: Vec::new(),
      outputs: vec![Slot::Source],
      action: PhaseAction::Fetch(def.source.clone()),
    },
    Phase {
      kind: PhaseKind::Patch,
      inputs: vec![Slot::Source],
      outputs: vec![Slot::Source],
      action: PhaseAction::Patch(patches),
    },
  ];

  let mut build_inputs = vec![Slot::Source];
  build_inputs.extend(dep_slots.iter().cloned());

  if let Some(warm_up) = &def.recipe.warm_up {
    phases.push(Phase {
      kind: PhaseKind::WarmUp,
      inputs: build_inputs.clone(),
      outputs: vec![Slot::Cache],
      action: tool(warm_up, &[]),
    });
    build_inputs.push(Slot::Cache);
  }

  phases.push(Phase {
    kind: PhaseKind::Build,
    inputs: build_inputs,
    outputs: vec![Slot::Source],
    action: tool(&def.recipe.build, &resolved.build_args),
  });

  let mut install_inputs = vec![Slot::Source];
  install_inputs.extend(dep_slots);
  phases.push(Phase {
    kind: PhaseKind::Install,
    inputs: install_inputs,
    outputs: vec![Slot::Output],
    action: tool(&def.recipe.install, &[]),
  });

  phases
}
