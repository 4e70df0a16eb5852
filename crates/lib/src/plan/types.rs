use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::package::{OptionValue, PatchDescriptor, SourceDescriptor, ToolCommand, Unpack};
use crate::util::hash::{ContentHash, HashError, Hashable};

/// Bumped whenever the identity encoding changes.
const IDENTITY_SCHEME: u32 = 1;

/// Content-addressed identity of a [`BuildPlan`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub ContentHash);

impl PlanId {
  pub fn as_str(&self) -> &str {
    &self.0.0
  }

  pub fn short(&self) -> &str {
    self.0.short()
  }
}

impl std::fmt::Display for PlanId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
  Fetch,
  Patch,
  WarmUp,
  Build,
  Install,
}

impl PhaseKind {
  /// Every phase kind, in execution order.
  pub const ALL: [PhaseKind; 5] = [
    PhaseKind::Fetch,
    PhaseKind::Patch,
    PhaseKind::WarmUp,
    PhaseKind::Build,
    PhaseKind::Install,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      PhaseKind::Fetch => "fetch",
      PhaseKind::Patch => "patch",
      PhaseKind::WarmUp => "warm-up",
      PhaseKind::Build => "build",
      PhaseKind::Install => "install",
    }
  }

  /// Whether a plan may leave this phase out.
  pub fn is_optional(&self) -> bool {
    matches!(self, PhaseKind::WarmUp)
  }
}

impl std::fmt::Display for PhaseKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A named resource a phase consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Slot {
  /// The working source tree.
  Source,
  /// Pre-materialized state from the warm-up phase.
  Cache,
  /// The published artifact of a dependency.
  Dependency(String),
  /// The install tree that becomes the artifact.
  Output,
}

/// A fully resolved toolchain call: the package's command with option
/// effects applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
  pub command: ToolCommand,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseAction {
  Fetch(SourceDescriptor),
  Patch(Vec<PatchDescriptor>),
  Tool(ToolSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
  pub kind: PhaseKind,
  pub inputs: Vec<Slot>,
  pub outputs: Vec<Slot>,
  pub action: PhaseAction,
}

/// Ordered, content-addressed description of how to build one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
  pub id: PlanId,
  pub package: String,
  pub version: String,
  pub source: SourceDescriptor,
  pub options: BTreeMap<String, OptionValue>,
  pub phases: Vec<Phase>,
  pub dependencies: BTreeMap<String, Arc<BuildPlan>>,
}

#[derive(Serialize)]
struct IdentityInput<'a> {
  scheme: u32,
  package: &'a str,
  version: &'a str,
  sources: Vec<(String, ContentHash, Unpack)>,
  patches: Vec<(u32, ContentHash)>,
  options: &'a BTreeMap<String, OptionValue>,
  tools: Vec<(PhaseKind, &'a ToolSpec)>,
  dependencies: BTreeMap<&'a str, &'a PlanId>,
}

impl Hashable for IdentityInput<'_> {}

impl BuildPlan {
  pub fn phase(&self, kind: PhaseKind) -> Option<&Phase> {
    self.phases.iter().find(|p| p.kind == kind)
  }

  pub fn phase_kinds(&self) -> Vec<PhaseKind> {
    self.phases.iter().map(|p| p.kind).collect()
  }

  /// Whether phases appear in execution order, each at most once, with every
  /// mandatory phase present.
  pub fn has_canonical_phases(&self) -> bool {
    let kinds = self.phase_kinds();
    let ordered = kinds.windows(2).all(|pair| pair[0] < pair[1]);
    ordered
      && PhaseKind::ALL
        .iter()
        .all(|kind| kind.is_optional() || kinds.contains(kind))
  }

  /// Patches in application order.
  pub fn patches(&self) -> &[PatchDescriptor] {
    self
      .phases
      .iter()
      .find_map(|p| match &p.action {
        PhaseAction::Patch(patches) => Some(patches.as_slice()),
        _ => None,
      })
      .unwrap_or(&[])
  }

  /// Identity computed from this plan's current content.
  ///
  /// Origins are not part of the identity: the same digest fetched from a
  /// mirror is the same input.
  pub fn recompute_id(&self) -> Result<PlanId, HashError> {
    compute_identity(
      &self.package,
      &self.version,
      &self.source,
      self.patches(),
      &self.options,
      &self.phases,
      &self.dependencies,
    )
  }

  /// Every plan reachable from this one, dependencies before dependents,
  /// each identity once.
  pub fn closure(self: &Arc<Self>) -> Vec<Arc<BuildPlan>> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    fn walk(plan: &Arc<BuildPlan>, out: &mut Vec<Arc<BuildPlan>>, seen: &mut std::collections::HashSet<PlanId>) {
      if !seen.insert(plan.id.clone()) {
        return;
      }
      for dep in plan.dependencies.values() {
        walk(dep, out, seen);
      }
      out.push(plan.clone());
    }
    walk(self, &mut out, &mut seen);
    out
  }
}

pub(crate) fn compute_identity(
  package: &str,
  version: &str,
  source: &SourceDescriptor,
  patches: &[PatchDescriptor],
  options: &BTreeMap<String, OptionValue>,
  phases: &[Phase],
  dependencies: &BTreeMap<String, Arc<BuildPlan>>,
) -> Result<PlanId, HashError> {
  let sources = source_entries(source, "");
  let input = IdentityInput {
    scheme: IDENTITY_SCHEME,
    package,
    version,
    sources,
    patches: patches.iter().map(|p| (p.sequence, p.digest())).collect(),
    options,
    tools: phases
      .iter()
      .filter_map(|p| match &p.action {
        PhaseAction::Tool(spec) => Some((p.kind, spec)),
        _ => None,
      })
      .collect(),
    dependencies: dependencies.iter().map(|(k, v)| (k.as_str(), &v.id)).collect(),
  };
  Ok(PlanId(input.compute_hash()?))
}

fn source_entries(source: &SourceDescriptor, prefix: &str) -> Vec<(String, ContentHash, Unpack)> {
  let mut out = vec![(prefix.to_string(), source.sha256.clone(), source.unpack)];
  for (path, sub) in &source.submodules {
    let nested = if prefix.is_empty() {
      path.clone()
    } else {
      format!("{}/{}", prefix, path)
    };
    out.extend(source_entries(sub, &nested));
  }
  out
}
