//! Errors, configuration and results for build execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::toolchain::ToolError;
use crate::fetch::FetchError;
use crate::normalize::NormalizeError;
use crate::patch::PatchError;
use crate::plan::{PhaseKind, PlanId, Slot};
use crate::store::{Artifact, StoreError};
use crate::util::hash::ContentHash;

/// What went wrong inside a phase.
#[derive(Debug, Error)]
pub enum PhaseFailure {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Patch(#[from] PatchError),

  #[error(transparent)]
  Tool(#[from] ToolError),

  #[error(transparent)]
  Normalize(#[from] NormalizeError),

  #[error("{program} exited with {}", describe_exit(.code))]
  ToolFailed {
    program: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("input {0:?} is not available")]
  MissingInput(Slot),

  #[error("workspace error: {0}")]
  Workspace(#[source] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("status {}", code),
    None => "a signal".to_string(),
  }
}

/// A phase of a plan failed.
#[derive(Debug, Clone, Error)]
#[error("{package} ({}) failed in {phase} phase: {cause}", .plan.short())]
pub struct PhaseExecutionError {
  pub plan: PlanId,
  pub package: String,
  pub phase: PhaseKind,
  pub cause: Arc<PhaseFailure>,
}

/// A declared digest did not match the recomputed one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
  #[error("plan identity {declared} does not match its content ({actual})")]
  PlanIdentity { declared: PlanId, actual: PlanId },

  #[error("source {origin} hashed to {actual}, expected {expected}")]
  SourceDigest {
    origin: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("plan identity could not be recomputed: {0}")]
  Identity(String),

  #[error("phases {0:?} are out of order or incomplete")]
  PhaseLayout(Vec<PhaseKind>),
}

/// Why a plan did not produce an artifact.
///
/// Cheap to clone so that every caller waiting on the same plan receives
/// the same failure.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
  #[error(transparent)]
  Phase(#[from] PhaseExecutionError),

  #[error("verification failed for {package}: {failure}")]
  Verification {
    package: String,
    plan: PlanId,
    failure: VerificationFailure,
  },

  /// A dependency of `package` failed. `root` is the original failure, never
  /// another `DependencyFailed`.
  #[error("{package} not built: dependency {dependency} failed: {root}")]
  DependencyFailed {
    package: String,
    dependency: String,
    root: Box<BuildError>,
  },

  #[error("store error while building {package}: {source}")]
  Store {
    package: String,
    #[source]
    source: Arc<StoreError>,
  },
}

impl BuildError {
  /// Wrap `cause`, the failure of `dependency`, as the failure of `package`.
  pub fn dependency_failed(package: &str, dependency: &str, cause: BuildError) -> Self {
    let root = match cause {
      BuildError::DependencyFailed { root, .. } => root,
      other => Box::new(other),
    };
    BuildError::DependencyFailed {
      package: package.to_string(),
      dependency: dependency.to_string(),
      root,
    }
  }

  pub(crate) fn store(package: &str, source: StoreError) -> Self {
    BuildError::Store {
      package: package.to_string(),
      source: Arc::new(source),
    }
  }

  /// The failure that started the chain.
  pub fn root_cause(&self) -> &BuildError {
    match self {
      BuildError::DependencyFailed { root, .. } => root,
      other => other,
    }
  }

  /// The package this error is reported for.
  pub fn package(&self) -> &str {
    match self {
      BuildError::Phase(e) => &e.package,
      BuildError::Verification { package, .. }
      | BuildError::DependencyFailed { package, .. }
      | BuildError::Store { package, .. } => package,
    }
  }
}

/// Configuration for build execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of plans doing phase work at the same time.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
    }
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Outcome of building a set of plans, keyed by package name.
#[derive(Debug, Default)]
pub struct GraphBuildResult {
  pub built: BTreeMap<String, Artifact>,
  /// Plans whose own phases, verification or store access failed.
  pub failed: BTreeMap<String, BuildError>,
  /// Plans not attempted because a dependency failed. Each value is a
  /// [`BuildError::DependencyFailed`].
  pub skipped: BTreeMap<String, BuildError>,
}

impl GraphBuildResult {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn total(&self) -> usize {
    self.built.len() + self.failed.len() + self.skipped.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_bytes;

  fn phase_error(package: &str) -> BuildError {
    BuildError::Phase(PhaseExecutionError {
      plan: PlanId(hash_bytes(package.as_bytes())),
      package: package.to_string(),
      phase: PhaseKind::Build,
      cause: Arc::new(PhaseFailure::ToolFailed {
        program: "make".to_string(),
        code: Some(2),
        stderr: String::new(),
      }),
    })
  }

  #[test]
  fn dependency_failure_keeps_original_root() {
    let direct = BuildError::dependency_failed("b", "a", phase_error("a"));
    let transitive = BuildError::dependency_failed("c", "b", direct);

    match &transitive {
      BuildError::DependencyFailed { package, dependency, root } => {
        assert_eq!(package, "c");
        assert_eq!(dependency, "b");
        assert_eq!(root.package(), "a");
      }
      other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(transitive.root_cause(), BuildError::Phase(_)));
  }

  #[test]
  fn phase_error_message_names_package_and_phase() {
    let msg = phase_error("zlib").to_string();
    assert!(msg.starts_with("zlib ("), "{msg}");
    assert!(msg.contains("failed in build phase: make exited with status 2"), "{msg}");
  }

  #[test]
  fn empty_result_is_success() {
    let result = GraphBuildResult::default();
    assert!(result.is_success());
    assert_eq!(result.total(), 0);
  }
}
