//! Build execution.
//!
//! The [`Executor`] turns a [`BuildPlan`] into an [`Artifact`]:
//!
//! 1. A plan whose identity is already in the store is returned as is.
//! 2. Concurrent requests for one identity share a single build. The first
//!    caller leads; the others wait for its result. If the leader is dropped
//!    before finishing, a waiting caller takes over.
//! 3. Dependencies are built (or awaited) before the plan's fetch phase.
//! 4. Phases run in order inside a scoped workspace that is removed on every
//!    exit path. The install tree is normalized, packed deterministically and
//!    published. Nothing is published if any step fails.
//!
//! [`build_graph`] drives a whole set of plans concurrently.

mod archive;
mod graph;
mod toolchain;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, join_all};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::fetch::{FetchError, FetchVerifier, Transport};
use crate::normalize::NormalizerSet;
use crate::patch::PatchApplier;
use crate::plan::{BuildPlan, Phase, PhaseAction, PhaseKind, PlanId, Slot};
use crate::store::{Artifact, ContentStore};

pub use archive::{pack_tree, unpack_archive};
pub use graph::build_graph;
pub use toolchain::{CommandToolchain, ToolError, ToolInvocation, ToolOutcome, Toolchain};
pub use types::{
  BuildError, ExecuteConfig, GraphBuildResult, PhaseExecutionError, PhaseFailure, VerificationFailure,
};

type FlightState = Option<Result<Artifact, BuildError>>;

struct Flight {
  token: u64,
  receiver: watch::Receiver<FlightState>,
}

struct Inner {
  store: Arc<dyn ContentStore>,
  fetcher: FetchVerifier,
  toolchain: Arc<dyn Toolchain>,
  patcher: PatchApplier,
  normalizers: Arc<NormalizerSet>,
  semaphore: Semaphore,
  in_flight: Mutex<HashMap<PlanId, Flight>>,
  next_token: AtomicU64,
  builds_run: AtomicUsize,
}

impl Inner {
  fn flights(&self) -> MutexGuard<'_, HashMap<PlanId, Flight>> {
    self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Removes a leader's in-flight entry when the leader finishes or is dropped.
struct FlightGuard {
  inner: Arc<Inner>,
  id: PlanId,
  token: u64,
}

impl Drop for FlightGuard {
  fn drop(&mut self) {
    let mut flights = self.inner.flights();
    if flights.get(&self.id).is_some_and(|f| f.token == self.token) {
      flights.remove(&self.id);
    }
  }
}

enum Role {
  Leader(watch::Sender<FlightState>, FlightGuard),
  Follower(watch::Receiver<FlightState>),
}

/// Executes build plans against a content store.
///
/// Cloning is cheap; clones share the store, the in-flight map and the
/// parallelism limit.
#[derive(Clone)]
pub struct Executor {
  inner: Arc<Inner>,
}

impl Executor {
  pub fn new(
    store: Arc<dyn ContentStore>,
    transport: Arc<dyn Transport>,
    toolchain: Arc<dyn Toolchain>,
    config: ExecuteConfig,
  ) -> Self {
    let normalizers = NormalizerSet::standard().unwrap_or_else(|e| {
      warn!(error = %e, "standard normalizers unavailable");
      NormalizerSet::new()
    });
    Self {
      inner: Arc::new(Inner {
        store,
        fetcher: FetchVerifier::new(transport),
        toolchain,
        patcher: PatchApplier::new(),
        normalizers: Arc::new(normalizers),
        semaphore: Semaphore::new(config.parallelism.max(1)),
        in_flight: Mutex::new(HashMap::new()),
        next_token: AtomicU64::new(0),
        builds_run: AtomicUsize::new(0),
      }),
    }
  }

  /// Replace the output normalizers.
  ///
  /// Only affects an executor that has not been cloned yet.
  pub fn with_normalizers(mut self, normalizers: NormalizerSet) -> Self {
    match Arc::get_mut(&mut self.inner) {
      Some(inner) => inner.normalizers = Arc::new(normalizers),
      None => warn!("executor already shared; keeping existing normalizers"),
    }
    self
  }

  pub fn store(&self) -> &Arc<dyn ContentStore> {
    &self.inner.store
  }

  /// Number of builds that actually ran phases.
  pub fn builds_run(&self) -> usize {
    self.inner.builds_run.load(Ordering::SeqCst)
  }

  /// Build `plan`, or return its stored artifact.
  ///
  /// # Errors
  ///
  /// - [`BuildError::Verification`] if the plan's identity does not match its
  ///   content, or a fetched source does not match its pinned digest
  /// - [`BuildError::DependencyFailed`] if a dependency could not be built
  /// - [`BuildError::Phase`] if a phase failed
  /// - [`BuildError::Store`] if the store could not be read or written
  pub async fn execute(&self, plan: &Arc<BuildPlan>) -> Result<Artifact, BuildError> {
    self.execute_owned(plan.clone()).await
  }

  fn execute_owned(&self, plan: Arc<BuildPlan>) -> BoxFuture<'static, Result<Artifact, BuildError>> {
    let this = self.clone();
    Box::pin(async move { this.single_flight(plan).await })
  }

  async fn single_flight(&self, plan: Arc<BuildPlan>) -> Result<Artifact, BuildError> {
    loop {
      if let Some(artifact) = self.cached(&plan).await? {
        debug!(package = %plan.package, id = %plan.id.short(), "cache hit");
        return Ok(artifact);
      }

      match self.join_flight(&plan.id) {
        Role::Leader(sender, _guard) => {
          let result = self.lead(&plan).await;
          sender.send_replace(Some(result.clone()));
          return result;
        }
        Role::Follower(mut receiver) => {
          debug!(package = %plan.package, id = %plan.id.short(), "waiting for in-flight build");
          let outcome = match receiver.wait_for(|state| state.is_some()).await {
            Ok(state) => (*state).clone(),
            Err(_) => None,
          };
          match outcome {
            Some(result) => return result,
            None => debug!(package = %plan.package, "in-flight build abandoned, retrying"),
          }
        }
      }
    }
  }

  fn join_flight(&self, id: &PlanId) -> Role {
    let mut flights = self.inner.flights();
    if let Some(flight) = flights.get(id) {
      return Role::Follower(flight.receiver.clone());
    }

    let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
    let (sender, receiver) = watch::channel(None);
    flights.insert(id.clone(), Flight { token, receiver });
    let guard = FlightGuard {
      inner: self.inner.clone(),
      id: id.clone(),
      token,
    };
    Role::Leader(sender, guard)
  }

  async fn cached(&self, plan: &BuildPlan) -> Result<Option<Artifact>, BuildError> {
    self
      .inner
      .store
      .get(&plan.id)
      .await
      .map_err(|e| BuildError::store(&plan.package, e))
  }

  async fn lead(&self, plan: &Arc<BuildPlan>) -> Result<Artifact, BuildError> {
    // another process may have published while we were joining
    if let Some(artifact) = self.cached(plan).await? {
      return Ok(artifact);
    }

    verify_identity(plan)?;

    let results = join_all(plan.dependencies.iter().map(|(name, dep)| {
      let build = self.execute_owned(dep.clone());
      async move { (name, build.await) }
    }))
    .await;
    for (name, result) in results {
      if let Err(cause) = result {
        warn!(package = %plan.package, dependency = %name, "dependency failed");
        return Err(BuildError::dependency_failed(&plan.package, name, cause));
      }
    }

    // the semaphore is never closed
    let _permit = self.inner.semaphore.acquire().await.ok();
    self.inner.builds_run.fetch_add(1, Ordering::SeqCst);
    info!(package = %plan.package, version = %plan.version, id = %plan.id.short(), "building");

    let workspace = Workspace::create(self.inner.store.scratch_dir(), plan)
      .map_err(|e| phase_error(plan, PhaseKind::Fetch, PhaseFailure::Workspace(e)))?;
    let packed = self.run_phases(plan, &workspace).await?;

    let artifact = self
      .inner
      .store
      .put(&plan.id, packed)
      .await
      .map_err(|e| BuildError::store(&plan.package, e))?;

    info!(
      package = %plan.package,
      id = %plan.id.short(),
      digest = %artifact.digest.short(),
      size = artifact.size,
      "published"
    );
    Ok(artifact)
  }

  async fn run_phases(&self, plan: &BuildPlan, ws: &Workspace) -> Result<Vec<u8>, BuildError> {
    let mut available: BTreeSet<Slot> = BTreeSet::new();
    let mut unpacked: BTreeMap<String, PathBuf> = BTreeMap::new();

    for phase in &plan.phases {
      debug!(package = %plan.package, phase = %phase.kind, "starting phase");
      self.prepare_inputs(plan, phase, ws, &mut available, &mut unpacked).await?;

      match &phase.action {
        PhaseAction::Fetch(source) => {
          let verified = match self.inner.fetcher.fetch(source).await {
            Ok(verified) => verified,
            Err(FetchError::HashMismatch {
              origin,
              expected,
              actual,
            }) => {
              return Err(BuildError::Verification {
                package: plan.package.clone(),
                plan: plan.id.clone(),
                failure: VerificationFailure::SourceDigest {
                  origin,
                  expected,
                  actual,
                },
              });
            }
            Err(e) => return Err(phase_error(plan, phase.kind, e.into())),
          };
          let dest = ws.src.clone();
          blocking(move || verified.materialize(&dest).map_err(PhaseFailure::from))
            .await
            .map_err(|f| phase_error(plan, phase.kind, f))?;
        }
        PhaseAction::Patch(patches) => {
          if !patches.is_empty() {
            let patcher = self.inner.patcher;
            let patches = patches.clone();
            let tree = ws.src.clone();
            blocking(move || patcher.apply(&tree, &patches).map_err(PhaseFailure::from))
              .await
              .map_err(|f| phase_error(plan, phase.kind, f))?;
          }
        }
        PhaseAction::Tool(spec) => {
          let invocation = ToolInvocation {
            package: plan.package.clone(),
            phase: phase.kind,
            spec: spec.clone(),
            source_dir: ws.src.clone(),
            out_dir: ws.out.clone(),
            cache_dir: ws.cache.clone(),
            tmp_dir: ws.tmp.clone(),
            deps_dir: ws.deps.clone(),
            dependencies: unpacked.clone(),
          };
          let outcome = self
            .inner
            .toolchain
            .invoke(&invocation)
            .await
            .map_err(|e| phase_error(plan, phase.kind, e.into()))?;
          if !outcome.success {
            return Err(phase_error(
              plan,
              phase.kind,
              PhaseFailure::ToolFailed {
                program: spec.command.program.clone(),
                code: outcome.exit_code,
                stderr: outcome.stderr,
              },
            ));
          }
          debug!(package = %plan.package, phase = %phase.kind, produced = outcome.produced.len(), "tool phase finished");
        }
      }

      available.extend(phase.outputs.iter().cloned());
    }

    let normalizers = self.inner.normalizers.clone();
    let out = ws.out.clone();
    blocking(move || {
      normalizers.normalize_tree(&out)?;
      pack_tree(&out).map_err(PhaseFailure::Workspace)
    })
    .await
    .map_err(|f| phase_error(plan, PhaseKind::Install, f))
  }

  /// Make every input of `phase` available, unpacking dependency artifacts
  /// the first time a phase asks for them.
  async fn prepare_inputs(
    &self,
    plan: &BuildPlan,
    phase: &Phase,
    ws: &Workspace,
    available: &mut BTreeSet<Slot>,
    unpacked: &mut BTreeMap<String, PathBuf>,
  ) -> Result<(), BuildError> {
    for input in &phase.inputs {
      if available.contains(input) {
        continue;
      }
      let Slot::Dependency(name) = input else {
        return Err(phase_error(plan, phase.kind, PhaseFailure::MissingInput(input.clone())));
      };
      let Some(dep) = plan.dependencies.get(name) else {
        return Err(phase_error(plan, phase.kind, PhaseFailure::MissingInput(input.clone())));
      };

      let bytes = self
        .inner
        .store
        .read(&dep.id)
        .await
        .map_err(|e| BuildError::store(&plan.package, e))?
        .ok_or_else(|| phase_error(plan, phase.kind, PhaseFailure::MissingInput(input.clone())))?;

      let dest = ws.deps.join(name);
      let target = dest.clone();
      blocking(move || unpack_archive(&bytes, &target).map_err(PhaseFailure::Workspace))
        .await
        .map_err(|f| phase_error(plan, phase.kind, f))?;

      debug!(package = %plan.package, dependency = %name, "dependency unpacked");
      unpacked.insert(name.clone(), dest);
      available.insert(input.clone());
    }
    Ok(())
  }
}

impl std::fmt::Debug for Executor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Executor")
      .field("builds_run", &self.builds_run())
      .finish_non_exhaustive()
  }
}

fn verify_identity(plan: &BuildPlan) -> Result<(), BuildError> {
  let failure = if !plan.has_canonical_phases() {
    VerificationFailure::PhaseLayout(plan.phase_kinds())
  } else {
    match plan.recompute_id() {
      Ok(actual) if actual == plan.id => return Ok(()),
      Ok(actual) => VerificationFailure::PlanIdentity {
        declared: plan.id.clone(),
        actual,
      },
      Err(e) => VerificationFailure::Identity(e.to_string()),
    }
  };
  warn!(package = %plan.package, failure = %failure, "plan verification failed");
  Err(BuildError::Verification {
    package: plan.package.clone(),
    plan: plan.id.clone(),
    failure,
  })
}

fn phase_error(plan: &BuildPlan, phase: PhaseKind, cause: PhaseFailure) -> BuildError {
  warn!(package = %plan.package, phase = %phase, error = %cause, "phase failed");
  BuildError::Phase(PhaseExecutionError {
    plan: plan.id.clone(),
    package: plan.package.clone(),
    phase,
    cause: Arc::new(cause),
  })
}

async fn blocking<T, F>(f: F) -> Result<T, PhaseFailure>
where
  F: FnOnce() -> Result<T, PhaseFailure> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| PhaseFailure::Workspace(std::io::Error::other(e)))?
}

/// Scratch directories for one build. Removed when dropped.
struct Workspace {
  _dir: tempfile::TempDir,
  src: PathBuf,
  cache: PathBuf,
  out: PathBuf,
  deps: PathBuf,
  tmp: PathBuf,
}

impl Workspace {
  fn create(scratch: Option<PathBuf>, plan: &BuildPlan) -> std::io::Result<Self> {
    let prefix = format!("build-{}-", plan.id.short());
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let dir = match scratch {
      Some(scratch) => {
        std::fs::create_dir_all(&scratch)?;
        builder.tempdir_in(scratch)?
      }
      None => builder.tempdir()?,
    };

    let root = dir.path();
    let ws = Workspace {
      src: root.join("src"),
      cache: root.join("cache"),
      out: root.join("out"),
      deps: root.join("deps"),
      tmp: root.join("tmp"),
      _dir: dir,
    };
    for path in [&ws.src, &ws.cache, &ws.out, &ws.deps, &ws.tmp] {
      std::fs::create_dir_all(path)?;
    }
    Ok(ws)
  }
}
