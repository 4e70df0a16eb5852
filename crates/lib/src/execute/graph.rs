//! Building a set of plans and their dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::types::{BuildError, GraphBuildResult, PhaseExecutionError, PhaseFailure};
use super::Executor;
use crate::plan::{BuildPlan, PhaseKind, PlanId};
use crate::store::Artifact;

/// Plans and their dependency edges, dependencies pointing at dependents.
struct PlanDag {
  graph: DiGraph<Arc<BuildPlan>, ()>,
}

impl PlanDag {
  fn from_plans<'a>(plans: impl IntoIterator<Item = &'a Arc<BuildPlan>>) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<PlanId, NodeIndex> = HashMap::new();

    for root in plans {
      for plan in root.closure() {
        if nodes.contains_key(&plan.id) {
          continue;
        }
        let idx = graph.add_node(plan.clone());
        nodes.insert(plan.id.clone(), idx);
        // closure() yields dependencies first
        for dep in plan.dependencies.values() {
          if let Some(&dep_idx) = nodes.get(&dep.id) {
            graph.add_edge(dep_idx, idx, ());
          }
        }
      }
    }

    Self { graph }
  }

  /// Every plan, dependencies before their dependents.
  fn ordered(&self) -> Vec<Arc<BuildPlan>> {
    let order = toposort(&self.graph, None).unwrap_or_else(|cycle| {
      // acyclic by construction
      error!(node = ?cycle.node_id(), "plan graph has a cycle");
      self.graph.node_indices().collect()
    });
    order.into_iter().map(|idx| self.graph[idx].clone()).collect()
  }
}

/// Build `plans` and everything they depend on.
///
/// Every plan is started at once; the executor makes each one wait for its
/// own dependencies only, so a slow package never holds back packages that
/// do not depend on it. At most the executor's parallelism run phases at a
/// time. A failed plan makes every plan depending on it fail with
/// [`BuildError::DependencyFailed`] naming the original failure; plans that
/// do not depend on it are still built.
pub async fn build_graph<'a>(
  executor: &Executor,
  plans: impl IntoIterator<Item = &'a Arc<BuildPlan>>,
) -> GraphBuildResult {
  let dag = PlanDag::from_plans(plans);
  info!(plans = dag.graph.node_count(), "building plan graph");

  let mut result = GraphBuildResult::default();
  let mut join_set = JoinSet::new();
  let mut pending: BTreeMap<PlanId, Arc<BuildPlan>> = BTreeMap::new();

  for plan in dag.ordered() {
    let executor = executor.clone();
    let task_plan = plan.clone();
    join_set.spawn(async move {
      let outcome = executor.execute(&task_plan).await;
      (task_plan, outcome)
    });
    pending.insert(plan.id.clone(), plan);
  }

  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok((plan, outcome)) => {
        pending.remove(&plan.id);
        record(&mut result, &plan, outcome);
      }
      Err(e) => error!(error = %e, "build task panicked"),
    }
  }

  // tasks that panicked never reported back
  for plan in pending.into_values() {
    let failure = BuildError::Phase(PhaseExecutionError {
      plan: plan.id.clone(),
      package: plan.package.clone(),
      phase: PhaseKind::Build,
      cause: Arc::new(PhaseFailure::Workspace(std::io::Error::other("build task panicked"))),
    });
    record(&mut result, &plan, Err(failure));
  }

  info!(
    built = result.built.len(),
    failed = result.failed.len(),
    skipped = result.skipped.len(),
    "plan graph finished"
  );
  result
}

fn record(result: &mut GraphBuildResult, plan: &BuildPlan, outcome: Result<Artifact, BuildError>) {
  match outcome {
    Ok(artifact) => {
      result.built.insert(plan.package.clone(), artifact);
    }
    Err(err) => {
      if matches!(err, BuildError::DependencyFailed { .. }) {
        result.skipped.insert(plan.package.clone(), err);
      } else {
        result.failed.insert(plan.package.clone(), err);
      }
    }
  }
}
