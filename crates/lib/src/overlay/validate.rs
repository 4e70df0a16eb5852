//! Whole-graph consistency checks run after composition.

use std::collections::HashMap;

use super::OverlayError;
use crate::package::PackageGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
  Visiting,
  Visited,
}

/// Check that every dependency resolves and that the dependency relation is
/// acyclic.
///
/// Traversal is in identifier order so the reported error is deterministic.
pub fn validate(graph: &PackageGraph) -> Result<(), OverlayError> {
  for (name, def) in graph.iter() {
    if let Some(missing) = def.dependencies.iter().find(|dep| !graph.contains(dep)) {
      return Err(OverlayError::UnknownReference {
        layer: None,
        referrer: Some(name.to_string()),
        reference: missing.clone(),
      });
    }
  }

  let mut marks: HashMap<&str, Mark> = HashMap::new();
  let mut stack: Vec<&str> = Vec::new();

  for name in graph.names() {
    if !marks.contains_key(name) {
      visit(graph, name, &mut marks, &mut stack)?;
    }
  }

  Ok(())
}

fn visit<'g>(
  graph: &'g PackageGraph,
  name: &'g str,
  marks: &mut HashMap<&'g str, Mark>,
  stack: &mut Vec<&'g str>,
) -> Result<(), OverlayError> {
  match marks.get(name) {
    Some(Mark::Visited) => return Ok(()),
    Some(Mark::Visiting) => {
      let start = stack.iter().position(|n| *n == name).unwrap_or(0);
      let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
      cycle.push(name.to_string());
      return Err(OverlayError::Cycle { cycle });
    }
    None => {}
  }

  marks.insert(name, Mark::Visiting);
  stack.push(name);

  if let Some(def) = graph.get(name) {
    for dep in &def.dependencies {
      visit(graph, dep.as_str(), marks, stack)?;
    }
  }

  stack.pop();
  marks.insert(name, Mark::Visited);
  Ok(())
}
