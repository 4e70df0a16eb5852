//! Overlay composition.
//!
//! [`compose`] folds an ordered list of [`OverrideLayer`]s over a base
//! [`PackageGraph`]. Each layer receives the graph produced by every layer
//! before it, so composition is associative but not commutative.
//!
//! When two layers touch the same nested field, the later layer's edit is
//! applied to the earlier layer's result (last writer wins); no conflict is
//! raised.
//!
//! # Submodules
//!
//! - [`delta`] - Partial definitions and per-field merge rules
//! - [`layer`] - Layer trait and the provided layer kinds
//! - [`validate`] - Reference and cycle checks on the composed graph

pub mod delta;
pub mod layer;
pub mod validate;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::package::PackageGraph;

pub use delta::{
  ListEdit, MapEdit, Merge, MergeError, PackageDelta, RecipeDelta, SetEdit, SourceDelta, SubmoduleEdit, WarmUpEdit,
};
pub use layer::{DeltaLayer, FnLayer, OverrideLayer, Sequence};
pub use validate::validate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
  /// The composed dependency relation contains a cycle.
  #[error("dependency cycle: {}", .cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },

  /// A package or dependency identifier does not exist in the graph.
  #[error("unknown package '{reference}'{}", describe_origin(.referrer, .layer))]
  UnknownReference {
    layer: Option<String>,
    referrer: Option<String>,
    reference: String,
  },

  /// A delta could not be merged into its target.
  #[error("layer '{layer}' cannot override '{package}': {source}")]
  Merge {
    layer: String,
    package: String,
    #[source]
    source: MergeError,
  },

  /// A custom layer rejected the graph.
  #[error("layer '{layer}' failed: {message}")]
  Layer { layer: String, message: String },
}

fn describe_origin(referrer: &Option<String>, layer: &Option<String>) -> String {
  let mut out = String::new();
  if let Some(referrer) = referrer {
    out.push_str(&format!(" referenced by '{}'", referrer));
  }
  if let Some(layer) = layer {
    out.push_str(&format!(" in layer '{}'", layer));
  }
  out
}

/// Apply `layers` in order to `base` and validate the result.
///
/// # Errors
///
/// - [`OverlayError::UnknownReference`] if a layer targets or adds a
///   dependency on an identifier absent from the graph, or the final graph
///   contains a dangling dependency
/// - [`OverlayError::Cycle`] if the final graph has a dependency cycle
/// - any error returned by a layer
pub fn compose(base: &PackageGraph, layers: &[Arc<dyn OverrideLayer>]) -> Result<PackageGraph, OverlayError> {
  let mut current = base.clone();

  for layer in layers {
    let next = layer.apply(&current)?;
    debug!(
      layer = layer.name(),
      changed = ?changed_packages(&current, &next),
      "applied layer"
    );
    current = next;
  }

  validate(&current)?;

  info!(
    packages = current.len(),
    layers = layers.len(),
    "composed package graph"
  );

  Ok(current)
}

/// Identifiers whose definition differs between `before` and `after`.
pub fn changed_packages(before: &PackageGraph, after: &PackageGraph) -> Vec<String> {
  let mut changed: Vec<String> = after
    .iter()
    .filter(|(name, def)| before.get(name).is_none_or(|old| !Arc::ptr_eq(old, def) && old != *def))
    .map(|(name, _)| name.to_string())
    .collect();
  changed.extend(
    before
      .names()
      .filter(|name| !after.contains(name))
      .map(str::to_string),
  );
  changed.sort();
  changed
}
