//! Override layers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use super::OverlayError;
use super::delta::{Merge, PackageDelta};
use crate::package::{PackageDefinition, PackageGraph};

/// A pure function from one package graph to the next.
///
/// Layers never mutate their input; they return a new graph in which some
/// subset of definitions has been replaced.
pub trait OverrideLayer: Send + Sync {
  fn name(&self) -> &str;

  fn apply(&self, graph: &PackageGraph) -> Result<PackageGraph, OverlayError>;
}

/// Adds whole definitions, then merges deltas into existing ones.
#[derive(Debug, Clone, Default)]
pub struct DeltaLayer {
  name: String,
  add: Vec<PackageDefinition>,
  overrides: BTreeMap<String, PackageDelta>,
}

impl DeltaLayer {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Default::default()
    }
  }

  /// Add a definition, replacing any existing one of the same name.
  pub fn add(mut self, def: PackageDefinition) -> Self {
    self.add.push(def);
    self
  }

  /// Merge `delta` into the named package. A second call for the same
  /// package replaces the first.
  pub fn override_package(mut self, name: &str, delta: PackageDelta) -> Self {
    self.overrides.insert(name.to_string(), delta);
    self
  }
}

impl OverrideLayer for DeltaLayer {
  fn name(&self) -> &str {
    &self.name
  }

  fn apply(&self, graph: &PackageGraph) -> Result<PackageGraph, OverlayError> {
    let mut next = graph.clone();

    for def in &self.add {
      trace!(layer = %self.name, package = %def.name, "adding definition");
      next = next.with(def.clone());
    }

    for (name, delta) in &self.overrides {
      let old = next.get(name).ok_or_else(|| OverlayError::UnknownReference {
        layer: Some(self.name.clone()),
        referrer: None,
        reference: name.clone(),
      })?;

      let merged = old.merge(delta).map_err(|source| OverlayError::Merge {
        layer: self.name.clone(),
        package: name.clone(),
        source,
      })?;

      if let Some(missing) = merged
        .dependencies
        .difference(&old.dependencies)
        .find(|dep| !next.contains(dep))
      {
        return Err(OverlayError::UnknownReference {
          layer: Some(self.name.clone()),
          referrer: Some(name.clone()),
          reference: missing.clone(),
        });
      }

      trace!(layer = %self.name, package = %name, "merged delta");
      next = next.with(merged);
    }

    Ok(next)
  }
}

type LayerFn = dyn Fn(&PackageGraph) -> Result<PackageGraph, OverlayError> + Send + Sync;

/// A layer backed by an arbitrary pure function.
pub struct FnLayer {
  name: String,
  f: Box<LayerFn>,
}

impl FnLayer {
  pub fn new<F>(name: &str, f: F) -> Self
  where
    F: Fn(&PackageGraph) -> Result<PackageGraph, OverlayError> + Send + Sync + 'static,
  {
    Self {
      name: name.to_string(),
      f: Box::new(f),
    }
  }
}

impl std::fmt::Debug for FnLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FnLayer").field("name", &self.name).finish_non_exhaustive()
  }
}

impl OverrideLayer for FnLayer {
  fn name(&self) -> &str {
    &self.name
  }

  fn apply(&self, graph: &PackageGraph) -> Result<PackageGraph, OverlayError> {
    (self.f)(graph)
  }
}

/// `first` then `second`, as a single layer.
pub struct Sequence {
  name: String,
  first: Arc<dyn OverrideLayer>,
  second: Arc<dyn OverrideLayer>,
}

impl Sequence {
  pub fn new(first: Arc<dyn OverrideLayer>, second: Arc<dyn OverrideLayer>) -> Self {
    Self {
      name: format!("{}+{}", first.name(), second.name()),
      first,
      second,
    }
  }

  /// Fold a list of layers into one. `None` for an empty list.
  pub fn of(layers: &[Arc<dyn OverrideLayer>]) -> Option<Arc<dyn OverrideLayer>> {
    let mut iter = layers.iter().cloned();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, next| Arc::new(Sequence::new(acc, next)) as Arc<dyn OverrideLayer>))
  }
}

impl OverrideLayer for Sequence {
  fn name(&self) -> &str {
    &self.name
  }

  fn apply(&self, graph: &PackageGraph) -> Result<PackageGraph, OverlayError> {
    let intermediate = self.first.apply(graph)?;
    self.second.apply(&intermediate)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::overlay::delta::{ListEdit, MergeError, SourceDelta, SubmoduleEdit};
  use crate::package::{OptionValue, PatchDescriptor};
  use crate::util::testutil::simple_package;

  fn base() -> PackageGraph {
    PackageGraph::from_definitions([simple_package("a"), simple_package("b")]).unwrap()
  }

  #[test]
  fn delta_layer_replaces_only_targeted_package() {
    let layer = DeltaLayer::new("bump").override_package("a", PackageDelta::new().version("2.0"));
    let before = base();
    let after = layer.apply(&before).unwrap();

    assert_eq!(after.get("a").unwrap().version, "2.0");
    assert_eq!(before.get("a").unwrap().version, "1.0");
    assert!(PackageGraph::shares_definition(&before, &after, "b"));
  }

  #[test]
  fn override_of_missing_package_is_unknown_reference() {
    let layer = DeltaLayer::new("l").override_package("ghost", PackageDelta::new().version("1"));
    let err = layer.apply(&base()).unwrap_err();
    assert!(matches!(
      err,
      OverlayError::UnknownReference { ref reference, referrer: None, .. } if reference == "ghost"
    ));
  }

  #[test]
  fn added_dependency_must_exist() {
    let layer = DeltaLayer::new("l").override_package("a", PackageDelta::new().add_dependency("zlib"));
    let err = layer.apply(&base()).unwrap_err();
    match err {
      OverlayError::UnknownReference {
        layer,
        referrer,
        reference,
      } => {
        assert_eq!(layer.as_deref(), Some("l"));
        assert_eq!(referrer.as_deref(), Some("a"));
        assert_eq!(reference, "zlib");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn additions_are_visible_to_overrides_in_same_layer() {
    let layer = DeltaLayer::new("l")
      .add(simple_package("zlib"))
      .override_package("a", PackageDelta::new().add_dependency("zlib"));
    let graph = layer.apply(&base()).unwrap();
    assert!(graph.get("a").unwrap().dependencies.contains("zlib"));
  }

  #[test]
  fn merge_failures_name_layer_and_package() {
    let layer = DeltaLayer::new("subs").override_package(
      "a",
      PackageDelta::new().source(SourceDelta {
        submodules: [("x".to_string(), SubmoduleEdit::Update(SourceDelta::default()))].into(),
        ..Default::default()
      }),
    );
    let err = layer.apply(&base()).unwrap_err();
    assert!(matches!(
      err,
      OverlayError::Merge { ref layer, ref package, source: MergeError::MissingSubmodule(_) }
        if layer == "subs" && package == "a"
    ));
  }

  #[test]
  fn later_layer_sees_earlier_result() {
    let first: Arc<dyn OverrideLayer> = Arc::new(DeltaLayer::new("one").override_package(
      "a",
      PackageDelta::new().patches(ListEdit::Append(vec![PatchDescriptor::new("p1", 1, "x")])),
    ));
    let second: Arc<dyn OverrideLayer> = Arc::new(DeltaLayer::new("two").override_package(
      "a",
      PackageDelta::new().patches(ListEdit::Append(vec![PatchDescriptor::new("p2", 2, "y")])),
    ));

    let seq = Sequence::new(first, second);
    let graph = seq.apply(&base()).unwrap();
    let names: Vec<_> = graph.get("a").unwrap().patches.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["p1", "p2"]);
    assert_eq!(seq.name(), "one+two");
  }

  #[test]
  fn fn_layer_runs_closure() {
    let layer = FnLayer::new("all-debug", |graph: &PackageGraph| {
      let mut next = graph.clone();
      for (_, def) in graph.iter() {
        let mut def = (**def).clone();
        def.options.insert("debug".to_string(), OptionValue::Bool(true));
        next = next.with(def);
      }
      Ok(next)
    });

    let graph = layer.apply(&base()).unwrap();
    assert!(graph.iter().all(|(_, d)| d.options["debug"] == OptionValue::Bool(true)));
  }

  #[test]
  fn sequence_of_empty_list_is_none() {
    assert!(Sequence::of(&[]).is_none());
  }
}
