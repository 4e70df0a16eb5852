//! Resolved package graphs.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::types::PackageDefinition;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("package '{0}' is defined more than once")]
  Duplicate(String),
}

/// Identifier → definition mapping.
///
/// Definitions are shared through `Arc`; every "modification" returns a new
/// graph and leaves the original untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageGraph {
  packages: BTreeMap<String, Arc<PackageDefinition>>,
}

impl PackageGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a graph where every identifier is defined exactly once.
  pub fn from_definitions(defs: impl IntoIterator<Item = PackageDefinition>) -> Result<Self, GraphError> {
    let mut packages = BTreeMap::new();
    for def in defs {
      let name = def.name.clone();
      if packages.insert(name.clone(), Arc::new(def)).is_some() {
        return Err(GraphError::Duplicate(name));
      }
    }
    Ok(Self { packages })
  }

  pub fn get(&self, name: &str) -> Option<&Arc<PackageDefinition>> {
    self.packages.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.packages.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.packages.keys().map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<PackageDefinition>)> {
    self.packages.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize {
    self.packages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.packages.is_empty()
  }

  /// A new graph with `def` inserted, replacing any definition of the same name.
  pub fn with(&self, def: PackageDefinition) -> Self {
    self.with_shared(Arc::new(def))
  }

  pub fn with_shared(&self, def: Arc<PackageDefinition>) -> Self {
    let mut packages = self.packages.clone();
    packages.insert(def.name.clone(), def);
    Self { packages }
  }

  /// A new graph without `name`.
  pub fn without(&self, name: &str) -> Self {
    let mut packages = self.packages.clone();
    packages.remove(name);
    Self { packages }
  }

  /// Whether `a` and `b` share the same underlying definition allocation.
  pub fn shares_definition(a: &Self, b: &Self, name: &str) -> bool {
    match (a.get(name), b.get(name)) {
      (Some(x), Some(y)) => Arc::ptr_eq(x, y),
      _ => false,
    }
  }
}
