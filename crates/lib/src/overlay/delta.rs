//! Partial definitions and their merge rules.
//!
//! Every field of a delta names its own merge rule:
//!
//! | field          | rule                                                   |
//! |----------------|--------------------------------------------------------|
//! | `version`      | replace                                                |
//! | `source`       | recurse ([`SourceDelta`])                              |
//! | `patches`      | list edit: replace, append or prepend                  |
//! | `options`      | map edit: set keys, remove keys, others kept           |
//! | `dependencies` | set edit: optional replacement, then add and remove    |
//! | `recipe`       | recurse ([`RecipeDelta`])                              |
//!
//! Unspecified fields keep the previous value.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::{OptionValue, PackageDefinition, PatchDescriptor, Recipe, SourceDescriptor, ToolCommand, Unpack};
use crate::util::hash::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
  #[error("cannot update sub-module '{0}': it does not exist")]
  MissingSubmodule(String),
}

/// `merge(old, delta)`: a new value with `delta` applied on top of `self`.
pub trait Merge: Sized {
  type Delta;

  fn merge(&self, delta: &Self::Delta) -> Result<Self, MergeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListEdit<T> {
  Replace(Vec<T>),
  Append(Vec<T>),
  Prepend(Vec<T>),
}

impl<T: Clone> ListEdit<T> {
  pub fn apply(&self, old: &[T]) -> Vec<T> {
    match self {
      ListEdit::Replace(items) => items.clone(),
      ListEdit::Append(items) => old.iter().chain(items).cloned().collect(),
      ListEdit::Prepend(items) => items.iter().chain(old).cloned().collect(),
    }
  }
}

/// Removes `remove`, then inserts `set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "V: Deserialize<'de>"))]
pub struct MapEdit<V> {
  pub set: BTreeMap<String, V>,
  pub remove: BTreeSet<String>,
}

impl<V> Default for MapEdit<V> {
  fn default() -> Self {
    Self {
      set: BTreeMap::new(),
      remove: BTreeSet::new(),
    }
  }
}

impl<V: Clone> MapEdit<V> {
  pub fn set(mut self, key: &str, value: V) -> Self {
    self.set.insert(key.to_string(), value);
    self
  }

  pub fn remove(mut self, key: &str) -> Self {
    self.remove.insert(key.to_string());
    self
  }

  pub fn apply(&self, old: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    let mut out = old.clone();
    for key in &self.remove {
      out.remove(key);
    }
    for (key, value) in &self.set {
      out.insert(key.clone(), value.clone());
    }
    out
  }
}

/// Optional replacement followed by additions and removals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetEdit {
  pub replace: Option<BTreeSet<String>>,
  pub add: BTreeSet<String>,
  pub remove: BTreeSet<String>,
}

impl SetEdit {
  pub fn add(mut self, name: &str) -> Self {
    self.add.insert(name.to_string());
    self
  }

  pub fn remove(mut self, name: &str) -> Self {
    self.remove.insert(name.to_string());
    self
  }

  pub fn apply(&self, old: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = self.replace.clone().unwrap_or_else(|| old.clone());
    out.extend(self.add.iter().cloned());
    for name in &self.remove {
      out.remove(name);
    }
    out
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmoduleEdit {
  Set(SourceDescriptor),
  Update(SourceDelta),
  Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceDelta {
  pub origin: Option<String>,
  pub sha256: Option<ContentHash>,
  pub unpack: Option<Unpack>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub submodules: BTreeMap<String, SubmoduleEdit>,
}

impl Merge for SourceDescriptor {
  type Delta = SourceDelta;

  fn merge(&self, delta: &SourceDelta) -> Result<Self, MergeError> {
    let mut submodules = self.submodules.clone();
    for (path, edit) in &delta.submodules {
      match edit {
        SubmoduleEdit::Set(source) => {
          submodules.insert(path.clone(), source.clone());
        }
        SubmoduleEdit::Update(nested) => {
          let old = submodules
            .get(path)
            .ok_or_else(|| MergeError::MissingSubmodule(path.clone()))?;
          let merged = old.merge(nested)?;
          submodules.insert(path.clone(), merged);
        }
        SubmoduleEdit::Remove => {
          submodules.remove(path);
        }
      }
    }

    Ok(SourceDescriptor {
      origin: delta.origin.clone().unwrap_or_else(|| self.origin.clone()),
      sha256: delta.sha256.clone().unwrap_or_else(|| self.sha256.clone()),
      unpack: delta.unpack.unwrap_or(self.unpack),
      submodules,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarmUpEdit {
  Set(ToolCommand),
  Clear,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipeDelta {
  pub warm_up: Option<WarmUpEdit>,
  pub build: Option<ToolCommand>,
  pub install: Option<ToolCommand>,
}

impl Merge for Recipe {
  type Delta = RecipeDelta;

  fn merge(&self, delta: &RecipeDelta) -> Result<Self, MergeError> {
    let warm_up = match &delta.warm_up {
      None => self.warm_up.clone(),
      Some(WarmUpEdit::Set(cmd)) => Some(cmd.clone()),
      Some(WarmUpEdit::Clear) => None,
    };
    Ok(Recipe {
      warm_up,
      build: delta.build.clone().unwrap_or_else(|| self.build.clone()),
      install: delta.install.clone().unwrap_or_else(|| self.install.clone()),
    })
  }
}

/// A partial [`PackageDefinition`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageDelta {
  pub version: Option<String>,
  pub source: Option<SourceDelta>,
  pub patches: Option<ListEdit<PatchDescriptor>>,
  pub options: Option<MapEdit<OptionValue>>,
  pub dependencies: Option<SetEdit>,
  pub recipe: Option<RecipeDelta>,
}

impl PackageDelta {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn version(mut self, version: &str) -> Self {
    self.version = Some(version.to_string());
    self
  }

  pub fn source(mut self, delta: SourceDelta) -> Self {
    self.source = Some(delta);
    self
  }

  pub fn patches(mut self, edit: ListEdit<PatchDescriptor>) -> Self {
    self.patches = Some(edit);
    self
  }

  pub fn set_option(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
    let edit = self.options.take().unwrap_or_default();
    self.options = Some(edit.set(key, value.into()));
    self
  }

  pub fn remove_option(mut self, key: &str) -> Self {
    let edit = self.options.take().unwrap_or_default();
    self.options = Some(edit.remove(key));
    self
  }

  pub fn add_dependency(mut self, name: &str) -> Self {
    let edit = self.dependencies.take().unwrap_or_default();
    self.dependencies = Some(edit.add(name));
    self
  }

  pub fn remove_dependency(mut self, name: &str) -> Self {
    let edit = self.dependencies.take().unwrap_or_default();
    self.dependencies = Some(edit.remove(name));
    self
  }

  pub fn recipe(mut self, delta: RecipeDelta) -> Self {
    self.recipe = Some(delta);
    self
  }
}

impl Merge for PackageDefinition {
  type Delta = PackageDelta;

  fn merge(&self, delta: &PackageDelta) -> Result<Self, MergeError> {
    let source = match &delta.source {
      Some(d) => self.source.merge(d)?,
      None => self.source.clone(),
    };
    let recipe = match &delta.recipe {
      Some(d) => self.recipe.merge(d)?,
      None => self.recipe.clone(),
    };

    Ok(PackageDefinition {
      name: self.name.clone(),
      version: delta.version.clone().unwrap_or_else(|| self.version.clone()),
      source,
      patches: delta
        .patches
        .as_ref()
        .map(|e| e.apply(&self.patches))
        .unwrap_or_else(|| self.patches.clone()),
      options: delta
        .options
        .as_ref()
        .map(|e| e.apply(&self.options))
        .unwrap_or_else(|| self.options.clone()),
      dependencies: delta
        .dependencies
        .as_ref()
        .map(|e| e.apply(&self.dependencies))
        .unwrap_or_else(|| self.dependencies.clone()),
      recipe,
    })
  }
}
