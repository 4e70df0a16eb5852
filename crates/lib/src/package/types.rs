use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::util::hash::{ContentHash, hash_bytes};

/// One buildable unit: where its source comes from, how it is patched, which
/// options it is built with, what it depends on and how its phases run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDefinition {
  pub name: String,
  pub version: String,
  pub source: SourceDescriptor,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub patches: Vec<PatchDescriptor>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub options: BTreeMap<String, OptionValue>,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub dependencies: BTreeSet<String>,
  pub recipe: Recipe,
}

impl PackageDefinition {
  pub fn new(name: &str, version: &str, source: SourceDescriptor, recipe: Recipe) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      source,
      patches: Vec::new(),
      options: BTreeMap::new(),
      dependencies: BTreeSet::new(),
      recipe,
    }
  }

  pub fn with_option(mut self, key: &str, value: OptionValue) -> Self {
    self.options.insert(key.to_string(), value);
    self
  }

  pub fn with_dependency(mut self, name: &str) -> Self {
    self.dependencies.insert(name.to_string());
    self
  }

  pub fn with_patch(mut self, patch: PatchDescriptor) -> Self {
    self.patches.push(patch);
    self
  }
}

/// How fetched bytes are turned into a source tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Unpack {
  /// Place the bytes as a single file named after the origin.
  #[default]
  File,
  Tar,
  TarGz,
}

/// Where a source comes from and the digest it must hash to.
///
/// Sub-modules are independently pinned sources mounted at a relative path
/// inside the parent tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
  pub origin: String,
  pub sha256: ContentHash,
  #[serde(default)]
  pub unpack: Unpack,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub submodules: BTreeMap<String, SourceDescriptor>,
}

impl SourceDescriptor {
  pub fn new(origin: &str, sha256: ContentHash) -> Self {
    Self {
      origin: origin.to_string(),
      sha256,
      unpack: Unpack::File,
      submodules: BTreeMap::new(),
    }
  }

  pub fn with_unpack(mut self, unpack: Unpack) -> Self {
    self.unpack = unpack;
    self
  }

  pub fn with_submodule(mut self, path: &str, source: SourceDescriptor) -> Self {
    self.submodules.insert(path.to_string(), source);
    self
  }

  /// Digests of this source and every nested sub-module, parents first,
  /// sub-modules in path order.
  pub fn all_digests(&self) -> Vec<(String, ContentHash)> {
    let mut out = vec![(String::new(), self.sha256.clone())];
    for (path, sub) in &self.submodules {
      for (nested, digest) in sub.all_digests() {
        let full = if nested.is_empty() {
          path.clone()
        } else {
          format!("{}/{}", path, nested)
        };
        out.push((full, digest));
      }
    }
    out
  }
}

/// A unified diff applied to the source tree.
///
/// `sequence` positions define the application order and must be unique
/// within a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
  pub name: String,
  pub sequence: u32,
  pub diff: String,
}

impl PatchDescriptor {
  pub fn new(name: &str, sequence: u32, diff: &str) -> Self {
    Self {
      name: name.to_string(),
      sequence,
      diff: diff.to_string(),
    }
  }

  pub fn digest(&self) -> ContentHash {
    hash_bytes(self.diff.as_bytes())
  }
}

/// Values that differ between otherwise identical evaluations.
///
/// They can be written in a package set but are rejected by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbientValue {
  CurrentTime,
  Random,
  Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<String>),
  Ambient { ambient: AmbientValue },
}

impl OptionValue {
  pub fn kind(&self) -> OptionKind {
    match self {
      OptionValue::Bool(_) => OptionKind::Bool,
      OptionValue::Int(_) => OptionKind::Int,
      OptionValue::Str(_) => OptionKind::Str,
      OptionValue::List(_) => OptionKind::List,
      OptionValue::Ambient { .. } => OptionKind::Ambient,
    }
  }

  /// Textual form handed to toolchains. `None` for ambient values.
  pub fn render(&self) -> Option<String> {
    match self {
      OptionValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
      OptionValue::Int(i) => Some(i.to_string()),
      OptionValue::Str(s) => Some(s.clone()),
      OptionValue::List(items) => Some(items.join(" ")),
      OptionValue::Ambient { .. } => None,
    }
  }
}

impl From<bool> for OptionValue {
  fn from(value: bool) -> Self {
    OptionValue::Bool(value)
  }
}

impl From<i64> for OptionValue {
  fn from(value: i64) -> Self {
    OptionValue::Int(value)
  }
}

impl From<i32> for OptionValue {
  fn from(value: i32) -> Self {
    OptionValue::Int(value.into())
  }
}

impl From<&str> for OptionValue {
  fn from(value: &str) -> Self {
    OptionValue::Str(value.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionKind {
  Bool,
  Int,
  Str,
  List,
  Ambient,
}

impl std::fmt::Display for OptionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      OptionKind::Bool => "bool",
      OptionKind::Int => "int",
      OptionKind::Str => "string",
      OptionKind::List => "list",
      OptionKind::Ambient => "ambient",
    };
    f.write_str(s)
  }
}

/// A program invocation handed to the toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
  pub program: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,
}

impl ToolCommand {
  pub fn new(program: &str) -> Self {
    Self {
      program: program.to_string(),
      args: Vec::new(),
    }
  }

  pub fn arg(mut self, arg: &str) -> Self {
    self.args.push(arg.to_string());
    self
  }

  /// Shell script run through `sh -c`.
  pub fn shell(script: &str) -> Self {
    Self::new("/bin/sh").arg("-c").arg(script)
  }
}

/// Commands for the tool phases. Warm-up is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warm_up: Option<ToolCommand>,
  pub build: ToolCommand,
  pub install: ToolCommand,
}

impl Recipe {
  pub fn new(build: ToolCommand, install: ToolCommand) -> Self {
    Self {
      warm_up: None,
      build,
      install,
    }
  }

  pub fn with_warm_up(mut self, warm_up: ToolCommand) -> Self {
    self.warm_up = Some(warm_up);
    self
  }
}
