//! Package-set files.
//!
//! A package set is a JSON document describing the base packages, the
//! override layers to apply on top of them and, optionally, the schema of
//! recognized build options:
//!
//! ```json
//! {
//!   "packages": [
//!     {
//!       "name": "zlib",
//!       "version": "1.3",
//!       "source": { "origin": "sources/zlib-1.3.tar.gz", "sha256": "…", "unpack": "tar-gz" },
//!       "recipe": {
//!         "build": { "program": "make" },
//!         "install": { "program": "make", "args": ["install"] }
//!       }
//!     }
//!   ],
//!   "layers": [
//!     { "name": "hardening", "override": { "zlib": { "options": { "set": { "pic": true } } } } }
//!   ],
//!   "options": {
//!     "pic": { "kind": "bool", "effect": { "arg": "--enable-pic" } }
//!   }
//! }
//! ```
//!
//! Without an `options` table every key is accepted and exported to the
//! toolchain as an environment variable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::overlay::{self, DeltaLayer, OverlayError, OverrideLayer, PackageDelta};
use crate::package::{GraphError, PackageDefinition, PackageGraph};
use crate::plan::{OptionSchema, Planner};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {}: {source}", describe_path(.path))]
  Parse {
    path: Option<PathBuf>,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Overlay(#[from] OverlayError),
}

fn describe_path(path: &Option<PathBuf>) -> String {
  match path {
    Some(path) => path.display().to_string(),
    None => "package set".to_string(),
  }
}

/// One override layer as written in a package set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
  pub name: String,
  /// Whole definitions added (or replaced) by the layer.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub add: Vec<PackageDefinition>,
  /// Deltas merged into existing definitions.
  #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
  pub overrides: BTreeMap<String, PackageDelta>,
}

impl LayerSpec {
  pub fn to_layer(&self) -> DeltaLayer {
    let layer = self
      .add
      .iter()
      .cloned()
      .fold(DeltaLayer::new(&self.name), DeltaLayer::add);
    self
      .overrides
      .iter()
      .fold(layer, |layer, (name, delta)| layer.override_package(name, delta.clone()))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSet {
  #[serde(default)]
  pub packages: Vec<PackageDefinition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub layers: Vec<LayerSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options: Option<OptionSchema>,
}

impl PackageSet {
  /// Read a package set from `path`.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let set: PackageSet = serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
      path: Some(path.to_path_buf()),
      source,
    })?;
    debug!(
      path = ?path,
      packages = set.packages.len(),
      layers = set.layers.len(),
      "loaded package set"
    );
    Ok(set)
  }

  pub fn from_json(json: &str) -> Result<Self, ManifestError> {
    serde_json::from_str(json).map_err(|source| ManifestError::Parse { path: None, source })
  }

  /// The packages before any layer is applied.
  pub fn base_graph(&self) -> Result<PackageGraph, ManifestError> {
    Ok(PackageGraph::from_definitions(self.packages.iter().cloned())?)
  }

  pub fn layers(&self) -> Vec<Arc<dyn OverrideLayer>> {
    self
      .layers
      .iter()
      .map(|spec| Arc::new(spec.to_layer()) as Arc<dyn OverrideLayer>)
      .collect()
  }

  /// Apply every layer to the base packages and validate the result.
  pub fn compose(&self) -> Result<PackageGraph, ManifestError> {
    Ok(overlay::compose(&self.base_graph()?, &self.layers())?)
  }

  pub fn planner(&self) -> Planner {
    match &self.options {
      Some(schema) => Planner::new(schema.clone()),
      None => Planner::permissive(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::package::OptionValue;
  use crate::plan::OptionEffect;
  use crate::util::hash::hash_bytes;

  fn package_json(name: &str, deps: &[&str]) -> serde_json::Value {
    serde_json::json!({
      "name": name,
      "version": "1.0",
      "source": { "origin": format!("sources/{name}.txt"), "sha256": hash_bytes(name.as_bytes()) },
      "dependencies": deps,
      "recipe": {
        "build": { "program": "/bin/sh", "args": ["-c", "true"] },
        "install": { "program": "/bin/sh", "args": ["-c", "true"] }
      }
    })
  }

  #[test]
  fn layers_are_applied_in_order() {
    let json = serde_json::json!({
      "packages": [package_json("zlib", &[]), package_json("curl", &["zlib"])],
      "layers": [
        { "name": "first", "override": { "curl": { "options": { "set": { "ssl": true, "http2": false } } } } },
        { "name": "second", "override": { "curl": { "version": "8.0", "options": { "set": { "http2": true } } } } }
      ]
    });
    let set = PackageSet::from_json(&json.to_string()).unwrap();
    let graph = set.compose().unwrap();

    let curl = graph.get("curl").unwrap();
    assert_eq!(curl.version, "8.0");
    assert_eq!(curl.options["ssl"], OptionValue::Bool(true));
    assert_eq!(curl.options["http2"], OptionValue::Bool(true));
    assert_eq!(graph.get("zlib").unwrap().version, "1.0");
  }

  #[test]
  fn added_packages_become_available_to_later_layers() {
    let json = serde_json::json!({
      "packages": [package_json("app", &[])],
      "layers": [
        { "name": "extra", "add": [package_json("openssl", &[])] },
        { "name": "wire", "override": { "app": { "dependencies": { "add": ["openssl"] } } } }
      ]
    });
    let graph = PackageSet::from_json(&json.to_string()).unwrap().compose().unwrap();
    assert!(graph.get("app").unwrap().dependencies.contains("openssl"));
  }

  #[test]
  fn unknown_dependency_is_reported() {
    let json = serde_json::json!({ "packages": [package_json("app", &["missing"])] });
    let err = PackageSet::from_json(&json.to_string()).unwrap().compose().unwrap_err();
    assert!(matches!(
      err,
      ManifestError::Overlay(OverlayError::UnknownReference { .. })
    ));
  }

  #[test]
  fn duplicate_base_package_is_rejected() {
    let json = serde_json::json!({ "packages": [package_json("a", &[]), package_json("a", &[])] });
    let err = PackageSet::from_json(&json.to_string()).unwrap().base_graph().unwrap_err();
    assert!(matches!(err, ManifestError::Graph(GraphError::Duplicate(name)) if name == "a"));
  }

  #[test]
  fn option_schema_is_parsed() {
    let json = serde_json::json!({
      "packages": [],
      "options": {
        "pic": { "kind": "bool", "effect": { "arg": "--enable-pic" } },
        "prefix": { "kind": "str", "effect": "define" }
      }
    });
    let set = PackageSet::from_json(&json.to_string()).unwrap();
    let planner = set.planner();
    assert!(!planner.schema().is_permissive());
    assert_eq!(
      planner.schema().get("pic").unwrap().effect,
      OptionEffect::Arg("--enable-pic".to_string())
    );
  }

  #[test]
  fn missing_schema_is_permissive() {
    let set = PackageSet::from_json(r#"{ "packages": [] }"#).unwrap();
    assert!(set.planner().schema().is_permissive());
  }

  #[test]
  fn unknown_top_level_field_is_rejected() {
    let err = PackageSet::from_json(r#"{ "packages": [], "pakages": [] }"#).unwrap_err();
    assert!(matches!(err, ManifestError::Parse { path: None, .. }));
  }

  #[test]
  fn load_reports_missing_file() {
    let temp = tempfile::TempDir::new().unwrap();
    let err = PackageSet::load(&temp.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, ManifestError::Read { .. }));
  }
}
