//! Implementation of the `ovl graph` command.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use super::compose;
use crate::output::{OutputFormat, print_field, print_json};

#[derive(Serialize)]
struct GraphEntry<'a> {
  name: &'a str,
  version: &'a str,
  origin: &'a str,
  patches: usize,
  dependencies: Vec<&'a str>,
}

pub fn cmd_graph(file: &Path, output: OutputFormat) -> Result<()> {
  let (_, graph) = compose(file)?;

  let entries: Vec<GraphEntry<'_>> = graph
    .iter()
    .map(|(name, def)| GraphEntry {
      name,
      version: &def.version,
      origin: &def.source.origin,
      patches: def.patches.len(),
      dependencies: def.dependencies.iter().map(String::as_str).collect(),
    })
    .collect();

  if output.is_json() {
    return print_json(&entries);
  }

  for entry in &entries {
    println!("{} {}", entry.name, entry.version);
    print_field("Source", entry.origin);
    if entry.patches > 0 {
      print_field("Patches", &entry.patches.to_string());
    }
    if !entry.dependencies.is_empty() {
      print_field("Depends on", &entry.dependencies.join(", "));
    }
  }
  Ok(())
}
