//! Package definitions and graphs.
//!
//! A [`PackageDefinition`] is immutable once built. Graphs map identifiers to
//! shared definitions and are recomputed, never mutated, when layers change.

mod graph;
mod types;

pub use graph::{GraphError, PackageGraph};
pub use types::*;
