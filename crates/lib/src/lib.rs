//! overlay-lib: layered package overrides and reproducible builds.
//!
//! - `overlay`: composes override layers over a base package graph
//! - `plan`: derives content-addressed build plans from a composed graph
//! - `execute`: runs plans phase by phase and publishes artifacts
//! - `fetch`, `patch`, `normalize`: the work done inside phases
//! - `store`: content-addressed artifact storage
//! - `manifest`: JSON package-set files

pub mod consts;
pub mod execute;
pub mod fetch;
pub mod manifest;
pub mod normalize;
pub mod overlay;
pub mod package;
pub mod patch;
pub mod paths;
pub mod plan;
pub mod store;
pub mod store_lock;
pub mod util;
