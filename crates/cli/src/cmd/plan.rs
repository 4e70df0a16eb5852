//! Implementation of the `ovl plan` command.
//!
//! Composes the package set, plans the selected packages and prints each
//! plan's identity, phases and dependencies. Nothing is fetched or built.

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;

use overlay_lib::plan::BuildPlan;

use super::{compose, plan_selected};
use crate::output::{OutputFormat, Status, print_field, print_json, print_status, short_id};

#[derive(Serialize)]
struct PlanSummary<'a> {
  package: &'a str,
  version: &'a str,
  id: &'a str,
  phases: Vec<&'static str>,
  dependencies: Vec<&'a str>,
}

#[derive(Serialize)]
struct PlanFailure {
  package: String,
  error: String,
}

#[derive(Serialize)]
struct PlanReport<'a> {
  plans: Vec<PlanSummary<'a>>,
  errors: Vec<PlanFailure>,
}

impl<'a> PlanSummary<'a> {
  fn of(plan: &'a BuildPlan) -> Self {
    Self {
      package: &plan.package,
      version: &plan.version,
      id: plan.id.as_str(),
      phases: plan.phases.iter().map(|p| p.kind.as_str()).collect(),
      dependencies: plan.dependencies.keys().map(String::as_str).collect(),
    }
  }
}

pub fn cmd_plan(file: &Path, packages: &[String], output: OutputFormat) -> Result<()> {
  let (set, graph) = compose(file)?;
  let results = plan_selected(&set, &graph, packages)?;

  let mut report = PlanReport {
    plans: Vec::new(),
    errors: Vec::new(),
  };
  for (name, result) in &results {
    match result {
      Ok(plan) => report.plans.push(PlanSummary::of(plan)),
      Err(e) => report.errors.push(PlanFailure {
        package: name.clone(),
        error: e.to_string(),
      }),
    }
  }

  if output.is_json() {
    print_json(&report)?;
  } else {
    for plan in &report.plans {
      println!("{} {} ({})", plan.package, plan.version, short_id(plan.id));
      print_field("Phases", &plan.phases.join(" -> "));
      if !plan.dependencies.is_empty() {
        print_field("Depends on", &plan.dependencies.join(", "));
      }
    }
    for failure in &report.errors {
      print_status(Status::Failed, &failure.error);
    }
  }

  if !report.errors.is_empty() {
    bail!("{} of {} package(s) could not be planned", report.errors.len(), results.len());
  }
  Ok(())
}
