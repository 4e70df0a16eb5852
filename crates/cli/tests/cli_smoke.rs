//! CLI smoke tests for ovl.
//!
//! These tests run the binary against small package sets written to temp
//! directories and check exit codes and output.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use overlay_lib::store_lock::{LockMode, StoreLock};
use overlay_lib::util::hash::hash_bytes;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

const HELLO_SOURCE: &str = "hello source\n";

/// Get a Command for the ovl binary.
fn ovl_cmd() -> Command {
  cargo_bin_cmd!("ovl")
}

fn sh(script: &str) -> Value {
  json!({ "program": "/bin/sh", "args": ["-c", script] })
}

/// `hello` copies its single-file source into the output; `app` copies the
/// installed file of its `hello` dependency.
fn package_set(hello_install: &str) -> Value {
  json!({
    "packages": [
      {
        "name": "hello",
        "version": "1.0",
        "source": { "origin": "sources/hello.txt", "sha256": hash_bytes(HELLO_SOURCE.as_bytes()) },
        "recipe": {
          "build": sh("true"),
          "install": sh(hello_install)
        }
      },
      {
        "name": "app",
        "version": "2.0",
        "source": { "origin": "sources/hello.txt", "sha256": hash_bytes(HELLO_SOURCE.as_bytes()) },
        "dependencies": ["hello"],
        "recipe": {
          "build": sh("true"),
          "install": sh(r#"while read -r l; do printf '%s\n' "$l"; done < "$deps/hello/hello.txt" > "$out/app.txt""#)
        }
      }
    ]
  })
}

const HELLO_INSTALL: &str = r#"while read -r l; do printf '%s\n' "$l"; done < hello.txt > "$out/hello.txt""#;

/// Create a temp directory holding `set` as `packages.json` and the sources
/// it refers to.
fn temp_package_set(set: &Value) -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::create_dir_all(temp.path().join("sources")).unwrap();
  std::fs::write(temp.path().join("sources/hello.txt"), HELLO_SOURCE).unwrap();
  std::fs::write(temp.path().join("packages.json"), set.to_string()).unwrap();
  temp
}

fn run(temp: &TempDir, args: &[&str]) -> assert_cmd::assert::Assert {
  ovl_cmd()
    .args(args)
    .arg(temp.path().join("packages.json"))
    .env("OVERLAY_STORE", temp.path().join("store"))
    .env_remove("RUST_LOG")
    .assert()
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  ovl_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  ovl_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("ovl"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["plan", "build", "graph"] {
    ovl_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// plan
// =============================================================================

#[test]
fn plan_lists_packages_and_phases() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));

  run(&temp, &["plan"])
    .success()
    .stdout(predicate::str::contains("hello 1.0"))
    .stdout(predicate::str::contains("fetch -> patch -> build -> install"))
    .stdout(predicate::str::contains("Depends on: hello"));
}

#[test]
fn plan_json_reports_identities() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));

  let output = run(&temp, &["plan", "--format", "json"]).success().get_output().stdout.clone();
  let report: Value = serde_json::from_slice(&output).unwrap();

  let plans = report["plans"].as_array().unwrap();
  assert_eq!(plans.len(), 2);
  let app = plans.iter().find(|p| p["package"] == "app").unwrap();
  assert_eq!(app["dependencies"], json!(["hello"]));
  assert_eq!(app["id"].as_str().unwrap().len(), 64);
  assert!(report["errors"].as_array().unwrap().is_empty());
}

#[test]
fn plan_rejects_option_outside_schema() {
  let mut set = package_set(HELLO_INSTALL);
  set["options"] = json!({ "shared": { "kind": "bool", "effect": { "arg": "--shared" } } });
  set["layers"] = json!([
    { "name": "debug", "override": { "hello": { "options": { "set": { "debug": true } } } } }
  ]);
  let temp = temp_package_set(&set);

  run(&temp, &["plan"])
    .failure()
    .stderr(predicate::str::contains("unknown option 'debug'"));
}

#[test]
fn plan_unknown_package_fails() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));

  run(&temp, &["plan", "--package", "nope"])
    .failure()
    .stderr(predicate::str::contains("unknown package 'nope'"));
}

#[test]
fn plan_nonexistent_file_fails() {
  ovl_cmd()
    .arg("plan")
    .arg("/nonexistent/path/packages.json")
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load package set"));
}

// =============================================================================
// graph
// =============================================================================

#[test]
fn graph_json_shows_composed_dependencies() {
  let mut set = package_set(HELLO_INSTALL);
  set["layers"] = json!([
    { "name": "bump", "override": { "app": { "version": "2.1" } } }
  ]);
  let temp = temp_package_set(&set);

  let output = run(&temp, &["graph", "--format", "json"]).success().get_output().stdout.clone();
  let entries: Value = serde_json::from_slice(&output).unwrap();

  let app = entries.as_array().unwrap().iter().find(|e| e["name"] == "app").unwrap();
  assert_eq!(app["version"], "2.1");
  assert_eq!(app["dependencies"], json!(["hello"]));
}

#[test]
fn graph_rejects_cycles() {
  let mut set = package_set(HELLO_INSTALL);
  set["layers"] = json!([
    { "name": "loop", "override": { "hello": { "dependencies": { "add": ["app"] } } } }
  ]);
  let temp = temp_package_set(&set);

  run(&temp, &["graph"])
    .failure()
    .stderr(predicate::str::contains("dependency cycle"));
}

// =============================================================================
// build
// =============================================================================

#[cfg(unix)]
#[test]
fn build_publishes_artifacts() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));

  let output = run(&temp, &["build", "--format", "json"]).success().get_output().stdout.clone();
  let report: Value = serde_json::from_slice(&output).unwrap();

  let built = report["built"].as_object().unwrap();
  assert_eq!(built.len(), 2);
  let path = built["app"]["path"].as_str().unwrap();
  assert!(std::path::Path::new(path).exists());
  assert!(temp.path().join("store/objects").is_dir());

  // second run is served from the store
  run(&temp, &["build"]).success().stdout(predicate::str::contains("Built: 2"));
}

#[cfg(unix)]
#[test]
fn build_failure_exits_non_zero() {
  let temp = temp_package_set(&package_set("exit 3"));

  run(&temp, &["build"])
    .failure()
    .stderr(predicate::str::contains("did not build"))
    .stderr(predicate::str::contains("dependency hello failed"));
}

#[cfg(unix)]
#[test]
fn unplannable_package_does_not_block_the_rest() {
  let mut set = package_set(HELLO_INSTALL);
  let mut stamped = set["packages"][0].clone();
  stamped["name"] = json!("stamped");
  stamped["options"] = json!({ "stamp": { "ambient": "current-time" } });
  set["packages"].as_array_mut().unwrap().push(stamped);
  let temp = temp_package_set(&set);

  let output = run(&temp, &["build", "--format", "json"]).failure().get_output().stdout.clone();
  let report: Value = serde_json::from_slice(&output).unwrap();

  let built = report["built"].as_object().unwrap();
  assert!(built.contains_key("hello"));
  assert!(built.contains_key("app"));
  assert!(report["failed"]["stamped"].as_str().unwrap().contains("cannot plan 'stamped'"));
  assert!(temp.path().join("store/objects").is_dir());
}

#[cfg(unix)]
#[test]
fn dependents_of_unplannable_package_are_skipped() {
  let mut set = package_set(HELLO_INSTALL);
  set["packages"][0]["options"] = json!({ "stamp": { "ambient": "current-time" } });
  let temp = temp_package_set(&set);

  run(&temp, &["build"])
    .failure()
    .stdout(predicate::str::contains("Built: 0"))
    .stdout(predicate::str::contains("Failed: 1"))
    .stdout(predicate::str::contains("Skipped: 1"))
    .stderr(predicate::str::contains("app not built"));
}

#[cfg(unix)]
#[test]
fn build_refuses_a_locked_store() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));
  let _held = StoreLock::acquire(&temp.path().join("store"), LockMode::Exclusive, "ovl build").unwrap();

  run(&temp, &["build"])
    .failure()
    .stderr(predicate::str::contains("store is in use by `ovl build`"));
}

#[cfg(unix)]
#[test]
fn build_rejects_tampered_source() {
  let temp = temp_package_set(&package_set(HELLO_INSTALL));
  std::fs::write(temp.path().join("sources/hello.txt"), "tampered\n").unwrap();

  run(&temp, &["build", "--package", "hello"])
    .failure()
    .stderr(predicate::str::contains("verification failed for hello"));
}
