//! Rendering of `ovl` reports for terminals and for JSON consumers.
//!
//! Per-package outcomes go through [`print_status`]: successes on stdout,
//! failures and skips on stderr. Summary rows use [`print_field`].

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use overlay_lib::consts::SHORT_HASH_LEN;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// What happened to one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Built,
  Failed,
  Skipped,
}

impl Status {
  fn marker(self) -> &'static str {
    match self {
      Status::Built => "built",
      Status::Failed => "failed",
      Status::Skipped => "skipped",
    }
  }
}

pub fn print_status(status: Status, message: &str) {
  let marker = format!("{:>7}", status.marker());
  match status {
    Status::Built => println!("{} {}", marker.if_supports_color(Stream::Stdout, |s| s.green()), message),
    Status::Failed => eprintln!("{} {}", marker.if_supports_color(Stream::Stderr, |s| s.red()), message),
    Status::Skipped => eprintln!("{} {}", marker.if_supports_color(Stream::Stderr, |s| s.yellow()), message),
  }
}

/// An indented `label: value` row.
pub fn print_field(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
  println!("{}", json);
  Ok(())
}

/// Leading characters of a plan identity or digest.
pub fn short_id(id: &str) -> &str {
  id.get(..SHORT_HASH_LEN).unwrap_or(id)
}

/// Artifact size in binary units.
pub fn format_size(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// Wall-clock time to millisecond precision, e.g. `1m 5s 20ms`.
pub fn format_elapsed(elapsed: Duration) -> String {
  let millis = Duration::from_millis(elapsed.as_millis() as u64);
  humantime::format_duration(millis).to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_id_keeps_prefix() {
    let id = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    assert_eq!(short_id(id), "2cf24dba5fb0");
    assert_eq!(short_id("abc"), "abc");
  }

  #[test]
  fn sizes_use_binary_units() {
    assert_eq!(format_size(0), "0 B");
    assert_eq!(format_size(1023), "1023 B");
    assert_eq!(format_size(1536), "1.5 KiB");
    assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
  }

  #[test]
  fn elapsed_drops_sub_millisecond_noise() {
    assert_eq!(format_elapsed(Duration::from_micros(1_500_700)), "1s 500ms");
    assert_eq!(format_elapsed(Duration::from_secs(65)), "1m 5s");
  }
}
