//! Recognized build options and how they reach the toolchain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::InvalidPlanReason;
use crate::consts::RESERVED_ENV;
use crate::package::{OptionKind, OptionValue};

/// How a resolved option is handed to the tool phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionEffect {
  /// Exported as an environment variable to every tool phase.
  Env(String),
  /// Appended to the build command. Booleans add the bare flag when true;
  /// other kinds add `<flag>=<value>`.
  Arg(String),
  /// Appended to the build command as `-D<key>=<value>`.
  Define,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
  pub kind: OptionKind,
  pub effect: OptionEffect,
}

impl OptionSpec {
  pub fn new(kind: OptionKind, effect: OptionEffect) -> Self {
    Self { kind, effect }
  }
}

/// Option effects after resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
  pub env: BTreeMap<String, String>,
  pub build_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSchema {
  #[serde(flatten)]
  specs: BTreeMap<String, OptionSpec>,
  #[serde(skip)]
  permissive: bool,
}

impl OptionSchema {
  pub fn new() -> Self {
    Self::default()
  }

  /// A schema accepting any key, exported as an environment variable named
  /// after the key (`with-ssl` becomes `WITH_SSL`).
  pub fn permissive() -> Self {
    Self {
      specs: BTreeMap::new(),
      permissive: true,
    }
  }

  pub fn with(mut self, key: &str, spec: OptionSpec) -> Self {
    self.specs.insert(key.to_string(), spec);
    self
  }

  pub fn is_permissive(&self) -> bool {
    self.permissive
  }

  pub fn get(&self, key: &str) -> Option<&OptionSpec> {
    self.specs.get(key)
  }

  /// Check every option against the schema and compute its effects.
  ///
  /// Keys are visited in sorted order so the resulting argument list is
  /// canonical.
  pub fn resolve(&self, options: &BTreeMap<String, OptionValue>) -> Result<ResolvedOptions, InvalidPlanReason> {
    let mut resolved = ResolvedOptions::default();

    for (key, value) in options {
      if let OptionValue::Ambient { ambient } = value {
        return Err(InvalidPlanReason::NonDeterministicOption {
          key: key.clone(),
          value: *ambient,
        });
      }

      let spec = match self.specs.get(key) {
        Some(spec) => spec.clone(),
        None if self.permissive => OptionSpec::new(value.kind(), OptionEffect::Env(env_name(key))),
        None => return Err(InvalidPlanReason::UnknownOption(key.clone())),
      };

      if spec.kind != value.kind() {
        return Err(InvalidPlanReason::OptionKind {
          key: key.clone(),
          expected: spec.kind,
          found: value.kind(),
        });
      }

      let rendered = value.render().unwrap_or_default();
      match spec.effect {
        OptionEffect::Env(var) => {
          if is_reserved(&var) {
            return Err(InvalidPlanReason::ReservedVariable { key: key.clone(), var });
          }
          resolved.env.insert(var, rendered);
        }
        OptionEffect::Arg(flag) => match value {
          OptionValue::Bool(true) => resolved.build_args.push(flag),
          OptionValue::Bool(false) => {}
          _ => resolved.build_args.push(format!("{}={}", flag, rendered)),
        },
        OptionEffect::Define => resolved.build_args.push(format!("-D{}={}", key, rendered)),
      }
    }

    Ok(resolved)
  }
}

fn is_reserved(var: &str) -> bool {
  RESERVED_ENV.iter().any(|reserved| reserved.eq_ignore_ascii_case(var))
}

fn env_name(key: &str) -> String {
  key
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}
