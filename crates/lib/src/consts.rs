//! Crate-wide constants.

/// Application name, used for default data directories.
pub const APP_NAME: &str = "overlay";

/// Environment variable overriding the content store root.
pub const STORE_ENV: &str = "OVERLAY_STORE";

/// Value exported as `SOURCE_DATE_EPOCH` to every toolchain invocation.
///
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Variables every tool phase gets from the isolated environment. Options
/// cannot set them.
pub const RESERVED_ENV: &[&str] = &[
  "PATH",
  "HOME",
  "TMPDIR",
  "TMP",
  "TEMP",
  "TEMPDIR",
  "LANG",
  "LC_ALL",
  "TZ",
  "SOURCE_DATE_EPOCH",
  "src",
  "out",
  "cache",
  "deps",
];

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Number of digest characters shown in log lines and CLI output.
pub const SHORT_HASH_LEN: usize = 12;
