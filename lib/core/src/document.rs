//! Serde-facing mirror of the external task document format. Kept
//! deliberately dumb (mostly `Option`/`String`/`Vec`) so `loader` owns all
//! the defaulting, validation, and kind-resolution logic in one place.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTask {
  /// Informational only; the loader doesn't branch on it.
  #[serde(default)]
  pub version: Option<String>,
  #[serde(default)]
  pub alias: Option<RawAlias>,
  /// Task-wide environment defaults. A step's own `env` entries override
  /// these by variable name; anything not overridden is still set.
  #[serde(default)]
  pub env: Vec<String>,
  #[serde(default)]
  pub step_timeout: Option<u64>,
  #[serde(default)]
  pub working_directory: Option<String>,
  #[serde(default)]
  pub networks: Vec<RawNetwork>,
  #[serde(default)]
  pub volumes: Vec<RawVolume>,
  /// Named secret bundles (filename -> base64 content), referenced by
  /// volumes via `RawVolume::secret`.
  #[serde(default)]
  pub secrets: HashMap<String, HashMap<String, String>>,
  #[serde(default)]
  pub credentials: HashMap<String, RawCredentials>,
  pub steps: Vec<RawStep>,
}

/// The document's `alias` block. `values` and the alias documents named in
/// `src` compose: each `src` document is merged in list order (later
/// overriding earlier), then inline `values` is layered on top and wins
/// over anything loaded from `src`.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawAlias {
  #[serde(default)]
  pub directive: Option<String>,
  #[serde(default)]
  pub values: HashMap<String, String>,
  #[serde(default)]
  pub src: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNetwork {
  pub name: String,
  #[serde(default)]
  pub driver: Option<String>,
  #[serde(default)]
  pub ipv6: bool,
  #[serde(default)]
  pub subnet: Option<String>,
  #[serde(default)]
  pub skip_creation: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVolume {
  pub name: String,
  /// Name of a bundle in the task's top-level `secrets` map. The only
  /// volume source this crate materializes itself; anything else is a
  /// collaborator's job.
  #[serde(default)]
  pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawCredentials {
  pub username: String,
  pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStep {
  pub id: String,

  #[serde(default)]
  pub build: Option<String>,
  #[serde(default)]
  pub push: Option<Vec<String>>,
  #[serde(default)]
  pub cmd: Option<String>,

  #[serde(default)]
  pub working_directory: Option<String>,
  #[serde(default)]
  pub entrypoint: Option<String>,
  #[serde(default)]
  pub env: Vec<String>,
  #[serde(default)]
  pub secret_env: Vec<String>,
  #[serde(default)]
  pub ports: Vec<String>,
  #[serde(default)]
  pub publish_ports: Vec<String>,
  #[serde(default)]
  pub user: Option<String>,
  #[serde(default)]
  pub isolation: Option<String>,
  #[serde(default)]
  pub network: Option<String>,
  #[serde(default)]
  pub privileged: bool,
  #[serde(default)]
  pub keep: bool,
  #[serde(default)]
  pub detach: bool,
  #[serde(default)]
  pub pull: bool,

  #[serde(default)]
  pub when: Vec<String>,

  #[serde(default)]
  pub timeout: Option<u64>,
  #[serde(default)]
  pub retries: u32,
  #[serde(default)]
  pub retry_delay: Option<u64>,
  #[serde(default)]
  pub retry_on_errors: Vec<String>,
  #[serde(default)]
  pub repeat: u32,
  #[serde(default)]
  pub start_delay: Option<u64>,
  #[serde(default)]
  pub ignore_errors: bool,
  #[serde(default)]
  pub exited_with: Vec<i32>,
  #[serde(default)]
  pub exited_without: Vec<i32>,
}

/// Parses a `VAR=value` entry as used in `env`/`secretEnv` lists.
pub fn parse_env_entry(
  entry: &str,
) -> Result<crate::task::EnvVar, crate::error::LoadError> {
  match entry.split_once('=') {
    Some((variable, value)) => Ok(crate::task::EnvVar {
      variable: variable.to_string(),
      value: value.to_string(),
    }),
    None => Err(crate::error::LoadError::MalformedDocument(
      {
        use serde::de::Error as _;
        serde_yaml_ng::Error::custom(format!(
          "environment entry {entry:?} is not in VAR=value form"
        ))
      },
    )),
  }
}
