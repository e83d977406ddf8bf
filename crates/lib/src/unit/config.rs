//! Per-unit configuration and default injection.
//!
//! The configuration document is a YAML mapping from unit name to a [`UnitConfig`].
//! Units missing from the document get an empty record, which [`resolve`] then fills
//! with defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{BOOTSTRAP_ROLES, CLEANUP_ROLE, DEFAULT_LIMITS, DEFAULT_REQUESTS, DEFAULT_USER, LOG_VOLUME};
use crate::license::LicenseMaterial;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("unable to read configuration document {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("unable to parse configuration document {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
}

/// Resource limits and requests, each entry `key=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
  #[serde(deserialize_with = "scalar_list")]
  pub limits: Vec<String>,
  #[serde(deserialize_with = "scalar_list")]
  pub requests: Vec<String>,
}

/// Configuration of a single unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
  pub user: String,
  #[serde(deserialize_with = "scalar_list")]
  pub ports: Vec<String>,
  #[serde(deserialize_with = "scalar_list")]
  pub environment: Vec<String>,
  #[serde(deserialize_with = "scalar_list")]
  pub secrets: Vec<String>,
  #[serde(deserialize_with = "scalar_list")]
  pub roles: Vec<String>,
  #[serde(deserialize_with = "scalar_list")]
  pub volumes: Vec<String>,
  pub resources: Resources,
}

/// The whole configuration document, keyed by unit name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDocument(pub BTreeMap<String, UnitConfig>);

impl ConfigDocument {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
    if content.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(content)
  }

  pub fn get(&self, name: &str) -> Option<&UnitConfig> {
    self.0.get(name)
  }
}

/// Resolve the configuration for `name`, injecting defaults and license material.
///
/// - empty roles become the bootstrap roles, the unit's own role, then the cleanup role
/// - empty limits and requests get memory defaults
/// - an empty user becomes the default run-as user
/// - the log volume is always appended
///
/// The result never has an empty role list.
pub fn resolve(name: &str, document: &ConfigDocument, license: &LicenseMaterial) -> UnitConfig {
  let mut config = document.get(name).cloned().unwrap_or_default();

  for secret in config.secrets.iter_mut() {
    if let Some(replaced) = license.substitute_secret(secret) {
      *secret = replaced;
    }
  }
  for entry in config.environment.iter_mut() {
    if let Some(replaced) = license.substitute_environment(entry) {
      *entry = replaced;
    }
  }

  config.volumes.push(LOG_VOLUME.to_string());

  if config.roles.is_empty() {
    debug!(unit = %name, "adding default roles");
    config.roles = BOOTSTRAP_ROLES
      .iter()
      .map(|r| r.to_string())
      .chain([name.to_string(), CLEANUP_ROLE.to_string()])
      .collect();
  }
  if config.resources.limits.is_empty() {
    config.resources.limits = DEFAULT_LIMITS.iter().map(|s| s.to_string()).collect();
  }
  if config.resources.requests.is_empty() {
    config.resources.requests = DEFAULT_REQUESTS.iter().map(|s| s.to_string()).collect();
  }
  if config.user.is_empty() {
    config.user = DEFAULT_USER.to_string();
  }

  config
}

/// Accepts a list whose items are strings, numbers or booleans, so `ports: [8080]` reads
/// the same as `ports: ["8080"]`. A null list reads as empty.
fn scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
  }

  let items: Option<Vec<Scalar>> = Option::deserialize(deserializer)?;
  Ok(
    items
      .unwrap_or_default()
      .into_iter()
      .map(|item| match item {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
      })
      .collect(),
  )
}
