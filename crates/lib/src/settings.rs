//! Run-wide build settings.
//!
//! Settings are read from an optional YAML file (every field has a default) and then
//! overridden by command-line flags. [`Settings::validate`] normalizes the result
//! before a run starts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::{FragmentRule, Platform, RecipeError};

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
  #[error("failed to read settings file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse settings file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("invalid {field} '{value}': {reason}")]
  Invalid {
    field: &'static str,
    value: String,
    reason: String,
  },
}

/// Shape of the deployment the images are built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
  Single,
  Multiple,
  #[default]
  Full,
}

impl DeploymentType {
  pub fn as_str(&self) -> &'static str {
    match self {
      DeploymentType::Single => "single",
      DeploymentType::Multiple => "multiple",
      DeploymentType::Full => "full",
    }
  }
}

impl fmt::Display for DeploymentType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DeploymentType {
  type Err = SettingsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "single" => Ok(DeploymentType::Single),
      "multiple" => Ok(DeploymentType::Multiple),
      "full" => Ok(DeploymentType::Full),
      other => Err(SettingsError::Invalid {
        field: "deployment type",
        value: other.to_string(),
        reason: "expected one of single, multiple, full".to_string(),
      }),
    }
  }
}

/// Filesystem locations the assembler and loaders read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
  /// Support files: `playbook.yml`, `entrypoint`, `task.yml`, `ansible.cfg`.
  pub util_dir: PathBuf,
  /// Extracted playbook: `vars.yml`, `group_vars/`, `internal/`, `inventory.ini`.
  pub playbook_dir: PathBuf,
  /// Static role tree. Defaults to `<util_dir>/static-roles-<deployment>`.
  pub static_roles_dir: Option<PathBuf>,
  /// Where per-run build directories are created.
  pub builds_dir: PathBuf,
  /// Per-unit configuration document. Defaults to `config-<deployment>.yml`.
  pub config_file: Option<PathBuf>,
}

impl Default for PathSettings {
  fn default() -> Self {
    Self {
      util_dir: PathBuf::from("util"),
      playbook_dir: PathBuf::from("sas_viya_playbook"),
      static_roles_dir: None,
      builds_dir: PathBuf::from("builds"),
      config_file: None,
    }
  }
}

/// Files holding license material. All optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicensePaths {
  pub license: Option<PathBuf>,
  pub metered_license: Option<PathBuf>,
  pub ca_certificate: Option<PathBuf>,
  pub entitlement_certificate: Option<PathBuf>,
  pub site_default: Option<PathBuf>,
}

/// Settings for a whole build run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub deployment: DeploymentType,
  pub base_image: String,
  /// `redhat` or `suse`. Derived from the base image when unset.
  pub platform: Option<String>,
  pub project_name: String,
  /// Fixed tag. When unset, tags are `<recipe version>-<run timestamp>`.
  pub tag: Option<String>,
  pub registry: Option<String>,
  pub namespace: Option<String>,
  pub addons: Vec<PathBuf>,
  /// Restrict the run to these units. Empty builds everything.
  pub build_only: Vec<String>,
  pub workers: usize,
  pub verbose: bool,
  pub skip_push: bool,
  pub mirror_url: String,
  pub cert_base_url: String,
  /// Address the build containers resolve the builder hostname to.
  pub builder_ip: Option<String>,
  pub paths: PathSettings,
  pub license: LicensePaths,
  pub fragment_rules: Vec<FragmentRule>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      deployment: DeploymentType::default(),
      base_image: "centos:7".to_string(),
      platform: None,
      project_name: "sas-viya".to_string(),
      tag: None,
      registry: None,
      namespace: None,
      addons: Vec::new(),
      build_only: Vec::new(),
      workers: available_workers(),
      verbose: false,
      skip_push: false,
      mirror_url: String::new(),
      cert_base_url: String::new(),
      builder_ip: None,
      paths: PathSettings::default(),
      license: LicensePaths::default(),
      fragment_rules: FragmentRule::defaults(),
    }
  }
}

fn available_workers() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

impl Settings {
  /// Load settings from a YAML file. Missing fields take their defaults.
  pub fn load(path: &Path) -> Result<Self, SettingsError> {
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_yaml(&content).map_err(|source| SettingsError::Parse {
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

  /// Check user-supplied values and normalize the rest.
  ///
  /// The worker count is clamped to `1..=available CPUs`, empty registry and namespace
  /// strings become `None`, and a trailing `/` is dropped from the registry.
  pub fn validate(&mut self) -> Result<(), SettingsError> {
    if let Some(tag) = &self.tag {
      check_name_chars("tag", tag)?;
    }
    check_name_chars("project name", &self.project_name)?;

    if self.base_image.trim().is_empty() {
      return Err(SettingsError::Invalid {
        field: "base image",
        value: self.base_image.clone(),
        reason: "must not be empty".to_string(),
      });
    }

    self.registry = self
      .registry
      .take()
      .map(|r| r.trim().trim_end_matches('/').to_string())
      .filter(|r| !r.is_empty());
    self.namespace = self.namespace.take().filter(|n| !n.trim().is_empty());

    if let Some(registry) = &self.registry
      && registry.starts_with("http://")
    {
      return Err(SettingsError::Invalid {
        field: "registry",
        value: registry.clone(),
        reason: "insecure registries are not supported".to_string(),
      });
    }

    self.platform().map_err(|e| SettingsError::Invalid {
      field: "platform",
      value: self.platform.clone().unwrap_or_default(),
      reason: e.to_string(),
    })?;

    self.workers = self.workers.clamp(1, available_workers());
    Ok(())
  }

  /// Platform of the base image, which selects the package bootstrap.
  pub fn platform(&self) -> Result<Platform, RecipeError> {
    match &self.platform {
      Some(platform) => platform.parse(),
      None => Ok(Platform::from_base_image(&self.base_image)),
    }
  }

  pub fn static_roles_dir(&self) -> PathBuf {
    self
      .paths
      .static_roles_dir
      .clone()
      .unwrap_or_else(|| self.paths.util_dir.join(format!("static-roles-{}", self.deployment)))
  }

  pub fn config_file(&self) -> PathBuf {
    self.paths.config_file.clone().unwrap_or_else(|| match self.deployment {
      DeploymentType::Multiple => PathBuf::from("config-multiple.yml"),
      _ => PathBuf::from("config-full.yml"),
    })
  }

  pub fn inventory_file(&self) -> PathBuf {
    self.paths.playbook_dir.join("inventory.ini")
  }

  /// Whether built images are pushed: push is enabled and both a registry and a namespace are set.
  pub fn push_enabled(&self) -> bool {
    !self.skip_push && self.registry.is_some() && self.namespace.is_some()
  }
}

fn check_name_chars(field: &'static str, value: &str) -> Result<(), SettingsError> {
  let valid = !value.is_empty()
    && value
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
  if valid {
    Ok(())
  } else {
    Err(SettingsError::Invalid {
      field,
      value: value.to_string(),
      reason: "only letters, digits, '_', '.' and '-' are allowed".to_string(),
    })
  }
}
