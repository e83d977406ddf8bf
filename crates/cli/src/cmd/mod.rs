mod build;
mod recipe;
mod units;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::warn;

use rolebuild_lib::settings::{DeploymentType, Settings};
use rolebuild_lib::unit::ConfigDocument;

pub use build::cmd_build;
pub use recipe::cmd_recipe;
pub use units::cmd_units;

/// Flags shared by every command. Each one overrides the settings file.
#[derive(Debug, Default, Args)]
pub struct SettingsArgs {
  /// Settings file (YAML)
  #[arg(short, long)]
  settings: Option<PathBuf>,

  /// Deployment type: single, multiple or full
  #[arg(short, long)]
  deployment: Option<DeploymentType>,

  /// Base image every recipe starts from
  #[arg(long)]
  base_image: Option<String>,

  /// Image name prefix
  #[arg(long)]
  project_name: Option<String>,

  /// Image tag (default: <recipe version>-<timestamp>)
  #[arg(short, long)]
  tag: Option<String>,

  /// Registry to push to
  #[arg(long)]
  registry: Option<String>,

  /// Registry namespace to push to
  #[arg(long)]
  namespace: Option<String>,

  /// Only build these units (comma separated)
  #[arg(long, value_delimiter = ',')]
  build_only: Vec<String>,

  /// Add-on directory to include (repeatable)
  #[arg(long = "addon")]
  addons: Vec<PathBuf>,

  /// Number of concurrent builds
  #[arg(short, long)]
  workers: Option<usize>,

  /// Build without pushing
  #[arg(long)]
  skip_push: bool,

  /// Playbook directory
  #[arg(long)]
  playbook_dir: Option<PathBuf>,
}

impl SettingsArgs {
  /// Read the settings file, apply flag overrides and validate.
  pub fn load(&self, verbose: bool) -> Result<Settings> {
    let mut settings = match &self.settings {
      Some(path) => Settings::load(path).context("Failed to load settings")?,
      None => Settings::default(),
    };

    if let Some(deployment) = self.deployment {
      settings.deployment = deployment;
    }
    if let Some(image) = &self.base_image {
      settings.base_image = image.clone();
    }
    if let Some(project) = &self.project_name {
      settings.project_name = project.clone();
    }
    if self.tag.is_some() {
      settings.tag = self.tag.clone();
    }
    if self.registry.is_some() {
      settings.registry = self.registry.clone();
    }
    if self.namespace.is_some() {
      settings.namespace = self.namespace.clone();
    }
    if !self.build_only.is_empty() {
      settings.build_only = self.build_only.clone();
    }
    settings.addons.extend(self.addons.iter().cloned());
    if let Some(workers) = self.workers {
      settings.workers = workers;
    }
    if let Some(dir) = &self.playbook_dir {
      settings.paths.playbook_dir = dir.clone();
    }
    settings.skip_push |= self.skip_push;
    settings.verbose |= verbose;

    settings.validate().context("Invalid settings")?;
    Ok(settings)
  }
}

/// Load the per-unit configuration document. A missing file means every unit takes the defaults.
pub fn load_document(settings: &Settings) -> Result<ConfigDocument> {
  let path = settings.config_file();
  if !path.exists() {
    warn!(path = ?path, "configuration document not found, using defaults for every unit");
    return Ok(ConfigDocument::default());
  }
  ConfigDocument::load(&path).context("Failed to load configuration document")
}
