//! Pre-flight loaders.
//!
//! Before any unit is assembled, a fixed set of loaders checks and loads what the run
//! depends on. Which loaders apply is decided once from the settings, then all applicable
//! loaders run concurrently as a structured join that stops at the first fatal error.
//!
//! # Submodules
//!
//! - [`registry`] - Docker client credentials and registry reachability

pub mod registry;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::daemon::{DaemonConnector, DaemonError, RegistryAuth};
use crate::license::{LicenseError, LicenseMaterial};
use crate::settings::{DeploymentType, Settings};

/// Site defaults are read from here when no path is configured.
pub const DEFAULT_SITE_DEFAULT_FILE: &str = "sitedefault.yml";

#[derive(Debug, Error)]
pub enum LoaderError {
  #[error(transparent)]
  License(#[from] LicenseError),

  #[error(transparent)]
  Daemon(#[from] DaemonError),

  #[error("unable to pull base image {image}: {message}")]
  BaseImage { image: String, message: String },

  #[error("unable to read site defaults {path}: {source}")]
  SiteDefault {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("playbook is incomplete: {path} is missing")]
  Playbook { path: PathBuf },

  #[error("cannot use Docker configuration {path}: {message}")]
  DockerConfig { path: PathBuf, message: String },

  #[error("no credentials for {registry} in {path}. Run `docker login {registry}` before building")]
  NoCredentials { registry: String, path: PathBuf },

  #[error("registry {registry} is not usable: {message}")]
  RegistryUnreachable { registry: String, message: String },

  #[error("loader {0} panicked")]
  Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderKind {
  License,
  Daemon,
  SiteDefault,
  Playbook,
  RegistryAuth,
  RegistryCheck,
}

impl LoaderKind {
  pub const ALL: [LoaderKind; 6] = [
    LoaderKind::License,
    LoaderKind::Daemon,
    LoaderKind::SiteDefault,
    LoaderKind::Playbook,
    LoaderKind::RegistryAuth,
    LoaderKind::RegistryCheck,
  ];

  /// Whether this loader runs for `settings`.
  pub fn applies(self, settings: &Settings) -> bool {
    match self {
      LoaderKind::License | LoaderKind::Daemon | LoaderKind::Playbook => true,
      LoaderKind::SiteDefault => settings.deployment == DeploymentType::Full,
      LoaderKind::RegistryAuth => settings.push_enabled(),
      LoaderKind::RegistryCheck => settings.push_enabled() && settings.deployment != DeploymentType::Single,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      LoaderKind::License => "license",
      LoaderKind::Daemon => "daemon",
      LoaderKind::SiteDefault => "site-default",
      LoaderKind::Playbook => "playbook",
      LoaderKind::RegistryAuth => "registry-auth",
      LoaderKind::RegistryCheck => "registry-check",
    }
  }
}

impl fmt::Display for LoaderKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Loaders that apply to `settings`, in declaration order.
pub fn applicable(settings: &Settings) -> Vec<LoaderKind> {
  LoaderKind::ALL.into_iter().filter(|k| k.applies(settings)).collect()
}

enum LoaderOutput {
  License(LicenseMaterial),
  SiteDefault(Option<Vec<u8>>),
  RegistryAuth(RegistryAuth),
  Checked,
}

/// What the loaders produced for the run.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
  pub license: LicenseMaterial,
  pub auth: Option<RegistryAuth>,
}

/// Run every applicable loader concurrently.
///
/// The first failure aborts the remaining loaders, waits for them to stop, and is returned.
pub async fn run_loaders(
  settings: Arc<Settings>,
  connector: Arc<dyn DaemonConnector>,
) -> Result<Preflight, LoaderError> {
  let kinds = applicable(&settings);
  info!(loaders = ?kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(), "running pre-flight loaders");

  let mut join_set = JoinSet::new();
  for kind in kinds {
    let settings = settings.clone();
    let connector = connector.clone();
    join_set.spawn(async move { (kind, run_loader(kind, &settings, connector.as_ref()).await) });
  }

  let mut preflight = Preflight::default();
  let mut site_default = None;

  while let Some(joined) = join_set.join_next().await {
    let (kind, result) = match joined {
      Ok(done) => done,
      Err(e) if e.is_cancelled() => continue,
      Err(e) => {
        error!(error = %e, "loader panicked");
        join_set.abort_all();
        drain(&mut join_set).await;
        return Err(LoaderError::Panicked(e.to_string()));
      }
    };

    match result {
      Ok(output) => {
        debug!(loader = %kind, "loader finished");
        match output {
          LoaderOutput::License(material) => preflight.license = material,
          LoaderOutput::SiteDefault(bytes) => site_default = bytes,
          LoaderOutput::RegistryAuth(auth) => preflight.auth = Some(auth),
          LoaderOutput::Checked => {}
        }
      }
      Err(e) => {
        error!(loader = %kind, error = %e, "loader failed");
        join_set.abort_all();
        drain(&mut join_set).await;
        return Err(e);
      }
    }
  }

  preflight.license.site_default = site_default;
  info!("pre-flight loaders finished");
  Ok(preflight)
}

async fn drain<T: 'static>(join_set: &mut JoinSet<T>) {
  while join_set.join_next().await.is_some() {}
}

async fn run_loader(
  kind: LoaderKind,
  settings: &Settings,
  connector: &dyn DaemonConnector,
) -> Result<LoaderOutput, LoaderError> {
  match kind {
    LoaderKind::License => {
      let paths = settings.license.clone();
      let material = tokio::task::spawn_blocking(move || LicenseMaterial::load(&paths))
        .await
        .map_err(|e| LoaderError::Panicked(e.to_string()))??;
      Ok(LoaderOutput::License(material))
    }
    LoaderKind::Daemon => {
      pull_base_image(settings, connector).await?;
      Ok(LoaderOutput::Checked)
    }
    LoaderKind::SiteDefault => load_site_default(settings.license.site_default.as_deref())
      .await
      .map(LoaderOutput::SiteDefault),
    LoaderKind::Playbook => {
      check_playbook(settings)?;
      Ok(LoaderOutput::Checked)
    }
    LoaderKind::RegistryAuth => {
      let registry = settings.registry.as_deref().unwrap_or_default();
      let path = registry::docker_config_path().ok_or_else(|| LoaderError::DockerConfig {
        path: PathBuf::from("~/.docker/config.json"),
        message: "neither DOCKER_CONFIG nor HOME is set".to_string(),
      })?;
      registry::load_registry_auth(&path, registry).map(LoaderOutput::RegistryAuth)
    }
    LoaderKind::RegistryCheck => {
      registry::check_registry(settings.registry.as_deref().unwrap_or_default()).await?;
      Ok(LoaderOutput::Checked)
    }
  }
}

/// Ping the daemon and pull the base image so the first build does not pay for it.
async fn pull_base_image(settings: &Settings, connector: &dyn DaemonConnector) -> Result<(), LoaderError> {
  let daemon = connector.connect()?;
  daemon.ping().await?;

  info!(image = %settings.base_image, "pulling base image");
  let mut stream = daemon.pull_image(&settings.base_image);
  while let Some(item) = stream.next().await {
    match item {
      Ok(record) => {
        if let Some(message) = record.error.filter(|m| !m.trim().is_empty()) {
          return Err(LoaderError::BaseImage {
            image: settings.base_image.clone(),
            message,
          });
        }
        if let Some(status) = record.status {
          debug!(image = %settings.base_image, status = %status.trim(), "pull progress");
        }
      }
      Err(e) if e.is_benign() => continue,
      Err(e) => {
        return Err(LoaderError::BaseImage {
          image: settings.base_image.clone(),
          message: e.to_string(),
        });
      }
    }
  }
  Ok(())
}

/// Read the configured site defaults, or `sitedefault.yml` from the working directory if present.
async fn load_site_default(configured: Option<&Path>) -> Result<Option<Vec<u8>>, LoaderError> {
  let path = match configured {
    Some(path) => path.to_path_buf(),
    None => {
      let fallback = PathBuf::from(DEFAULT_SITE_DEFAULT_FILE);
      if !tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
        debug!("no site defaults provided");
        return Ok(None);
      }
      fallback
    }
  };

  let bytes = tokio::fs::read(&path)
    .await
    .map_err(|source| LoaderError::SiteDefault { path: path.clone(), source })?;
  info!(path = ?path, "loaded site defaults");
  Ok(Some(bytes))
}

fn check_playbook(settings: &Settings) -> Result<(), LoaderError> {
  let required = [
    settings.paths.playbook_dir.clone(),
    settings.inventory_file(),
    settings.paths.util_dir.join("playbook.yml"),
    settings.static_roles_dir(),
  ];
  for path in required {
    if !path.exists() {
      return Err(LoaderError::Playbook { path });
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  use tempfile::TempDir;
  use tracing_test::traced_test;

  use crate::daemon::StreamRecord;
  use crate::util::testutil::{ContextFixture, FakeConnector, FakeDaemon, fixture_settings};

  #[test]
  fn applicability_follows_settings() {
    let mut settings = Settings::default();
    assert_eq!(
      applicable(&settings),
      vec![
        LoaderKind::License,
        LoaderKind::Daemon,
        LoaderKind::SiteDefault,
        LoaderKind::Playbook
      ]
    );

    settings.deployment = DeploymentType::Multiple;
    settings.registry = Some("registry.local".to_string());
    settings.namespace = Some("team".to_string());
    let kinds = applicable(&settings);
    assert!(!kinds.contains(&LoaderKind::SiteDefault));
    assert!(kinds.contains(&LoaderKind::RegistryAuth));
    assert!(kinds.contains(&LoaderKind::RegistryCheck));

    settings.deployment = DeploymentType::Single;
    assert!(!applicable(&settings).contains(&LoaderKind::RegistryCheck));
  }

  #[tokio::test]
  async fn loaders_succeed_on_a_complete_tree() {
    let fixture = ContextFixture::new();
    let mut settings = fixture_settings(fixture.root());
    let license_path = fixture.write("license.txt", "SETINIT");
    let site_default = fixture.write("sitedefault.yml", "config: {}\n");
    settings.license.license = Some(license_path);
    settings.license.site_default = Some(site_default);

    let daemon = Arc::new(FakeDaemon::default());
    let preflight = run_loaders(Arc::new(settings), Arc::new(FakeConnector::new(daemon.clone())))
      .await
      .unwrap();

    assert_eq!(preflight.license.license.as_deref(), Some(&b"SETINIT"[..]));
    assert_eq!(preflight.license.site_default.as_deref(), Some(&b"config: {}\n"[..]));
    assert!(preflight.auth.is_none());
    assert_eq!(daemon.pulled(), vec!["centos:7".to_string()]);
  }

  #[tokio::test]
  async fn base_image_error_fails_the_join() {
    let fixture = ContextFixture::new();
    let settings = fixture_settings(fixture.root());
    let daemon = Arc::new(FakeDaemon::default().with_pull(vec![
      Ok(StreamRecord::status("Pulling from library/centos")),
      Ok(StreamRecord::error("manifest unknown")),
    ]));

    let err = run_loaders(Arc::new(settings), Arc::new(FakeConnector::new(daemon)))
      .await
      .unwrap_err();
    assert!(matches!(err, LoaderError::BaseImage { ref message, .. } if message == "manifest unknown"));
  }

  #[tokio::test]
  #[traced_test]
  async fn missing_playbook_fails_the_join() {
    let temp = TempDir::new().unwrap();
    let settings = fixture_settings(temp.path());
    let daemon = Arc::new(FakeDaemon::default());
    let err = run_loaders(Arc::new(settings), Arc::new(FakeConnector::new(daemon)))
      .await
      .unwrap_err();
    assert!(matches!(err, LoaderError::Playbook { .. }));
    assert!(logs_contain("loader failed"));
  }

  #[tokio::test]
  async fn configured_site_default_must_exist() {
    let err = load_site_default(Some(Path::new("/nonexistent/sitedefault.yml")))
      .await
      .unwrap_err();
    assert!(matches!(err, LoaderError::SiteDefault { .. }));
  }
}
