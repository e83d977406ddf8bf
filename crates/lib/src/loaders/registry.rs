//! Registry credentials and reachability.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{debug, info};

use super::LoaderError;
use crate::daemon::RegistryAuth;

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
  #[serde(default)]
  auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
  #[serde(default)]
  auth: Option<String>,
  #[serde(default)]
  username: Option<String>,
  #[serde(default)]
  password: Option<String>,
  #[serde(default)]
  identitytoken: Option<String>,
}

/// Location of the Docker client config: `$DOCKER_CONFIG/config.json`, else
/// `$HOME/.docker/config.json`.
pub fn docker_config_path() -> Option<PathBuf> {
  if let Some(dir) = std::env::var_os("DOCKER_CONFIG").filter(|d| !d.is_empty()) {
    return Some(PathBuf::from(dir).join("config.json"));
  }
  std::env::var_os("HOME")
    .filter(|h| !h.is_empty())
    .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Strip scheme, path and trailing slashes so `https://reg.io/v1/` compares equal to `reg.io`.
fn registry_host(value: &str) -> &str {
  let value = value
    .strip_prefix("https://")
    .or_else(|| value.strip_prefix("http://"))
    .unwrap_or(value);
  value.split('/').next().unwrap_or(value)
}

/// Read the credentials for `registry` from the Docker client config at `path`.
pub fn load_registry_auth(path: &Path, registry: &str) -> Result<RegistryAuth, LoaderError> {
  let config_err = |message: String| LoaderError::DockerConfig {
    path: path.to_path_buf(),
    message,
  };

  debug!(path = ?path, registry = %registry, "reading registry credentials");
  let content = std::fs::read_to_string(path)
    .map_err(|e| config_err(format!("{e}. Run `docker login {registry}` before building")))?;
  let config: DockerConfigFile = serde_json::from_str(&content).map_err(|e| config_err(e.to_string()))?;

  let wanted = registry_host(registry);
  let entry = config
    .auths
    .iter()
    .find(|(key, _)| registry_host(key) == wanted)
    .map(|(_, entry)| entry)
    .ok_or_else(|| LoaderError::NoCredentials {
      registry: registry.to_string(),
      path: path.to_path_buf(),
    })?;

  let (mut username, mut password) = (entry.username.clone(), entry.password.clone());
  if let Some(encoded) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
    let decoded = STANDARD
      .decode(encoded.trim())
      .map_err(|e| config_err(format!("invalid auth for {registry}: {e}")))?;
    let decoded = String::from_utf8(decoded).map_err(|e| config_err(format!("invalid auth for {registry}: {e}")))?;
    let (user, pass) = decoded
      .split_once(':')
      .ok_or_else(|| config_err(format!("invalid auth for {registry}: expected user:password")))?;
    username = Some(user.to_string());
    password = Some(pass.to_string());
  }

  if username.is_none() && entry.identitytoken.is_none() {
    return Err(LoaderError::NoCredentials {
      registry: registry.to_string(),
      path: path.to_path_buf(),
    });
  }

  Ok(RegistryAuth {
    username,
    password,
    identity_token: entry.identitytoken.clone(),
    server_address: registry.to_string(),
  })
}

/// Check the registry answers over TLS with a success status.
pub async fn check_registry(registry: &str) -> Result<(), LoaderError> {
  let unreachable = |message: String| LoaderError::RegistryUnreachable {
    registry: registry.to_string(),
    message,
  };

  if registry.starts_with("http://") {
    return Err(unreachable("the registry must be served over https".to_string()));
  }
  let url = if registry.starts_with("https://") {
    registry.to_string()
  } else {
    format!("https://{registry}")
  };

  let client = reqwest::Client::builder()
    .timeout(Duration::from_secs(30))
    .build()
    .map_err(|e| unreachable(e.to_string()))?;
  let response = client.get(&url).send().await.map_err(|e| unreachable(e.to_string()))?;

  if !response.status().is_success() {
    return Err(unreachable(format!("HTTP {}", response.status())));
  }
  info!(url = %url, status = %response.status(), "registry reachable");
  Ok(())
}
