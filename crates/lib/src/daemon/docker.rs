//! Docker Engine API adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions, PushImageOptions};
use futures::StreamExt;
use tracing::debug;

use super::{BuildRequest, Daemon, DaemonConnector, DaemonError, RecordStream, RegistryAuth, StreamRecord};

/// A daemon reached over the local Docker socket.
#[derive(Debug, Clone)]
pub struct DockerDaemon {
  docker: Docker,
}

impl DockerDaemon {
  pub fn connect() -> Result<Self, DaemonError> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| DaemonError::Connect(e.to_string()))?;
    Ok(Self { docker })
  }
}

/// Opens a fresh local connection per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerConnector;

impl DaemonConnector for DockerConnector {
  fn connect(&self) -> Result<Arc<dyn Daemon>, DaemonError> {
    Ok(Arc::new(DockerDaemon::connect()?))
  }
}

fn map_error(err: bollard::errors::Error) -> DaemonError {
  use bollard::errors::Error;

  match &err {
    Error::JsonDataError { .. } | Error::JsonSerdeError { .. } => DaemonError::Decode(err.to_string()),
    _ => DaemonError::Transport(err.to_string()),
  }
}

/// Split `repo:tag` into its parts. A `:` before the last `/` belongs to a registry port.
fn split_reference(reference: &str) -> (&str, Option<&str>) {
  let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
  match reference[name_start..].rfind(':') {
    Some(i) => (&reference[..name_start + i], Some(&reference[name_start + i + 1..])),
    None => (reference, None),
  }
}

fn credentials(auth: RegistryAuth) -> DockerCredentials {
  DockerCredentials {
    username: auth.username,
    password: auth.password,
    identitytoken: auth.identity_token,
    serveraddress: Some(auth.server_address),
    ..Default::default()
  }
}

#[async_trait]
impl Daemon for DockerDaemon {
  async fn ping(&self) -> Result<(), DaemonError> {
    self.docker.ping().await.map(|_| ()).map_err(|e| DaemonError::Connect(e.to_string()))
  }

  fn build_image(&self, request: BuildRequest) -> RecordStream<'_> {
    let options = BuildImageOptions {
      dockerfile: request.dockerfile,
      t: request.tag,
      buildargs: request.build_args.into_iter().collect::<HashMap<_, _>>(),
      rm: request.remove_intermediate,
      forcerm: request.force_remove,
      extrahosts: (!request.extra_hosts.is_empty()).then(|| request.extra_hosts.join(",")),
      ..Default::default()
    };

    self
      .docker
      .build_image(options, None, Some(request.context))
      .map(|item| {
        item.map_err(map_error).map(|info| StreamRecord {
          stream: info.stream,
          status: info.status,
          error: info.error.or_else(|| info.error_detail.and_then(|d| d.message)),
        })
      })
      .boxed()
  }

  fn push_image(&self, reference: &str, auth: Option<RegistryAuth>) -> RecordStream<'_> {
    let (name, tag) = split_reference(reference);
    debug!(image = %name, tag = ?tag, "pushing image");
    let options = tag.map(|tag| PushImageOptions { tag: tag.to_string() });

    self
      .docker
      .push_image(name, options, auth.map(credentials))
      .map(|item| {
        item.map_err(map_error).map(|info| StreamRecord {
          stream: None,
          status: info.status,
          error: info.error,
        })
      })
      .boxed()
  }

  fn pull_image(&self, image: &str) -> RecordStream<'_> {
    let options = CreateImageOptions {
      from_image: image.to_string(),
      ..Default::default()
    };

    self
      .docker
      .create_image(Some(options), None, None)
      .map(|item| {
        item.map_err(map_error).map(|info| StreamRecord {
          stream: None,
          status: info.status,
          error: info.error,
        })
      })
      .boxed()
  }

  async fn image_size(&self, reference: &str) -> Result<u64, DaemonError> {
    let filters = HashMap::from([("reference".to_string(), vec![reference.to_string()])]);
    let images = self
      .docker
      .list_images(Some(ListImagesOptions::<String> {
        filters,
        ..Default::default()
      }))
      .await
      .map_err(map_error)?;

    images
      .first()
      .map(|image| image.size.max(0) as u64)
      .ok_or_else(|| DaemonError::ImageNotFound(reference.to_string()))
  }
}
