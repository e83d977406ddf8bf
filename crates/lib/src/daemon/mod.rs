//! Image daemon access.
//!
//! The engine talks to the daemon only through the [`Daemon`] trait. Build, push and pull
//! return a stream of [`StreamRecord`]s that [`stream::StreamResponseReader`] consumes.
//! [`docker::DockerDaemon`] is the Engine API adapter; tests substitute an in-memory fake.
//!
//! # Submodules
//!
//! - [`docker`] - bollard-backed daemon and connector
//! - [`stream`] - progress stream reader

pub mod docker;
pub mod stream;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::{DockerConnector, DockerDaemon};
pub use stream::{StreamError, StreamResponseReader};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
  #[error("unable to connect to the image daemon: {0}")]
  Connect(String),

  /// A record could not be decoded. Readers skip these.
  #[error("undecodable daemon response: {0}")]
  Decode(String),

  #[error("daemon request failed: {0}")]
  Transport(String),

  #[error("no image matches {0}")]
  ImageNotFound(String),
}

impl DaemonError {
  pub fn is_benign(&self) -> bool {
    matches!(self, DaemonError::Decode(_))
  }
}

/// One decoded record of a build, push or pull progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
  #[serde(default)]
  pub stream: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub error: Option<String>,
}

impl StreamRecord {
  pub fn stream(text: impl Into<String>) -> Self {
    Self {
      stream: Some(text.into()),
      ..Default::default()
    }
  }

  pub fn status(text: impl Into<String>) -> Self {
    Self {
      status: Some(text.into()),
      ..Default::default()
    }
  }

  pub fn error(text: impl Into<String>) -> Self {
    Self {
      error: Some(text.into()),
      ..Default::default()
    }
  }
}

/// Progress records of one daemon call. The stream may borrow the daemon handle it came from.
pub type RecordStream<'a> = BoxStream<'a, Result<StreamRecord, DaemonError>>;

/// Parameters of one image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
  /// The sealed context archive, sent verbatim.
  pub context: Bytes,
  pub tag: String,
  pub dockerfile: String,
  pub build_args: BTreeMap<String, String>,
  pub remove_intermediate: bool,
  pub force_remove: bool,
  /// `host:ip` entries added to the build containers' hosts file.
  pub extra_hosts: Vec<String>,
}

/// Credentials for pushing to a registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
  pub username: Option<String>,
  pub password: Option<String>,
  pub identity_token: Option<String>,
  pub server_address: String,
}

impl fmt::Debug for RegistryAuth {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegistryAuth")
      .field("username", &self.username)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("identity_token", &self.identity_token.as_ref().map(|_| "<redacted>"))
      .field("server_address", &self.server_address)
      .finish()
  }
}

/// The image daemon operations the engine relies on.
#[async_trait]
pub trait Daemon: Send + Sync {
  async fn ping(&self) -> Result<(), DaemonError>;

  fn build_image(&self, request: BuildRequest) -> RecordStream<'_>;

  fn push_image(&self, reference: &str, auth: Option<RegistryAuth>) -> RecordStream<'_>;

  fn pull_image(&self, image: &str) -> RecordStream<'_>;

  /// Size in bytes of the image matching `reference`.
  async fn image_size(&self, reference: &str) -> Result<u64, DaemonError>;
}

/// Hands out daemon handles. Every unit gets its own.
pub trait DaemonConnector: Send + Sync {
  fn connect(&self) -> Result<Arc<dyn Daemon>, DaemonError>;
}
