//! Test utilities for rolebuild-lib.
//!
//! This module provides an on-disk playbook fixture and an in-memory daemon for tests
//! that exercise context assembly, the loaders and the worker pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tempfile::TempDir;

use crate::daemon::{BuildRequest, Daemon, DaemonConnector, DaemonError, RecordStream, RegistryAuth, StreamRecord};
use crate::settings::Settings;

const STATIC_ROLES: &[&str] = &[
  "ansible",
  "tini",
  "sas-prerequisites",
  "sas-install-base-packages",
  "sas-java",
  "cloud-config",
  "sas-install",
  "casserver-config",
];

/// A temporary support tree: `util/`, static roles and a generated playbook.
///
/// `httpproxy` is configured but has no static role, so it is always synthesized.
pub struct ContextFixture {
  temp: TempDir,
}

impl ContextFixture {
  pub fn new() -> Self {
    let fixture = Self {
      temp: TempDir::new().unwrap(),
    };

    fixture.write("util/playbook.yml", "- hosts: localhost\n  roles: []\n");
    fixture.write("util/entrypoint", "#!/bin/sh\nexec \"$@\"\n");
    fixture.write("util/task.yml", "- name: run role\n  debug: msg=ok\n");
    fixture.write("util/ansible.cfg", "[defaults]\nhost_key_checking = False\n");

    for role in STATIC_ROLES {
      fixture.write(
        &format!("util/static-roles-full/{role}/tasks/main.yml"),
        &format!("- name: {role}\n  debug: msg={role}\n"),
      );
    }
    fixture.write("util/static-roles-full/tini/templates/entrypoint", "#!/bin/tini\n");

    fixture.write("playbook/vars.yml", "ORDER: 09ABCD\n");
    fixture.write("playbook/group_vars/all", "REPOSITORY_WAREHOUSE: https://mirror.local\n");
    fixture.write("playbook/group_vars/httpproxy", "HTTPD_CERT_PATH: /etc/pki\n");
    fixture.write("playbook/internal/soe_defaults.yml", "SAS_INSTALL: true\n");
    fixture.write(
      "playbook/inventory.ini",
      "deployTarget ansible_connection=local\n\n[sas-all:children]\nhttpproxy\nCommandLine\n",
    );

    fixture
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  /// Write `content` to `rel` under the fixture root, creating parents.
  pub fn write(&self, rel: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn config_document(&self) -> String {
    "\
httpproxy:
  ports:
    - 80
    - 443
  environment:
    - HTTPD_PORT=80
"
    .to_string()
  }
}

/// Settings pointing every support directory into `root`.
pub fn fixture_settings(root: &Path) -> Settings {
  let mut settings = Settings {
    tag: Some("test".to_string()),
    workers: 2,
    ..Default::default()
  };
  settings.paths.util_dir = root.join("util");
  settings.paths.playbook_dir = root.join("playbook");
  settings.paths.builds_dir = root.join("builds");
  settings
}

type Script = Vec<Result<StreamRecord, DaemonError>>;

#[derive(Default)]
struct Calls {
  pulled: Vec<String>,
  built: Vec<String>,
  pushed: Vec<String>,
}

/// In-memory daemon. Builds and pushes succeed unless scripted otherwise.
#[derive(Default)]
pub struct FakeDaemon {
  pull: Option<Script>,
  /// `(reference substring, error message)` builds that fail.
  build_errors: Vec<(String, String)>,
  image_size: u64,
  calls: Mutex<Calls>,
}

impl FakeDaemon {
  pub fn with_pull(mut self, records: Script) -> Self {
    self.pull = Some(records);
    self
  }

  pub fn with_build_error(mut self, reference: &str, message: &str) -> Self {
    self.build_errors.push((reference.to_string(), message.to_string()));
    self
  }

  pub fn with_image_size(mut self, bytes: u64) -> Self {
    self.image_size = bytes;
    self
  }

  pub fn pulled(&self) -> Vec<String> {
    self.calls.lock().unwrap().pulled.clone()
  }

  pub fn built(&self) -> Vec<String> {
    self.calls.lock().unwrap().built.clone()
  }

  pub fn pushed(&self) -> Vec<String> {
    self.calls.lock().unwrap().pushed.clone()
  }
}

#[async_trait]
impl Daemon for FakeDaemon {
  async fn ping(&self) -> Result<(), DaemonError> {
    Ok(())
  }

  fn build_image(&self, request: BuildRequest) -> RecordStream<'_> {
    self.calls.lock().unwrap().built.push(request.tag.clone());
    let mut records = vec![
      Ok(StreamRecord::stream("Step 1/2 : FROM centos:7\n")),
      Ok(StreamRecord::stream(format!("context {} bytes\n", request.context.len()))),
    ];
    if let Some((_, message)) = self.build_errors.iter().find(|(r, _)| request.tag.contains(r.as_str())) {
      records.push(Ok(StreamRecord::error(message.clone())));
    } else {
      records.push(Ok(StreamRecord::stream("Successfully built\n")));
    }
    stream::iter(records).boxed()
  }

  fn push_image(&self, reference: &str, _auth: Option<RegistryAuth>) -> RecordStream<'_> {
    self.calls.lock().unwrap().pushed.push(reference.to_string());
    stream::iter(vec![Ok(StreamRecord::status("Pushed"))]).boxed()
  }

  fn pull_image(&self, image: &str) -> RecordStream<'_> {
    self.calls.lock().unwrap().pulled.push(image.to_string());
    let records = self
      .pull
      .clone()
      .unwrap_or_else(|| vec![Ok(StreamRecord::status("Downloaded newer image"))]);
    stream::iter(records).boxed()
  }

  async fn image_size(&self, _reference: &str) -> Result<u64, DaemonError> {
    Ok(self.image_size)
  }
}

/// Hands out the same [`FakeDaemon`] to every caller.
pub struct FakeConnector {
  daemon: Arc<FakeDaemon>,
}

impl FakeConnector {
  pub fn new(daemon: Arc<FakeDaemon>) -> Self {
    Self { daemon }
  }
}

impl DaemonConnector for FakeConnector {
  fn connect(&self) -> Result<Arc<dyn Daemon>, DaemonError> {
    Ok(self.daemon.clone())
  }
}
