//! Shared test helpers for library integration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tempfile::TempDir;

use rolebuild_lib::daemon::{
  BuildRequest, Daemon, DaemonConnector, DaemonError, RecordStream, RegistryAuth, StreamRecord,
};
use rolebuild_lib::execute::CancelSignal;
use rolebuild_lib::settings::Settings;
use rolebuild_lib::unit::ConfigDocument;

/// Isolated support tree with one synthesized role per host.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  /// Create a tree whose inventory lists `hosts`, each with its own variables file.
  pub fn with_hosts(hosts: &[&str]) -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };

    env.write_file("util/playbook.yml", "- hosts: localhost\n");
    env.write_file("util/entrypoint", "#!/bin/sh\nexec \"$@\"\n");
    env.write_file("util/task.yml", "- debug: msg=ok\n");
    for role in ["ansible", "tini", "sas-prerequisites", "sas-install-base-packages", "sas-java", "cloud-config"] {
      env.write_file(&format!("util/static-roles-full/{role}/tasks/main.yml"), &format!("# {role}\n"));
    }

    env.write_file("playbook/vars.yml", "ORDER: 09ABCD\n");
    env.write_file("playbook/group_vars/all", "ALL: true\n");
    for host in hosts {
      env.write_file(&format!("playbook/group_vars/{host}"), &format!("HOST: {host}\n"));
    }
    let inventory = format!("[sas-all:children]\n{}\n", hosts.join("\n"));
    env.write_file("playbook/inventory.ini", &inventory);
    env
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Settings pointing into this tree with a fixed tag and `workers` workers.
  pub fn settings(&self, workers: usize) -> Settings {
    let mut settings = Settings {
      tag: Some("it".to_string()),
      workers,
      ..Default::default()
    };
    settings.paths.util_dir = self.root().join("util");
    settings.paths.playbook_dir = self.root().join("playbook");
    settings.paths.builds_dir = self.root().join("builds");
    settings
  }

  pub fn document(&self) -> ConfigDocument {
    ConfigDocument::from_yaml("consul:\n  ports: [8500]\n").unwrap()
  }
}

/// Names in `names` as owned strings.
pub fn names(names: &[&str]) -> Vec<String> {
  names.iter().map(|n| n.to_string()).collect()
}

#[derive(Default)]
struct Calls {
  built: Vec<String>,
  pushed: Vec<String>,
}

/// Daemon double: every build succeeds unless its tag contains a failing name.
#[derive(Default)]
pub struct MockDaemon {
  failing: Vec<String>,
  size: u64,
  calls: Mutex<Calls>,
  /// Raised once, when the first built image is sized.
  cancel_on_size: Mutex<Option<CancelSignal>>,
}

impl MockDaemon {
  pub fn new(size: u64) -> Self {
    Self {
      size,
      ..Default::default()
    }
  }

  pub fn failing(mut self, name: &str) -> Self {
    self.failing.push(name.to_string());
    self
  }

  /// Cancel `signal` right after the first image is built and sized.
  pub fn cancel_after_first_build(&self, signal: CancelSignal) {
    *self.cancel_on_size.lock().unwrap() = Some(signal);
  }

  pub fn built(&self) -> Vec<String> {
    let mut built = self.calls.lock().unwrap().built.clone();
    built.sort();
    built
  }

  pub fn pushed(&self) -> Vec<String> {
    let mut pushed = self.calls.lock().unwrap().pushed.clone();
    pushed.sort();
    pushed
  }
}

#[async_trait]
impl Daemon for MockDaemon {
  async fn ping(&self) -> Result<(), DaemonError> {
    Ok(())
  }

  fn build_image(&self, request: BuildRequest) -> RecordStream<'_> {
    self.calls.lock().unwrap().built.push(request.tag.clone());
    let last = if self.failing.iter().any(|n| request.tag.contains(n.as_str())) {
      StreamRecord::error("The command '/bin/sh -c ansible-playbook' returned a non-zero code: 2")
    } else {
      StreamRecord::stream("Successfully tagged\n")
    };
    stream::iter(vec![Ok(StreamRecord::stream("Step 1/9 : FROM centos:7\n")), Ok(last)]).boxed()
  }

  fn push_image(&self, reference: &str, _auth: Option<RegistryAuth>) -> RecordStream<'_> {
    self.calls.lock().unwrap().pushed.push(reference.to_string());
    stream::iter(vec![Ok(StreamRecord::status("Pushed"))]).boxed()
  }

  fn pull_image(&self, _image: &str) -> RecordStream<'_> {
    stream::iter(Vec::new()).boxed()
  }

  async fn image_size(&self, _reference: &str) -> Result<u64, DaemonError> {
    if let Some(signal) = self.cancel_on_size.lock().unwrap().take() {
      signal.cancel();
    }
    Ok(self.size)
  }
}

/// A connector handing out `daemon` to every unit.
pub fn connector(daemon: &Arc<MockDaemon>) -> Arc<dyn DaemonConnector> {
  Arc::new(MockConnector(daemon.clone()))
}

struct MockConnector(Arc<MockDaemon>);

impl DaemonConnector for MockConnector {
  fn connect(&self) -> Result<Arc<dyn Daemon>, DaemonError> {
    Ok(self.0.clone())
  }
}
