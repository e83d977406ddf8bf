//! Build units.
//!
//! A [`BuildUnit`] is one host to turn into one image. It carries the unit's resolved
//! configuration, its lifecycle status and the artifacts produced for it: the generated
//! recipe, the sealed build context and the measured image size.
//!
//! # Submodules
//!
//! - [`config`] - configuration document and default injection
//! - [`status`] - the lifecycle state machine

pub mod config;
pub mod status;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::consts::UNIT_LOG_FILE;
use crate::context::SealedContext;
use crate::settings::Settings;

pub use config::{ConfigDocument, ConfigError, Resources, UnitConfig};
pub use status::{TransitionError, UnitStatus};

/// Start and end instants of the build and push phases, used only for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitTimings {
  pub build_start: Option<Instant>,
  pub build_end: Option<Instant>,
  pub push_start: Option<Instant>,
  pub push_end: Option<Instant>,
}

impl UnitTimings {
  pub fn build_duration(&self) -> Option<Duration> {
    Some(self.build_end?.duration_since(self.build_start?))
  }

  pub fn push_duration(&self) -> Option<Duration> {
    Some(self.push_end?.duration_since(self.push_start?))
  }
}

/// One host to build into an image.
#[derive(Debug)]
pub struct BuildUnit {
  /// Canonical lowercase name.
  name: String,
  /// `<project>-<name>`.
  image_name: String,
  tag: String,
  /// Fully qualified reference used for build, size lookup and push.
  reference: String,
  status: UnitStatus,
  pub config: UnitConfig,
  /// Directory holding the unit's context archive and log.
  pub build_dir: PathBuf,
  pub recipe: Option<String>,
  pub context: Option<SealedContext>,
  pub image_size: u64,
  pub timings: UnitTimings,
}

impl BuildUnit {
  /// Create a unit for `name` inside the run directory `run_dir`.
  pub fn new(name: &str, tag: &str, settings: &Settings, run_dir: &Path) -> Self {
    let name = name.to_lowercase();
    let image_name = format!("{}-{}", settings.project_name, name);
    let reference = match (&settings.registry, &settings.namespace) {
      (Some(registry), Some(namespace)) => format!("{registry}/{namespace}/{image_name}:{tag}"),
      _ => format!("{image_name}:{tag}"),
    };
    let build_dir = run_dir.join(&image_name);

    Self {
      name,
      image_name,
      tag: tag.to_string(),
      reference,
      status: UnitStatus::Unknown,
      config: UnitConfig::default(),
      build_dir,
      recipe: None,
      context: None,
      image_size: 0,
      timings: UnitTimings::default(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn image_name(&self) -> &str {
    &self.image_name
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn reference(&self) -> &str {
    &self.reference
  }

  pub fn status(&self) -> UnitStatus {
    self.status
  }

  /// Move to `next`, leaving the status unchanged if the move is illegal.
  pub fn transition(&mut self, next: UnitStatus) -> Result<(), TransitionError> {
    self.status = self.status.transition(next)?;
    debug!(unit = %self.name, status = %self.status, "status changed");
    Ok(())
  }

  /// Mark the unit failed. Terminal units keep their status.
  pub fn fail(&mut self) {
    if self.status.can_transition(UnitStatus::Failed) {
      self.status = UnitStatus::Failed;
    }
  }

  /// Whether the unit participates in the build phase at all.
  pub fn is_selected(&self) -> bool {
    self.status != UnitStatus::DoNotBuild
  }

  pub fn log(&self) -> UnitLog {
    UnitLog::new(self.build_dir.join(UNIT_LOG_FILE))
  }
}

/// The per-unit `log.txt`.
///
/// Writers are opened in append mode and released when dropped, so every phase scopes
/// its own handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLog {
  path: PathBuf,
}

impl UnitLog {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn writer(&self) -> std::io::Result<UnitLogWriter> {
    let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
    Ok(UnitLogWriter {
      inner: BufWriter::new(file),
    })
  }

  /// Append a single line, opening and closing the log around it.
  pub fn append(&self, line: &str) -> std::io::Result<()> {
    let mut writer = self.writer()?;
    writer.line(line)?;
    writer.flush()
  }
}

pub struct UnitLogWriter {
  inner: BufWriter<File>,
}

impl UnitLogWriter {
  pub fn line(&mut self, line: &str) -> std::io::Result<()> {
    writeln!(self.inner, "{line}")
  }

  pub fn flush(&mut self) -> std::io::Result<()> {
    self.inner.flush()
  }
}
