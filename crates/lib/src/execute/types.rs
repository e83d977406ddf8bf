//! Types for running builds.
//!
//! This module defines the events workers send to the orchestrator, per-unit failures,
//! run errors, and the summary a finished run reports.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::inventory::InventoryError;
use crate::unit::{BuildUnit, UnitStatus};

/// Phase a unit failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
  PreBuild,
  Build,
  Push,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Phase::PreBuild => "pre-build",
      Phase::Build => "build",
      Phase::Push => "push",
    })
  }
}

/// A failure of a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
  pub unit: String,
  pub phase: Phase,
  pub message: String,
  pub log_path: PathBuf,
}

impl UnitFailure {
  pub fn new(unit: &BuildUnit, phase: Phase, err: impl fmt::Display) -> Self {
    Self {
      unit: unit.name().to_string(),
      phase,
      message: err.to_string(),
      log_path: unit.log().path().to_path_buf(),
    }
  }
}

impl fmt::Display for UnitFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} failed during {}: {}", self.unit, self.phase, self.message)?;
    let log = self.log_path.display().to_string();
    // daemon stream errors already carry the log path
    if !self.message.contains(&log) {
      write!(f, "\n\nDebugging: {log}")?;
    }
    Ok(())
  }
}

impl std::error::Error for UnitFailure {}

/// How a unit left the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
  Done,
  /// Not processed: not loaded, or the worker or run had already stopped.
  Skipped,
  Failed(UnitFailure),
}

/// Messages from workers to the orchestrator.
#[derive(Debug)]
pub enum RunEvent {
  Progress { unit: String, line: String },
  Sized { unit: String, bytes: u64 },
  /// Sent exactly once per dequeued unit, on every exit path.
  Completed {
    index: usize,
    unit: BuildUnit,
    outcome: UnitOutcome,
  },
}

#[derive(Debug, Error)]
pub enum RunError {
  #[error(transparent)]
  Unit(#[from] UnitFailure),

  #[error(transparent)]
  Inventory(#[from] InventoryError),

  #[error("unable to create run directory {path}: {source}")]
  RunDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no units selected for building")]
  NothingToBuild,

  #[error("run cancelled")]
  Cancelled,

  #[error("{0} task panicked")]
  Panicked(String),
}

/// Per-unit line of a run summary.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
  pub name: String,
  pub reference: String,
  pub status: UnitStatus,
  pub size: u64,
  pub build_time: Option<Duration>,
  pub push_time: Option<Duration>,
}

impl From<&BuildUnit> for UnitReport {
  fn from(unit: &BuildUnit) -> Self {
    Self {
      name: unit.name().to_string(),
      reference: unit.reference().to_string(),
      status: unit.status(),
      size: unit.image_size,
      build_time: unit.timings.build_duration(),
      push_time: unit.timings.push_duration(),
    }
  }
}

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub run_dir: PathBuf,
  pub units: Vec<UnitReport>,
  pub total_size: u64,
  pub elapsed: Duration,
}

impl RunSummary {
  pub fn built(&self) -> usize {
    self
      .units
      .iter()
      .filter(|u| matches!(u.status, UnitStatus::Built | UnitStatus::Pushed))
      .count()
  }

  pub fn failed(&self) -> usize {
    self.units.iter().filter(|u| u.status == UnitStatus::Failed).count()
  }

  /// Selected units that never reached a final state, e.g. after a cancelled run.
  pub fn unfinished(&self) -> usize {
    self.units.iter().filter(|u| !u.status.is_terminal()).count()
  }

  pub fn is_success(&self) -> bool {
    self.failed() == 0 && self.unfinished() == 0
  }
}
