//! Run orchestration.
//!
//! This module drives a whole run. It handles:
//! - Unit collection and `build_only` selection
//! - The unbounded pre-build fan-out (context assembly per unit)
//! - The bounded build/push worker pool
//! - Fan-in of completion events and run-wide aggregates
//! - Fail-fast cancellation on the first unit failure

pub mod cancel;
pub mod pool;
pub mod prebuild;
pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::consts::{RECIPE_VERSION, TIMESTAMP_FORMAT};
use crate::daemon::{DaemonConnector, RegistryAuth};
use crate::inventory::apply_selection;
use crate::license::LicenseMaterial;
use crate::loaders::Preflight;
use crate::settings::Settings;
use crate::unit::{BuildUnit, ConfigDocument};

use pool::WorkerContext;
use prebuild::{PrebuildContext, PrebuildOutput};

pub use cancel::CancelSignal;
pub use types::{Phase, RunError, RunEvent, RunSummary, UnitFailure, UnitOutcome, UnitReport};

/// Owns the units of one run and drives them to completion.
pub struct Orchestrator {
  settings: Arc<Settings>,
  document: Arc<ConfigDocument>,
  license: Arc<LicenseMaterial>,
  connector: Arc<dyn DaemonConnector>,
  auth: Option<RegistryAuth>,
  units: Vec<BuildUnit>,
  tag: String,
  run_dir: PathBuf,
  /// Longest unit name, for aligned progress output.
  name_width: usize,
  cancel: CancelSignal,
  total_size: u64,
  elapsed: Duration,
}

impl Orchestrator {
  /// Create the units for `names` and apply the `build_only` selection.
  ///
  /// # Arguments
  ///
  /// * `settings` - Validated run settings
  /// * `names` - Unit names in inventory order
  /// * `document` - The per-unit configuration document
  /// * `preflight` - License material and registry credentials from the loaders
  /// * `connector` - Source of per-unit daemon handles
  ///
  /// # Returns
  ///
  /// The orchestrator, or an error if nothing is left to build or `build_only`
  /// names an unknown unit.
  pub fn new(
    settings: Arc<Settings>,
    names: &[String],
    document: ConfigDocument,
    preflight: Preflight,
    connector: Arc<dyn DaemonConnector>,
  ) -> Result<Self, RunError> {
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
    let tag = settings
      .tag
      .clone()
      .unwrap_or_else(|| format!("{RECIPE_VERSION}-{timestamp}"));
    let run_dir = settings
      .paths
      .builds_dir
      .join(format!("{}-{timestamp}", settings.deployment));

    let mut units: Vec<BuildUnit> = names
      .iter()
      .map(|name| BuildUnit::new(name, &tag, &settings, &run_dir))
      .collect();
    let selected = apply_selection(&mut units, &settings.build_only)?;
    if selected == 0 {
      return Err(RunError::NothingToBuild);
    }

    let name_width = units.iter().map(|u| u.name().len()).max().unwrap_or(0);
    info!(units = units.len(), selected, tag = %tag, run_dir = ?run_dir, "collected units");

    Ok(Self {
      settings,
      document: Arc::new(document),
      license: Arc::new(preflight.license),
      connector,
      auth: preflight.auth,
      units,
      tag,
      run_dir,
      name_width,
      cancel: CancelSignal::new(),
      total_size: 0,
      elapsed: Duration::ZERO,
    })
  }

  pub fn units(&self) -> &[BuildUnit] {
    &self.units
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn run_dir(&self) -> &Path {
    &self.run_dir
  }

  pub fn name_width(&self) -> usize {
    self.name_width
  }

  /// Raising this signal stops the run at the next checkpoint of every task.
  pub fn cancel_signal(&self) -> CancelSignal {
    self.cancel.clone()
  }

  pub fn total_size(&self) -> u64 {
    self.total_size
  }

  /// Run pre-build for every selected unit, then build and push them.
  ///
  /// `progress` receives `(unit, line)` pairs from the workers. The first unit failure
  /// cancels the run; every task is awaited before that failure is returned. The
  /// per-unit outcome stays available through [`Orchestrator::summary`] either way.
  pub async fn run(&mut self, mut progress: impl FnMut(&str, &str)) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let result = self.run_phases(&mut progress).await;
    self.elapsed = started.elapsed();

    let summary = self.summary();
    info!(
      built = summary.built(),
      failed = summary.failed(),
      total_size = summary.total_size,
      elapsed = ?summary.elapsed,
      "run finished"
    );
    result.map(|()| summary)
  }

  async fn run_phases(&mut self, progress: &mut impl FnMut(&str, &str)) -> Result<(), RunError> {
    tokio::fs::create_dir_all(&self.run_dir)
      .await
      .map_err(|source| RunError::RunDir {
        path: self.run_dir.clone(),
        source,
      })?;

    self.checkpoint("before pre-build")?;
    if let Some(err) = self.prebuild_all().await {
      return Err(err);
    }
    self.checkpoint("before building")?;
    if let Some(err) = self.build_all(progress).await {
      return Err(err);
    }

    let unfinished = self
      .units
      .iter()
      .filter(|u| u.is_selected() && !u.status().is_terminal())
      .count();
    if self.cancel.is_cancelled() && unfinished > 0 {
      warn!(unfinished, "run cancelled with units left unbuilt");
      return Err(RunError::Cancelled);
    }
    Ok(())
  }

  fn checkpoint(&self, stage: &str) -> Result<(), RunError> {
    if self.cancel.is_cancelled() {
      warn!(stage, "run cancelled");
      return Err(RunError::Cancelled);
    }
    Ok(())
  }

  /// Assemble every selected unit concurrently. Returns the first failure.
  async fn prebuild_all(&mut self) -> Option<RunError> {
    let ctx = PrebuildContext {
      settings: self.settings.clone(),
      document: self.document.clone(),
      license: self.license.clone(),
      cancel: self.cancel.clone(),
    };

    let units = std::mem::take(&mut self.units);
    let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
    let mut slots: Vec<Option<BuildUnit>> = Vec::with_capacity(units.len());
    let mut task_index = HashMap::new();
    let mut join_set = JoinSet::new();

    for (index, unit) in units.into_iter().enumerate() {
      if unit.is_selected() {
        let handle = join_set.spawn(prebuild::prebuild(index, unit, ctx.clone()));
        task_index.insert(handle.id(), index);
        slots.push(None);
      } else {
        slots.push(Some(unit));
      }
    }
    info!(tasks = join_set.len(), "pre-build started");

    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok(PrebuildOutput {
          index,
          unit,
          result,
          name,
        }) => {
          slots[index] = unit;
          if let Err(failure) = result {
            debug!(unit = %name, "pre-build failure");
            self.record_failure(&mut first_error, RunError::Unit(failure));
          }
        }
        Err(e) => {
          error!(error = %e, "pre-build task panicked");
          let name = task_index
            .get(&e.id())
            .map(|i| names[*i].clone())
            .unwrap_or_default();
          self.record_failure(&mut first_error, RunError::Panicked(name));
        }
      }
    }

    self.units = self.restore(slots, &names);
    first_error
  }

  /// Feed loaded units to the worker pool and fold its events. Returns the first failure.
  async fn build_all(&mut self, progress: &mut impl FnMut(&str, &str)) -> Option<RunError> {
    let units = std::mem::take(&mut self.units);
    let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
    let mut slots: Vec<Option<BuildUnit>> = (0..units.len()).map(|_| None).collect();

    let mut queued = Vec::new();
    for (index, unit) in units.into_iter().enumerate() {
      if unit.is_selected() {
        queued.push((index, unit));
      } else {
        slots[index] = Some(unit);
      }
    }
    let required = queued.len();

    let workers = self.settings.workers.max(1);
    let (queue_tx, queue_rx) = mpsc::channel(workers);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let queue = Arc::new(Mutex::new(queue_rx));

    let ctx = Arc::new(WorkerContext {
      settings: self.settings.clone(),
      connector: self.connector.clone(),
      auth: self.auth.clone(),
      events: events_tx,
      cancel: self.cancel.clone(),
    });

    let mut join_set = JoinSet::new();
    for id in 0..workers {
      join_set.spawn(pool::worker(id, queue.clone(), ctx.clone()));
    }
    // the event channel closes once every worker is gone
    drop(ctx);
    drop(queue);

    let feeder = tokio::spawn(async move {
      let mut unsent = Vec::new();
      let mut pending = queued.into_iter();
      for item in pending.by_ref() {
        if let Err(mpsc::error::SendError(item)) = queue_tx.send(item).await {
          unsent.push(item);
          break;
        }
      }
      unsent.extend(pending);
      unsent
    });
    info!(workers, units = required, "worker pool started");

    let mut first_error = None;
    let mut completed = 0;
    while completed < required {
      let Some(event) = events_rx.recv().await else {
        warn!(completed, required, "workers exited before every unit completed");
        break;
      };
      match event {
        RunEvent::Progress { unit, line } => progress(&unit, &line),
        RunEvent::Sized { unit, bytes } => {
          self.total_size += bytes;
          debug!(unit = %unit, bytes, total = self.total_size, "image sized");
        }
        RunEvent::Completed { index, unit, outcome } => {
          completed += 1;
          debug!(unit = %unit.name(), outcome = ?outcome, completed, required, "unit completed");
          slots[index] = Some(unit);
          if let UnitOutcome::Failed(failure) = outcome {
            self.record_failure(&mut first_error, RunError::Unit(failure));
          }
        }
      }
    }

    while let Some(joined) = join_set.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "build task panicked");
        self.record_failure(&mut first_error, RunError::Panicked("worker".to_string()));
      }
    }
    while let Ok(event) = events_rx.try_recv() {
      if let RunEvent::Progress { unit, line } = event {
        progress(&unit, &line);
      }
    }
    match feeder.await {
      Ok(unsent) => {
        for (index, unit) in unsent {
          slots[index] = Some(unit);
        }
      }
      Err(e) => error!(error = %e, "queue feeder panicked"),
    }

    self.units = self.restore(slots, &names);
    first_error
  }

  /// Keep the first error and cancel everything else.
  fn record_failure(&self, first: &mut Option<RunError>, err: RunError) {
    if first.is_none() {
      warn!(error = %err, "cancelling run after first failure");
      self.cancel.cancel();
      *first = Some(err);
    } else {
      debug!(error = %err, "additional failure");
    }
  }

  /// Put units back in insertion order. Units lost to a panic come back as failed.
  fn restore(&self, slots: Vec<Option<BuildUnit>>, names: &[String]) -> Vec<BuildUnit> {
    slots
      .into_iter()
      .zip(names)
      .map(|(slot, name)| {
        slot.unwrap_or_else(|| {
          let mut unit = BuildUnit::new(name, &self.tag, &self.settings, &self.run_dir);
          unit.fail();
          unit
        })
      })
      .collect()
  }

  pub fn summary(&self) -> RunSummary {
    RunSummary {
      run_dir: self.run_dir.clone(),
      units: self.units.iter().map(UnitReport::from).collect(),
      total_size: self.total_size,
      elapsed: self.elapsed,
    }
  }
}
