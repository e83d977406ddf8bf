//! The bounded build/push worker pool.
//!
//! Workers share one queue of loaded units. Each dequeued unit is built, sized and
//! optionally pushed, then handed back to the orchestrator with exactly one
//! [`RunEvent::Completed`], whatever happened to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use super::CancelSignal;
use super::types::{Phase, RunEvent, UnitFailure, UnitOutcome};
use crate::consts::{BUILDER_HOST, RECIPE_FILE};
use crate::daemon::{BuildRequest, Daemon, DaemonConnector, RegistryAuth, StreamResponseReader};
use crate::settings::Settings;
use crate::unit::{BuildUnit, UnitStatus};

/// Queue of `(position, unit)` pairs shared by every worker.
pub type UnitQueue = Arc<Mutex<mpsc::Receiver<(usize, BuildUnit)>>>;

/// Everything a worker needs besides the queue.
pub struct WorkerContext {
  pub settings: Arc<Settings>,
  pub connector: Arc<dyn DaemonConnector>,
  pub auth: Option<RegistryAuth>,
  pub events: mpsc::UnboundedSender<RunEvent>,
  pub cancel: CancelSignal,
}

/// Read units until the queue is closed and drained.
///
/// After its first failure, or once the run is cancelled, a worker keeps draining the
/// queue but returns every further unit as [`UnitOutcome::Skipped`].
pub async fn worker(id: usize, queue: UnitQueue, ctx: Arc<WorkerContext>) {
  let mut stopped = false;

  loop {
    let next = queue.lock().await.recv().await;
    let Some((index, mut unit)) = next else {
      break;
    };

    let outcome = if stopped || ctx.cancel.is_cancelled() {
      debug!(worker = id, unit = %unit.name(), "worker stopped, skipping unit");
      UnitOutcome::Skipped
    } else if unit.status() != UnitStatus::Loaded {
      debug!(worker = id, unit = %unit.name(), status = %unit.status(), "unit not loaded, skipping");
      UnitOutcome::Skipped
    } else {
      match process(&mut unit, &ctx).await {
        Ok(()) => UnitOutcome::Done,
        Err(failure) => {
          error!(worker = id, unit = %failure.unit, phase = %failure.phase, error = %failure.message, "unit failed");
          // best effort: the failure travels with the completion event regardless
          let _ = unit.log().append(&format!("{} failed: {}", failure.phase, failure.message));
          unit.fail();
          stopped = true;
          UnitOutcome::Failed(failure)
        }
      }
    };

    if ctx.events.send(RunEvent::Completed { index, unit, outcome }).is_err() {
      warn!(worker = id, "orchestrator stopped listening");
      break;
    }
  }

  debug!(worker = id, "worker finished");
}

/// Build, size and push one loaded unit.
async fn process(unit: &mut BuildUnit, ctx: &WorkerContext) -> Result<(), UnitFailure> {
  let daemon = ctx
    .connector
    .connect()
    .map_err(|e| UnitFailure::new(unit, Phase::Build, e))?;

  build(unit, daemon.as_ref(), ctx).await?;
  measure(unit, daemon.as_ref(), ctx).await;

  if !ctx.settings.push_enabled() {
    debug!(unit = %unit.name(), "push skipped");
    return unit
      .transition(UnitStatus::Pushed)
      .map_err(|e| UnitFailure::new(unit, Phase::Push, e));
  }
  push(unit, daemon.as_ref(), ctx).await
}

async fn build(unit: &mut BuildUnit, daemon: &dyn Daemon, ctx: &WorkerContext) -> Result<(), UnitFailure> {
  let fail = |unit: &BuildUnit, e: &dyn std::fmt::Display| UnitFailure::new(unit, Phase::Build, e);

  unit.transition(UnitStatus::Building).map_err(|e| fail(unit, &e))?;
  unit.timings.build_start = Some(Instant::now());

  let Some(context) = unit.context.take() else {
    return Err(fail(unit, &"no sealed build context"));
  };
  let archive = tokio::fs::read(&context.path)
    .await
    .map_err(|e| fail(unit, &format!("unable to read {}: {e}", context.path.display())))?;

  if ctx.cancel.is_cancelled() {
    return Err(fail(unit, &"cancelled"));
  }

  let request = BuildRequest {
    context: Bytes::from(archive),
    tag: unit.reference().to_string(),
    dockerfile: RECIPE_FILE.to_string(),
    build_args: build_args(&ctx.settings),
    remove_intermediate: true,
    force_remove: true,
    extra_hosts: extra_hosts(&ctx.settings),
  };

  let log = unit.log();
  log
    .append("----- Starting image build -----")
    .map_err(|e| fail(unit, &e))?;
  progress(ctx, unit.name(), format!("Starting build: {} ...", unit.reference()));
  info!(unit = %unit.name(), reference = %unit.reference(), digest = %context.digest, "building image");

  let sink = progress_sink(ctx, unit.name());
  StreamResponseReader::new(unit.name(), &log, ctx.settings.verbose, &sink)
    .read(daemon.build_image(request), &ctx.cancel)
    .await
    .map_err(|e| fail(unit, &e))?;

  unit.timings.build_end = Some(Instant::now());
  unit.transition(UnitStatus::Built).map_err(|e| fail(unit, &e))?;
  info!(unit = %unit.name(), "image built");
  Ok(())
}

/// Record the built image's size. A failed lookup is reported and counts as zero.
async fn measure(unit: &mut BuildUnit, daemon: &dyn Daemon, ctx: &WorkerContext) {
  match daemon.image_size(unit.reference()).await {
    Ok(bytes) => {
      unit.image_size = bytes;
      let _ = ctx.events.send(RunEvent::Sized {
        unit: unit.name().to_string(),
        bytes,
      });
    }
    Err(e) => warn!(unit = %unit.name(), error = %e, "unable to read image size"),
  }
}

async fn push(unit: &mut BuildUnit, daemon: &dyn Daemon, ctx: &WorkerContext) -> Result<(), UnitFailure> {
  let fail = |unit: &BuildUnit, e: &dyn std::fmt::Display| UnitFailure::new(unit, Phase::Push, e);

  if ctx.cancel.is_cancelled() {
    return Err(fail(unit, &"cancelled"));
  }

  unit.transition(UnitStatus::Pushing).map_err(|e| fail(unit, &e))?;
  unit.timings.push_start = Some(Instant::now());

  let log = unit.log();
  log.append("----- Starting image push -----").map_err(|e| fail(unit, &e))?;
  progress(ctx, unit.name(), format!("Pushing: {} ...", unit.reference()));

  let sink = progress_sink(ctx, unit.name());
  StreamResponseReader::new(unit.name(), &log, ctx.settings.verbose, &sink)
    .read(daemon.push_image(unit.reference(), ctx.auth.clone()), &ctx.cancel)
    .await
    .map_err(|e| fail(unit, &e))?;

  unit.timings.push_end = Some(Instant::now());
  unit.transition(UnitStatus::Pushed).map_err(|e| fail(unit, &e))?;
  info!(unit = %unit.name(), reference = %unit.reference(), "image pushed");
  Ok(())
}

/// Build arguments every recipe declares.
pub fn build_args(settings: &Settings) -> BTreeMap<String, String> {
  let platform = settings.platform().map(|p| p.as_str()).unwrap_or_default();
  BTreeMap::from([
    ("BASE".to_string(), settings.base_image.clone()),
    ("PLATFORM".to_string(), platform.to_string()),
    ("PLAYBOOK_SRV".to_string(), settings.cert_base_url.clone()),
    ("SAS_RPM_REPO_URL".to_string(), settings.mirror_url.clone()),
  ])
}

/// Host entries that let build containers reach the builder machine.
pub fn extra_hosts(settings: &Settings) -> Vec<String> {
  settings
    .builder_ip
    .iter()
    .filter(|ip| !ip.trim().is_empty())
    .map(|ip| format!("{BUILDER_HOST}:{}", ip.trim()))
    .collect()
}

fn progress(ctx: &WorkerContext, unit: &str, line: String) {
  let _ = ctx.events.send(RunEvent::Progress {
    unit: unit.to_string(),
    line,
  });
}

fn progress_sink(ctx: &WorkerContext, unit: &str) -> impl Fn(&str) + Send + Sync + use<> {
  let events = ctx.events.clone();
  let unit = unit.to_string();
  move |line: &str| {
    let _ = events.send(RunEvent::Progress {
      unit: unit.clone(),
      line: line.to_string(),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use crate::context::ContextAssembler;
  use crate::license::LicenseMaterial;
  use crate::unit::ConfigDocument;
  use crate::util::testutil::{ContextFixture, FakeConnector, FakeDaemon, fixture_settings};

  fn loaded(fixture: &ContextFixture, settings: &Settings, name: &str) -> BuildUnit {
    let document = ConfigDocument::from_yaml(&fixture.config_document()).unwrap();
    let license = LicenseMaterial::default();
    let mut unit = BuildUnit::new(name, "test", settings, &fixture.root().join("run"));
    unit.transition(UnitStatus::Loading).unwrap();
    ContextAssembler::new(settings, &document, &license)
      .assemble(&mut unit, &CancelSignal::new())
      .unwrap();
    unit.transition(UnitStatus::Loaded).unwrap();
    unit
  }

  async fn drive(daemon: Arc<FakeDaemon>, settings: Settings, units: Vec<BuildUnit>) -> Vec<RunEvent> {
    let (events, mut events_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(WorkerContext {
      settings: Arc::new(settings),
      connector: Arc::new(FakeConnector::new(daemon)),
      auth: None,
      events,
      cancel: CancelSignal::new(),
    });

    let (tx, rx) = mpsc::channel(units.len());
    for item in units.into_iter().enumerate() {
      tx.send(item).await.unwrap();
    }
    drop(tx);
    worker(0, Arc::new(Mutex::new(rx)), ctx).await;

    let mut seen = Vec::new();
    while let Some(event) = events_rx.recv().await {
      seen.push(event);
    }
    seen
  }

  fn outcomes(events: &[RunEvent]) -> Vec<(usize, UnitStatus, UnitOutcome)> {
    events
      .iter()
      .filter_map(|e| match e {
        RunEvent::Completed { index, unit, outcome } => Some((*index, unit.status(), outcome.clone())),
        _ => None,
      })
      .collect()
  }

  #[tokio::test]
  async fn every_dequeued_unit_completes_once() {
    let fixture = ContextFixture::new();
    let settings = fixture_settings(fixture.root());
    let units = vec![
      loaded(&fixture, &settings, "httpproxy"),
      BuildUnit::new("consul", "test", &settings, &fixture.root().join("run")),
    ];
    let daemon = Arc::new(FakeDaemon::default().with_image_size(42));

    let events = drive(daemon.clone(), settings, units).await;

    assert_eq!(
      outcomes(&events),
      vec![
        (0, UnitStatus::Pushed, UnitOutcome::Done),
        (1, UnitStatus::Unknown, UnitOutcome::Skipped),
      ]
    );
    assert!(
      events
        .iter()
        .any(|e| matches!(e, RunEvent::Sized { unit, bytes: 42 } if unit == "httpproxy"))
    );
    assert_eq!(daemon.built(), vec!["sas-viya-httpproxy:test"]);
    assert!(daemon.pushed().is_empty());
  }

  #[tokio::test]
  async fn failed_worker_skips_the_rest_of_the_queue() {
    let fixture = ContextFixture::new();
    fixture.write("playbook/group_vars/consul", "CONSUL: true\n");
    let settings = fixture_settings(fixture.root());
    let units = vec![
      loaded(&fixture, &settings, "httpproxy"),
      loaded(&fixture, &settings, "consul"),
    ];
    let daemon = Arc::new(FakeDaemon::default().with_build_error("httpproxy", "no space left on device"));

    let events = drive(daemon.clone(), settings, units).await;
    let outcomes = outcomes(&events);

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].1, UnitStatus::Failed);
    let UnitOutcome::Failed(failure) = &outcomes[0].2 else {
      panic!("expected a failure, got {:?}", outcomes[0].2);
    };
    assert_eq!(failure.phase, Phase::Build);
    assert!(failure.message.contains("no space left on device"));
    assert_eq!(outcomes[1], (1, UnitStatus::Loaded, UnitOutcome::Skipped));
    assert_eq!(daemon.built(), vec!["sas-viya-httpproxy:test"]);
  }

  #[tokio::test]
  async fn push_goes_to_the_registry_reference() {
    let fixture = ContextFixture::new();
    let mut settings = fixture_settings(fixture.root());
    settings.registry = Some("registry.local".to_string());
    settings.namespace = Some("team".to_string());
    let units = vec![loaded(&fixture, &settings, "httpproxy")];
    let daemon = Arc::new(FakeDaemon::default());

    let events = drive(daemon.clone(), settings, units).await;

    let RunEvent::Completed { unit, outcome, .. } = events.last().unwrap() else {
      panic!("last event should be the completion");
    };
    assert_eq!(*outcome, UnitOutcome::Done);
    assert!(unit.timings.push_duration().is_some());
    assert_eq!(daemon.pushed(), vec!["registry.local/team/sas-viya-httpproxy:test"]);
  }

  #[test]
  fn build_args_carry_order_details() {
    let settings = Settings {
      base_image: "opensuse/leap:15".to_string(),
      mirror_url: "https://mirror.local".to_string(),
      cert_base_url: "https://builder:1976".to_string(),
      ..Default::default()
    };
    let args = build_args(&settings);
    assert_eq!(args["BASE"], "opensuse/leap:15");
    assert_eq!(args["PLATFORM"], "suse");
    assert_eq!(args["PLAYBOOK_SRV"], "https://builder:1976");
    assert_eq!(args["SAS_RPM_REPO_URL"], "https://mirror.local");
  }

  #[test]
  fn extra_hosts_need_a_builder_ip() {
    let mut settings = Settings::default();
    assert!(extra_hosts(&settings).is_empty());

    settings.builder_ip = Some("10.0.0.5".to_string());
    assert_eq!(extra_hosts(&settings), vec!["sas-container-recipes-builder:10.0.0.5"]);
  }
}
