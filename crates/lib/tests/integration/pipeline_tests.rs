use std::sync::Arc;

use rolebuild_lib::execute::{Orchestrator, Phase, RunError};
use rolebuild_lib::loaders::Preflight;
use rolebuild_lib::unit::UnitStatus;

use super::common::{MockDaemon, TestEnv, connector, names};

const HOSTS: &[&str] = &["httpproxy", "consul", "cas"];

fn pushing(env: &TestEnv, workers: usize) -> rolebuild_lib::settings::Settings {
  let mut settings = env.settings(workers);
  settings.registry = Some("registry.local".to_string());
  settings.namespace = Some("team".to_string());
  settings
}

#[tokio::test]
async fn three_units_on_two_workers_all_complete() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(100));
  let mut orchestrator = Orchestrator::new(
    Arc::new(pushing(&env, 2)),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let summary = orchestrator.run(|_, _| {}).await.unwrap();

  assert_eq!(summary.built(), 3);
  assert_eq!(summary.failed(), 0);
  assert_eq!(summary.total_size, 300);
  assert!(summary.units.iter().all(|u| u.status == UnitStatus::Pushed));
  assert!(summary.units.iter().all(|u| u.build_time.is_some() && u.push_time.is_some()));
  assert_eq!(
    summary.units.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
    HOSTS.to_vec()
  );
  assert_eq!(
    daemon.pushed(),
    vec![
      "registry.local/team/sas-viya-cas:it",
      "registry.local/team/sas-viya-consul:it",
      "registry.local/team/sas-viya-httpproxy:it",
    ]
  );
}

#[tokio::test]
async fn failed_build_is_returned_after_every_task_finishes() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(10).failing("consul"));
  let mut orchestrator = Orchestrator::new(
    Arc::new(pushing(&env, 2)),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let err = orchestrator.run(|_, _| {}).await.unwrap_err();
  let RunError::Unit(failure) = err else {
    panic!("expected a unit failure, got {err:?}");
  };
  assert_eq!(failure.unit, "consul");
  assert_eq!(failure.phase, Phase::Build);
  assert!(failure.message.contains("non-zero code: 2"));
  assert!(failure.log_path.ends_with("sas-viya-consul/log.txt"));

  let summary = orchestrator.summary();
  assert_eq!(summary.failed(), 1);
  assert_eq!(summary.units.len(), 3);
  assert!(
    summary
      .units
      .iter()
      .all(|u| !matches!(u.status, UnitStatus::Building | UnitStatus::Pushing | UnitStatus::Loading))
  );

  let log = std::fs::read_to_string(&failure.log_path).unwrap();
  assert!(log.contains("ERROR: The command"));
}

#[tokio::test]
async fn push_is_skipped_without_a_registry() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(1));
  let mut orchestrator = Orchestrator::new(
    Arc::new(env.settings(1)),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let summary = orchestrator.run(|_, _| {}).await.unwrap();

  assert!(daemon.pushed().is_empty());
  assert_eq!(daemon.built().len(), 3);
  assert!(summary.units.iter().all(|u| u.status == UnitStatus::Pushed));
  assert!(summary.units.iter().all(|u| u.push_time.is_none()));
}

#[tokio::test]
async fn unselected_units_are_never_built() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(7));
  let mut settings = env.settings(2);
  settings.build_only = vec!["HttpProxy".to_string()];
  let mut orchestrator = Orchestrator::new(
    Arc::new(settings),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let summary = orchestrator.run(|_, _| {}).await.unwrap();

  assert_eq!(daemon.built(), vec!["sas-viya-httpproxy:it"]);
  assert_eq!(summary.total_size, 7);
  let statuses: Vec<UnitStatus> = summary.units.iter().map(|u| u.status).collect();
  assert_eq!(
    statuses,
    vec![UnitStatus::Pushed, UnitStatus::DoNotBuild, UnitStatus::DoNotBuild]
  );
  assert!(!orchestrator.run_dir().join("sas-viya-consul").exists());
}

#[tokio::test]
async fn unknown_selection_is_rejected() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(0));
  let mut settings = env.settings(2);
  settings.build_only = vec!["nosuchhost".to_string()];
  let result = Orchestrator::new(
    Arc::new(settings),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  );
  assert!(matches!(result, Err(RunError::Inventory(_))));
}

#[tokio::test]
async fn prebuild_failure_stops_the_run_before_building() {
  let env = TestEnv::with_hosts(&["httpproxy"]);
  let daemon = Arc::new(MockDaemon::new(0));
  let mut orchestrator = Orchestrator::new(
    Arc::new(env.settings(2)),
    &names(&["httpproxy", "ghost"]),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let err = orchestrator.run(|_, _| {}).await.unwrap_err();
  let RunError::Unit(failure) = err else {
    panic!("expected a unit failure, got {err:?}");
  };
  assert_eq!(failure.unit, "ghost");
  assert_eq!(failure.phase, Phase::PreBuild);
  assert!(daemon.built().is_empty());
  assert_eq!(orchestrator.units()[1].status(), UnitStatus::Failed);
}

#[tokio::test]
async fn verbose_progress_reaches_the_sink_and_the_log() {
  let env = TestEnv::with_hosts(&["httpproxy"]);
  let daemon = Arc::new(MockDaemon::new(0));
  let mut settings = env.settings(1);
  settings.verbose = true;
  let mut orchestrator = Orchestrator::new(
    Arc::new(settings),
    &names(&["httpproxy"]),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  let mut lines = Vec::new();
  orchestrator
    .run(|unit, line| lines.push(format!("{unit}: {line}")))
    .await
    .unwrap();

  assert!(lines.contains(&"httpproxy: Starting build: sas-viya-httpproxy:it ...".to_string()));
  assert!(lines.contains(&"httpproxy: Step 1/9 : FROM centos:7".to_string()));

  let log = std::fs::read_to_string(orchestrator.units()[0].log().path()).unwrap();
  assert!(log.contains("----- Starting image build -----"));
  assert!(log.contains("Successfully tagged"));
}

#[tokio::test]
async fn cancelled_run_builds_nothing() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(1));
  let mut orchestrator = Orchestrator::new(
    Arc::new(env.settings(2)),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();

  orchestrator.cancel_signal().cancel();
  let err = orchestrator.run(|_, _| {}).await.unwrap_err();

  assert!(matches!(err, RunError::Cancelled), "got {err:?}");
  assert!(daemon.built().is_empty());
  let summary = orchestrator.summary();
  assert_eq!(summary.unfinished(), 3);
  assert!(!summary.is_success());
}

#[tokio::test]
async fn cancel_between_units_is_an_error() {
  let env = TestEnv::with_hosts(HOSTS);
  let daemon = Arc::new(MockDaemon::new(5));
  let mut orchestrator = Orchestrator::new(
    Arc::new(env.settings(1)),
    &names(HOSTS),
    env.document(),
    Preflight::default(),
    connector(&daemon),
  )
  .unwrap();
  daemon.cancel_after_first_build(orchestrator.cancel_signal());

  let err = orchestrator.run(|_, _| {}).await.unwrap_err();

  assert!(matches!(err, RunError::Cancelled), "got {err:?}");
  assert_eq!(daemon.built(), vec!["sas-viya-httpproxy:it"]);
  let summary = orchestrator.summary();
  let statuses: Vec<UnitStatus> = summary.units.iter().map(|u| u.status).collect();
  assert_eq!(
    statuses,
    vec![UnitStatus::Pushed, UnitStatus::Loaded, UnitStatus::Loaded]
  );
  assert_eq!(summary.total_size, 5);
  assert_eq!(summary.failed(), 0);
  assert!(!summary.is_success());
}
