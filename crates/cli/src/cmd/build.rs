//! Implementation of the `rolebuild build` command.
//!
//! Runs the pre-flight loaders, assembles a build context per unit, builds and pushes the
//! images on the worker pool and prints a per-unit summary.

use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use tracing::info;

use rolebuild_lib::daemon::{DaemonConnector, DockerConnector};
use rolebuild_lib::execute::{Orchestrator, RunSummary};
use rolebuild_lib::inventory::load_inventory;
use rolebuild_lib::loaders::run_loaders;
use rolebuild_lib::settings::Settings;

use super::{SettingsArgs, load_document};
use crate::output::{Mark, format_duration, format_size, print_error, print_mark, print_stat};

pub fn cmd_build(args: &SettingsArgs, verbose: bool) -> Result<()> {
  let settings = Arc::new(args.load(verbose)?);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(build(settings))
}

async fn build(settings: Arc<Settings>) -> Result<()> {
  let connector: Arc<dyn DaemonConnector> = Arc::new(DockerConnector);

  print_mark(Mark::Pending, "Running pre-flight checks");
  let preflight = run_loaders(settings.clone(), connector.clone())
    .await
    .context("Pre-flight checks failed")?;

  let names = load_inventory(&settings.inventory_file()).context("Failed to read inventory")?;
  let document = load_document(&settings)?;
  let mut orchestrator = Orchestrator::new(settings.clone(), &names, document, preflight, connector)
    .context("Failed to prepare units")?;

  let cancel = orchestrator.cancel_signal();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      cancel.cancel();
    }
  });

  let selected = orchestrator.units().iter().filter(|u| u.is_selected()).count();
  print_mark(
    Mark::Pending,
    &format!(
      "Building {selected} image(s) tagged {} with {} worker(s)",
      orchestrator.tag(),
      settings.workers
    ),
  );

  let width = orchestrator.name_width();
  let result = orchestrator
    .run(|unit, line| {
      println!(
        "{} {}",
        format!("{unit:<width$} |").if_supports_color(Stream::Stdout, |s| s.dimmed()),
        line
      );
    })
    .await;

  let summary = orchestrator.summary();
  print_summary(&summary);
  info!(run_dir = ?summary.run_dir, "build logs written");

  match result {
    Ok(_) if summary.is_success() => {
      print_mark(Mark::Done, &format!("Built {} image(s)", summary.built()));
      Ok(())
    }
    Ok(_) => {
      let message = format!("{} unit(s) did not finish", summary.unfinished());
      print_error(&message);
      anyhow::bail!("Build failed: {message}")
    }
    Err(e) => {
      print_error(&e.to_string());
      Err(e).context("Build failed")
    }
  }
}

fn print_summary(summary: &RunSummary) {
  println!();
  for unit in &summary.units {
    let symbol = Mark::for_status(unit.status).render(Stream::Stdout);
    let timings = [("build", unit.build_time), ("push", unit.push_time)]
      .into_iter()
      .filter_map(|(label, time)| time.map(|t| format!("{label} {}", format_duration(t))))
      .collect::<Vec<_>>()
      .join(", ");

    println!("{symbol} {} [{}]", unit.reference, unit.status);
    if unit.size > 0 || !timings.is_empty() {
      println!("    {} {}", format_size(unit.size), timings);
    }
  }

  println!();
  print_stat("Total image size", &format_size(summary.total_size));
  print_stat("Elapsed", &format_duration(summary.elapsed));
  print_stat("Logs", &summary.run_dir.display().to_string());
}
