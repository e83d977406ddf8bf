//! Terminal output for rolebuild commands.
//!
//! Unit status marks, image size and duration formatting, and the few message
//! helpers the commands share.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

use rolebuild_lib::unit::UnitStatus;

/// Leading mark of a unit or status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
  Done,
  Failed,
  Pending,
  Selected,
  Skipped,
}

impl Mark {
  pub fn for_status(status: UnitStatus) -> Self {
    match status {
      UnitStatus::Pushed | UnitStatus::Built => Mark::Done,
      UnitStatus::Failed => Mark::Failed,
      UnitStatus::DoNotBuild => Mark::Skipped,
      _ => Mark::Pending,
    }
  }

  fn symbol(self) -> &'static str {
    match self {
      Mark::Done => "✓",
      Mark::Failed => "✗",
      Mark::Pending => "•",
      Mark::Selected => "+",
      Mark::Skipped => "-",
    }
  }

  /// The symbol, colored when `stream` supports it.
  pub fn render(self, stream: Stream) -> String {
    let symbol = self.symbol();
    match self {
      Mark::Done | Mark::Selected => symbol.if_supports_color(stream, |s| s.green()).to_string(),
      Mark::Failed => symbol.if_supports_color(stream, |s| s.red()).to_string(),
      Mark::Pending => symbol.if_supports_color(stream, |s| s.blue()).to_string(),
      Mark::Skipped => symbol.if_supports_color(stream, |s| s.dimmed()).to_string(),
    }
  }
}

/// Image size in the decimal units the daemon reports.
pub fn format_size(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];

  if bytes < 1000 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1000.0;
  let mut unit = 0;
  while value >= 1000.0 && unit < UNITS.len() - 1 {
    value /= 1000.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

/// Durations over an hour keep their hours, since image builds regularly run that long.
pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 3600 {
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
  } else if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_mark(mark: Mark, message: &str) {
  println!("{} {message}", mark.render(Stream::Stdout));
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    Mark::Failed.render(Stream::Stderr),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}
