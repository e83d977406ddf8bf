//! Reads daemon progress streams into the unit log.

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, trace};

use super::{DaemonError, RecordStream};
use crate::execute::CancelSignal;
use crate::unit::UnitLog;

#[derive(Debug, Error)]
pub enum StreamError {
  /// The daemon reported an error in the stream.
  #[error("[ERROR] {unit}: {message} \n\nDebugging: {log_path}")]
  Daemon {
    unit: String,
    message: String,
    log_path: String,
  },

  #[error("{unit}: {source}")]
  Transport {
    unit: String,
    #[source]
    source: DaemonError,
  },

  #[error("{unit}: unable to write log {log_path}: {source}")]
  Log {
    unit: String,
    log_path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{unit}: cancelled")]
  Cancelled { unit: String },
}

/// Consumes one build or push stream for a unit.
///
/// Every non-empty trimmed `stream`/`status` line goes to the unit log, and to the
/// progress sink in verbose mode. The first record carrying a non-empty error ends the
/// read with [`StreamError::Daemon`]. Undecodable records are skipped.
pub struct StreamResponseReader<'a> {
  unit: &'a str,
  log: &'a UnitLog,
  verbose: bool,
  progress: &'a (dyn Fn(&str) + Send + Sync),
}

impl<'a> StreamResponseReader<'a> {
  pub fn new(unit: &'a str, log: &'a UnitLog, verbose: bool, progress: &'a (dyn Fn(&str) + Send + Sync)) -> Self {
    Self {
      unit,
      log,
      verbose,
      progress,
    }
  }

  /// Read `stream` to the end. Returns the number of records seen.
  pub async fn read(&self, mut stream: RecordStream<'_>, cancel: &CancelSignal) -> Result<usize, StreamError> {
    let mut writer = self.log.writer().map_err(|e| self.log_error(e))?;
    let mut records = 0;

    loop {
      let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          return Err(StreamError::Cancelled { unit: self.unit.to_string() });
        }
        next = stream.next() => next,
      };
      let Some(item) = next else {
        break;
      };

      let record = match item {
        Ok(record) => record,
        Err(e) if e.is_benign() => {
          debug!(unit = %self.unit, error = %e, "skipping undecodable record");
          continue;
        }
        Err(source) => {
          return Err(StreamError::Transport {
            unit: self.unit.to_string(),
            source,
          });
        }
      };
      records += 1;

      for text in [record.stream.as_deref(), record.status.as_deref()].into_iter().flatten() {
        let line = text.trim();
        if line.is_empty() {
          continue;
        }
        trace!(unit = %self.unit, line = %line, "daemon output");
        writer.line(line).map_err(|e| self.log_error(e))?;
        if self.verbose {
          (self.progress)(line);
        }
      }

      if let Some(message) = record.error.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        writer
          .line(&format!("ERROR: {message}"))
          .and_then(|_| writer.flush())
          .map_err(|e| self.log_error(e))?;
        return Err(StreamError::Daemon {
          unit: self.unit.to_string(),
          message: message.to_string(),
          log_path: self.log.path().display().to_string(),
        });
      }
    }

    writer.flush().map_err(|e| self.log_error(e))?;
    Ok(records)
  }

  fn log_error(&self, source: std::io::Error) -> StreamError {
    StreamError::Log {
      unit: self.unit.to_string(),
      log_path: self.log.path().display().to_string(),
      source,
    }
  }
}
