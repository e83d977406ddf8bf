//! Append-only tar writer for build contexts.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::ContextError;

/// Mode every entry is written with.
const ENTRY_MODE: u32 = 0o777;

/// A build context being written.
///
/// Entries are keyed by their internal path. The first write to a path wins and later
/// writes to the same path are skipped, so every path appears exactly once.
pub struct ContextArchive {
  builder: tar::Builder<BufWriter<File>>,
  path: PathBuf,
  written: HashSet<String>,
  hasher: Sha256,
  mtime: u64,
}

/// A finished build context, immutable once sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContext {
  pub path: PathBuf,
  /// SHA-256 over entry names and payloads, in write order.
  pub digest: String,
  pub entries: usize,
}

impl ContextArchive {
  pub fn create(path: &Path) -> Result<Self, ContextError> {
    let file = File::create(path).map_err(|source| ContextError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let mtime = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or_default();

    Ok(Self {
      builder: tar::Builder::new(BufWriter::new(file)),
      path: path.to_path_buf(),
      written: HashSet::new(),
      hasher: Sha256::new(),
      mtime,
    })
  }

  /// Append `data` at `name`. Returns `false` if `name` was already written.
  pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<bool, ContextError> {
    if self.written.contains(name) {
      debug!(entry = %name, "skipping duplicate context entry");
      return Ok(false);
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(self.mtime);
    header.set_entry_type(tar::EntryType::Regular);

    self
      .builder
      .append_data(&mut header, name, data)
      .map_err(|source| ContextError::Io {
        path: self.path.clone(),
        source,
      })?;

    self.hasher.update(name.as_bytes());
    self.hasher.update([0u8]);
    self.hasher.update(data);
    self.hasher.update([0u8]);
    self.written.insert(name.to_string());
    trace!(entry = %name, size = data.len(), "added context entry");
    Ok(true)
  }

  /// Append the file at `source` as `name`. A missing source is an error.
  pub fn add_file(&mut self, source: &Path, name: &str) -> Result<bool, ContextError> {
    if self.written.contains(name) {
      return Ok(false);
    }
    let data = std::fs::read(source).map_err(|e| ContextError::MissingSource {
      path: source.to_path_buf(),
      message: e.to_string(),
    })?;
    self.add_bytes(name, &data)
  }

  /// Append the file at `source` as `name` if it exists.
  pub fn add_optional_file(&mut self, source: &Path, name: &str) -> Result<bool, ContextError> {
    if !source.is_file() {
      debug!(source = ?source, "optional context source not present");
      return Ok(false);
    }
    self.add_file(source, name)
  }

  /// Finish the archive and flush it to disk.
  pub fn seal(self) -> Result<SealedContext, ContextError> {
    let Self {
      builder,
      path,
      written,
      hasher,
      ..
    } = self;

    let io_err = |source| ContextError::Io {
      path: path.clone(),
      source,
    };
    let mut writer = builder.into_inner().map_err(io_err)?;
    writer.flush().map_err(io_err)?;

    Ok(SealedContext {
      digest: hex::encode(hasher.finalize()),
      entries: written.len(),
      path,
    })
  }
}
