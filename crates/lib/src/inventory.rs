//! Unit discovery from the playbook inventory and `build_only` selection.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::consts::{INVENTORY_IGNORED, INVENTORY_SECTION};
use crate::unit::{BuildUnit, TransitionError, UnitStatus};

#[derive(Debug, Error)]
pub enum InventoryError {
  #[error("unable to read inventory {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("inventory {path} has no {section} section")]
  MissingSection { path: PathBuf, section: &'static str },

  #[error("unit '{0}' requested for building does not exist")]
  UnknownUnit(String),

  #[error(transparent)]
  Transition(#[from] TransitionError),
}

/// Host names listed under the build section, lowercased, deduplicated, in file order.
///
/// Returns `None` when the section header is absent. The section ends at the next
/// `[header]` line.
pub fn parse_inventory(content: &str) -> Option<Vec<String>> {
  let mut lines = content.lines().map(str::trim);
  lines.by_ref().find(|line| *line == INVENTORY_SECTION)?;

  let mut seen = BTreeSet::new();
  let names = lines
    .take_while(|line| !line.starts_with('['))
    .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
    .filter(|line| !INVENTORY_IGNORED.contains(line))
    .map(str::to_lowercase)
    .filter(|name| seen.insert(name.clone()))
    .collect();
  Some(names)
}

pub fn load_inventory(path: &Path) -> Result<Vec<String>, InventoryError> {
  let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let names = parse_inventory(&content).ok_or_else(|| InventoryError::MissingSection {
    path: path.to_path_buf(),
    section: INVENTORY_SECTION,
  })?;
  info!(path = ?path, units = names.len(), "loaded inventory");
  Ok(names)
}

/// Mark every unit not named in `build_only` as `DoNotBuild`. An empty list selects all.
///
/// Every requested name must exist. Returns the number of selected units.
pub fn apply_selection(units: &mut [BuildUnit], build_only: &[String]) -> Result<usize, InventoryError> {
  if build_only.is_empty() {
    return Ok(units.len());
  }

  let requested: BTreeSet<String> = build_only.iter().map(|n| n.trim().to_lowercase()).collect();
  if let Some(missing) = requested.iter().find(|name| !units.iter().any(|u| u.name() == name.as_str())) {
    return Err(InventoryError::UnknownUnit(missing.clone()));
  }

  let mut selected = 0;
  for unit in units.iter_mut() {
    if requested.contains(unit.name()) {
      selected += 1;
    } else {
      debug!(unit = %unit.name(), "not selected for building");
      unit.transition(UnitStatus::DoNotBuild)?;
    }
  }
  Ok(selected)
}
